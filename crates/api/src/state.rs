//! Shared application state

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;
use subsync_billing::{BillingService, CancelSignal};

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Lifetime of access tokens minted by this service
const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 1;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub billing: BillingService,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, ACCESS_TOKEN_EXPIRY_HOURS);
        Self {
            config: Arc::new(config),
            pool,
            billing,
            jwt_manager,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    /// Cancellation signal bounding processor work for one request
    pub fn deadline(&self) -> CancelSignal {
        CancelSignal::deadline(Duration::from_secs(self.config.processor_deadline_secs))
    }
}
