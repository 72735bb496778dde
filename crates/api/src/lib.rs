//! Subsync API
//!
//! HTTP surface over the billing engine: plan catalog, tenant subscriptions,
//! hosted checkout and portal sessions, and processor webhook ingress.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
