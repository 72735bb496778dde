//! Processor-hosted billing portal

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::customer::CustomerService;
use crate::error::BillingResult;
use crate::gateway::{PortalSessionRecord, ProcessorGateway};
use crate::retry::{with_retry, CancelSignal, RetrySettings};
use crate::tenants::TenantDirectory;

/// Portal service for processor billing portal sessions
pub struct PortalService {
    gateway: Arc<dyn ProcessorGateway>,
    customers: Arc<CustomerService>,
    tenants: Arc<dyn TenantDirectory>,
    config: StripeConfig,
    retry: RetrySettings,
}

impl PortalService {
    pub fn new(
        gateway: Arc<dyn ProcessorGateway>,
        customers: Arc<CustomerService>,
        tenants: Arc<dyn TenantDirectory>,
        config: StripeConfig,
        retry: RetrySettings,
    ) -> Self {
        Self {
            gateway,
            customers,
            tenants,
            config,
            retry,
        }
    }

    /// Create a billing portal session for the tenant's customer
    pub async fn create_session(
        &self,
        tenant_id: Uuid,
        return_url: Option<String>,
        cancel: &CancelSignal,
    ) -> BillingResult<PortalSessionRecord> {
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;
        let return_url = return_url.unwrap_or_else(|| self.config.billing_url());

        let gateway = &self.gateway;
        let session = with_retry("create_portal_session", self.retry.attempts, cancel, || {
            gateway.create_portal_session(&customer_id, &return_url)
        })
        .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            customer_id = %customer_id,
            "Created billing portal session"
        );

        Ok(session)
    }
}

/// Response for creating a portal session
#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

impl From<PortalSessionRecord> for PortalResponse {
    fn from(session: PortalSessionRecord) -> Self {
        Self { url: session.url }
    }
}
