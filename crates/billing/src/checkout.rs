//! Hosted checkout sessions

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::StripeConfig;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutMode, CheckoutSessionRecord, CheckoutSessionRequest, Metadata, ProcessorGateway};
use crate::retry::{with_retry, CancelSignal, RetrySettings};
use crate::tenants::TenantDirectory;

/// Response for creating a checkout session
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

impl From<CheckoutSessionRecord> for CheckoutResponse {
    fn from(session: CheckoutSessionRecord) -> Self {
        Self {
            session_id: session.id,
            url: session.url,
        }
    }
}

/// Checkout service for creating processor-hosted checkout sessions
pub struct CheckoutService {
    gateway: Arc<dyn ProcessorGateway>,
    catalog: Arc<PlanCatalog>,
    customers: Arc<CustomerService>,
    tenants: Arc<dyn TenantDirectory>,
    config: StripeConfig,
    retry: RetrySettings,
}

impl CheckoutService {
    pub fn new(
        gateway: Arc<dyn ProcessorGateway>,
        catalog: Arc<PlanCatalog>,
        customers: Arc<CustomerService>,
        tenants: Arc<dyn TenantDirectory>,
        config: StripeConfig,
        retry: RetrySettings,
    ) -> Self {
        Self {
            gateway,
            catalog,
            customers,
            tenants,
            config,
            retry,
        }
    }

    /// Free plans collect a card in `setup` mode; paid plans start a
    /// subscription on the plan's synced price
    #[tracing::instrument(skip(self, success_url, cancel_url, cancel))]
    pub async fn create_session(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        success_url: Option<String>,
        cancel_url: Option<String>,
        cancel: &CancelSignal,
    ) -> BillingResult<CheckoutSessionRecord> {
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let plan = self.catalog.get_plan(plan_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;

        let (mode, price_id) = if plan.is_free() {
            (CheckoutMode::Setup, None)
        } else {
            let plan = self.catalog.ensure_synced(&plan, cancel).await?;
            let price_id = plan.processor_price_id.ok_or_else(|| {
                BillingError::Internal(format!("plan {} has no processor price", plan.id))
            })?;
            (CheckoutMode::Subscription, Some(price_id))
        };

        let billing_url = self.config.billing_url();
        let request = CheckoutSessionRequest {
            customer_id,
            mode,
            price_id,
            success_url: success_url.unwrap_or_else(|| {
                format!("{}?checkout=success&session_id={{CHECKOUT_SESSION_ID}}", billing_url)
            }),
            cancel_url: cancel_url.unwrap_or_else(|| format!("{}?checkout=cancelled", billing_url)),
            metadata: Metadata::from([
                ("tenant_id".to_string(), tenant_id.to_string()),
                ("plan_id".to_string(), plan.id.to_string()),
            ]),
        };

        let key = format!("checkout_{}_{}_{}", tenant_id, plan.id, Uuid::new_v4());
        let gateway = &self.gateway;
        let session = with_retry("create_checkout_session", self.retry.attempts, cancel, || {
            gateway.create_checkout_session(&request, &key)
        })
        .await?;

        tracing::info!(
            session_id = %session.id,
            descriptor = %plan.descriptor,
            mode = ?mode,
            "Created checkout session"
        );
        Ok(session)
    }
}
