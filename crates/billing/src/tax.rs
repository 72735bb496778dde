//! Tax calculation delegated to the processor

use std::sync::Arc;

use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ProcessorGateway, TaxCalculationRecord, TaxCalculationRequest};
use crate::retry::{with_retry, CancelSignal, RetrySettings};
use crate::tenants::TenantDirectory;

/// Product tax code for general electronically supplied services
pub const SERVICE_TAX_CODE: &str = "txcd_10000000";
/// Line item reference sent with every calculation
pub const SERVICE_CHARGE_REFERENCE: &str = "service_charge";

pub struct TaxService {
    gateway: Arc<dyn ProcessorGateway>,
    customers: Arc<CustomerService>,
    tenants: Arc<dyn TenantDirectory>,
    retry: RetrySettings,
}

impl TaxService {
    pub fn new(
        gateway: Arc<dyn ProcessorGateway>,
        customers: Arc<CustomerService>,
        tenants: Arc<dyn TenantDirectory>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            gateway,
            customers,
            tenants,
            retry,
        }
    }

    pub async fn calculate(
        &self,
        tenant_id: Uuid,
        amount: i64,
        currency: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<TaxCalculationRecord> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput("amount must be positive".to_string()));
        }
        let currency = currency.trim().to_lowercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(format!("invalid currency: {}", currency)));
        }

        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;

        let request = TaxCalculationRequest {
            customer_id,
            currency,
            amount,
            reference: SERVICE_CHARGE_REFERENCE.to_string(),
            tax_code: SERVICE_TAX_CODE.to_string(),
        };
        let gateway = &self.gateway;
        let calculation = with_retry("calculate_tax", self.retry.attempts, cancel, || {
            gateway.calculate_tax(&request)
        })
        .await?;

        tracing::debug!(
            tenant_id = %tenant_id,
            amount_total = calculation.amount_total,
            "Calculated tax"
        );
        Ok(calculation)
    }
}
