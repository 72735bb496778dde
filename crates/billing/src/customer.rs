//! Processor customer and payment-method management

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{CustomerRecord, Metadata, NewCustomer, NewSetupIntent, ProcessorGateway, SetupIntentRecord};
use crate::retry::{with_retry, CancelSignal, RetrySettings};
use crate::tenants::{Tenant, TenantDirectory};

/// Customer service for keeping one processor customer per tenant
pub struct CustomerService {
    gateway: Arc<dyn ProcessorGateway>,
    tenants: Arc<dyn TenantDirectory>,
    retry: RetrySettings,
}

impl CustomerService {
    pub fn new(
        gateway: Arc<dyn ProcessorGateway>,
        tenants: Arc<dyn TenantDirectory>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            gateway,
            tenants,
            retry,
        }
    }

    /// Processor customer id for `tenant`, creating the customer when the
    /// stored one is missing or was deleted at the processor
    #[tracing::instrument(skip_all, fields(tenant_id = %tenant.id))]
    pub async fn ensure_customer(&self, tenant: &Tenant, cancel: &CancelSignal) -> BillingResult<String> {
        let gateway = &self.gateway;
        let attempts = self.retry.attempts;

        if let Some(customer_id) = &tenant.processor_customer_id {
            match with_retry("retrieve_customer", attempts, cancel, || {
                gateway.retrieve_customer(customer_id)
            })
            .await
            {
                Ok(customer) if !customer.deleted => return Ok(customer.id),
                Ok(_) => {
                    tracing::warn!(customer_id = %customer_id, "Stored customer was deleted, creating a new one");
                }
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        customer_id = %customer_id,
                        error = %e,
                        "Stored customer unavailable, creating a new one"
                    );
                }
            }
        }

        let params = NewCustomer {
            email: Some(tenant.owner_email.clone()),
            name: Some(tenant.name.clone()),
            metadata: Metadata::from([("tenant_id".to_string(), tenant.id.to_string())]),
        };
        let key = format!("customer_{}", tenant.id);
        let customer = with_retry("create_customer", attempts, cancel, || {
            gateway.create_customer(&params, &key)
        })
        .await?;

        self.tenants
            .set_processor_customer_id(tenant.id, &customer.id)
            .await?;

        tracing::info!(customer_id = %customer.id, "Created processor customer");
        Ok(customer.id)
    }

    pub async fn retrieve_customer(&self, customer_id: &str, cancel: &CancelSignal) -> BillingResult<CustomerRecord> {
        let gateway = &self.gateway;
        let customer = with_retry("retrieve_customer", self.retry.attempts, cancel, || {
            gateway.retrieve_customer(customer_id)
        })
        .await?;
        Ok(customer)
    }

    /// Attach a card to the tenant's customer and make it the default
    #[tracing::instrument(skip(self, cancel))]
    pub async fn attach_payment_method(
        &self,
        tenant_id: Uuid,
        payment_method_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<()> {
        if payment_method_id.trim().is_empty() {
            return Err(BillingError::InvalidPaymentMethod(
                "payment method id is required".to_string(),
            ));
        }

        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.ensure_customer(&tenant, cancel).await?;

        let gateway = &self.gateway;
        let attempts = self.retry.attempts;

        let payment_method = with_retry("retrieve_payment_method", attempts, cancel, || {
            gateway.retrieve_payment_method(payment_method_id)
        })
        .await?;
        if payment_method.kind != "card" {
            return Err(BillingError::InvalidPaymentMethod(format!(
                "unsupported payment method type: {}",
                payment_method.kind
            )));
        }

        self.attach_and_set_default(&customer_id, payment_method_id, cancel)
            .await?;
        self.tenants
            .set_default_payment_method(tenant_id, payment_method_id)
            .await?;

        tracing::info!(customer_id = %customer_id, "Attached default payment method");
        Ok(())
    }

    /// Setup intent the client confirms to save a card for off-session charges
    #[tracing::instrument(skip(self, cancel))]
    pub async fn create_setup_intent(
        &self,
        tenant_id: Uuid,
        cancel: &CancelSignal,
    ) -> BillingResult<SetupIntentRecord> {
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.ensure_customer(&tenant, cancel).await?;

        let params = NewSetupIntent {
            customer_id,
            metadata: Metadata::from([("tenant_id".to_string(), tenant.id.to_string())]),
        };
        let key = format!(
            "setup_intent_{}_{}",
            tenant.id,
            OffsetDateTime::now_utc().unix_timestamp()
        );
        let gateway = &self.gateway;
        let intent = with_retry("create_setup_intent", self.retry.attempts, cancel, || {
            gateway.create_setup_intent(&params, &key)
        })
        .await?;

        if intent.client_secret.is_none() {
            return Err(BillingError::Internal(format!(
                "setup intent {} has no client secret",
                intent.id
            )));
        }
        tracing::info!(setup_intent_id = %intent.id, "Created setup intent");
        Ok(intent)
    }

    /// Attach `payment_method_id` to `customer_id` and set it as the invoice default
    pub async fn attach_and_set_default(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<()> {
        let gateway = &self.gateway;
        let attempts = self.retry.attempts;

        let attach_key = format!("attach_pm_{}_{}", payment_method_id, customer_id);
        with_retry("attach_payment_method", attempts, cancel, || {
            gateway.attach_payment_method(payment_method_id, customer_id, &attach_key)
        })
        .await?;

        self.set_default(customer_id, payment_method_id, cancel).await
    }

    pub async fn set_default(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<()> {
        let gateway = &self.gateway;
        let key = format!("set_default_pm_{}_{}", payment_method_id, customer_id);
        with_retry("set_default_payment_method", self.retry.attempts, cancel, || {
            gateway.set_default_payment_method(customer_id, payment_method_id, &key)
        })
        .await?;
        Ok(())
    }
}
