//! Tenant-facing invoice listing, one-off invoices, and payment

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    InvoiceQuery, InvoiceRecord, InvoiceStatus, Metadata, NewInvoice, NewInvoiceItem, ProcessorGateway,
};
use crate::retry::{with_retry, CancelSignal, RetrySettings};
use crate::subscriptions::parse_day;
use crate::tenants::{Tenant, TenantDirectory};

/// Maximum invoices returned by a listing
pub const INVOICE_LIST_LIMIT: u64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceFilter {
    Open,
    Paid,
    #[default]
    All,
}

impl InvoiceFilter {
    fn status(&self) -> Option<InvoiceStatus> {
        match self {
            InvoiceFilter::Open => Some(InvoiceStatus::Open),
            InvoiceFilter::Paid => Some(InvoiceStatus::Paid),
            InvoiceFilter::All => None,
        }
    }
}

/// One-off charge billed to a tenant outside its subscription
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub description: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    /// "YYYY-MM-DD"; without one the invoice is charged automatically
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceDownload {
    pub invoice_id: String,
    pub url: String,
}

pub struct InvoiceService {
    gateway: Arc<dyn ProcessorGateway>,
    customers: Arc<CustomerService>,
    tenants: Arc<dyn TenantDirectory>,
    retry: RetrySettings,
}

impl InvoiceService {
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

    pub async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: InvoiceFilter,
        cancel: &CancelSignal,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let Some(customer_id) = tenant.processor_customer_id else {
            return Ok(Vec::new());
        };

        let query = InvoiceQuery {
            customer_id: Some(customer_id),
            subscription_id: None,
            status: filter.status(),
            limit: INVOICE_LIST_LIMIT,
        };
        let gateway = &self.gateway;
        let invoices = with_retry("list_invoices", self.retry.attempts, cancel, || {
            gateway.list_invoices(&query)
        })
        .await?;
        Ok(invoices)
    }

    /// Pay one of the tenant's invoices, finalizing a draft first
    #[tracing::instrument(skip(self, cancel))]
    pub async fn pay_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<InvoiceRecord> {
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let invoice = self.owned_invoice(&tenant, invoice_id, cancel).await?;
        let gateway = &self.gateway;
        let attempts = self.retry.attempts;

        if invoice.status == Some(InvoiceStatus::Draft) {
            let key = format!("finalize_invoice_{}", invoice_id);
            with_retry("finalize_invoice", attempts, cancel, || {
                gateway.finalize_invoice(invoice_id, &key)
            })
            .await?;
        }

        let key = format!("pay_invoice_{}", invoice_id);
        let paid = with_retry("pay_invoice", attempts, cancel, || {
            gateway.pay_invoice(invoice_id, &key)
        })
        .await?;

        tracing::info!(amount_paid = paid.amount_paid, "Paid invoice");
        Ok(paid)
    }

    /// PDF link of one of the tenant's invoices, or the hosted page when the
    /// processor has not rendered a PDF yet
    pub async fn download_url(
        &self,
        tenant_id: Uuid,
        invoice_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<InvoiceDownload> {
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let invoice = self.owned_invoice(&tenant, invoice_id, cancel).await?;
        let url = invoice
            .invoice_pdf
            .or(invoice.hosted_invoice_url)
            .ok_or_else(|| BillingError::InvalidState(format!("invoice {} has no document yet", invoice_id)))?;
        Ok(InvoiceDownload {
            invoice_id: invoice.id,
            url,
        })
    }

    /// Bill a one-off amount: a draft invoice, one line attached to it, then
    /// the invoice re-read with its totals
    #[tracing::instrument(skip(self, request, cancel), fields(amount = request.amount, currency = %request.currency))]
    pub async fn create_invoice(
        &self,
        tenant_id: Uuid,
        request: &InvoiceRequest,
        cancel: &CancelSignal,
    ) -> BillingResult<InvoiceRecord> {
        let due_date = validate_request(request, OffsetDateTime::now_utc())?;
        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;

        let gateway = &self.gateway;
        let attempts = self.retry.attempts;
        let request_id = Uuid::new_v4();
        let currency = request.currency.to_lowercase();
        let description = request.description.trim().to_string();

        let params = NewInvoice {
            customer_id: customer_id.clone(),
            currency: currency.clone(),
            description: Some(description.clone()),
            due_date,
            auto_advance: true,
            metadata: Metadata::from([
                ("tenant_id".to_string(), tenant.id.to_string()),
                ("request_id".to_string(), request_id.to_string()),
            ]),
        };
        let key = format!("invoice_{}_{}", tenant.id, request_id);
        let invoice = with_retry("create_invoice", attempts, cancel, || {
            gateway.create_invoice(&params, &key)
        })
        .await?;

        let item = NewInvoiceItem {
            customer_id,
            invoice_id: invoice.id.clone(),
            amount: request.amount,
            currency,
            description: Some(description),
        };
        let key = format!("invoice_item_{}_{}", tenant.id, request_id);
        with_retry("create_invoice_item", attempts, cancel, || {
            gateway.create_invoice_item(&item, &key)
        })
        .await?;

        let invoice = with_retry("retrieve_invoice", attempts, cancel, || {
            gateway.retrieve_invoice(&invoice.id)
        })
        .await?;

        tracing::info!(invoice_id = %invoice.id, amount_due = invoice.amount_due, "Created invoice");
        Ok(invoice)
    }

    /// Invoice `invoice_id` when it bills the tenant's customer. Invoices of
    /// other customers read as missing.
    async fn owned_invoice(
        &self,
        tenant: &Tenant,
        invoice_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<InvoiceRecord> {
        let gateway = &self.gateway;
        let invoice = match with_retry("retrieve_invoice", self.retry.attempts, cancel, || {
            gateway.retrieve_invoice(invoice_id)
        })
        .await
        {
            Ok(invoice) => invoice,
            Err(e) if e.http_status == Some(404) => {
                return Err(BillingError::InvoiceNotFound(invoice_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let owned = tenant.processor_customer_id.is_some()
            && invoice.customer_id == tenant.processor_customer_id;
        if !owned {
            tracing::warn!(invoice_id, "Invoice does not belong to tenant");
            return Err(BillingError::InvoiceNotFound(invoice_id.to_string()));
        }
        Ok(invoice)
    }
}

/// Due date as a unix timestamp, after checking the rest of the request
fn validate_request(request: &InvoiceRequest, now: OffsetDateTime) -> BillingResult<Option<i64>> {
    if request.description.trim().is_empty() {
        return Err(BillingError::InvalidInput("description is required".to_string()));
    }
    if request.amount <= 0 {
        return Err(BillingError::InvalidInput(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }
    let currency = request.currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::InvalidInput(format!(
            "currency must be a three-letter ISO code, got {}",
            request.currency
        )));
    }

    let Some(due) = request.due_date.as_deref() else {
        return Ok(None);
    };
    let day = parse_day(due)
        .ok_or_else(|| BillingError::InvalidInput(format!("due_date must be YYYY-MM-DD, got {}", due)))?;
    if day < now.date() {
        return Err(BillingError::InvalidInput(format!("due_date {} is in the past", due)));
    }
    Ok(Some(day.midnight().assume_utc().unix_timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn request(amount: i64, currency: &str, due_date: Option<&str>) -> InvoiceRequest {
        InvoiceRequest {
            description: "Onboarding".to_string(),
            amount,
            currency: currency.to_string(),
            due_date: due_date.map(str::to_string),
        }
    }

    #[test]
    fn one_off_invoices_are_validated() {
        let now = datetime!(2031-02-03 10:00 UTC);

        assert_eq!(validate_request(&request(500, "aed", None), now).unwrap(), None);
        assert_eq!(
            validate_request(&request(500, "AED", Some("2031-02-03")), now).unwrap(),
            Some(datetime!(2031-02-03 0:00 UTC).unix_timestamp())
        );

        for bad in [
            request(0, "aed", None),
            request(500, "dirham", None),
            request(500, "aed", Some("2031-02-02")),
            request(500, "aed", Some("next week")),
        ] {
            assert!(matches!(
                validate_request(&bad, now),
                Err(BillingError::InvalidInput(_))
            ));
        }

        let mut blank = request(500, "aed", None);
        blank.description = "  ".to_string();
        assert!(validate_request(&blank, now).is_err());
    }
}
