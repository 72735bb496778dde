//! Processor gateway contract
//!
//! One async method per remote operation. Every call performs exactly one
//! outbound request; retries are layered above in [`crate::retry`]. Mutating
//! calls take an idempotency key so that a retried or replayed call never
//! creates a second object at the processor.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a processor failure should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate limits, 5xx responses, timeouts, connection failures
    Transient,
    /// Validation errors and other 4xx responses
    Permanent,
    Unknown,
}

/// Classified processor failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("processor {operation} failed ({class:?}): {message}")]
pub struct ProcessorError {
    pub class: ErrorClass,
    pub operation: &'static str,
    pub message: String,
    pub http_status: Option<u16>,
}

impl ProcessorError {
    pub fn new(class: ErrorClass, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            class,
            operation,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, operation, message)
    }

    pub fn permanent(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, operation, message)
    }

    /// Error returned when a retry loop is cancelled before any attempt ran.
    pub fn cancelled(operation: &'static str) -> Self {
        Self::transient(operation, "cancelled before completion")
    }

    /// Classify by HTTP status: 429 and 5xx are transient, other 4xx permanent.
    pub fn from_status(operation: &'static str, status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            429 | 500..=599 => ErrorClass::Transient,
            400..=499 => ErrorClass::Permanent,
            _ => ErrorClass::Unknown,
        };
        Self {
            class,
            operation,
            message: message.into(),
            http_status: Some(status),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

pub type Metadata = HashMap<String, String>;

// =============================================================================
// Customers and payment methods
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRecord {
    pub id: String,
    pub email: Option<String>,
    pub deleted: bool,
    pub default_payment_method: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCustomer {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRecord {
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodRecord {
    pub id: String,
    /// Processor payment method type, e.g. `card`
    pub kind: String,
    pub customer_id: Option<String>,
    pub card: Option<CardRecord>,
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRecord {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurringInterval {
    Month,
    Year,
}

impl RecurringInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringInterval::Month => "month",
            RecurringInterval::Year => "year",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceRecord {
    pub id: String,
    pub product_id: String,
    pub currency: String,
    pub unit_amount: Option<i64>,
    pub interval: Option<RecurringInterval>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewPrice {
    pub product_id: String,
    pub currency: String,
    pub unit_amount: i64,
    pub interval: RecurringInterval,
    pub metadata: Metadata,
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: String,
    pub customer_id: String,
    /// Raw processor status, e.g. `active`, `trialing`
    pub status: String,
    pub item_id: Option<String>,
    pub price_id: Option<String>,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub created: i64,
    pub trial_end: Option<i64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentBehavior {
    /// Activate even when the first payment cannot be collected
    AllowIncomplete,
    /// Stay incomplete until the first invoice is paid
    DefaultIncomplete,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub payment_behavior: PaymentBehavior,
    pub charge_automatically: bool,
    /// Unix time the trial ends, for subscriptions that start trialing
    pub trial_end: Option<i64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub item_id: String,
    pub price_id: String,
    pub create_prorations: bool,
}

/// Trial and metadata changes that leave the price untouched. Metadata keys
/// are merged into the existing set.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTerms {
    pub trial_end: Option<i64>,
    pub metadata: Metadata,
}

/// How the processor bills a plan change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationMode {
    None,
    #[default]
    CreateProrations,
    AlwaysInvoice,
}

impl ProrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationMode::None => "none",
            ProrationMode::CreateProrations => "create_prorations",
            ProrationMode::AlwaysInvoice => "always_invoice",
        }
    }
}

impl std::str::FromStr for ProrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ProrationMode::None),
            "create_prorations" => Ok(ProrationMode::CreateProrations),
            "always_invoice" => Ok(ProrationMode::AlwaysInvoice),
            other => Err(format!("unknown proration mode: {}", other)),
        }
    }
}

/// One phase of a subscription schedule. An open-ended phase has no end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulePhase {
    pub price_id: String,
    pub start_date: i64,
    pub end_date: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRecord {
    pub id: String,
    pub subscription_id: Option<String>,
    /// Raw processor status, e.g. `active`, `not_started`
    pub status: String,
    pub phases: Vec<SchedulePhase>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CancelOptions {
    pub invoice_now: bool,
    pub prorate: bool,
}

// =============================================================================
// Invoices and credit notes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Uncollectible => "uncollectible",
            InvoiceStatus::Void => "void",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: String,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
    pub created: i64,
}

/// Invoice for one-off charges. A due date switches collection to
/// emailing the invoice instead of charging the default card.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub customer_id: String,
    pub currency: String,
    pub description: Option<String>,
    pub due_date: Option<i64>,
    pub auto_advance: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct NewInvoiceItem {
    pub customer_id: String,
    pub invoice_id: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceItemRecord {
    pub id: String,
    pub invoice_id: Option<String>,
    pub amount: i64,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceQuery {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditNoteRecord {
    pub id: String,
    pub invoice_id: String,
    pub amount: i64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct NewCreditNote {
    pub invoice_id: String,
    pub amount: i64,
    pub memo: String,
    pub metadata: Metadata,
}

// =============================================================================
// Sessions and tax
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Setup,
    Subscription,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub mode: CheckoutMode,
    pub price_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSessionRecord {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupIntentRecord {
    pub id: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Card setup for off-session use
#[derive(Debug, Clone)]
pub struct NewSetupIntent {
    pub customer_id: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalSessionRecord {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct TaxCalculationRequest {
    pub customer_id: String,
    pub currency: String,
    pub amount: i64,
    pub reference: String,
    pub tax_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxCalculationRecord {
    pub id: Option<String>,
    pub amount_total: i64,
    pub tax_amount_exclusive: i64,
    pub tax_amount_inclusive: i64,
}

/// Remote payment processor
#[async_trait]
pub trait ProcessorGateway: Send + Sync {
    async fn create_customer(&self, params: &NewCustomer, key: &str) -> ProcessorResult<CustomerRecord>;

    async fn retrieve_customer(&self, customer_id: &str) -> ProcessorResult<CustomerRecord>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        key: &str,
    ) -> ProcessorResult<CustomerRecord>;

    async fn retrieve_payment_method(&self, payment_method_id: &str) -> ProcessorResult<PaymentMethodRecord>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        key: &str,
    ) -> ProcessorResult<PaymentMethodRecord>;

    async fn retrieve_product(&self, product_id: &str) -> ProcessorResult<ProductRecord>;

    async fn list_active_products(&self, limit: u64) -> ProcessorResult<Vec<ProductRecord>>;

    async fn create_product(&self, params: &NewProduct, key: &str) -> ProcessorResult<ProductRecord>;

    async fn update_product_metadata(
        &self,
        product_id: &str,
        metadata: &Metadata,
        key: &str,
    ) -> ProcessorResult<ProductRecord>;

    async fn retrieve_price(&self, price_id: &str) -> ProcessorResult<PriceRecord>;

    async fn create_price(&self, params: &NewPrice, key: &str) -> ProcessorResult<PriceRecord>;

    async fn create_subscription(
        &self,
        params: &NewSubscription,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> ProcessorResult<SubscriptionRecord>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord>;

    async fn update_subscription_terms(
        &self,
        subscription_id: &str,
        terms: &SubscriptionTerms,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        options: &CancelOptions,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord>;

    /// Schedule that takes over billing of an existing subscription,
    /// starting with its current phase
    async fn create_subscription_schedule(&self, subscription_id: &str, key: &str) -> ProcessorResult<ScheduleRecord>;

    /// Replace every phase of a schedule
    async fn update_subscription_schedule(
        &self,
        schedule_id: &str,
        phases: &[SchedulePhase],
        proration: ProrationMode,
        key: &str,
    ) -> ProcessorResult<ScheduleRecord>;

    async fn list_invoices(&self, query: &InvoiceQuery) -> ProcessorResult<Vec<InvoiceRecord>>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> ProcessorResult<InvoiceRecord>;

    async fn finalize_invoice(&self, invoice_id: &str, key: &str) -> ProcessorResult<InvoiceRecord>;

    async fn pay_invoice(&self, invoice_id: &str, key: &str) -> ProcessorResult<InvoiceRecord>;

    async fn create_invoice(&self, params: &NewInvoice, key: &str) -> ProcessorResult<InvoiceRecord>;

    async fn create_invoice_item(&self, params: &NewInvoiceItem, key: &str) -> ProcessorResult<InvoiceItemRecord>;

    async fn list_credit_notes(&self, invoice_id: &str) -> ProcessorResult<Vec<CreditNoteRecord>>;

    async fn create_credit_note(&self, params: &NewCreditNote, key: &str) -> ProcessorResult<CreditNoteRecord>;

    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionRequest,
        key: &str,
    ) -> ProcessorResult<CheckoutSessionRecord>;

    async fn create_setup_intent(&self, params: &NewSetupIntent, key: &str) -> ProcessorResult<SetupIntentRecord>;

    async fn retrieve_setup_intent(&self, setup_intent_id: &str) -> ProcessorResult<SetupIntentRecord>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProcessorResult<PortalSessionRecord>;

    async fn calculate_tax(&self, params: &TaxCalculationRequest) -> ProcessorResult<TaxCalculationRecord>;
}
