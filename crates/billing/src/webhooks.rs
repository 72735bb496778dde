//! Processor webhook ingestion
//!
//! Every delivery is verified against the `Stripe-Signature` scheme
//! (`t=<unix>,v1=<hex hmac>`), deduplicated through the processed-event
//! ledger, and folded into local state. A handler failure leaves no ledger
//! entry so the processor's redelivery runs the handler again.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subsync_shared::{Repository, Scope};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult, WebhookRejection};
use crate::gateway::ProcessorGateway;
use crate::ledger::ProcessedEvent;
use crate::notifications::NotificationTemplate;
use crate::retry::{with_retry, CancelSignal, RetrySettings};
use crate::subscriptions::{Subscription, SubscriptionService, SubscriptionStatus};
use crate::tenants::TenantDirectory;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Rows younger than this get a confirmation rather than a renewal receipt
const CONFIRMATION_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Ignored,
}

/// The parts of an event envelope the processor relies on
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub object: Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> Result<Self, WebhookRejection> {
        let envelope: Value =
            serde_json::from_str(payload).map_err(|_| WebhookRejection::InvalidPayload)?;

        let id = envelope
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(WebhookRejection::InvalidPayload)?;
        let event_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or(WebhookRejection::InvalidPayload)?;
        let object = envelope
            .get("data")
            .and_then(|data| data.get("object"))
            .filter(|object| object.is_object())
            .ok_or(WebhookRejection::InvalidPayload)?;

        Ok(Self {
            id: id.to_string(),
            event_type: event_type.to_string(),
            object: object.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    InvoiceMarkedUncollectible,
    InvoiceFinalized,
    InvoiceVoided,
    PaymentMethodAutomaticallyUpdated,
    CheckoutSessionCompleted,
    Unhandled,
}

impl EventKind {
    fn parse(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => EventKind::TrialWillEnd,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "invoice.marked_uncollectible" => EventKind::InvoiceMarkedUncollectible,
            "invoice.finalized" => EventKind::InvoiceFinalized,
            "invoice.voided" => EventKind::InvoiceVoided,
            "payment_method.automatically_updated" => EventKind::PaymentMethodAutomaticallyUpdated,
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            _ => EventKind::Unhandled,
        }
    }
}

/// Check a `Stripe-Signature` header against `payload`. Any `v1` entry may match.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: i64,
) -> Result<(), WebhookRejection> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookRejection::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(WebhookRejection::InvalidSignature);
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookRejection::TimestampOutOfTolerance);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| WebhookRejection::InvalidSignature)?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(WebhookRejection::InvalidSignature)
}

pub struct WebhookProcessor {
    secret: Option<String>,
    gateway: Arc<dyn ProcessorGateway>,
    subscriptions: Arc<SubscriptionService>,
    customers: Arc<CustomerService>,
    tenants: Arc<dyn TenantDirectory>,
    ledger: Arc<dyn Repository<ProcessedEvent>>,
    retry: RetrySettings,
}

impl WebhookProcessor {
    pub fn new(
        secret: Option<String>,
        gateway: Arc<dyn ProcessorGateway>,
        subscriptions: Arc<SubscriptionService>,
        customers: Arc<CustomerService>,
        tenants: Arc<dyn TenantDirectory>,
        ledger: Arc<dyn Repository<ProcessedEvent>>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            secret,
            gateway,
            subscriptions,
            customers,
            tenants,
            ledger,
            retry,
        }
    }

    /// Verify, deduplicate, and apply one delivery
    #[tracing::instrument(skip_all)]
    pub async fn handle(
        &self,
        payload: &str,
        signature: Option<&str>,
        cancel: &CancelSignal,
    ) -> BillingResult<WebhookOutcome> {
        let secret = self
            .secret
            .as_deref()
            .ok_or(BillingError::Webhook(WebhookRejection::MissingSecret))?;
        let signature = signature
            .filter(|s| !s.is_empty())
            .ok_or(BillingError::Webhook(WebhookRejection::MissingSignature))?;
        verify_signature(
            secret,
            payload,
            signature,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .map_err(BillingError::Webhook)?;

        let event = WebhookEvent::parse(payload).map_err(BillingError::Webhook)?;
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Received webhook");

        match self
            .ledger
            .find_one(&[Scope::eq("event_id", event.id.as_str())])
            .await
        {
            Ok(_) => {
                tracing::info!(event_id = %event.id, "Duplicate webhook, skipping");
                return Ok(WebhookOutcome::Duplicate);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let outcome = self.dispatch(&event, cancel).await?;
        self.record(&event).await;
        Ok(outcome)
    }

    async fn dispatch(&self, event: &WebhookEvent, cancel: &CancelSignal) -> BillingResult<WebhookOutcome> {
        let object = &event.object;

        match EventKind::parse(&event.event_type) {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                let id = required_id(object)?;
                let status = object.get("status").and_then(Value::as_str).unwrap_or_default();
                let (_, period_end) = period_bounds(object);
                let price_id = item_price(object);
                self.subscriptions
                    .sync_status(&id, status, period_end, price_id.as_deref())
                    .await?;
            }
            EventKind::SubscriptionDeleted => {
                let id = required_id(object)?;
                let (period_start, period_end) = period_bounds(object);
                let refund = self
                    .subscriptions
                    .finalize_cancellation(&id, period_start, period_end, cancel)
                    .await?;
                tracing::info!(processor_subscription_id = %id, refund = ?refund, "Subscription deleted");
            }
            EventKind::TrialWillEnd => {
                let id = required_id(object)?;
                if let Some(sub) = self.subscriptions.find_by_processor_id(&id).await? {
                    let data = serde_json::json!({ "trial_end": int_field(object, "trial_end") });
                    self.subscriptions
                        .notify_tenant(sub.tenant_id, NotificationTemplate::TrialEnding, data)
                        .await;
                }
            }
            EventKind::InvoicePaymentSucceeded => {
                let Some(sub_id) = invoice_subscription(object) else {
                    tracing::debug!("Invoice has no subscription");
                    return Ok(WebhookOutcome::Processed);
                };
                if let Some(sub) = self.subscriptions.mark_active(&sub_id).await? {
                    self.notify_payment_succeeded(&sub, object).await;
                }
            }
            EventKind::InvoicePaymentFailed => {
                let Some(sub_id) = invoice_subscription(object) else {
                    tracing::debug!("Invoice has no subscription");
                    return Ok(WebhookOutcome::Processed);
                };
                if let Some(sub) = self.subscriptions.mark_past_due(&sub_id).await? {
                    let data = invoice_payload(object, "amount_due");
                    self.subscriptions
                        .notify_tenant(sub.tenant_id, NotificationTemplate::PaymentFailed, data)
                        .await;
                }
            }
            EventKind::InvoiceMarkedUncollectible => {
                if let Some(sub_id) = invoice_subscription(object) {
                    self.subscriptions.mark_past_due(&sub_id).await?;
                }
            }
            EventKind::InvoiceFinalized | EventKind::InvoiceVoided => {
                let invoice_id = id_field(object, "id").unwrap_or_default();
                tracing::info!(
                    invoice_id = %invoice_id,
                    event_type = %event.event_type,
                    "Invoice state changed"
                );
            }
            EventKind::PaymentMethodAutomaticallyUpdated => {
                self.adopt_updated_payment_method(object, cancel).await?;
            }
            EventKind::CheckoutSessionCompleted => {
                self.complete_checkout(object, cancel).await?;
            }
            EventKind::Unhandled => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                return Ok(WebhookOutcome::Ignored);
            }
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn record(&self, event: &WebhookEvent) {
        match self
            .ledger
            .create_one(&ProcessedEvent::new(&event.id, &event.event_type))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(event_id = %event.id, "Event already recorded by a concurrent delivery");
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Failed to record processed event");
            }
        }
    }

    async fn notify_payment_succeeded(&self, sub: &Subscription, invoice: &Value) {
        if sub.status != SubscriptionStatus::Active {
            return;
        }
        let template = if OffsetDateTime::now_utc() - sub.created_at < CONFIRMATION_WINDOW {
            NotificationTemplate::SubscriptionConfirmed
        } else {
            NotificationTemplate::PaymentSucceeded
        };
        self.subscriptions
            .notify_tenant(sub.tenant_id, template, invoice_payload(invoice, "amount_paid"))
            .await;
    }

    /// The processor swapped a card on file; make it the default when the
    /// customer has none
    async fn adopt_updated_payment_method(&self, object: &Value, cancel: &CancelSignal) -> BillingResult<()> {
        let payment_method_id = required_id(object)?;
        let Some(customer_id) = id_field(object, "customer") else {
            tracing::debug!(payment_method_id = %payment_method_id, "Payment method has no customer");
            return Ok(());
        };

        let customer = self.customers.retrieve_customer(&customer_id, cancel).await?;
        if customer.default_payment_method.is_some() {
            return Ok(());
        }

        self.customers
            .set_default(&customer_id, &payment_method_id, cancel)
            .await?;
        if let Some(tenant) = self.tenants.find_by_processor_customer(&customer_id).await? {
            self.tenants
                .set_default_payment_method(tenant.id, &payment_method_id)
                .await?;
        }
        tracing::info!(customer_id = %customer_id, payment_method_id = %payment_method_id, "Adopted updated payment method");
        Ok(())
    }

    async fn complete_checkout(&self, session: &Value, cancel: &CancelSignal) -> BillingResult<()> {
        if let Some(setup_intent_id) = id_field(session, "setup_intent") {
            let gateway = &self.gateway;
            let intent = with_retry("retrieve_setup_intent", self.retry.attempts, cancel, || {
                gateway.retrieve_setup_intent(&setup_intent_id)
            })
            .await?;

            let customer_id = intent.customer_id.clone().or_else(|| id_field(session, "customer"));
            match (intent.payment_method_id.as_deref(), customer_id) {
                (Some(pm), Some(customer_id)) => {
                    self.customers
                        .attach_and_set_default(&customer_id, pm, cancel)
                        .await?;
                    if let Some(tenant_id) = self.checkout_tenant(session, &customer_id).await? {
                        self.tenants.set_default_payment_method(tenant_id, pm).await?;
                    }
                    tracing::info!(customer_id = %customer_id, payment_method_id = %pm, "Saved payment method from checkout");
                }
                _ => tracing::warn!(setup_intent_id = %setup_intent_id, "Setup intent has no payment method or customer"),
            }
        }

        if let Some(sub_id) = id_field(session, "subscription") {
            self.subscriptions.mark_active(&sub_id).await?;
        }
        Ok(())
    }

    async fn checkout_tenant(&self, session: &Value, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let from_metadata = session
            .get("metadata")
            .and_then(|m| m.get("tenant_id"))
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());
        if from_metadata.is_some() {
            return Ok(from_metadata);
        }
        Ok(self
            .tenants
            .find_by_processor_customer(customer_id)
            .await?
            .map(|t| t.id))
    }
}

/// Id of a referenced object, whether expanded or not
fn id_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(expanded) => expanded
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn required_id(object: &Value) -> BillingResult<String> {
    object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or(BillingError::Webhook(WebhookRejection::InvalidPayload))
}

fn int_field(object: &Value, key: &str) -> i64 {
    object.get(key).and_then(Value::as_i64).unwrap_or(0)
}

/// Billing period of a subscription object. Newer API versions report it
/// on the first item only.
fn period_bounds(subscription: &Value) -> (i64, i64) {
    let start = int_field(subscription, "current_period_start");
    let end = int_field(subscription, "current_period_end");
    if start != 0 && end != 0 {
        return (start, end);
    }

    let item = subscription
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(|data| data.get(0));
    match item {
        Some(item) => (
            int_field(item, "current_period_start"),
            int_field(item, "current_period_end"),
        ),
        None => (start, end),
    }
}

/// Price of the first subscription item
fn item_price(subscription: &Value) -> Option<String> {
    subscription
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(|data| data.get(0))
        .and_then(|item| id_field(item, "price"))
}

fn invoice_subscription(invoice: &Value) -> Option<String> {
    id_field(invoice, "subscription").or_else(|| {
        invoice
            .get("parent")
            .and_then(|parent| parent.get("subscription_details"))
            .and_then(|details| id_field(details, "subscription"))
    })
}

fn invoice_payload(invoice: &Value, amount_key: &str) -> Value {
    serde_json::json!({
        "invoice_id": invoice.get("id").and_then(Value::as_str),
        "amount_cents": int_field(invoice, amount_key),
        "currency": invoice.get("currency").and_then(Value::as_str),
        "invoice_url": invoice.get("hosted_invoice_url").and_then(Value::as_str),
        "created": int_field(invoice, "created"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn any_v1_entry_may_match() {
        let payload = r#"{"id":"evt_1"}"#;
        let valid = sign(payload, 1_700_000_000);
        let header = valid.replacen("v1=", "v1=00ff,v1=", 1);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, r#"{"id":"evt_2"}"#, &header, 1_700_000_000),
            Err(WebhookRejection::InvalidSignature)
        );
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, payload, &header, 1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1),
            Err(WebhookRejection::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn malformed_header_fails() {
        assert_eq!(
            verify_signature(SECRET, "{}", "garbage", 0),
            Err(WebhookRejection::InvalidSignature)
        );
        assert_eq!(
            verify_signature(SECRET, "{}", "t=1", 1),
            Err(WebhookRejection::InvalidSignature)
        );
    }

    #[test]
    fn envelope_requires_id_type_and_object() {
        assert!(WebhookEvent::parse(r#"{"id":"evt_1","type":"x","data":{"object":{}}}"#).is_ok());
        assert_eq!(
            WebhookEvent::parse(r#"{"type":"x","data":{"object":{}}}"#).unwrap_err(),
            WebhookRejection::InvalidPayload
        );
        assert_eq!(
            WebhookEvent::parse(r#"{"id":"evt_1","type":"x","data":{}}"#).unwrap_err(),
            WebhookRejection::InvalidPayload
        );
        assert_eq!(WebhookEvent::parse("not json").unwrap_err(), WebhookRejection::InvalidPayload);
    }

    #[test]
    fn referenced_ids_may_be_expanded() {
        let object = serde_json::json!({
            "customer": "cus_1",
            "subscription": { "id": "sub_1" },
            "setup_intent": null,
        });
        assert_eq!(id_field(&object, "customer").as_deref(), Some("cus_1"));
        assert_eq!(id_field(&object, "subscription").as_deref(), Some("sub_1"));
        assert_eq!(id_field(&object, "setup_intent"), None);
    }

    #[test]
    fn period_falls_back_to_first_item() {
        let object = serde_json::json!({
            "items": { "data": [{ "current_period_start": 10, "current_period_end": 20 }] }
        });
        assert_eq!(period_bounds(&object), (10, 20));

        let top_level = serde_json::json!({ "current_period_start": 1, "current_period_end": 2 });
        assert_eq!(period_bounds(&top_level), (1, 2));
    }

    #[test]
    fn item_price_reads_first_item() {
        let object = serde_json::json!({
            "items": { "data": [{ "price": { "id": "price_pro" } }, { "price": "price_other" }] }
        });
        assert_eq!(item_price(&object).as_deref(), Some("price_pro"));
        assert_eq!(item_price(&serde_json::json!({ "items": { "data": [] } })), None);
    }

    #[test]
    fn invoice_subscription_reads_parent_details() {
        let invoice = serde_json::json!({
            "parent": { "subscription_details": { "subscription": "sub_9" } }
        });
        assert_eq!(invoice_subscription(&invoice).as_deref(), Some("sub_9"));
    }

    #[test]
    fn event_kinds() {
        assert_eq!(
            EventKind::parse("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(EventKind::parse("charge.refunded"), EventKind::Unhandled);
    }
}
