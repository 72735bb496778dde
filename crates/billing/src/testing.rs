//! In-memory collaborators and a scripted processor for tests
//!
//! [`MockGateway`] keeps processor state in memory and honours idempotency
//! keys: replaying a mutation with the same key returns the object the first
//! call produced. Failures can be scripted per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subsync_shared::InMemoryRepository;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::*;
use crate::ledger::ProcessedEvent;
use crate::notifications::{NotificationError, NotificationSender, NotificationTemplate};
use crate::plans::{default_catalog, Plan};
use crate::retry::RetrySettings;
use crate::subscriptions::Subscription;
use crate::tenants::{Tenant, TenantDirectory, UsageCounter};
use crate::{BillingParts, BillingService};

const PERIOD_SECS: i64 = 30 * 86_400;

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn not_found(operation: &'static str, id: &str) -> ProcessorError {
    ProcessorError::from_status(operation, 404, format!("No such object: '{}'", id))
}

#[derive(Default)]
struct MockState {
    sequence: u64,
    keyed: HashMap<String, String>,
    customers: HashMap<String, CustomerRecord>,
    payment_methods: HashMap<String, PaymentMethodRecord>,
    products: Vec<ProductRecord>,
    prices: HashMap<String, PriceRecord>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    invoices: Vec<InvoiceRecord>,
    credit_notes: Vec<CreditNoteRecord>,
    setup_intents: HashMap<String, SetupIntentRecord>,
    schedules: HashMap<String, ScheduleRecord>,
    invoice_items: Vec<InvoiceItemRecord>,
    failures: HashMap<&'static str, VecDeque<ProcessorError>>,
    calls: HashMap<&'static str, usize>,
    new_subscription_status: Option<String>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{}_{:04}", prefix, self.sequence)
    }

    /// Count the call and surface a scripted failure, if any
    fn enter(&mut self, operation: &'static str) -> ProcessorResult<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn replay(&self, key: &str) -> Option<String> {
        self.keyed.get(key).cloned()
    }

    fn invoice_mut(&mut self, operation: &'static str, id: &str) -> ProcessorResult<&mut InvoiceRecord> {
        self.invoices
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| not_found(operation, id))
    }
}

/// Scripted in-memory [`ProcessorGateway`]
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next call of `operation` with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, operation: &'static str, error: ProcessorError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `operation`, failed ones included
    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    /// Status reported by newly created subscriptions, overriding the
    /// payment-behavior default
    pub fn set_new_subscription_status(&self, status: &str) {
        self.state().new_subscription_status = Some(status.to_string());
    }

    pub fn insert_customer(&self, customer: CustomerRecord) {
        self.state().customers.insert(customer.id.clone(), customer);
    }

    pub fn insert_payment_method(&self, payment_method: PaymentMethodRecord) {
        self.state()
            .payment_methods
            .insert(payment_method.id.clone(), payment_method);
    }

    pub fn insert_product(&self, product: ProductRecord) {
        self.state().products.push(product);
    }

    pub fn insert_price(&self, price: PriceRecord) {
        self.state().prices.insert(price.id.clone(), price);
    }

    pub fn insert_subscription(&self, subscription: SubscriptionRecord) {
        self.state()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn insert_invoice(&self, invoice: InvoiceRecord) {
        self.state().invoices.push(invoice);
    }

    pub fn insert_setup_intent(&self, intent: SetupIntentRecord) {
        self.state().setup_intents.insert(intent.id.clone(), intent);
    }

    pub fn customer(&self, id: &str) -> Option<CustomerRecord> {
        self.state().customers.get(id).cloned()
    }

    pub fn customers(&self) -> Vec<CustomerRecord> {
        self.state().customers.values().cloned().collect()
    }

    pub fn price(&self, id: &str) -> Option<PriceRecord> {
        self.state().prices.get(id).cloned()
    }

    pub fn prices(&self) -> Vec<PriceRecord> {
        self.state().prices.values().cloned().collect()
    }

    pub fn products(&self) -> Vec<ProductRecord> {
        self.state().products.clone()
    }

    pub fn subscription(&self, id: &str) -> Option<SubscriptionRecord> {
        self.state().subscriptions.get(id).cloned()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.state().subscriptions.values().cloned().collect()
    }

    pub fn invoice(&self, id: &str) -> Option<InvoiceRecord> {
        self.state().invoices.iter().find(|i| i.id == id).cloned()
    }

    pub fn credit_notes(&self) -> Vec<CreditNoteRecord> {
        self.state().credit_notes.clone()
    }

    pub fn payment_method(&self, id: &str) -> Option<PaymentMethodRecord> {
        self.state().payment_methods.get(id).cloned()
    }

    pub fn setup_intent(&self, id: &str) -> Option<SetupIntentRecord> {
        self.state().setup_intents.get(id).cloned()
    }

    pub fn schedules(&self) -> Vec<ScheduleRecord> {
        self.state().schedules.values().cloned().collect()
    }

    pub fn invoice_items(&self) -> Vec<InvoiceItemRecord> {
        self.state().invoice_items.clone()
    }
}

#[async_trait]
impl ProcessorGateway for MockGateway {
    async fn create_customer(&self, params: &NewCustomer, key: &str) -> ProcessorResult<CustomerRecord> {
        let mut s = self.state();
        s.enter("create_customer")?;
        if let Some(id) = s.replay(key) {
            return s.customers.get(&id).cloned().ok_or_else(|| not_found("create_customer", &id));
        }

        let customer = CustomerRecord {
            id: s.next_id("cus"),
            email: params.email.clone(),
            deleted: false,
            default_payment_method: None,
        };
        s.keyed.insert(key.to_string(), customer.id.clone());
        s.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn retrieve_customer(&self, customer_id: &str) -> ProcessorResult<CustomerRecord> {
        let mut s = self.state();
        s.enter("retrieve_customer")?;
        s.customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| not_found("retrieve_customer", customer_id))
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        _key: &str,
    ) -> ProcessorResult<CustomerRecord> {
        let mut s = self.state();
        s.enter("set_default_payment_method")?;
        let customer = s
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| not_found("set_default_payment_method", customer_id))?;
        customer.default_payment_method = Some(payment_method_id.to_string());
        Ok(customer.clone())
    }

    async fn retrieve_payment_method(&self, payment_method_id: &str) -> ProcessorResult<PaymentMethodRecord> {
        let mut s = self.state();
        s.enter("retrieve_payment_method")?;
        s.payment_methods
            .get(payment_method_id)
            .cloned()
            .ok_or_else(|| not_found("retrieve_payment_method", payment_method_id))
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        _key: &str,
    ) -> ProcessorResult<PaymentMethodRecord> {
        let mut s = self.state();
        s.enter("attach_payment_method")?;
        let payment_method = s
            .payment_methods
            .get_mut(payment_method_id)
            .ok_or_else(|| not_found("attach_payment_method", payment_method_id))?;
        payment_method.customer_id = Some(customer_id.to_string());
        Ok(payment_method.clone())
    }

    async fn retrieve_product(&self, product_id: &str) -> ProcessorResult<ProductRecord> {
        let mut s = self.state();
        s.enter("retrieve_product")?;
        s.products
            .iter()
            .find(|p| p.id == product_id)
            .cloned()
            .ok_or_else(|| not_found("retrieve_product", product_id))
    }

    async fn list_active_products(&self, limit: u64) -> ProcessorResult<Vec<ProductRecord>> {
        let mut s = self.state();
        s.enter("list_active_products")?;
        Ok(s.products
            .iter()
            .filter(|p| p.active)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn create_product(&self, params: &NewProduct, key: &str) -> ProcessorResult<ProductRecord> {
        let mut s = self.state();
        s.enter("create_product")?;
        if let Some(id) = s.replay(key) {
            return s
                .products
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .ok_or_else(|| not_found("create_product", &id));
        }

        let product = ProductRecord {
            id: s.next_id("prod"),
            name: params.name.clone(),
            active: true,
            metadata: params.metadata.clone(),
        };
        s.keyed.insert(key.to_string(), product.id.clone());
        s.products.push(product.clone());
        Ok(product)
    }

    async fn update_product_metadata(
        &self,
        product_id: &str,
        metadata: &Metadata,
        _key: &str,
    ) -> ProcessorResult<ProductRecord> {
        let mut s = self.state();
        s.enter("update_product_metadata")?;
        let product = s
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| not_found("update_product_metadata", product_id))?;
        product
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(product.clone())
    }

    async fn retrieve_price(&self, price_id: &str) -> ProcessorResult<PriceRecord> {
        let mut s = self.state();
        s.enter("retrieve_price")?;
        s.prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| not_found("retrieve_price", price_id))
    }

    async fn create_price(&self, params: &NewPrice, key: &str) -> ProcessorResult<PriceRecord> {
        let mut s = self.state();
        s.enter("create_price")?;
        if let Some(id) = s.replay(key) {
            return s.prices.get(&id).cloned().ok_or_else(|| not_found("create_price", &id));
        }

        let price = PriceRecord {
            id: s.next_id("price"),
            product_id: params.product_id.clone(),
            currency: params.currency.clone(),
            unit_amount: Some(params.unit_amount),
            interval: Some(params.interval),
            active: true,
        };
        s.keyed.insert(key.to_string(), price.id.clone());
        s.prices.insert(price.id.clone(), price.clone());
        Ok(price)
    }

    async fn create_subscription(
        &self,
        params: &NewSubscription,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let mut s = self.state();
        s.enter("create_subscription")?;
        if let Some(id) = s.replay(key) {
            return s
                .subscriptions
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("create_subscription", &id));
        }

        let status = s.new_subscription_status.clone().unwrap_or_else(|| {
            match (params.trial_end, params.payment_behavior) {
                (Some(_), _) => "trialing",
                (None, PaymentBehavior::AllowIncomplete) => "active",
                (None, PaymentBehavior::DefaultIncomplete) => "incomplete",
            }
            .to_string()
        });
        let now = now_unix();
        let subscription = SubscriptionRecord {
            id: s.next_id("sub"),
            customer_id: params.customer_id.clone(),
            status,
            item_id: Some(s.next_id("si")),
            price_id: Some(params.price_id.clone()),
            current_period_start: now,
            current_period_end: params.trial_end.unwrap_or(now + PERIOD_SECS),
            created: now,
            trial_end: params.trial_end,
            metadata: params.metadata.clone(),
        };
        s.keyed.insert(key.to_string(), subscription.id.clone());
        s.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> ProcessorResult<SubscriptionRecord> {
        let mut s = self.state();
        s.enter("retrieve_subscription")?;
        s.subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| not_found("retrieve_subscription", subscription_id))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
        _key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let mut s = self.state();
        s.enter("update_subscription")?;
        let subscription = s
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("update_subscription", subscription_id))?;
        subscription.item_id = Some(change.item_id.clone());
        subscription.price_id = Some(change.price_id.clone());
        Ok(subscription.clone())
    }

    /// Moving the trial end also moves the end of the trial period
    async fn update_subscription_terms(
        &self,
        subscription_id: &str,
        terms: &SubscriptionTerms,
        _key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let mut s = self.state();
        s.enter("update_subscription_terms")?;
        let subscription = s
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("update_subscription_terms", subscription_id))?;
        if let Some(trial_end) = terms.trial_end {
            subscription.trial_end = Some(trial_end);
            subscription.current_period_end = trial_end;
        }
        subscription
            .metadata
            .extend(terms.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(subscription.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        _options: &CancelOptions,
        _key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let mut s = self.state();
        s.enter("cancel_subscription")?;
        let subscription = s
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("cancel_subscription", subscription_id))?;
        subscription.status = "canceled".to_string();
        Ok(subscription.clone())
    }

    async fn create_subscription_schedule(&self, subscription_id: &str, key: &str) -> ProcessorResult<ScheduleRecord> {
        let mut s = self.state();
        s.enter("create_subscription_schedule")?;
        if let Some(id) = s.replay(key) {
            return s
                .schedules
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("create_subscription_schedule", &id));
        }

        let subscription = s
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| not_found("create_subscription_schedule", subscription_id))?;
        if s
            .schedules
            .values()
            .any(|sched| sched.subscription_id.as_deref() == Some(subscription_id))
        {
            return Err(ProcessorError::from_status(
                "create_subscription_schedule",
                400,
                format!("Subscription {} is already managed by a schedule", subscription_id),
            ));
        }

        let schedule = ScheduleRecord {
            id: s.next_id("sub_sched"),
            subscription_id: Some(subscription.id.clone()),
            status: "active".to_string(),
            phases: vec![SchedulePhase {
                price_id: subscription.price_id.clone().unwrap_or_default(),
                start_date: subscription.current_period_start,
                end_date: Some(subscription.current_period_end),
            }],
        };
        s.keyed.insert(key.to_string(), schedule.id.clone());
        s.schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn update_subscription_schedule(
        &self,
        schedule_id: &str,
        phases: &[SchedulePhase],
        _proration: ProrationMode,
        _key: &str,
    ) -> ProcessorResult<ScheduleRecord> {
        let mut s = self.state();
        s.enter("update_subscription_schedule")?;
        let schedule = s
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| not_found("update_subscription_schedule", schedule_id))?;
        schedule.phases = phases.to_vec();
        Ok(schedule.clone())
    }

    async fn list_invoices(&self, query: &InvoiceQuery) -> ProcessorResult<Vec<InvoiceRecord>> {
        let mut s = self.state();
        s.enter("list_invoices")?;
        let mut invoices: Vec<InvoiceRecord> = s
            .invoices
            .iter()
            .filter(|i| query.customer_id.is_none() || i.customer_id == query.customer_id)
            .filter(|i| query.subscription_id.is_none() || i.subscription_id == query.subscription_id)
            .filter(|i| query.status.is_none() || i.status == query.status)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created.cmp(&a.created));
        if query.limit > 0 {
            invoices.truncate(query.limit as usize);
        }
        Ok(invoices)
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> ProcessorResult<InvoiceRecord> {
        let mut s = self.state();
        s.enter("retrieve_invoice")?;
        Ok(s.invoice_mut("retrieve_invoice", invoice_id)?.clone())
    }

    async fn finalize_invoice(&self, invoice_id: &str, _key: &str) -> ProcessorResult<InvoiceRecord> {
        let mut s = self.state();
        s.enter("finalize_invoice")?;
        let invoice = s.invoice_mut("finalize_invoice", invoice_id)?;
        if invoice.status == Some(InvoiceStatus::Draft) {
            invoice.status = Some(InvoiceStatus::Open);
        }
        Ok(invoice.clone())
    }

    async fn pay_invoice(&self, invoice_id: &str, _key: &str) -> ProcessorResult<InvoiceRecord> {
        let mut s = self.state();
        s.enter("pay_invoice")?;
        let invoice = s.invoice_mut("pay_invoice", invoice_id)?;
        match invoice.status {
            Some(InvoiceStatus::Open) => {
                invoice.status = Some(InvoiceStatus::Paid);
                invoice.amount_paid = invoice.amount_due;
                Ok(invoice.clone())
            }
            Some(InvoiceStatus::Paid) => Ok(invoice.clone()),
            other => Err(ProcessorError::from_status(
                "pay_invoice",
                400,
                format!("Invoice in status {:?} cannot be paid", other),
            )),
        }
    }

    /// New invoices stay in draft; the processor would finalize them later
    async fn create_invoice(&self, params: &NewInvoice, key: &str) -> ProcessorResult<InvoiceRecord> {
        let mut s = self.state();
        s.enter("create_invoice")?;
        if let Some(id) = s.replay(key) {
            return Ok(s.invoice_mut("create_invoice", &id)?.clone());
        }

        let id = s.next_id("in");
        let invoice = InvoiceRecord {
            customer_id: Some(params.customer_id.clone()),
            subscription_id: None,
            status: Some(InvoiceStatus::Draft),
            amount_due: 0,
            amount_paid: 0,
            currency: params.currency.to_lowercase(),
            hosted_invoice_url: Some(format!("https://invoice.test/{}", id)),
            invoice_pdf: Some(format!("https://invoice.test/{}/pdf", id)),
            created: now_unix(),
            id,
        };
        s.keyed.insert(key.to_string(), invoice.id.clone());
        s.invoices.push(invoice.clone());
        Ok(invoice)
    }

    async fn create_invoice_item(&self, params: &NewInvoiceItem, key: &str) -> ProcessorResult<InvoiceItemRecord> {
        let mut s = self.state();
        s.enter("create_invoice_item")?;
        if let Some(id) = s.replay(key) {
            return s
                .invoice_items
                .iter()
                .find(|item| item.id == id)
                .cloned()
                .ok_or_else(|| not_found("create_invoice_item", &id));
        }

        let invoice = s.invoice_mut("create_invoice_item", &params.invoice_id)?;
        if invoice.status != Some(InvoiceStatus::Draft) {
            return Err(ProcessorError::from_status(
                "create_invoice_item",
                400,
                format!("Invoice {} is no longer a draft", params.invoice_id),
            ));
        }
        invoice.amount_due += params.amount;

        let item = InvoiceItemRecord {
            id: s.next_id("ii"),
            invoice_id: Some(params.invoice_id.clone()),
            amount: params.amount,
        };
        s.keyed.insert(key.to_string(), item.id.clone());
        s.invoice_items.push(item.clone());
        Ok(item)
    }

    async fn list_credit_notes(&self, invoice_id: &str) -> ProcessorResult<Vec<CreditNoteRecord>> {
        let mut s = self.state();
        s.enter("list_credit_notes")?;
        Ok(s.credit_notes
            .iter()
            .filter(|n| n.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn create_credit_note(&self, params: &NewCreditNote, key: &str) -> ProcessorResult<CreditNoteRecord> {
        let mut s = self.state();
        s.enter("create_credit_note")?;
        if let Some(id) = s.replay(key) {
            return s
                .credit_notes
                .iter()
                .find(|n| n.id == id)
                .cloned()
                .ok_or_else(|| not_found("create_credit_note", &id));
        }

        let note = CreditNoteRecord {
            id: s.next_id("cn"),
            invoice_id: params.invoice_id.clone(),
            amount: params.amount,
            metadata: params.metadata.clone(),
        };
        s.keyed.insert(key.to_string(), note.id.clone());
        s.credit_notes.push(note.clone());
        Ok(note)
    }

    async fn create_checkout_session(
        &self,
        _params: &CheckoutSessionRequest,
        key: &str,
    ) -> ProcessorResult<CheckoutSessionRecord> {
        let mut s = self.state();
        s.enter("create_checkout_session")?;
        let id = match s.replay(key) {
            Some(id) => id,
            None => {
                let id = s.next_id("cs");
                s.keyed.insert(key.to_string(), id.clone());
                id
            }
        };
        Ok(CheckoutSessionRecord {
            url: Some(format!("https://checkout.test/{}", id)),
            id,
        })
    }

    async fn create_setup_intent(&self, params: &NewSetupIntent, key: &str) -> ProcessorResult<SetupIntentRecord> {
        let mut s = self.state();
        s.enter("create_setup_intent")?;
        if let Some(id) = s.replay(key) {
            return s
                .setup_intents
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("create_setup_intent", &id));
        }
        if !s.customers.contains_key(&params.customer_id) {
            return Err(not_found("create_setup_intent", &params.customer_id));
        }

        let id = s.next_id("seti");
        let intent = SetupIntentRecord {
            customer_id: Some(params.customer_id.clone()),
            payment_method_id: None,
            client_secret: Some(format!("{}_secret_test", id)),
            id,
        };
        s.keyed.insert(key.to_string(), intent.id.clone());
        s.setup_intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    async fn retrieve_setup_intent(&self, setup_intent_id: &str) -> ProcessorResult<SetupIntentRecord> {
        let mut s = self.state();
        s.enter("retrieve_setup_intent")?;
        s.setup_intents
            .get(setup_intent_id)
            .cloned()
            .ok_or_else(|| not_found("retrieve_setup_intent", setup_intent_id))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> ProcessorResult<PortalSessionRecord> {
        let mut s = self.state();
        s.enter("create_portal_session")?;
        if !s.customers.contains_key(customer_id) {
            return Err(not_found("create_portal_session", customer_id));
        }
        let id = s.next_id("bps");
        Ok(PortalSessionRecord {
            url: format!("https://portal.test/{}", id),
            id,
        })
    }

    /// Flat 5% exclusive tax
    async fn calculate_tax(&self, params: &TaxCalculationRequest) -> ProcessorResult<TaxCalculationRecord> {
        let mut s = self.state();
        s.enter("calculate_tax")?;
        let tax = params.amount * 5 / 100;
        Ok(TaxCalculationRecord {
            id: Some(s.next_id("taxcalc")),
            amount_total: params.amount + tax,
            tax_amount_exclusive: tax,
            tax_amount_inclusive: 0,
        })
    }
}

/// [`TenantDirectory`] over a map
#[derive(Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<Uuid, Tenant>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, tenant: Tenant) {
        self.tenants.write().await.insert(tenant.id, tenant);
    }

    pub async fn get(&self, tenant_id: Uuid) -> Option<Tenant> {
        self.tenants.read().await.get(&tenant_id).cloned()
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Tenant> {
        self.get(tenant_id)
            .await
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))
    }

    async fn find_by_processor_customer(&self, customer_id: &str) -> BillingResult<Option<Tenant>> {
        Ok(self
            .tenants
            .read()
            .await
            .values()
            .find(|t| t.processor_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn set_processor_customer_id(&self, tenant_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;
        tenant.processor_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn set_default_payment_method(&self, tenant_id: Uuid, payment_method_id: &str) -> BillingResult<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;
        tenant.default_payment_method_id = Some(payment_method_id.to_string());
        Ok(())
    }
}

/// [`UsageCounter`] returning fixed, adjustable counts for every tenant
#[derive(Default)]
pub struct StaticUsage {
    team_members: AtomicI64,
    businesses: AtomicI64,
    orders: AtomicI64,
}

impl StaticUsage {
    pub fn new(team_members: i64, businesses: i64, orders: i64) -> Self {
        Self {
            team_members: AtomicI64::new(team_members),
            businesses: AtomicI64::new(businesses),
            orders: AtomicI64::new(orders),
        }
    }

    pub fn set(&self, team_members: i64, businesses: i64, orders: i64) {
        self.team_members.store(team_members, Ordering::SeqCst);
        self.businesses.store(businesses, Ordering::SeqCst);
        self.orders.store(orders, Ordering::SeqCst);
    }
}

#[async_trait]
impl UsageCounter for StaticUsage {
    async fn team_members(&self, _tenant_id: Uuid) -> BillingResult<i64> {
        Ok(self.team_members.load(Ordering::SeqCst))
    }

    async fn businesses(&self, _tenant_id: Uuid) -> BillingResult<i64> {
        Ok(self.businesses.load(Ordering::SeqCst))
    }

    async fn orders_between(
        &self,
        _tenant_id: Uuid,
        _from: OffsetDateTime,
        _to: OffsetDateTime,
    ) -> BillingResult<i64> {
        Ok(self.orders.load(Ordering::SeqCst))
    }
}

/// A notification captured by [`RecordingSender`]
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub template: NotificationTemplate,
    pub recipient: String,
    pub data: Value,
}

/// [`NotificationSender`] that records every message
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait up to a second for at least `count` messages to arrive
    pub async fn wait_for(&self, count: usize) -> Vec<SentNotification> {
        for _ in 0..100 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(
        &self,
        template: NotificationTemplate,
        recipient: &str,
        data: &Value,
    ) -> Result<String, NotificationError> {
        let mut sent = self
            .sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sent.push(SentNotification {
            template,
            recipient: recipient.to_string(),
            data: data.clone(),
        });
        Ok(format!("msg_{}", sent.len()))
    }
}

/// A fully wired [`BillingService`] over in-memory collaborators
pub struct TestHarness {
    pub billing: BillingService,
    pub gateway: Arc<MockGateway>,
    pub plans: InMemoryRepository<Plan>,
    pub subscriptions: InMemoryRepository<Subscription>,
    pub ledger: InMemoryRepository<ProcessedEvent>,
    pub tenants: Arc<InMemoryTenantDirectory>,
    pub usage: Arc<StaticUsage>,
    pub sender: Arc<RecordingSender>,
}

impl TestHarness {
    pub const WEBHOOK_SECRET: &'static str = "whsec_test_secret";

    /// Harness with the default catalog seeded and no retries
    pub async fn new() -> Self {
        Self::with_retry(RetrySettings { attempts: 1 }).await
    }

    pub async fn with_retry(retry: RetrySettings) -> Self {
        let gateway = Arc::new(MockGateway::new());
        let plans = InMemoryRepository::<Plan>::new();
        let subscriptions = InMemoryRepository::<Subscription>::new();
        let ledger = InMemoryRepository::<ProcessedEvent>::new();
        let tenants = Arc::new(InMemoryTenantDirectory::new());
        let usage = Arc::new(StaticUsage::default());
        let sender = Arc::new(RecordingSender::new());

        let billing = BillingService::from_parts(BillingParts {
            gateway: gateway.clone(),
            plans: Arc::new(plans.clone()),
            subscriptions: Arc::new(subscriptions.clone()),
            ledger: Arc::new(ledger.clone()),
            tenants: tenants.clone(),
            usage: usage.clone(),
            sender: sender.clone(),
            stripe: StripeConfig {
                secret_key: "sk_test_mock".to_string(),
                webhook_secret: Some(Self::WEBHOOK_SECRET.to_string()),
                app_base_url: "https://app.test".to_string(),
            },
            retry,
        });

        let harness = Self {
            billing,
            gateway,
            plans,
            subscriptions,
            ledger,
            tenants,
            usage,
            sender,
        };
        harness.seed_catalog().await;
        harness
    }

    async fn seed_catalog(&self) {
        if let Err(e) = self.billing.catalog.seed(default_catalog()).await {
            tracing::error!(error = %e, "Failed to seed test catalog");
        }
    }

    pub async fn add_tenant(&self, name: &str, owner_email: &str) -> Tenant {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_email: owner_email.to_string(),
            processor_customer_id: None,
            default_payment_method_id: None,
        };
        self.tenants.insert(tenant.clone()).await;
        tenant
    }

    pub async fn plan(&self, descriptor: &str) -> BillingResult<Plan> {
        self.billing.catalog.get_by_descriptor(descriptor).await
    }

    /// Signature header for `payload`, stamped now with [`Self::WEBHOOK_SECRET`]
    pub fn sign(payload: &str) -> String {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(Self::WEBHOOK_SECRET.as_bytes()) else {
            return String::new();
        };
        let timestamp = now_unix();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }
}
