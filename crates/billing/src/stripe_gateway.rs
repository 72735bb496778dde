//! Stripe implementation of [`ProcessorGateway`]

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    AttachPaymentMethod, BillingPortalSession, CancelSubscription, CheckoutSession,
    CheckoutSessionMode, CollectionMethod, CreateBillingPortalSession, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionPaymentMethodTypes, CreateCreditNote,
    CreateCustomer, CreateInvoice, CreateInvoiceItem, CreatePrice, CreatePriceRecurring,
    CreatePriceRecurringInterval, CreateProduct, CreateSetupIntent, CreateSubscription,
    CreateSubscriptionItems, CreditNote, CreditNoteReason, Currency, Customer, CustomerId,
    CustomerInvoiceSettings, IdOrCreate, Invoice, InvoiceId, InvoiceItem, ListCreditNotes,
    ListInvoices, ListProducts, PaymentMethod, PaymentMethodId, Price, PriceId, Product, ProductId,
    RequestStrategy, Scheduled, SetupIntent, SetupIntentId, StripeError, Subscription,
    SubscriptionId, SubscriptionPaymentBehavior, SubscriptionScheduleId,
    SubscriptionStatus as StripeSubStatus, UpdateCustomer, UpdateProduct, UpdateSubscription,
    UpdateSubscriptionItems,
};
// The proration enum lives in the subscription module, not subscription_item
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::generated::billing::subscription_schedule::{
    CreateSubscriptionSchedule, SubscriptionProrationBehavior as ScheduleProrationBehavior,
    SubscriptionSchedule, UpdateSubscriptionSchedule, UpdateSubscriptionSchedulePhases,
    UpdateSubscriptionSchedulePhasesItems,
};

use crate::client::StripeClient;
use crate::gateway::{
    CancelOptions, CardRecord, CheckoutMode, CheckoutSessionRecord, CheckoutSessionRequest,
    CreditNoteRecord, CustomerRecord, ErrorClass, InvoiceItemRecord, InvoiceQuery, InvoiceRecord,
    InvoiceStatus, Metadata, NewCreditNote, NewCustomer, NewInvoice, NewInvoiceItem, NewPrice,
    NewProduct, NewSetupIntent, NewSubscription, PaymentBehavior, PaymentMethodRecord,
    PortalSessionRecord, PriceRecord, ProcessorError, ProcessorGateway, ProcessorResult,
    ProductRecord, ProrationMode, RecurringInterval, SchedulePhase, ScheduleRecord,
    SetupIntentRecord, SubscriptionChange, SubscriptionRecord, SubscriptionTerms,
    TaxCalculationRecord, TaxCalculationRequest,
};

/// Gateway backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Client that sends `key` as the Idempotency-Key header
    fn idempotent(&self, key: &str) -> stripe::Client {
        self.stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

/// Classify a Stripe error: 429/5xx/timeouts/connection errors are transient,
/// other 4xx and serialization failures permanent.
fn classify(operation: &'static str, error: StripeError) -> ProcessorError {
    match error {
        StripeError::Stripe(request_error) => {
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            ProcessorError::from_status(operation, request_error.http_status, message)
        }
        StripeError::Timeout => ProcessorError {
            class: ErrorClass::Transient,
            operation,
            message: "Request timed out".to_string(),
            http_status: Some(408),
        },
        StripeError::ClientError(msg) => {
            ProcessorError::transient(operation, format!("HTTP client error: {msg}"))
        }
        StripeError::QueryStringSerialize(e) => {
            ProcessorError::permanent(operation, format!("Failed to serialize request: {e}"))
        }
        StripeError::JSONSerialize(e) => {
            ProcessorError::permanent(operation, format!("Failed to serialize JSON: {e}"))
        }
        StripeError::UnsupportedVersion => ProcessorError::new(
            ErrorClass::Unknown,
            operation,
            "Unsupported Stripe API version",
        ),
    }
}

fn parse_id<T: std::str::FromStr>(operation: &'static str, kind: &str, id: &str) -> ProcessorResult<T> {
    id.parse::<T>()
        .map_err(|_| ProcessorError::permanent(operation, format!("Invalid {kind} ID: {id}")))
}

fn parse_currency(operation: &'static str, code: &str) -> ProcessorResult<Currency> {
    code.to_lowercase()
        .parse::<Currency>()
        .map_err(|_| ProcessorError::permanent(operation, format!("Unsupported currency: {code}")))
}

// ============================================================================
// Record Mapping
// ============================================================================

fn map_customer(customer: Customer) -> CustomerRecord {
    CustomerRecord {
        id: customer.id.to_string(),
        email: customer.email,
        deleted: customer.deleted,
        default_payment_method: customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|pm| pm.id().to_string()),
    }
}

fn map_payment_method(pm: PaymentMethod) -> PaymentMethodRecord {
    PaymentMethodRecord {
        id: pm.id.to_string(),
        kind: pm.type_.as_str().to_string(),
        customer_id: pm.customer.map(|c| c.id().to_string()),
        card: pm.card.map(|card| CardRecord {
            brand: card.brand,
            last4: card.last4,
            exp_month: card.exp_month,
            exp_year: card.exp_year,
        }),
    }
}

fn map_product(product: Product) -> ProductRecord {
    ProductRecord {
        id: product.id.to_string(),
        name: product.name.unwrap_or_default(),
        active: product.active.unwrap_or(false),
        metadata: product.metadata.unwrap_or_default(),
    }
}

fn map_price(price: Price) -> PriceRecord {
    PriceRecord {
        id: price.id.to_string(),
        product_id: price
            .product
            .map(|p| p.id().to_string())
            .unwrap_or_default(),
        currency: price
            .currency
            .map(|c| c.to_string().to_lowercase())
            .unwrap_or_default(),
        unit_amount: price.unit_amount,
        interval: price.recurring.and_then(|r| match r.interval {
            stripe::RecurringInterval::Month => Some(RecurringInterval::Month),
            stripe::RecurringInterval::Year => Some(RecurringInterval::Year),
            _ => None,
        }),
        active: price.active.unwrap_or(false),
    }
}

fn map_subscription(sub: Subscription) -> SubscriptionRecord {
    let status = match sub.status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    };
    let first_item = sub.items.data.first();

    SubscriptionRecord {
        id: sub.id.to_string(),
        customer_id: sub.customer.id().to_string(),
        status: status.to_string(),
        item_id: first_item.map(|item| item.id.to_string()),
        price_id: first_item
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string()),
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        created: sub.created,
        trial_end: sub.trial_end,
        metadata: sub.metadata,
    }
}

fn map_schedule(schedule: SubscriptionSchedule) -> ScheduleRecord {
    ScheduleRecord {
        id: schedule.id.to_string(),
        subscription_id: schedule.subscription.map(|s| s.id().to_string()),
        status: schedule.status.as_str().to_string(),
        phases: schedule
            .phases
            .into_iter()
            .map(|phase| SchedulePhase {
                price_id: phase
                    .items
                    .first()
                    .map(|item| item.price.id().to_string())
                    .unwrap_or_default(),
                start_date: phase.start_date,
                end_date: Some(phase.end_date).filter(|end| *end > 0),
            })
            .collect(),
    }
}

fn schedule_proration(mode: ProrationMode) -> ScheduleProrationBehavior {
    match mode {
        ProrationMode::None => ScheduleProrationBehavior::None,
        ProrationMode::CreateProrations => ScheduleProrationBehavior::CreateProrations,
        ProrationMode::AlwaysInvoice => ScheduleProrationBehavior::AlwaysInvoice,
    }
}

fn map_invoice(invoice: Invoice) -> InvoiceRecord {
    let status = invoice.status.map(|s| match s {
        stripe::InvoiceStatus::Draft => InvoiceStatus::Draft,
        stripe::InvoiceStatus::Open => InvoiceStatus::Open,
        stripe::InvoiceStatus::Paid => InvoiceStatus::Paid,
        stripe::InvoiceStatus::Uncollectible => InvoiceStatus::Uncollectible,
        stripe::InvoiceStatus::Void => InvoiceStatus::Void,
    });

    InvoiceRecord {
        id: invoice.id.to_string(),
        customer_id: invoice.customer.map(|c| c.id().to_string()),
        subscription_id: invoice.subscription.map(|s| s.id().to_string()),
        status,
        amount_due: invoice.amount_due.unwrap_or(0),
        amount_paid: invoice.amount_paid.unwrap_or(0),
        currency: invoice
            .currency
            .map(|c| c.to_string().to_lowercase())
            .unwrap_or_default(),
        hosted_invoice_url: invoice.hosted_invoice_url,
        invoice_pdf: invoice.invoice_pdf,
        created: invoice.created.unwrap_or(0),
    }
}

fn map_setup_intent(intent: SetupIntent) -> SetupIntentRecord {
    SetupIntentRecord {
        id: intent.id.to_string(),
        customer_id: intent.customer.map(|c| c.id().to_string()),
        payment_method_id: intent.payment_method.map(|pm| pm.id().to_string()),
        client_secret: intent.client_secret,
    }
}

fn map_credit_note(note: CreditNote) -> CreditNoteRecord {
    CreditNoteRecord {
        id: note.id.to_string(),
        invoice_id: note.invoice.id().to_string(),
        amount: note.amount,
        metadata: note.metadata.unwrap_or_default(),
    }
}

/// Form body for `POST /tax/calculations`, which the typed client does not cover
#[derive(Debug, Serialize)]
struct TaxCalculationForm<'a> {
    currency: &'a str,
    customer: &'a str,
    line_items: Vec<TaxLineItemForm<'a>>,
}

#[derive(Debug, Serialize)]
struct TaxLineItemForm<'a> {
    amount: i64,
    reference: &'a str,
    tax_code: &'a str,
}

#[async_trait]
impl ProcessorGateway for StripeGateway {
    async fn create_customer(&self, params: &NewCustomer, key: &str) -> ProcessorResult<CustomerRecord> {
        let create = CreateCustomer {
            email: params.email.as_deref(),
            name: params.name.as_deref(),
            metadata: Some(params.metadata.clone()),
            ..Default::default()
        };

        Customer::create(&self.idempotent(key), create)
            .await
            .map(map_customer)
            .map_err(|e| classify("create_customer", e))
    }

    async fn retrieve_customer(&self, customer_id: &str) -> ProcessorResult<CustomerRecord> {
        let id: CustomerId = parse_id("retrieve_customer", "customer", customer_id)?;
        Customer::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_customer)
            .map_err(|e| classify("retrieve_customer", e))
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        key: &str,
    ) -> ProcessorResult<CustomerRecord> {
        let id: CustomerId = parse_id("set_default_payment_method", "customer", customer_id)?;
        let params = UpdateCustomer {
            invoice_settings: Some(CustomerInvoiceSettings {
                default_payment_method: Some(payment_method_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        Customer::update(&self.idempotent(key), &id, params)
            .await
            .map(map_customer)
            .map_err(|e| classify("set_default_payment_method", e))
    }

    async fn retrieve_payment_method(&self, payment_method_id: &str) -> ProcessorResult<PaymentMethodRecord> {
        let id: PaymentMethodId =
            parse_id("retrieve_payment_method", "payment method", payment_method_id)?;
        PaymentMethod::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_payment_method)
            .map_err(|e| classify("retrieve_payment_method", e))
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        key: &str,
    ) -> ProcessorResult<PaymentMethodRecord> {
        let pm_id: PaymentMethodId =
            parse_id("attach_payment_method", "payment method", payment_method_id)?;
        let customer: CustomerId = parse_id("attach_payment_method", "customer", customer_id)?;

        PaymentMethod::attach(&self.idempotent(key), &pm_id, AttachPaymentMethod { customer })
            .await
            .map(map_payment_method)
            .map_err(|e| classify("attach_payment_method", e))
    }

    async fn retrieve_product(&self, product_id: &str) -> ProcessorResult<ProductRecord> {
        let id: ProductId = parse_id("retrieve_product", "product", product_id)?;
        Product::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_product)
            .map_err(|e| classify("retrieve_product", e))
    }

    async fn list_active_products(&self, limit: u64) -> ProcessorResult<Vec<ProductRecord>> {
        let params = ListProducts {
            active: Some(true),
            limit: Some(limit),
            ..Default::default()
        };

        Product::list(self.stripe.inner(), &params)
            .await
            .map(|list| list.data.into_iter().map(map_product).collect())
            .map_err(|e| classify("list_products", e))
    }

    async fn create_product(&self, params: &NewProduct, key: &str) -> ProcessorResult<ProductRecord> {
        let mut create = CreateProduct::new(&params.name);
        create.description = params.description.as_deref();
        create.metadata = Some(params.metadata.clone());

        Product::create(&self.idempotent(key), create)
            .await
            .map(map_product)
            .map_err(|e| classify("create_product", e))
    }

    async fn update_product_metadata(
        &self,
        product_id: &str,
        metadata: &Metadata,
        key: &str,
    ) -> ProcessorResult<ProductRecord> {
        let id: ProductId = parse_id("update_product", "product", product_id)?;
        let params = UpdateProduct {
            metadata: Some(metadata.clone()),
            ..Default::default()
        };

        Product::update(&self.idempotent(key), &id, params)
            .await
            .map(map_product)
            .map_err(|e| classify("update_product", e))
    }

    async fn retrieve_price(&self, price_id: &str) -> ProcessorResult<PriceRecord> {
        let id: PriceId = parse_id("retrieve_price", "price", price_id)?;
        Price::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_price)
            .map_err(|e| classify("retrieve_price", e))
    }

    async fn create_price(&self, params: &NewPrice, key: &str) -> ProcessorResult<PriceRecord> {
        let currency = parse_currency("create_price", &params.currency)?;
        let interval = match params.interval {
            RecurringInterval::Month => CreatePriceRecurringInterval::Month,
            RecurringInterval::Year => CreatePriceRecurringInterval::Year,
        };

        let mut create = CreatePrice::new(currency);
        create.product = Some(IdOrCreate::Id(&params.product_id));
        create.unit_amount = Some(params.unit_amount);
        create.recurring = Some(CreatePriceRecurring {
            interval,
            interval_count: None,
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        create.metadata = Some(params.metadata.clone());

        Price::create(&self.idempotent(key), create)
            .await
            .map(map_price)
            .map_err(|e| classify("create_price", e))
    }

    async fn create_subscription(
        &self,
        params: &NewSubscription,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let customer: CustomerId = parse_id("create_subscription", "customer", &params.customer_id)?;

        let mut create = CreateSubscription::new(customer);
        create.items = Some(vec![CreateSubscriptionItems {
            price: Some(params.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        create.payment_behavior = Some(match params.payment_behavior {
            PaymentBehavior::AllowIncomplete => SubscriptionPaymentBehavior::AllowIncomplete,
            PaymentBehavior::DefaultIncomplete => SubscriptionPaymentBehavior::DefaultIncomplete,
        });
        if params.charge_automatically {
            create.collection_method = Some(CollectionMethod::ChargeAutomatically);
        }
        create.trial_end = params.trial_end.map(Scheduled::at);
        create.metadata = Some(params.metadata.clone());

        Subscription::create(&self.idempotent(key), create)
            .await
            .map(map_subscription)
            .map_err(|e| classify("create_subscription", e))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> ProcessorResult<SubscriptionRecord> {
        let id: SubscriptionId = parse_id("retrieve_subscription", "subscription", subscription_id)?;
        Subscription::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_subscription)
            .map_err(|e| classify("retrieve_subscription", e))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let id: SubscriptionId = parse_id("update_subscription", "subscription", subscription_id)?;
        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(change.item_id.clone()),
                price: Some(change.price_id.clone()),
                ..Default::default()
            }]),
            proration_behavior: Some(if change.create_prorations {
                SubscriptionProrationBehavior::CreateProrations
            } else {
                SubscriptionProrationBehavior::None
            }),
            ..Default::default()
        };

        Subscription::update(&self.idempotent(key), &id, params)
            .await
            .map(map_subscription)
            .map_err(|e| classify("update_subscription", e))
    }

    async fn update_subscription_terms(
        &self,
        subscription_id: &str,
        terms: &SubscriptionTerms,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let id: SubscriptionId =
            parse_id("update_subscription_terms", "subscription", subscription_id)?;
        let params = UpdateSubscription {
            trial_end: terms.trial_end.map(Scheduled::at),
            metadata: (!terms.metadata.is_empty()).then(|| terms.metadata.clone()),
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            ..Default::default()
        };

        Subscription::update(&self.idempotent(key), &id, params)
            .await
            .map(map_subscription)
            .map_err(|e| classify("update_subscription_terms", e))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        options: &CancelOptions,
        key: &str,
    ) -> ProcessorResult<SubscriptionRecord> {
        let id: SubscriptionId = parse_id("cancel_subscription", "subscription", subscription_id)?;
        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: Some(options.invoice_now),
            prorate: Some(options.prorate),
        };

        Subscription::cancel(&self.idempotent(key), &id, params)
            .await
            .map(map_subscription)
            .map_err(|e| classify("cancel_subscription", e))
    }

    async fn create_subscription_schedule(&self, subscription_id: &str, key: &str) -> ProcessorResult<ScheduleRecord> {
        let mut create = CreateSubscriptionSchedule::new();
        create.from_subscription = Some(subscription_id);

        SubscriptionSchedule::create(&self.idempotent(key), create)
            .await
            .map(map_schedule)
            .map_err(|e| classify("create_subscription_schedule", e))
    }

    async fn update_subscription_schedule(
        &self,
        schedule_id: &str,
        phases: &[SchedulePhase],
        proration: ProrationMode,
        key: &str,
    ) -> ProcessorResult<ScheduleRecord> {
        let id: SubscriptionScheduleId =
            parse_id("update_subscription_schedule", "subscription schedule", schedule_id)?;

        let mut params = UpdateSubscriptionSchedule::new();
        params.phases = Some(
            phases
                .iter()
                .map(|phase| UpdateSubscriptionSchedulePhases {
                    items: vec![UpdateSubscriptionSchedulePhasesItems {
                        price: Some(phase.price_id.clone()),
                        quantity: Some(1),
                        ..Default::default()
                    }],
                    start_date: Some(Scheduled::at(phase.start_date)),
                    end_date: phase.end_date.map(Scheduled::at),
                    proration_behavior: Some(schedule_proration(proration)),
                    ..Default::default()
                })
                .collect(),
        );
        params.proration_behavior = Some(schedule_proration(proration));

        SubscriptionSchedule::update(&self.idempotent(key), &id, params)
            .await
            .map(map_schedule)
            .map_err(|e| classify("update_subscription_schedule", e))
    }

    async fn list_invoices(&self, query: &InvoiceQuery) -> ProcessorResult<Vec<InvoiceRecord>> {
        let mut params = ListInvoices::new();
        if let Some(customer) = &query.customer_id {
            params.customer = Some(parse_id("list_invoices", "customer", customer)?);
        }
        if let Some(subscription) = &query.subscription_id {
            params.subscription = Some(parse_id("list_invoices", "subscription", subscription)?);
        }
        params.status = query.status.map(|s| match s {
            InvoiceStatus::Draft => stripe::InvoiceStatus::Draft,
            InvoiceStatus::Open => stripe::InvoiceStatus::Open,
            InvoiceStatus::Paid => stripe::InvoiceStatus::Paid,
            InvoiceStatus::Uncollectible => stripe::InvoiceStatus::Uncollectible,
            InvoiceStatus::Void => stripe::InvoiceStatus::Void,
        });
        params.limit = Some(query.limit.max(1));

        Invoice::list(self.stripe.inner(), &params)
            .await
            .map(|list| list.data.into_iter().map(map_invoice).collect())
            .map_err(|e| classify("list_invoices", e))
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> ProcessorResult<InvoiceRecord> {
        let id: InvoiceId = parse_id("retrieve_invoice", "invoice", invoice_id)?;
        Invoice::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_invoice)
            .map_err(|e| classify("retrieve_invoice", e))
    }

    async fn finalize_invoice(&self, invoice_id: &str, key: &str) -> ProcessorResult<InvoiceRecord> {
        let id: InvoiceId = parse_id("finalize_invoice", "invoice", invoice_id)?;
        Invoice::finalize(&self.idempotent(key), &id, Default::default())
            .await
            .map(map_invoice)
            .map_err(|e| classify("finalize_invoice", e))
    }

    async fn pay_invoice(&self, invoice_id: &str, key: &str) -> ProcessorResult<InvoiceRecord> {
        let id: InvoiceId = parse_id("pay_invoice", "invoice", invoice_id)?;
        Invoice::pay(&self.idempotent(key), &id)
            .await
            .map(map_invoice)
            .map_err(|e| classify("pay_invoice", e))
    }

    async fn create_invoice(&self, params: &NewInvoice, key: &str) -> ProcessorResult<InvoiceRecord> {
        let mut create = CreateInvoice::new();
        create.customer = Some(parse_id("create_invoice", "customer", &params.customer_id)?);
        create.currency = Some(parse_currency("create_invoice", &params.currency)?);
        create.description = params.description.as_deref();
        create.auto_advance = Some(params.auto_advance);
        if let Some(due_date) = params.due_date {
            create.collection_method = Some(CollectionMethod::SendInvoice);
            create.due_date = Some(due_date);
        }
        create.metadata = Some(params.metadata.clone());

        Invoice::create(&self.idempotent(key), create)
            .await
            .map(map_invoice)
            .map_err(|e| classify("create_invoice", e))
    }

    async fn create_invoice_item(&self, params: &NewInvoiceItem, key: &str) -> ProcessorResult<InvoiceItemRecord> {
        let customer: CustomerId = parse_id("create_invoice_item", "customer", &params.customer_id)?;

        let mut create = CreateInvoiceItem::new(customer);
        create.invoice = Some(parse_id("create_invoice_item", "invoice", &params.invoice_id)?);
        create.amount = Some(params.amount);
        create.currency = Some(parse_currency("create_invoice_item", &params.currency)?);
        create.description = params.description.as_deref();

        InvoiceItem::create(&self.idempotent(key), create)
            .await
            .map(|item| InvoiceItemRecord {
                id: item.id.to_string(),
                invoice_id: item.invoice.map(|i| i.id().to_string()),
                amount: item.amount.unwrap_or(params.amount),
            })
            .map_err(|e| classify("create_invoice_item", e))
    }

    async fn list_credit_notes(&self, invoice_id: &str) -> ProcessorResult<Vec<CreditNoteRecord>> {
        let mut params = ListCreditNotes::new();
        params.invoice = Some(parse_id("list_credit_notes", "invoice", invoice_id)?);
        params.limit = Some(100);

        CreditNote::list(self.stripe.inner(), &params)
            .await
            .map(|list| list.data.into_iter().map(map_credit_note).collect())
            .map_err(|e| classify("list_credit_notes", e))
    }

    async fn create_credit_note(&self, params: &NewCreditNote, key: &str) -> ProcessorResult<CreditNoteRecord> {
        let invoice: InvoiceId = parse_id("create_credit_note", "invoice", &params.invoice_id)?;

        let mut create = CreateCreditNote::new(invoice);
        create.amount = Some(params.amount);
        create.memo = Some(&params.memo);
        create.reason = Some(CreditNoteReason::OrderChange);
        create.metadata = Some(params.metadata.clone());

        CreditNote::create(&self.idempotent(key), create)
            .await
            .map(map_credit_note)
            .map_err(|e| classify("create_credit_note", e))
    }

    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionRequest,
        key: &str,
    ) -> ProcessorResult<CheckoutSessionRecord> {
        let customer: CustomerId =
            parse_id("create_checkout_session", "customer", &params.customer_id)?;

        let mut create = CreateCheckoutSession::new();
        create.customer = Some(customer);
        create.success_url = Some(&params.success_url);
        create.cancel_url = Some(&params.cancel_url);
        create.metadata = Some(params.metadata.clone());

        match params.mode {
            CheckoutMode::Setup => {
                create.mode = Some(CheckoutSessionMode::Setup);
                create.payment_method_types =
                    Some(vec![CreateCheckoutSessionPaymentMethodTypes::Card]);
            }
            CheckoutMode::Subscription => {
                create.mode = Some(CheckoutSessionMode::Subscription);
                create.line_items = params.price_id.as_ref().map(|price| {
                    vec![CreateCheckoutSessionLineItems {
                        price: Some(price.clone()),
                        quantity: Some(1),
                        ..Default::default()
                    }]
                });
            }
        }

        CheckoutSession::create(&self.idempotent(key), create)
            .await
            .map(|session| CheckoutSessionRecord {
                id: session.id.to_string(),
                url: session.url,
            })
            .map_err(|e| classify("create_checkout_session", e))
    }

    async fn create_setup_intent(&self, params: &NewSetupIntent, key: &str) -> ProcessorResult<SetupIntentRecord> {
        let mut create = CreateSetupIntent::new();
        create.customer = Some(parse_id("create_setup_intent", "customer", &params.customer_id)?);
        create.payment_method_types = Some(vec!["card".to_string()]);
        create.metadata = Some(params.metadata.clone());

        SetupIntent::create(&self.idempotent(key), create)
            .await
            .map(map_setup_intent)
            .map_err(|e| classify("create_setup_intent", e))
    }

    async fn retrieve_setup_intent(&self, setup_intent_id: &str) -> ProcessorResult<SetupIntentRecord> {
        let id: SetupIntentId = parse_id("retrieve_setup_intent", "setup intent", setup_intent_id)?;
        SetupIntent::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map(map_setup_intent)
            .map_err(|e| classify("retrieve_setup_intent", e))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProcessorResult<PortalSessionRecord> {
        let customer: CustomerId = parse_id("create_portal_session", "customer", customer_id)?;
        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        BillingPortalSession::create(self.stripe.inner(), params)
            .await
            .map(|session| PortalSessionRecord {
                id: session.id.to_string(),
                url: session.url,
            })
            .map_err(|e| classify("create_portal_session", e))
    }

    async fn calculate_tax(&self, params: &TaxCalculationRequest) -> ProcessorResult<TaxCalculationRecord> {
        let currency = params.currency.to_lowercase();
        let form = TaxCalculationForm {
            currency: &currency,
            customer: &params.customer_id,
            line_items: vec![TaxLineItemForm {
                amount: params.amount,
                reference: &params.reference,
                tax_code: &params.tax_code,
            }],
        };

        self.stripe
            .inner()
            .post_form::<TaxCalculationRecord, _>("/tax/calculations", form)
            .await
            .map_err(|e| classify("calculate_tax", e))
    }
}
