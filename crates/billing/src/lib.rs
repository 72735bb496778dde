//! Subsync Billing
//!
//! Plan catalog synchronization, subscription lifecycle, prorated refunds,
//! entitlement checks, and webhook reconciliation against Stripe.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::sync::Arc;

use sqlx::PgPool;
use subsync_shared::Repository;

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod details;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod invoices;
pub mod ledger;
pub mod notifications;
pub mod plans;
pub mod portal;
pub mod proration;
pub mod refund;
pub mod retry;
pub mod store;
pub mod stripe_gateway;
pub mod subscriptions;
pub mod tax;
pub mod tenants;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{PlanCatalog, SyncReport};
pub use checkout::{CheckoutResponse, CheckoutService};
pub use client::{StripeClient, StripeConfig};
pub use customer::CustomerService;
pub use details::{CardDetails, SubscriptionDetails};
pub use email::{EmailConfig, ResendSender};
pub use entitlement::{EntitlementService, UsageQuota};
pub use error::{BillingError, BillingResult, DowngradeViolation, ErrorKind, WebhookRejection};
pub use gateway::{ErrorClass, ProcessorError, ProcessorGateway};
pub use invoices::{InvoiceDownload, InvoiceFilter, InvoiceRequest, InvoiceService};
pub use ledger::ProcessedEvent;
pub use notifications::{NotificationSender, NotificationTemplate, Notifier};
pub use plans::{BillingCycle, Plan, PlanFeatures, PlanLimits, UNLIMITED};
pub use portal::{PortalResponse, PortalService};
pub use refund::{RefundOutcome, RefundService};
pub use retry::{CancelHandle, CancelSignal, RetrySettings};
pub use stripe_gateway::StripeGateway;
pub use subscriptions::{
    GracePeriod, ProrationEstimate, ScheduledChange, Subscription, SubscriptionService, SubscriptionStatus,
    TrialStatus,
};
pub use tax::TaxService;
pub use tenants::{Tenant, TenantDirectory, UsageCounter};
pub use webhooks::{WebhookOutcome, WebhookProcessor};

/// Collaborators a [`BillingService`] is assembled from
pub struct BillingParts {
    pub gateway: Arc<dyn ProcessorGateway>,
    pub plans: Arc<dyn Repository<Plan>>,
    pub subscriptions: Arc<dyn Repository<Subscription>>,
    pub ledger: Arc<dyn Repository<ProcessedEvent>>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub usage: Arc<dyn UsageCounter>,
    pub sender: Arc<dyn NotificationSender>,
    pub stripe: StripeConfig,
    pub retry: RetrySettings,
}

/// Every billing service, wired over one gateway and one set of stores
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub customers: Arc<CustomerService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub refunds: Arc<RefundService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub invoices: Arc<InvoiceService>,
    pub checkout: Arc<CheckoutService>,
    pub portal: Arc<PortalService>,
    pub tax: Arc<TaxService>,
    pub entitlements: Arc<EntitlementService>,
}

impl BillingService {
    pub fn from_parts(parts: BillingParts) -> Self {
        let BillingParts {
            gateway,
            plans,
            subscriptions,
            ledger,
            tenants,
            usage,
            sender,
            stripe,
            retry,
        } = parts;

        let catalog = Arc::new(PlanCatalog::new(gateway.clone(), plans, retry));
        let customers = Arc::new(CustomerService::new(gateway.clone(), tenants.clone(), retry));
        let refunds = Arc::new(RefundService::new(gateway.clone(), retry));
        let subscription_service = Arc::new(SubscriptionService::new(
            gateway.clone(),
            subscriptions,
            catalog.clone(),
            customers.clone(),
            tenants.clone(),
            usage.clone(),
            refunds.clone(),
            Notifier::new(sender),
            retry,
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            stripe.webhook_secret.clone(),
            gateway.clone(),
            subscription_service.clone(),
            customers.clone(),
            tenants.clone(),
            ledger,
            retry,
        ));
        let invoices = Arc::new(InvoiceService::new(
            gateway.clone(),
            customers.clone(),
            tenants.clone(),
            retry,
        ));
        let checkout = Arc::new(CheckoutService::new(
            gateway.clone(),
            catalog.clone(),
            customers.clone(),
            tenants.clone(),
            stripe.clone(),
            retry,
        ));
        let portal = Arc::new(PortalService::new(
            gateway.clone(),
            customers.clone(),
            tenants.clone(),
            stripe,
            retry,
        ));
        let tax = Arc::new(TaxService::new(gateway, customers.clone(), tenants, retry));
        let entitlements = Arc::new(EntitlementService::new(
            subscription_service.clone(),
            catalog.clone(),
            usage,
        ));

        Self {
            catalog,
            customers,
            subscriptions: subscription_service,
            refunds,
            webhooks,
            invoices,
            checkout,
            portal,
            tax,
            entitlements,
        }
    }

    /// Production wiring: Stripe, Postgres stores, and Resend email
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = stripe.config().clone();

        Ok(Self::from_parts(BillingParts {
            gateway: Arc::new(StripeGateway::new(stripe)),
            plans: Arc::new(store::PgPlanRepository::new(pool.clone())),
            subscriptions: Arc::new(store::PgSubscriptionRepository::new(pool.clone())),
            ledger: Arc::new(store::PgEventLedger::new(pool.clone())),
            tenants: Arc::new(store::PgTenantDirectory::new(pool.clone())),
            usage: Arc::new(store::PgUsageCounter::new(pool)),
            sender: Arc::new(ResendSender::from_env()),
            stripe: config,
            retry: RetrySettings::from_env(),
        }))
    }
}
