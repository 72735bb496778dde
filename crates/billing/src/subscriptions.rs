//! Subscription lifecycle
//!
//! Each tenant has at most one subscription row. The row is never deleted:
//! cancellation is a status transition, and resuming a canceled
//! subscription replaces the row's processor reference in place.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use subsync_shared::{Entity, FieldValue, Repository, Scope};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::customer::CustomerService;
use crate::details::{CardDetails, SubscriptionDetails};
use crate::error::{BillingError, BillingResult, DowngradeViolation};
use crate::gateway::{
    CancelOptions, InvoiceQuery, InvoiceStatus, Metadata, NewSubscription, PaymentBehavior,
    ProcessorGateway, ProrationMode, SchedulePhase, SubscriptionChange, SubscriptionRecord,
    SubscriptionTerms,
};
use crate::notifications::{NotificationTemplate, Notifier};
use crate::plans::{within_limit, Plan, LIMITS, UNLIMITED};
use crate::proration::{days_remaining, estimate_proration};
use crate::refund::{RefundOutcome, RefundService};
use crate::retry::{with_retry, with_unit_retries, CancelSignal, RetrySettings, UNIT_RETRIES};
use crate::tenants::{current_usage, Tenant, TenantDirectory, UsageCounter};

/// Open invoices settled before a canceled subscription is resumed
const RESUME_INVOICE_LIMIT: u64 = 10;

/// Longest trial, trial extension, or grace period granted in one request
pub const MAX_TRIAL_DAYS: i64 = 30;
pub const MAX_GRACE_DAYS: i64 = 30;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a processor status. Statuses with no local meaning
    /// (`incomplete_expired`, `paused`, ...) become `Incomplete`.
    pub fn from_processor(status: &str) -> Self {
        match status {
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "unpaid" => SubscriptionStatus::Unpaid,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Incomplete,
        }
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        match self {
            Incomplete => matches!(next, Incomplete | Trialing | Active | PastDue | Canceled),
            Trialing => matches!(next, Trialing | Active | PastDue | Unpaid | Canceled),
            Active => matches!(next, Active | PastDue | Unpaid | Canceled),
            PastDue => matches!(next, PastDue | Active | Unpaid | Canceled),
            Unpaid => matches!(next, Unpaid | Active | Canceled),
            Canceled => next == Canceled,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub processor_subscription_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Entity for Subscription {
    const NAME: &'static str = "subscription";

    fn id(&self) -> Uuid {
        self.id
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => Some(self.id.into()),
            "tenant_id" => Some(self.tenant_id.into()),
            "plan_id" => Some(self.plan_id.into()),
            "processor_subscription_id" => Some(self.processor_subscription_id.clone().into()),
            "status" => Some(self.status.as_str().into()),
            _ => None,
        }
    }

    fn unique_fields() -> &'static [&'static str] {
        &["tenant_id", "processor_subscription_id"]
    }
}

/// Signed cost of switching plans for the rest of the period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationEstimate {
    pub current_plan: String,
    pub new_plan: String,
    pub days_remaining: i64,
    pub amount_cents: i64,
    pub currency: String,
}

/// Trial state as the processor reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialStatus {
    pub is_in_trial: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    /// Started days count as whole days
    pub days_remaining: i64,
}

/// Extra time granted to a past-due subscription before dunning escalates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GracePeriod {
    pub processor_subscription_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub days: i64,
}

/// Plan change booked on a subscription schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledChange {
    pub schedule_id: String,
    pub current_plan: String,
    pub new_plan: String,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    pub proration: ProrationMode,
}

pub struct SubscriptionService {
    gateway: Arc<dyn ProcessorGateway>,
    subscriptions: Arc<dyn Repository<Subscription>>,
    catalog: Arc<PlanCatalog>,
    customers: Arc<CustomerService>,
    tenants: Arc<dyn TenantDirectory>,
    usage: Arc<dyn UsageCounter>,
    refunds: Arc<RefundService>,
    notifier: Notifier,
    retry: RetrySettings,
}

impl SubscriptionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn ProcessorGateway>,
        subscriptions: Arc<dyn Repository<Subscription>>,
        catalog: Arc<PlanCatalog>,
        customers: Arc<CustomerService>,
        tenants: Arc<dyn TenantDirectory>,
        usage: Arc<dyn UsageCounter>,
        refunds: Arc<RefundService>,
        notifier: Notifier,
        retry: RetrySettings,
    ) -> Self {
        Self {
            gateway,
            subscriptions,
            catalog,
            customers,
            tenants,
            usage,
            refunds,
            notifier,
            retry,
        }
    }

    pub async fn get_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.find_for_tenant(tenant_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(tenant_id.to_string()))
    }

    pub async fn find_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        match self
            .subscriptions
            .find_one(&[Scope::eq("tenant_id", tenant_id)])
            .await
        {
            Ok(sub) => Ok(Some(sub)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_processor_id(&self, processor_subscription_id: &str) -> BillingResult<Option<Subscription>> {
        match self
            .subscriptions
            .find_one(&[Scope::eq("processor_subscription_id", processor_subscription_id)])
            .await
        {
            Ok(sub) => Ok(Some(sub)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Put `tenant_id` on `plan`, creating the processor subscription or
    /// re-pricing the existing one. A canceled subscription is only brought
    /// back through [`Self::resume_if_no_due`].
    #[tracing::instrument(skip(self, plan, cancel), fields(plan_id = %plan.id, descriptor = %plan.descriptor))]
    pub async fn create_or_update(
        &self,
        tenant_id: Uuid,
        plan: &Plan,
        cancel: &CancelSignal,
    ) -> BillingResult<Subscription> {
        self.assign_plan(tenant_id, plan, false, cancel).await
    }

    async fn assign_plan(
        &self,
        tenant_id: Uuid,
        plan: &Plan,
        allow_resume: bool,
        cancel: &CancelSignal,
    ) -> BillingResult<Subscription> {
        let existing = self.find_for_tenant(tenant_id).await?;
        if let Some(sub) = &existing {
            if sub.plan_id == plan.id && sub.status == SubscriptionStatus::Active {
                tracing::debug!("Tenant already active on plan");
                return Ok(sub.clone());
            }
            if sub.status == SubscriptionStatus::Canceled && !allow_resume {
                tracing::info!(
                    processor_subscription_id = %sub.processor_subscription_id,
                    "Refusing to restart canceled subscription outside resume"
                );
                return Err(BillingError::SubscriptionCanceled);
            }
        }

        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;
        let plan = self.catalog.ensure_synced(plan, cancel).await?;
        let price_id = processor_price(&plan)?;

        match existing {
            Some(current) if current.status != SubscriptionStatus::Canceled => {
                self.change_plan(current, &plan, &price_id, cancel).await
            }
            previous => {
                self.start_subscription(&tenant, &customer_id, previous, &plan, &price_id, cancel)
                    .await
            }
        }
    }

    async fn change_plan(
        &self,
        current: Subscription,
        plan: &Plan,
        price_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<Subscription> {
        let current_plan = self.catalog.get_plan(current.plan_id).await?;
        self.guard_downgrade(&current, &current_plan, plan).await?;

        let gateway = &self.gateway;
        let remote = with_retry("retrieve_subscription", self.retry.attempts, cancel, || {
            gateway.retrieve_subscription(&current.processor_subscription_id)
        })
        .await?;
        let item_id = remote.item_id.ok_or_else(|| {
            BillingError::Internal(format!(
                "processor subscription {} has no items",
                current.processor_subscription_id
            ))
        })?;

        let change = SubscriptionChange {
            item_id,
            price_id: price_id.to_string(),
            create_prorations: true,
        };
        let key = format!("sub_update_{}_{}", current.processor_subscription_id, plan.id);

        let updated = match with_unit_retries("update_subscription", UNIT_RETRIES, || {
            self.apply_update(&current, plan, &change, &key, cancel)
        })
        .await
        {
            Ok(updated) => updated,
            Err(e) => {
                if matches!(e, BillingError::Store(_)) {
                    tracing::error!(
                        tenant_id = %current.tenant_id,
                        subscription_id = %current.id,
                        processor_subscription_id = %current.processor_subscription_id,
                        from_plan_id = %current.plan_id,
                        to_plan_id = %plan.id,
                        error = %e,
                        "Processor re-priced but local row not updated"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            tenant_id = %updated.tenant_id,
            from_plan = %current_plan.descriptor,
            to_plan = %plan.descriptor,
            status = %updated.status,
            "Updated subscription plan"
        );
        Ok(updated)
    }

    async fn apply_update(
        &self,
        current: &Subscription,
        plan: &Plan,
        change: &SubscriptionChange,
        key: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<Subscription> {
        let gateway = &self.gateway;
        let remote = with_retry("update_subscription", self.retry.attempts, cancel, || {
            gateway.update_subscription(&current.processor_subscription_id, change, key)
        })
        .await?;

        let reported = SubscriptionStatus::from_processor(&remote.status);
        let mut updated = current.clone();
        updated.plan_id = plan.id;
        if current.status.can_transition_to(reported) {
            updated.status = reported;
        }
        if let Some(end) = timestamp(remote.current_period_end) {
            updated.current_period_end = end;
        }
        updated.updated_at = OffsetDateTime::now_utc();

        Ok(self.subscriptions.update_one(&updated).await?)
    }

    async fn start_subscription(
        &self,
        tenant: &Tenant,
        customer_id: &str,
        previous: Option<Subscription>,
        plan: &Plan,
        price_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<Subscription> {
        let key = match &previous {
            Some(prev) => format!(
                "sub_create_{}_{}_after_{}",
                tenant.id, plan.id, prev.processor_subscription_id
            ),
            None => format!("sub_create_{}_{}", tenant.id, plan.id),
        };
        let params = NewSubscription {
            customer_id: customer_id.to_string(),
            price_id: price_id.to_string(),
            payment_behavior: if plan.is_free() {
                PaymentBehavior::AllowIncomplete
            } else {
                PaymentBehavior::DefaultIncomplete
            },
            charge_automatically: !plan.is_free(),
            trial_end: None,
            metadata: Metadata::from([
                ("tenant_id".to_string(), tenant.id.to_string()),
                ("plan_id".to_string(), plan.id.to_string()),
            ]),
        };

        let (created, stored) = with_unit_retries("create_subscription", UNIT_RETRIES, || {
            self.apply_create(tenant.id, previous.as_ref(), plan, &params, &key, cancel)
        })
        .await?;
        if !stored {
            return Ok(created);
        }

        tracing::info!(
            tenant_id = %tenant.id,
            processor_subscription_id = %created.processor_subscription_id,
            status = %created.status,
            resumed = previous.is_some(),
            "Created subscription"
        );

        if previous.is_none() {
            self.notifier.dispatch(
                NotificationTemplate::SubscriptionWelcome,
                &tenant.owner_email,
                plan_payload(plan),
            );
        }
        Ok(created)
    }

    async fn apply_create(
        &self,
        tenant_id: Uuid,
        previous: Option<&Subscription>,
        plan: &Plan,
        params: &NewSubscription,
        key: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<(Subscription, bool)> {
        let gateway = &self.gateway;
        let remote = with_retry("create_subscription", self.retry.attempts, cancel, || {
            gateway.create_subscription(params, key)
        })
        .await?;

        let now = OffsetDateTime::now_utc();
        let row = Subscription {
            id: previous.map(|p| p.id).unwrap_or_else(Uuid::new_v4),
            tenant_id,
            plan_id: plan.id,
            processor_subscription_id: remote.id.clone(),
            status: SubscriptionStatus::from_processor(&remote.status),
            current_period_end: timestamp(remote.current_period_end).unwrap_or(now),
            created_at: now,
            updated_at: now,
        };

        let saved = match previous {
            Some(_) => self.subscriptions.update_one(&row).await?,
            None => match self.subscriptions.create_one(&row).await {
                Ok(saved) => saved,
                Err(e) if e.is_unique_violation() => {
                    // A concurrent request with the same key stored the row first
                    match self.find_for_tenant(tenant_id).await? {
                        Some(existing) if existing.processor_subscription_id == remote.id => {
                            tracing::debug!(
                                processor_subscription_id = %remote.id,
                                "Subscription row already stored by concurrent request"
                            );
                            return Ok((existing, false));
                        }
                        _ => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            },
        };
        Ok((saved, true))
    }

    async fn guard_downgrade(&self, current: &Subscription, current_plan: &Plan, target: &Plan) -> BillingResult<()> {
        if target.price_cents >= current_plan.price_cents || current.status != SubscriptionStatus::Active {
            return Ok(());
        }
        match self
            .downgrade_violation(current.tenant_id, current_plan, target)
            .await?
        {
            Some(violation) => {
                tracing::info!(violation = %violation, "Downgrade blocked");
                Err(BillingError::DowngradeBlocked(violation))
            }
            None => Ok(()),
        }
    }

    /// First downgrade rule the tenant would break by moving from `current`
    /// to `target`
    pub async fn downgrade_violation(
        &self,
        tenant_id: Uuid,
        current: &Plan,
        target: &Plan,
    ) -> BillingResult<Option<DowngradeViolation>> {
        if let Some(feature) = current
            .features
            .enabled()
            .find(|feature| target.features.get(feature) != Some(true))
        {
            return Ok(Some(DowngradeViolation::Feature {
                feature: feature.to_string(),
            }));
        }

        let now = OffsetDateTime::now_utc();
        for (limit, allowed_on) in LIMITS {
            let allowed = allowed_on(&target.limits);
            if allowed == UNLIMITED {
                continue;
            }
            let usage = current_usage(self.usage.as_ref(), tenant_id, limit, now).await?;
            if !within_limit(usage, allowed) {
                return Ok(Some(DowngradeViolation::Limit {
                    limit: limit.to_string(),
                    current: usage,
                    allowed,
                }));
            }
        }

        Ok(None)
    }

    /// Cancel at the processor right away. The local row is cut off even
    /// when the processor call fails; that failure is still returned.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn cancel_immediately(&self, tenant_id: Uuid, cancel: &CancelSignal) -> BillingResult<Subscription> {
        let sub = self.get_for_tenant(tenant_id).await?;
        if sub.status == SubscriptionStatus::Canceled {
            return Ok(sub);
        }

        let gateway = &self.gateway;
        let options = CancelOptions {
            invoice_now: false,
            prorate: false,
        };
        let key = format!("cancel_{}", sub.processor_subscription_id);
        let remote: Result<SubscriptionRecord, _> =
            with_retry("cancel_subscription", self.retry.attempts, cancel, || {
                gateway.cancel_subscription(&sub.processor_subscription_id, &options, &key)
            })
            .await;

        let now = OffsetDateTime::now_utc();
        let mut cut_off = sub.clone();
        cut_off.status = SubscriptionStatus::Canceled;
        cut_off.current_period_end = now;
        cut_off.updated_at = now;
        let canceled = with_unit_retries("persist_cancellation", UNIT_RETRIES, || self.persist(&cut_off)).await?;

        if let Err(e) = remote {
            tracing::error!(
                processor_subscription_id = %sub.processor_subscription_id,
                error = %e,
                "Processor cancellation failed after local cutoff"
            );
            return Err(e.into());
        }

        tracing::info!(processor_subscription_id = %sub.processor_subscription_id, "Canceled subscription");
        if let Ok(plan) = self.catalog.get_plan(sub.plan_id).await {
            self.notify_tenant(tenant_id, NotificationTemplate::SubscriptionCanceled, plan_payload(&plan))
                .await;
        }
        Ok(canceled)
    }

    /// Recreate a canceled subscription on its previous plan once every open
    /// invoice has been paid. Rows that are not canceled are returned as is.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn resume_if_no_due(&self, tenant_id: Uuid, cancel: &CancelSignal) -> BillingResult<Subscription> {
        let sub = self.get_for_tenant(tenant_id).await?;
        if sub.status != SubscriptionStatus::Canceled {
            return Ok(sub);
        }

        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;

        let gateway = &self.gateway;
        let attempts = self.retry.attempts;
        let query = InvoiceQuery {
            customer_id: Some(customer_id),
            status: Some(InvoiceStatus::Open),
            limit: RESUME_INVOICE_LIMIT,
            ..Default::default()
        };
        let open = with_retry("list_invoices", attempts, cancel, || gateway.list_invoices(&query)).await?;

        for invoice in &open {
            let key = format!("pay_invoice_{}", invoice.id);
            if let Err(e) = with_retry("pay_invoice", attempts, cancel, || {
                gateway.pay_invoice(&invoice.id, &key)
            })
            .await
            {
                tracing::warn!(invoice_id = %invoice.id, error = %e, "Outstanding invoice could not be paid");
                return Err(BillingError::SubscriptionNotActive(format!(
                    "outstanding invoice {} could not be paid",
                    invoice.id
                )));
            }
        }

        let plan = self.catalog.get_plan(sub.plan_id).await?;
        self.assign_plan(tenant_id, &plan, true, cancel).await
    }

    /// Put a tenant with no subscription on `plan` with a free trial of
    /// `trial_days`. The card is charged when the trial ends.
    #[tracing::instrument(skip(self, plan, cancel), fields(plan_id = %plan.id, descriptor = %plan.descriptor))]
    pub async fn start_trial(
        &self,
        tenant_id: Uuid,
        plan: &Plan,
        trial_days: i64,
        cancel: &CancelSignal,
    ) -> BillingResult<Subscription> {
        check_days("trial_days", trial_days, MAX_TRIAL_DAYS)?;
        if plan.is_free() {
            return Err(BillingError::InvalidInput(format!(
                "plan {} is free and has no trial",
                plan.descriptor
            )));
        }
        if let Some(existing) = self.find_for_tenant(tenant_id).await? {
            return Err(match existing.status {
                SubscriptionStatus::Canceled => BillingError::SubscriptionCanceled,
                status => BillingError::InvalidState(format!("tenant already has a {} subscription", status)),
            });
        }

        let tenant = self.tenants.get_tenant(tenant_id).await?;
        let customer_id = self.customers.ensure_customer(&tenant, cancel).await?;
        let plan = self.catalog.ensure_synced(plan, cancel).await?;
        let trial_end = OffsetDateTime::now_utc() + Duration::days(trial_days);

        let params = NewSubscription {
            customer_id,
            price_id: processor_price(&plan)?,
            payment_behavior: PaymentBehavior::DefaultIncomplete,
            charge_automatically: true,
            trial_end: Some(trial_end.unix_timestamp()),
            metadata: Metadata::from([
                ("tenant_id".to_string(), tenant.id.to_string()),
                ("plan_id".to_string(), plan.id.to_string()),
                ("trial".to_string(), "true".to_string()),
                ("trial_days".to_string(), trial_days.to_string()),
            ]),
        };
        let key = format!("sub_trial_{}_{}", tenant.id, plan.id);

        let (created, stored) = with_unit_retries("create_trial_subscription", UNIT_RETRIES, || {
            self.apply_create(tenant.id, None, &plan, &params, &key, cancel)
        })
        .await?;
        if !stored {
            return Ok(created);
        }

        tracing::info!(
            tenant_id = %tenant.id,
            processor_subscription_id = %created.processor_subscription_id,
            trial_days,
            "Started trial subscription"
        );
        self.notifier.dispatch(
            NotificationTemplate::SubscriptionWelcome,
            &tenant.owner_email,
            plan_payload(&plan),
        );
        Ok(created)
    }

    /// Push the end of a running trial back by `additional_days`
    #[tracing::instrument(skip(self, cancel))]
    pub async fn extend_trial(
        &self,
        tenant_id: Uuid,
        additional_days: i64,
        cancel: &CancelSignal,
    ) -> BillingResult<TrialStatus> {
        check_days("additional_days", additional_days, MAX_TRIAL_DAYS)?;
        let sub = self.get_for_tenant(tenant_id).await?;
        if sub.status != SubscriptionStatus::Trialing {
            return Err(BillingError::InvalidState(format!(
                "subscription is {}, not trialing",
                sub.status
            )));
        }

        let gateway = &self.gateway;
        let attempts = self.retry.attempts;
        let remote = with_retry("retrieve_subscription", attempts, cancel, || {
            gateway.retrieve_subscription(&sub.processor_subscription_id)
        })
        .await?;

        let now = OffsetDateTime::now_utc();
        let current_end = remote
            .trial_end
            .and_then(timestamp)
            .filter(|end| *end > now)
            .unwrap_or(now);
        let new_end = (current_end + Duration::days(additional_days)).unix_timestamp();
        let terms = SubscriptionTerms {
            trial_end: Some(new_end),
            metadata: Metadata::new(),
        };
        let key = format!("trial_extend_{}_{}", sub.processor_subscription_id, new_end);

        let updated = with_retry("update_subscription_terms", attempts, cancel, || {
            gateway.update_subscription_terms(&sub.processor_subscription_id, &terms, &key)
        })
        .await?;
        let reported = SubscriptionStatus::from_processor(&updated.status);
        self.transition(sub, reported, timestamp(updated.current_period_end), None)
            .await?;

        tracing::info!(
            processor_subscription_id = %updated.id,
            additional_days,
            trial_end = new_end,
            "Extended trial"
        );
        Ok(trial_status_of(&updated, OffsetDateTime::now_utc()))
    }

    pub async fn trial_status(&self, tenant_id: Uuid, cancel: &CancelSignal) -> BillingResult<TrialStatus> {
        let sub = self.get_for_tenant(tenant_id).await?;
        let gateway = &self.gateway;
        let remote = with_retry("retrieve_subscription", self.retry.attempts, cancel, || {
            gateway.retrieve_subscription(&sub.processor_subscription_id)
        })
        .await?;
        Ok(trial_status_of(&remote, OffsetDateTime::now_utc()))
    }

    /// Record a grace period on a past-due subscription's processor
    /// metadata, where dunning picks it up
    #[tracing::instrument(skip(self, cancel))]
    pub async fn set_grace_period(
        &self,
        tenant_id: Uuid,
        grace_days: i64,
        cancel: &CancelSignal,
    ) -> BillingResult<GracePeriod> {
        check_days("grace_days", grace_days, MAX_GRACE_DAYS)?;
        let sub = self.get_for_tenant(tenant_id).await?;
        if sub.status != SubscriptionStatus::PastDue {
            return Err(BillingError::InvalidState(format!(
                "grace periods apply to past_due subscriptions, this one is {}",
                sub.status
            )));
        }

        let ends_at = OffsetDateTime::now_utc() + Duration::days(grace_days);
        let terms = SubscriptionTerms {
            trial_end: None,
            metadata: Metadata::from([
                ("grace_period".to_string(), "true".to_string()),
                ("grace_period_end".to_string(), ends_at.unix_timestamp().to_string()),
                ("grace_period_days".to_string(), grace_days.to_string()),
            ]),
        };
        let key = format!(
            "grace_period_{}_{}",
            sub.processor_subscription_id,
            ends_at.unix_timestamp()
        );

        let gateway = &self.gateway;
        with_retry("update_subscription_terms", self.retry.attempts, cancel, || {
            gateway.update_subscription_terms(&sub.processor_subscription_id, &terms, &key)
        })
        .await?;

        tracing::info!(
            processor_subscription_id = %sub.processor_subscription_id,
            grace_days,
            "Set grace period"
        );
        Ok(GracePeriod {
            processor_subscription_id: sub.processor_subscription_id,
            ends_at,
            days: grace_days,
        })
    }

    /// Book a switch to `plan` at `effective_date` ("YYYY-MM-DD" or RFC 3339)
    /// through a processor schedule. The local row follows when the
    /// processor reports the new price.
    #[tracing::instrument(skip(self, plan, cancel), fields(plan_id = %plan.id, descriptor = %plan.descriptor))]
    pub async fn schedule_change(
        &self,
        tenant_id: Uuid,
        plan: &Plan,
        effective_date: &str,
        proration: ProrationMode,
        cancel: &CancelSignal,
    ) -> BillingResult<ScheduledChange> {
        let effective_at = parse_effective_date(effective_date)?;
        if effective_at <= OffsetDateTime::now_utc() {
            return Err(BillingError::InvalidInput(format!(
                "effective_date {} is not in the future",
                effective_date
            )));
        }

        let sub = self.get_for_tenant(tenant_id).await?;
        if sub.status == SubscriptionStatus::Canceled {
            return Err(BillingError::SubscriptionCanceled);
        }
        if sub.plan_id == plan.id {
            return Err(BillingError::InvalidState(format!(
                "subscription is already on plan {}",
                plan.descriptor
            )));
        }
        let current_plan = self.catalog.get_plan(sub.plan_id).await?;
        self.guard_downgrade(&sub, &current_plan, plan).await?;

        let plan = self.catalog.ensure_synced(plan, cancel).await?;
        let price_id = processor_price(&plan)?;

        let gateway = &self.gateway;
        let attempts = self.retry.attempts;
        let schedule_key = format!("schedule_{}", sub.processor_subscription_id);
        let schedule = with_retry("create_subscription_schedule", attempts, cancel, || {
            gateway.create_subscription_schedule(&sub.processor_subscription_id, &schedule_key)
        })
        .await?;
        let current_phase = schedule.phases.first().cloned().ok_or_else(|| {
            BillingError::Internal(format!("schedule {} has no phases", schedule.id))
        })?;

        let switch_at = effective_at.unix_timestamp();
        let phases = [
            SchedulePhase {
                price_id: current_phase.price_id,
                start_date: current_phase.start_date,
                end_date: Some(switch_at),
            },
            SchedulePhase {
                price_id,
                start_date: switch_at,
                end_date: None,
            },
        ];
        let key = format!("schedule_change_{}_{}_{}", schedule.id, plan.id, switch_at);
        let updated = with_retry("update_subscription_schedule", attempts, cancel, || {
            gateway.update_subscription_schedule(&schedule.id, &phases, proration, &key)
        })
        .await?;

        tracing::info!(
            schedule_id = %updated.id,
            from_plan = %current_plan.descriptor,
            to_plan = %plan.descriptor,
            effective_at = switch_at,
            proration = proration.as_str(),
            "Scheduled plan change"
        );
        Ok(ScheduledChange {
            schedule_id: updated.id,
            current_plan: current_plan.descriptor,
            new_plan: plan.descriptor,
            effective_at,
            proration,
        })
    }

    pub async fn estimate_proration_for(
        &self,
        tenant_id: Uuid,
        new_descriptor: &str,
    ) -> BillingResult<ProrationEstimate> {
        let sub = self.get_for_tenant(tenant_id).await?;
        let current = self.catalog.get_plan(sub.plan_id).await?;
        let new = self.catalog.get_by_descriptor(new_descriptor).await?;
        let now = OffsetDateTime::now_utc();

        Ok(ProrationEstimate {
            current_plan: current.descriptor.clone(),
            new_plan: new.descriptor.clone(),
            days_remaining: days_remaining(sub.current_period_end, now),
            amount_cents: estimate_proration(&current, &new, sub.current_period_end, now),
            currency: new.currency.clone(),
        })
    }

    /// Subscription, plan, and the default card with its expiry status
    pub async fn subscription_details(&self, tenant_id: Uuid, cancel: &CancelSignal) -> BillingResult<SubscriptionDetails> {
        let subscription = self.get_for_tenant(tenant_id).await?;
        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        let tenant = self.tenants.get_tenant(tenant_id).await?;

        let payment_method_id = match (&tenant.default_payment_method_id, &tenant.processor_customer_id) {
            (Some(pm), _) => Some(pm.clone()),
            (None, Some(customer_id)) => match self.customers.retrieve_customer(customer_id, cancel).await {
                Ok(customer) => customer.default_payment_method,
                Err(e) => {
                    tracing::warn!(customer_id = %customer_id, error = %e, "Could not load customer for details");
                    None
                }
            },
            (None, None) => None,
        };

        let gateway = &self.gateway;
        let payment_method = match payment_method_id {
            Some(pm) => match with_retry("retrieve_payment_method", self.retry.attempts, cancel, || {
                gateway.retrieve_payment_method(&pm)
            })
            .await
            {
                Ok(record) => record
                    .card
                    .map(|card| CardDetails::from_card(&card, OffsetDateTime::now_utc().date())),
                Err(e) => {
                    tracing::warn!(payment_method_id = %pm, error = %e, "Could not load payment method");
                    None
                }
            },
            None => None,
        };

        Ok(SubscriptionDetails {
            subscription,
            plan,
            payment_method,
        })
    }

    /// Overwrite the status reported by the processor, and the plan when the
    /// reported price belongs to another catalog plan. Unknown subscriptions
    /// are skipped; transitions out of `canceled` are ignored.
    pub async fn sync_status(
        &self,
        processor_subscription_id: &str,
        status: &str,
        period_end: i64,
        price_id: Option<&str>,
    ) -> BillingResult<Option<Subscription>> {
        let Some(sub) = self.find_by_processor_id(processor_subscription_id).await? else {
            tracing::debug!(processor_subscription_id, "No local subscription for processor id");
            return Ok(None);
        };
        let plan_id = match price_id {
            Some(price_id) => match self.catalog.find_by_price_id(price_id).await? {
                Some(plan) => Some(plan.id),
                None => {
                    tracing::debug!(price_id, "Reported price belongs to no catalog plan");
                    None
                }
            },
            None => None,
        };
        let next = SubscriptionStatus::from_processor(status);
        self.transition(sub, next, timestamp(period_end), plan_id)
            .await
            .map(Some)
    }

    /// Paid invoice. A trial stays a trial until the processor reports its
    /// end, since the zero-amount trial invoice is also paid.
    pub async fn mark_active(&self, processor_subscription_id: &str) -> BillingResult<Option<Subscription>> {
        match self.find_by_processor_id(processor_subscription_id).await? {
            Some(sub) if sub.status == SubscriptionStatus::Trialing => Ok(Some(sub)),
            Some(sub) => self
                .transition(sub, SubscriptionStatus::Active, None, None)
                .await
                .map(Some),
            None => {
                tracing::debug!(processor_subscription_id, "No local subscription for processor id");
                Ok(None)
            }
        }
    }

    pub async fn mark_past_due(&self, processor_subscription_id: &str) -> BillingResult<Option<Subscription>> {
        self.set_status(processor_subscription_id, SubscriptionStatus::PastDue)
            .await
    }

    /// Refund unused time, then mark the subscription canceled
    #[tracing::instrument(skip(self, cancel))]
    pub async fn finalize_cancellation(
        &self,
        processor_subscription_id: &str,
        period_start: i64,
        period_end: i64,
        cancel: &CancelSignal,
    ) -> BillingResult<RefundOutcome> {
        let outcome = self
            .refunds
            .refund_on_cancellation(processor_subscription_id, period_start, period_end, cancel)
            .await?;

        if let Some(sub) = self.find_by_processor_id(processor_subscription_id).await? {
            if sub.status != SubscriptionStatus::Canceled {
                self.transition(sub, SubscriptionStatus::Canceled, Some(OffsetDateTime::now_utc()), None)
                    .await?;
            }
        }
        Ok(outcome)
    }

    /// Look up the tenant's owner and dispatch `template` in the background
    pub async fn notify_tenant(&self, tenant_id: Uuid, template: NotificationTemplate, data: serde_json::Value) {
        match self.tenants.get_tenant(tenant_id).await {
            Ok(tenant) => self.notifier.dispatch(template, &tenant.owner_email, data),
            Err(e) => tracing::warn!(
                tenant_id = %tenant_id,
                template = %template,
                error = %e,
                "Skipping notification, tenant lookup failed"
            ),
        }
    }

    async fn set_status(
        &self,
        processor_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<Option<Subscription>> {
        match self.find_by_processor_id(processor_subscription_id).await? {
            Some(sub) => self.transition(sub, status, None, None).await.map(Some),
            None => {
                tracing::debug!(processor_subscription_id, "No local subscription for processor id");
                Ok(None)
            }
        }
    }

    async fn transition(
        &self,
        sub: Subscription,
        next: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
        plan_id: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        if !sub.status.can_transition_to(next) {
            tracing::warn!(
                processor_subscription_id = %sub.processor_subscription_id,
                from = %sub.status,
                to = %next,
                "Ignoring disallowed status transition"
            );
            return Ok(sub);
        }

        let mut updated = sub.clone();
        updated.status = next;
        if let Some(end) = period_end {
            updated.current_period_end = end;
        }
        if let Some(plan_id) = plan_id {
            updated.plan_id = plan_id;
        }
        if updated == sub {
            return Ok(sub);
        }
        updated.updated_at = OffsetDateTime::now_utc();

        let saved = with_unit_retries("persist_status", UNIT_RETRIES, || self.persist(&updated)).await?;
        tracing::info!(
            processor_subscription_id = %saved.processor_subscription_id,
            from = %sub.status,
            to = %saved.status,
            plan_changed = saved.plan_id != sub.plan_id,
            "Subscription status updated"
        );
        Ok(saved)
    }

    async fn persist(&self, sub: &Subscription) -> BillingResult<Subscription> {
        Ok(self.subscriptions.update_one(sub).await?)
    }
}

fn timestamp(unix: i64) -> Option<OffsetDateTime> {
    if unix <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(unix).ok()
}

fn processor_price(plan: &Plan) -> BillingResult<String> {
    plan.processor_price_id
        .clone()
        .ok_or_else(|| BillingError::Internal(format!("plan {} has no processor price", plan.id)))
}

fn check_days(field: &str, days: i64, max: i64) -> BillingResult<()> {
    if !(1..=max).contains(&days) {
        return Err(BillingError::InvalidInput(format!(
            "{} must be between 1 and {}, got {}",
            field, max, days
        )));
    }
    Ok(())
}

fn trial_status_of(remote: &SubscriptionRecord, now: OffsetDateTime) -> TrialStatus {
    let is_in_trial = remote.status == "trialing";
    let trial_end = remote.trial_end.and_then(timestamp);
    let days_remaining = match trial_end {
        Some(end) if is_in_trial => whole_days_until(end, now),
        _ => 0,
    };
    TrialStatus {
        is_in_trial,
        trial_end,
        days_remaining,
    }
}

/// Days until `end`, a started day counting as one
fn whole_days_until(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = end.unix_timestamp() - now.unix_timestamp();
    if seconds <= 0 {
        return 0;
    }
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

/// Calendar day, "YYYY-MM-DD"
pub(crate) fn parse_day(value: &str) -> Option<Date> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]")).ok()
}

/// "YYYY-MM-DD" (midnight UTC) or an RFC 3339 timestamp
fn parse_effective_date(value: &str) -> BillingResult<OffsetDateTime> {
    if let Ok(at) = OffsetDateTime::parse(value.trim(), &Rfc3339) {
        return Ok(at);
    }
    parse_day(value)
        .map(|day| day.midnight().assume_utc())
        .ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "effective_date must be YYYY-MM-DD or an RFC 3339 timestamp, got {}",
                value
            ))
        })
}

pub(crate) fn plan_payload(plan: &Plan) -> serde_json::Value {
    serde_json::json!({
        "plan_name": plan.name,
        "plan_descriptor": plan.descriptor,
        "amount_cents": plan.price_cents,
        "currency": plan.currency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn unknown_processor_statuses_are_incomplete() {
        assert_eq!(SubscriptionStatus::from_processor("active"), Active);
        assert_eq!(SubscriptionStatus::from_processor("past_due"), PastDue);
        assert_eq!(SubscriptionStatus::from_processor("trialing"), Trialing);
        assert_eq!(SubscriptionStatus::from_processor("incomplete_expired"), Incomplete);
        assert_eq!(SubscriptionStatus::from_processor("paused"), Incomplete);
    }

    #[test]
    fn canceled_is_terminal() {
        for next in [Incomplete, Trialing, Active, PastDue, Unpaid] {
            assert!(!Canceled.can_transition_to(next));
        }
        assert!(Canceled.can_transition_to(Canceled));
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(Incomplete.can_transition_to(Active));
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(Active.can_transition_to(Unpaid));
        assert!(PastDue.can_transition_to(Unpaid));
        assert!(!Incomplete.can_transition_to(Unpaid));
        assert!(!Unpaid.can_transition_to(PastDue));
        assert!(Incomplete.can_transition_to(Trialing));
        assert!(Trialing.can_transition_to(Active));
        assert!(Trialing.can_transition_to(PastDue));
        assert!(!Active.can_transition_to(Trialing));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [Incomplete, Trialing, Active, PastDue, Unpaid, Canceled] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn effective_dates_accept_day_or_timestamp() {
        let day = parse_effective_date("2031-02-03").unwrap();
        assert_eq!(day.unix_timestamp(), 1_927_843_200);

        let exact = parse_effective_date("2031-02-03T12:30:00Z").unwrap();
        assert_eq!(exact.unix_timestamp() - day.unix_timestamp(), 12 * 3_600 + 30 * 60);

        assert!(matches!(
            parse_effective_date("03/02/2031"),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(parse_day("2031-02-30").is_none());
    }

    #[test]
    fn started_trial_days_count_whole() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(whole_days_until(now + Duration::hours(1), now), 1);
        assert_eq!(whole_days_until(now + Duration::days(3), now), 3);
        assert_eq!(whole_days_until(now + Duration::days(3) + Duration::seconds(1), now), 4);
        assert_eq!(whole_days_until(now - Duration::days(1), now), 0);
    }

    #[test]
    fn day_counts_are_bounded() {
        assert!(check_days("trial_days", 1, MAX_TRIAL_DAYS).is_ok());
        assert!(check_days("trial_days", 30, MAX_TRIAL_DAYS).is_ok());
        assert!(check_days("trial_days", 0, MAX_TRIAL_DAYS).is_err());
        assert!(check_days("grace_days", 31, MAX_GRACE_DAYS).is_err());
    }

    #[test]
    fn trial_status_reads_processor_record() {
        let now = OffsetDateTime::now_utc();
        let mut remote = SubscriptionRecord {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: "trialing".to_string(),
            item_id: None,
            price_id: None,
            current_period_start: now.unix_timestamp(),
            current_period_end: now.unix_timestamp(),
            created: now.unix_timestamp(),
            trial_end: Some((now + Duration::days(5)).unix_timestamp()),
            metadata: Metadata::new(),
        };
        let status = trial_status_of(&remote, now);
        assert!(status.is_in_trial);
        assert_eq!(status.days_remaining, 5);

        remote.status = "active".to_string();
        let status = trial_status_of(&remote, now);
        assert!(!status.is_in_trial);
        assert_eq!(status.days_remaining, 0);
        assert!(status.trial_end.is_some());
    }

    #[test]
    fn zero_timestamp_is_unknown() {
        assert_eq!(timestamp(0), None);
        assert_eq!(
            timestamp(1_700_000_000).map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
    }
}
