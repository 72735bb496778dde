//! Entitlement checks
//!
//! Answers "may this tenant use feature X" and "does this tenant have room
//! for N more of Y" from the tenant's subscription and plan. Features and
//! limits are looked up by key in the plan's tables.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, LIMITS, UNLIMITED};
use crate::subscriptions::{Subscription, SubscriptionService, SubscriptionStatus};
use crate::tenants::{current_usage, UsageCounter};

/// Current usage of one limit against the plan's allowance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageQuota {
    #[serde(rename = "type")]
    pub kind: String,
    pub used: i64,
    /// `-1` when unlimited
    pub limit: i64,
}

pub struct EntitlementService {
    subscriptions: Arc<SubscriptionService>,
    catalog: Arc<PlanCatalog>,
    usage: Arc<dyn UsageCounter>,
}

impl EntitlementService {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        catalog: Arc<PlanCatalog>,
        usage: Arc<dyn UsageCounter>,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            usage,
        }
    }

    pub async fn can_use_feature(&self, tenant_id: Uuid, feature: &str) -> BillingResult<()> {
        let (subscription, plan) = self.active_plan(tenant_id).await?;
        check_feature(&subscription, &plan, feature)
    }

    /// Fails with `LimitExceeded` when `additional` more units would exceed the plan
    pub async fn check_usage_limit(&self, tenant_id: Uuid, limit: &str, additional: i64) -> BillingResult<()> {
        let (_, plan) = self.active_plan(tenant_id).await?;
        let allowed = plan
            .limits
            .get(limit)
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown limit: {}", limit)))?;
        if allowed == UNLIMITED {
            return Ok(());
        }

        let current = current_usage(self.usage.as_ref(), tenant_id, limit, OffsetDateTime::now_utc()).await?;
        check_limit(limit, current, additional, allowed)
    }

    /// Usage of `kind` against the tenant's current plan
    pub async fn usage_quota(&self, tenant_id: Uuid, kind: &str) -> BillingResult<UsageQuota> {
        let plan = self.current_plan(tenant_id).await?;
        let limit = plan
            .limits
            .get(kind)
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown limit: {}", kind)))?;
        let used = current_usage(self.usage.as_ref(), tenant_id, kind, OffsetDateTime::now_utc()).await?;
        Ok(UsageQuota {
            kind: kind.to_string(),
            used,
            limit,
        })
    }

    /// Every limit of the tenant's plan with current usage
    pub async fn subscription_usage(&self, tenant_id: Uuid) -> BillingResult<Vec<UsageQuota>> {
        let plan = self.current_plan(tenant_id).await?;
        let now = OffsetDateTime::now_utc();
        let mut quotas = Vec::with_capacity(LIMITS.len());
        for (kind, allowance) in LIMITS {
            let used = current_usage(self.usage.as_ref(), tenant_id, kind, now).await?;
            quotas.push(UsageQuota {
                kind: kind.to_string(),
                used,
                limit: allowance(&plan.limits),
            });
        }
        Ok(quotas)
    }

    /// Plan of the tenant's subscription, whatever its status
    async fn current_plan(&self, tenant_id: Uuid) -> BillingResult<Plan> {
        let subscription = self.subscriptions.get_for_tenant(tenant_id).await?;
        self.catalog.get_plan(subscription.plan_id).await
    }

    async fn active_plan(&self, tenant_id: Uuid) -> BillingResult<(Subscription, Plan)> {
        let subscription = self.subscriptions.get_for_tenant(tenant_id).await?;
        require_active(&subscription)?;
        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        Ok((subscription, plan))
    }
}

/// Trials carry the full entitlements of their plan
fn require_active(subscription: &Subscription) -> BillingResult<()> {
    match subscription.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => Ok(()),
        SubscriptionStatus::Canceled => Err(BillingError::SubscriptionCanceled),
        other => Err(BillingError::SubscriptionNotActive(other.to_string())),
    }
}

/// Subscription must be active, the key known, and the flag enabled
pub fn check_feature(subscription: &Subscription, plan: &Plan, feature: &str) -> BillingResult<()> {
    require_active(subscription)?;
    match plan.features.get(feature) {
        None => Err(BillingError::UnknownFeature(feature.to_string())),
        Some(false) => Err(BillingError::FeatureNotAvailable(feature.to_string())),
        Some(true) => Ok(()),
    }
}

pub fn check_limit(limit: &str, current: i64, additional: i64, allowed: i64) -> BillingResult<()> {
    if allowed == UNLIMITED || current + additional <= allowed {
        return Ok(());
    }
    Err(BillingError::LimitExceeded {
        limit: limit.to_string(),
        current,
        allowed,
    })
}
