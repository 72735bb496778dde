//! Tenant directory and usage counting collaborators

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::{LIMIT_BUSINESSES, LIMIT_ORDERS_PER_MONTH, LIMIT_TEAM_MEMBERS};

/// The billing view of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub owner_email: String,
    pub processor_customer_id: Option<String>,
    pub default_payment_method_id: Option<String>,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// `TenantNotFound` when no such tenant exists
    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Tenant>;

    async fn find_by_processor_customer(&self, customer_id: &str) -> BillingResult<Option<Tenant>>;

    async fn set_processor_customer_id(&self, tenant_id: Uuid, customer_id: &str) -> BillingResult<()>;

    async fn set_default_payment_method(&self, tenant_id: Uuid, payment_method_id: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait UsageCounter: Send + Sync {
    async fn team_members(&self, tenant_id: Uuid) -> BillingResult<i64>;

    async fn businesses(&self, tenant_id: Uuid) -> BillingResult<i64>;

    /// Orders created in `[from, to)`
    async fn orders_between(
        &self,
        tenant_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<i64>;
}

/// Start of the UTC calendar month containing `now`, and the start of the next one
pub fn month_bounds(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let now = now.to_offset(time::UtcOffset::UTC);
    let first = Date::from_calendar_date(now.year(), now.month(), 1).unwrap_or(now.date());
    let (next_year, next_month) = match now.month() {
        time::Month::December => (now.year() + 1, time::Month::January),
        month => (now.year(), month.next()),
    };
    let next = Date::from_calendar_date(next_year, next_month, 1).unwrap_or(first);
    (
        first.with_time(Time::MIDNIGHT).assume_utc(),
        next.with_time(Time::MIDNIGHT).assume_utc(),
    )
}

/// Current usage for a limit key; orders are counted for the current calendar month
pub async fn current_usage(
    counter: &dyn UsageCounter,
    tenant_id: Uuid,
    limit: &str,
    now: OffsetDateTime,
) -> BillingResult<i64> {
    match limit {
        LIMIT_TEAM_MEMBERS => counter.team_members(tenant_id).await,
        LIMIT_BUSINESSES => counter.businesses(tenant_id).await,
        LIMIT_ORDERS_PER_MONTH => {
            let (from, to) = month_bounds(now);
            counter.orders_between(tenant_id, from, to).await
        }
        other => Err(BillingError::InvalidInput(format!("unknown limit: {}", other))),
    }
}
