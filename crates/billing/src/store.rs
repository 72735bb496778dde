//! Postgres-backed repositories and collaborators

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use subsync_shared::{Entity, FieldValue, Repository, Scope, StoreError, StoreResult};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::ProcessedEvent;
use crate::plans::{BillingCycle, Plan, PlanFeatures, PlanLimits};
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::tenants::{Tenant, TenantDirectory, UsageCounter};

/// Append `WHERE`/`AND` clauses for `scopes`, accepting only known columns
fn push_scopes(
    builder: &mut QueryBuilder<'_, Postgres>,
    scopes: &[Scope],
    columns: &[&str],
) -> StoreResult<()> {
    for (i, scope) in scopes.iter().enumerate() {
        let Scope::Eq(field, value) = scope;
        if !columns.contains(field) {
            return Err(StoreError::Database(format!("unknown filter column: {}", field)));
        }

        builder.push(if i == 0 { " WHERE " } else { " AND " });
        builder.push(*field).push(" = ");
        match value {
            FieldValue::Text(v) => builder.push_bind(v.clone()),
            FieldValue::Uuid(v) => builder.push_bind(*v),
            FieldValue::Int(v) => builder.push_bind(*v),
            FieldValue::Bool(v) => builder.push_bind(*v),
        };
    }
    Ok(())
}

fn first_or_not_found<T: Entity>(mut rows: Vec<T>) -> StoreResult<T> {
    if rows.is_empty() {
        return Err(StoreError::not_found(T::NAME));
    }
    Ok(rows.swap_remove(0))
}

// =============================================================================
// Plans
// =============================================================================

const PLAN_COLUMNS: &str = "id, descriptor, name, description, price_cents, currency, billing_cycle, \
     processor_price_id, features, limits, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    descriptor: String,
    name: String,
    description: String,
    price_cents: i64,
    currency: String,
    billing_cycle: String,
    processor_price_id: Option<String>,
    features: Json<PlanFeatures>,
    limits: Json<PlanLimits>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Plan {
            id: row.id,
            descriptor: row.descriptor,
            name: row.name,
            description: row.description,
            price_cents: row.price_cents,
            currency: row.currency,
            billing_cycle: row
                .billing_cycle
                .parse::<BillingCycle>()
                .map_err(StoreError::Database)?,
            processor_price_id: row.processor_price_id,
            features: row.features.0,
            limits: row.limits.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgPlanRepository {
    pool: PgPool,
}

impl PgPlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<Plan> for PgPlanRepository {
    async fn find_one(&self, scopes: &[Scope]) -> StoreResult<Plan> {
        first_or_not_found(self.find_many(scopes).await?)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Plan> {
        self.find_one(&[Scope::eq("id", id)]).await
    }

    async fn find_many(&self, scopes: &[Scope]) -> StoreResult<Vec<Plan>> {
        let mut builder = QueryBuilder::new(format!("SELECT {} FROM plans", PLAN_COLUMNS));
        push_scopes(&mut builder, scopes, &["id", "descriptor", "processor_price_id"])?;
        builder.push(" ORDER BY price_cents");

        let rows: Vec<PlanRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(Plan::NAME, e))?;
        rows.into_iter().map(Plan::try_from).collect()
    }

    async fn create_one(&self, plan: &Plan) -> StoreResult<Plan> {
        let row: PlanRow = sqlx::query_as(&format!(
            "INSERT INTO plans ({cols}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING {cols}",
            cols = PLAN_COLUMNS
        ))
        .bind(plan.id)
        .bind(&plan.descriptor)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.billing_cycle.as_str())
        .bind(&plan.processor_price_id)
        .bind(Json(plan.features))
        .bind(Json(plan.limits))
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(Plan::NAME, e))?;
        row.try_into()
    }

    async fn update_one(&self, plan: &Plan) -> StoreResult<Plan> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            r#"
            UPDATE plans
            SET descriptor = $2, name = $3, description = $4, price_cents = $5, currency = $6,
                billing_cycle = $7, processor_price_id = $8, features = $9, limits = $10,
                updated_at = $11
            WHERE id = $1
            RETURNING {}
            "#,
            PLAN_COLUMNS
        ))
        .bind(plan.id)
        .bind(&plan.descriptor)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.billing_cycle.as_str())
        .bind(&plan.processor_price_id)
        .bind(Json(plan.features))
        .bind(Json(plan.limits))
        .bind(plan.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(Plan::NAME, e))?;

        row.ok_or_else(|| StoreError::not_found(Plan::NAME))?.try_into()
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, processor_subscription_id, status, \
     current_period_end, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    processor_subscription_id: String,
    status: String,
    current_period_end: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            processor_subscription_id: row.processor_subscription_id,
            status: row
                .status
                .parse::<SubscriptionStatus>()
                .map_err(StoreError::Database)?,
            current_period_end: row.current_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<Subscription> for PgSubscriptionRepository {
    async fn find_one(&self, scopes: &[Scope]) -> StoreResult<Subscription> {
        first_or_not_found(self.find_many(scopes).await?)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Subscription> {
        self.find_one(&[Scope::eq("id", id)]).await
    }

    async fn find_many(&self, scopes: &[Scope]) -> StoreResult<Vec<Subscription>> {
        let mut builder =
            QueryBuilder::new(format!("SELECT {} FROM subscriptions", SUBSCRIPTION_COLUMNS));
        push_scopes(
            &mut builder,
            scopes,
            &["id", "tenant_id", "plan_id", "processor_subscription_id", "status"],
        )?;

        let rows: Vec<SubscriptionRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(Subscription::NAME, e))?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn create_one(&self, sub: &Subscription) -> StoreResult<Subscription> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            "INSERT INTO subscriptions ({cols}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {cols}",
            cols = SUBSCRIPTION_COLUMNS
        ))
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(sub.plan_id)
        .bind(&sub.processor_subscription_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_end)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(Subscription::NAME, e))?;
        row.try_into()
    }

    async fn update_one(&self, sub: &Subscription) -> StoreResult<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET plan_id = $2, processor_subscription_id = $3, status = $4,
                current_period_end = $5, created_at = $6, updated_at = $7
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(sub.id)
        .bind(sub.plan_id)
        .bind(&sub.processor_subscription_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_end)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(Subscription::NAME, e))?;

        row.ok_or_else(|| StoreError::not_found(Subscription::NAME))?.try_into()
    }
}

// =============================================================================
// Processed events
// =============================================================================

#[derive(sqlx::FromRow)]
struct ProcessedEventRow {
    id: Uuid,
    event_id: String,
    event_type: String,
    processed_at: OffsetDateTime,
}

impl From<ProcessedEventRow> for ProcessedEvent {
    fn from(row: ProcessedEventRow) -> Self {
        ProcessedEvent {
            id: row.id,
            event_id: row.event_id,
            event_type: row.event_type,
            processed_at: row.processed_at,
        }
    }
}

#[derive(Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository<ProcessedEvent> for PgEventLedger {
    async fn find_one(&self, scopes: &[Scope]) -> StoreResult<ProcessedEvent> {
        first_or_not_found(self.find_many(scopes).await?)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<ProcessedEvent> {
        self.find_one(&[Scope::eq("id", id)]).await
    }

    async fn find_many(&self, scopes: &[Scope]) -> StoreResult<Vec<ProcessedEvent>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, event_id, event_type, processed_at FROM processed_events",
        );
        push_scopes(&mut builder, scopes, &["id", "event_id", "event_type"])?;

        let rows: Vec<ProcessedEventRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(ProcessedEvent::NAME, e))?;
        Ok(rows.into_iter().map(ProcessedEvent::from).collect())
    }

    async fn create_one(&self, event: &ProcessedEvent) -> StoreResult<ProcessedEvent> {
        let row: ProcessedEventRow = sqlx::query_as(
            r#"
            INSERT INTO processed_events (id, event_id, event_type, processed_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, event_id, event_type, processed_at
            "#,
        )
        .bind(event.id)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.processed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(ProcessedEvent::NAME, e))?;
        Ok(row.into())
    }

    /// The ledger is append-only
    async fn update_one(&self, _event: &ProcessedEvent) -> StoreResult<ProcessedEvent> {
        Err(StoreError::Database(
            "processed events are append-only".to_string(),
        ))
    }
}

// =============================================================================
// Tenants and usage
// =============================================================================

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    owner_email: String,
    processor_customer_id: Option<String>,
    default_payment_method_id: Option<String>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            name: row.name,
            owner_email: row.owner_email,
            processor_customer_id: row.processor_customer_id,
            default_payment_method_id: row.default_payment_method_id,
        }
    }
}

#[derive(Clone)]
pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Tenant> {
        let row: Option<TenantRow> = sqlx::query_as(
            r#"
            SELECT id, name, owner_email, processor_customer_id, default_payment_method_id
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Tenant::from)
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))
    }

    async fn find_by_processor_customer(&self, customer_id: &str) -> BillingResult<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            r#"
            SELECT id, name, owner_email, processor_customer_id, default_payment_method_id
            FROM tenants
            WHERE processor_customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Tenant::from))
    }

    async fn set_processor_customer_id(&self, tenant_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE tenants SET processor_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::TenantNotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    async fn set_default_payment_method(&self, tenant_id: Uuid, payment_method_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE tenants SET default_payment_method_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(payment_method_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::TenantNotFound(tenant_id.to_string()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgUsageCounter {
    pool: PgPool,
}

impl PgUsageCounter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageCounter for PgUsageCounter {
    async fn team_members(&self, tenant_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM team_members WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn businesses(&self, tenant_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM businesses WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn orders_between(
        &self,
        tenant_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_render_as_bound_conjunction() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT id FROM subscriptions");
        push_scopes(
            &mut builder,
            &[
                Scope::eq("tenant_id", Uuid::nil()),
                Scope::eq("status", "active"),
            ],
            &["tenant_id", "status"],
        )
        .unwrap();
        assert_eq!(
            builder.sql(),
            "SELECT id FROM subscriptions WHERE tenant_id = $1 AND status = $2"
        );
    }

    #[test]
    fn unknown_scope_columns_are_rejected() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT id FROM plans");
        let err = push_scopes(&mut builder, &[Scope::eq("name; DROP", "x")], &["id"]).unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn plan_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = subsync_shared::create_pool(&url, 2).await.unwrap();
        subsync_shared::run_migrations(&pool).await.unwrap();

        let repo = PgPlanRepository::new(pool);
        let seeded = crate::plans::seed_plans(&repo, crate::plans::default_catalog())
            .await
            .unwrap();
        let loaded = repo.find_by_id(seeded[1].id).await.unwrap();
        assert_eq!(loaded.features, seeded[1].features);
        assert_eq!(loaded.limits, seeded[1].limits);
    }
}
