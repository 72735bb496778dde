//! Plan catalog synchronization
//!
//! Maps local plans onto processor products and prices. Prices are never
//! edited in place: when a plan's amount, currency, or cycle drifts from
//! its stored price, a new price is created and the plan is repointed.

use std::collections::HashMap;
use std::sync::Arc;

use subsync_shared::{Repository, Scope};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{Metadata, NewPrice, NewProduct, PriceRecord, ProcessorGateway, ProductRecord};
use crate::plans::{seed_plans, Plan};
use crate::retry::{with_retry, CancelSignal, RetrySettings};

/// Product metadata key holding the local plan id
pub const META_PLAN_ID: &str = "plan_id";
/// Product metadata key holding the plan descriptor
pub const META_DESCRIPTOR: &str = "descriptor";

/// Upper bound on products scanned when searching by metadata
const PRODUCT_SCAN_LIMIT: u64 = 100;

/// Outcome of a full catalog sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
}

pub struct PlanCatalog {
    gateway: Arc<dyn ProcessorGateway>,
    plans: Arc<dyn Repository<Plan>>,
    retry: RetrySettings,
    /// plan id -> last verified price id
    cache: Mutex<HashMap<Uuid, String>>,
}

impl PlanCatalog {
    pub fn new(
        gateway: Arc<dyn ProcessorGateway>,
        plans: Arc<dyn Repository<Plan>>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            gateway,
            plans,
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans = self.plans.find_many(&[]).await?;
        plans.sort_by_key(|p| p.price_cents);
        Ok(plans)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.plans.find_by_id(plan_id).await.map_err(|e| {
            if e.is_not_found() {
                BillingError::PlanNotFound(plan_id.to_string())
            } else {
                e.into()
            }
        })
    }

    pub async fn get_by_descriptor(&self, descriptor: &str) -> BillingResult<Plan> {
        self.plans
            .find_one(&[Scope::eq("descriptor", descriptor)])
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    BillingError::PlanNotFound(descriptor.to_string())
                } else {
                    e.into()
                }
            })
    }

    /// Plan currently billed through `price_id`, if any
    pub async fn find_by_price_id(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        match self
            .plans
            .find_one(&[Scope::eq("processor_price_id", price_id)])
            .await
        {
            Ok(plan) => Ok(Some(plan)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert `definitions` and forget cached verifications
    pub async fn seed(&self, definitions: Vec<Plan>) -> BillingResult<Vec<Plan>> {
        let seeded = seed_plans(self.plans.as_ref(), definitions).await?;
        self.invalidate().await;
        Ok(seeded)
    }

    /// Drop every cached verification so the next call re-validates
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    /// Guarantee `plan` points at a processor price matching its definition.
    /// Returns the plan as persisted, possibly with a new price reference.
    #[tracing::instrument(skip_all, fields(plan_id = %plan.id, descriptor = %plan.descriptor))]
    pub async fn ensure_synced(&self, plan: &Plan, cancel: &CancelSignal) -> BillingResult<Plan> {
        if let Some(price_id) = &plan.processor_price_id {
            if self.cache.lock().await.get(&plan.id) == Some(price_id) {
                return Ok(plan.clone());
            }
        }

        let current_price = match &plan.processor_price_id {
            Some(price_id) => {
                let gateway = &self.gateway;
                match with_retry("retrieve_price", self.retry.attempts, cancel, || {
                    gateway.retrieve_price(price_id)
                })
                .await
                {
                    Ok(price) => Some(price),
                    Err(e) => {
                        tracing::warn!(
                            price_id = %price_id,
                            error = %e,
                            "Stored price unavailable, a new one will be created"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let product = self
            .resolve_product(plan, current_price.as_ref(), cancel)
            .await?;

        if let Some(price) = &current_price {
            if price_matches(plan, price, &product.id) {
                self.cache.lock().await.insert(plan.id, price.id.clone());
                return Ok(plan.clone());
            }
            tracing::info!(
                price_id = %price.id,
                unit_amount = ?price.unit_amount,
                currency = %price.currency,
                "Stored price no longer matches plan definition"
            );
        }

        let new_price = self.create_price(plan, &product.id, cancel).await?;

        let mut updated = plan.clone();
        updated.processor_price_id = Some(new_price.id.clone());
        updated.updated_at = OffsetDateTime::now_utc();
        let updated = self.plans.update_one(&updated).await?;

        self.cache.lock().await.insert(plan.id, new_price.id.clone());

        tracing::info!(
            price_id = %new_price.id,
            product_id = %product.id,
            amount_cents = plan.price_cents,
            "Created price for plan"
        );

        Ok(updated)
    }

    /// Reconcile every plan. Per-plan failures are logged and counted.
    #[tracing::instrument(skip_all)]
    pub async fn sync_all_plans(&self, cancel: &CancelSignal) -> BillingResult<SyncReport> {
        let plans = self.plans.find_many(&[]).await?;
        tracing::info!(plan_count = plans.len(), "Starting plan sync");

        let mut report = SyncReport::default();
        for plan in &plans {
            if cancel.is_cancelled() {
                tracing::warn!("Plan sync cancelled");
                break;
            }
            match self.ensure_synced(plan, cancel).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        plan_id = %plan.id,
                        descriptor = %plan.descriptor,
                        error = %e,
                        "Failed to sync plan"
                    );
                }
            }
        }

        tracing::info!(synced = report.synced, failed = report.failed, "Completed plan sync");
        Ok(report)
    }

    async fn resolve_product(
        &self,
        plan: &Plan,
        current_price: Option<&PriceRecord>,
        cancel: &CancelSignal,
    ) -> BillingResult<ProductRecord> {
        let gateway = &self.gateway;
        let attempts = self.retry.attempts;

        if let Some(price) = current_price.filter(|p| !p.product_id.is_empty()) {
            match with_retry("retrieve_product", attempts, cancel, || {
                gateway.retrieve_product(&price.product_id)
            })
            .await
            {
                Ok(product) if product_matches(plan, &product) => return Ok(product),
                Ok(product) => {
                    let metadata = plan_metadata(plan);
                    let key = format!("product_meta_{}_{}", plan.id, product.id);
                    let updated = with_retry("update_product", attempts, cancel, || {
                        gateway.update_product_metadata(&product.id, &metadata, &key)
                    })
                    .await?;
                    tracing::info!(product_id = %updated.id, "Updated product metadata");
                    return Ok(updated);
                }
                Err(e) => {
                    tracing::warn!(
                        product_id = %price.product_id,
                        error = %e,
                        "Linked product unavailable, searching catalog"
                    );
                }
            }
        }

        let products = with_retry("list_products", attempts, cancel, || {
            gateway.list_active_products(PRODUCT_SCAN_LIMIT)
        })
        .await?;
        if let Some(product) = products.into_iter().find(|p| product_matches(plan, p)) {
            return Ok(product);
        }

        let params = NewProduct {
            name: plan.name.clone(),
            description: Some(plan.description.clone()),
            metadata: plan_metadata(plan),
        };
        let key = format!("product_{}", plan.id);
        let product = with_retry("create_product", attempts, cancel, || {
            gateway.create_product(&params, &key)
        })
        .await?;

        tracing::info!(product_id = %product.id, name = %plan.name, "Created product");
        Ok(product)
    }

    async fn create_price(
        &self,
        plan: &Plan,
        product_id: &str,
        cancel: &CancelSignal,
    ) -> BillingResult<PriceRecord> {
        let interval = plan.billing_cycle.interval();
        let params = NewPrice {
            product_id: product_id.to_string(),
            currency: plan.currency.to_lowercase(),
            unit_amount: plan.price_cents,
            interval,
            metadata: plan_metadata(plan),
        };
        let key = format!("price_{}_{}_{}", plan.id, interval.as_str(), plan.price_cents);

        let gateway = &self.gateway;
        let price = with_retry("create_price", self.retry.attempts, cancel, || {
            gateway.create_price(&params, &key)
        })
        .await?;
        Ok(price)
    }
}

fn plan_metadata(plan: &Plan) -> Metadata {
    Metadata::from([
        (META_PLAN_ID.to_string(), plan.id.to_string()),
        (META_DESCRIPTOR.to_string(), plan.descriptor.clone()),
    ])
}

fn product_matches(plan: &Plan, product: &ProductRecord) -> bool {
    let plan_id = plan.id.to_string();
    product.metadata.get(META_PLAN_ID) == Some(&plan_id)
        || product.metadata.get(META_DESCRIPTOR) == Some(&plan.descriptor)
}

/// A price is current when currency, interval, amount, and product all match
pub fn price_matches(plan: &Plan, price: &PriceRecord, product_id: &str) -> bool {
    price.currency.eq_ignore_ascii_case(&plan.currency)
        && price.interval == Some(plan.billing_cycle.interval())
        && price.unit_amount == Some(plan.price_cents)
        && price.product_id == product_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RecurringInterval;
    use crate::plans::default_catalog;

    fn price_for(plan: &Plan, product_id: &str) -> PriceRecord {
        PriceRecord {
            id: "price_1".to_string(),
            product_id: product_id.to_string(),
            currency: plan.currency.to_uppercase(),
            unit_amount: Some(plan.price_cents),
            interval: Some(RecurringInterval::Month),
            active: true,
        }
    }

    #[test]
    fn matching_price_is_current() {
        let plan = default_catalog().remove(1);
        assert!(price_matches(&plan, &price_for(&plan, "prod_1"), "prod_1"));
    }

    #[test]
    fn any_drift_makes_price_stale() {
        let plan = default_catalog().remove(1);

        let mut amount = price_for(&plan, "prod_1");
        amount.unit_amount = Some(6000);
        assert!(!price_matches(&plan, &amount, "prod_1"));

        let mut interval = price_for(&plan, "prod_1");
        interval.interval = Some(RecurringInterval::Year);
        assert!(!price_matches(&plan, &interval, "prod_1"));

        let mut currency = price_for(&plan, "prod_1");
        currency.currency = "usd".to_string();
        assert!(!price_matches(&plan, &currency, "prod_1"));

        assert!(!price_matches(&plan, &price_for(&plan, "prod_1"), "prod_2"));
    }

    #[test]
    fn product_matches_by_id_or_descriptor() {
        let plan = default_catalog().remove(0);
        let mut product = ProductRecord {
            id: "prod_1".to_string(),
            name: "Starter".to_string(),
            active: true,
            metadata: Metadata::new(),
        };
        assert!(!product_matches(&plan, &product));

        product
            .metadata
            .insert(META_DESCRIPTOR.to_string(), "starter".to_string());
        assert!(product_matches(&plan, &product));

        product.metadata = plan_metadata(&plan);
        assert!(product_matches(&plan, &product));
    }
}
