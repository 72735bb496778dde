//! Plan catalog definitions
//!
//! Plans are seeded from [`default_catalog`] at bootstrap and upserted by
//! descriptor. Feature flags and usage limits are data-driven: adding a
//! field to the macro invocation below is all a new flag needs.

use serde::{Deserialize, Serialize};
use subsync_shared::{Entity, FieldValue, Repository, Scope};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::RecurringInterval;

/// Limit value meaning "no limit"
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn interval(&self) -> RecurringInterval {
        match self {
            BillingCycle::Monthly => RecurringInterval::Month,
            BillingCycle::Yearly => RecurringInterval::Year,
        }
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(format!("unknown billing cycle: {}", other)),
        }
    }
}

macro_rules! feature_table {
    ($($field:ident),* $(,)?) => {
        /// Named boolean capabilities of a plan
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct PlanFeatures {
            $(#[serde(default)] pub $field: bool,)*
        }

        /// Every feature key, in catalog order
        pub const FEATURES: &[&str] = &[$(stringify!($field)),*];

        impl PlanFeatures {
            /// Flag value by key, `None` for unknown keys
            pub fn get(&self, key: &str) -> Option<bool> {
                match key {
                    $(stringify!($field) => Some(self.$field),)*
                    _ => None,
                }
            }

            fn set(&mut self, key: &str, value: bool) {
                match key {
                    $(stringify!($field) => self.$field = value,)*
                    _ => {}
                }
            }
        }
    };
}

feature_table!(
    customer_management,
    inventory_management,
    order_management,
    expense_management,
    accounting,
    basic_analytics,
    financial_reports,
    data_import,
    data_export,
    advanced_analytics,
    advanced_financial_reports,
    order_payment_links,
    invoice_generation,
    export_analytics_data,
    ai_business_assistant,
);

impl PlanFeatures {
    /// Features with the given keys enabled, all others disabled
    pub fn with_enabled(keys: &[&str]) -> Self {
        let mut features = Self::default();
        for key in keys {
            features.set(key, true);
        }
        features
    }

    pub fn enabled(&self) -> impl Iterator<Item = &'static str> + '_ {
        FEATURES
            .iter()
            .copied()
            .filter(|key| self.get(key).unwrap_or(false))
    }
}

/// Usage quotas. [`UNLIMITED`] disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_orders_per_month: i64,
    pub max_team_members: i64,
    pub max_businesses: i64,
}

pub const LIMIT_ORDERS_PER_MONTH: &str = "orders_per_month";
pub const LIMIT_TEAM_MEMBERS: &str = "team_members";
pub const LIMIT_BUSINESSES: &str = "businesses";

/// Every limit key with its accessor
pub const LIMITS: &[(&str, fn(&PlanLimits) -> i64)] = &[
    (LIMIT_ORDERS_PER_MONTH, |l| l.max_orders_per_month),
    (LIMIT_TEAM_MEMBERS, |l| l.max_team_members),
    (LIMIT_BUSINESSES, |l| l.max_businesses),
];

impl PlanLimits {
    pub fn get(&self, key: &str) -> Option<i64> {
        LIMITS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, accessor)| accessor(self))
    }

    pub fn unlimited() -> Self {
        Self {
            max_orders_per_month: UNLIMITED,
            max_team_members: UNLIMITED,
            max_businesses: UNLIMITED,
        }
    }
}

/// Whether `usage` fits within `limit`
pub fn within_limit(usage: i64, limit: i64) -> bool {
    limit == UNLIMITED || usage <= limit
}

/// A catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub descriptor: String,
    pub name: String,
    pub description: String,
    /// Price in minor currency units; 0 is the free tier
    pub price_cents: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub processor_price_id: Option<String>,
    pub features: PlanFeatures,
    pub limits: PlanLimits,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }
}

impl Entity for Plan {
    const NAME: &'static str = "plan";

    fn id(&self) -> Uuid {
        self.id
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => Some(self.id.into()),
            "descriptor" => Some(self.descriptor.clone().into()),
            "processor_price_id" => self.processor_price_id.clone().map(Into::into),
            _ => None,
        }
    }

    fn unique_fields() -> &'static [&'static str] {
        &["descriptor", "processor_price_id"]
    }
}

const STARTER_FEATURES: &[&str] = &[
    "customer_management",
    "inventory_management",
    "order_management",
    "expense_management",
    "accounting",
    "basic_analytics",
    "financial_reports",
];

const PROFESSIONAL_EXTRAS: &[&str] = &[
    "data_import",
    "data_export",
    "advanced_analytics",
    "advanced_financial_reports",
    "order_payment_links",
    "invoice_generation",
];

fn catalog_entry(
    descriptor: &str,
    name: &str,
    description: &str,
    price_cents: i64,
    features: PlanFeatures,
    limits: PlanLimits,
) -> Plan {
    let now = OffsetDateTime::now_utc();
    Plan {
        id: Uuid::new_v4(),
        descriptor: descriptor.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        price_cents,
        currency: "aed".to_string(),
        billing_cycle: BillingCycle::Monthly,
        processor_price_id: None,
        features,
        limits,
        created_at: now,
        updated_at: now,
    }
}

/// The plans every deployment starts with
pub fn default_catalog() -> Vec<Plan> {
    let professional: Vec<&str> = STARTER_FEATURES
        .iter()
        .chain(PROFESSIONAL_EXTRAS)
        .copied()
        .collect();

    vec![
        catalog_entry(
            "starter",
            "Starter Plan",
            "Perfect for sole owners just getting started with their business",
            0,
            PlanFeatures::with_enabled(STARTER_FEATURES),
            PlanLimits {
                max_orders_per_month: 25,
                max_team_members: 1,
                max_businesses: 1,
            },
        ),
        catalog_entry(
            "professional",
            "Professional Plan",
            "For growing businesses that need advanced features and higher limits",
            5499,
            PlanFeatures::with_enabled(&professional),
            PlanLimits {
                max_orders_per_month: 500,
                max_team_members: 5,
                max_businesses: 3,
            },
        ),
        catalog_entry(
            "enterprise",
            "Enterprise Plan",
            "For large businesses with advanced needs and unlimited usage",
            15599,
            PlanFeatures::with_enabled(FEATURES),
            PlanLimits::unlimited(),
        ),
    ]
}

/// Upsert `catalog` by descriptor. Existing rows keep their id, creation
/// time, and processor price reference; the synchronizer validates that
/// reference against the new definition later.
pub async fn seed_plans(repo: &dyn Repository<Plan>, catalog: Vec<Plan>) -> BillingResult<Vec<Plan>> {
    let mut seeded = Vec::with_capacity(catalog.len());

    for definition in catalog {
        let existing = match repo
            .find_one(&[Scope::eq("descriptor", definition.descriptor.as_str())])
            .await
        {
            Ok(plan) => Some(plan),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let plan = match existing {
            Some(current) => {
                let updated = Plan {
                    id: current.id,
                    processor_price_id: current.processor_price_id.clone(),
                    created_at: current.created_at,
                    updated_at: OffsetDateTime::now_utc(),
                    ..definition
                };
                repo.update_one(&updated).await?
            }
            None => repo.create_one(&definition).await?,
        };

        tracing::info!(
            plan_id = %plan.id,
            descriptor = %plan.descriptor,
            price_cents = plan.price_cents,
            "Seeded plan"
        );
        seeded.push(plan);
    }

    Ok(seeded)
}
