//! Billing error types

use serde::Serialize;
use subsync_shared::StoreError;
use thiserror::Error;

use crate::gateway::{ErrorClass, ProcessorError};

/// Coarse error category used by transports to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    UpstreamTransient,
    UpstreamPermanent,
    WebhookMalformed,
    Internal,
}

/// Why a downgrade was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DowngradeViolation {
    /// A feature enabled on the current plan is disabled on the target plan
    Feature { feature: String },
    /// Current usage exceeds the target plan's limit
    Limit {
        limit: String,
        current: i64,
        allowed: i64,
    },
}

impl std::fmt::Display for DowngradeViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DowngradeViolation::Feature { feature } => {
                write!(f, "target plan does not include feature '{}'", feature)
            }
            DowngradeViolation::Limit {
                limit,
                current,
                allowed,
            } => write!(
                f,
                "current {} usage ({}) exceeds the target plan limit ({})",
                limit, current, allowed
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookRejection {
    MissingSecret,
    MissingSignature,
    InvalidSignature,
    TimestampOutOfTolerance,
    InvalidPayload,
}

impl std::fmt::Display for WebhookRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            WebhookRejection::MissingSecret => "webhook secret not configured",
            WebhookRejection::MissingSignature => "missing signature header",
            WebhookRejection::InvalidSignature => "signature verification failed",
            WebhookRejection::TimestampOutOfTolerance => "signature timestamp outside tolerance",
            WebhookRejection::InvalidPayload => "malformed event payload",
        };
        f.write_str(msg)
    }
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid payment method: {0}")]
    InvalidPaymentMethod(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Subscription not found for tenant: {0}")]
    SubscriptionNotFound(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Feature '{0}' is not available on the current plan")]
    FeatureNotAvailable(String),

    #[error("Subscription is not active: {0}")]
    SubscriptionNotActive(String),

    #[error("Subscription has been canceled")]
    SubscriptionCanceled,

    #[error("Subscription cannot do that now: {0}")]
    InvalidState(String),

    #[error("Usage limit '{limit}' exceeded ({current} of {allowed})")]
    LimitExceeded {
        limit: String,
        current: i64,
        allowed: i64,
    },

    #[error("Downgrade blocked: {0}")]
    DowngradeBlocked(DowngradeViolation),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("Webhook rejected: {0}")]
    Webhook(WebhookRejection),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidInput(_)
            | BillingError::InvalidPaymentMethod(_)
            | BillingError::UnknownFeature(_) => ErrorKind::Validation,
            BillingError::PlanNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::TenantNotFound(_)
            | BillingError::InvoiceNotFound(_) => ErrorKind::NotFound,
            BillingError::FeatureNotAvailable(_)
            | BillingError::SubscriptionNotActive(_)
            | BillingError::SubscriptionCanceled
            | BillingError::LimitExceeded { .. } => ErrorKind::Forbidden,
            BillingError::DowngradeBlocked(_) | BillingError::InvalidState(_) => ErrorKind::Conflict,
            BillingError::Processor(e) => match e.class {
                ErrorClass::Transient => ErrorKind::UpstreamTransient,
                ErrorClass::Permanent | ErrorClass::Unknown => ErrorKind::UpstreamPermanent,
            },
            BillingError::Webhook(_) => ErrorKind::WebhookMalformed,
            BillingError::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            BillingError::Store(StoreError::UniqueViolation { .. }) => ErrorKind::Conflict,
            BillingError::Store(_) | BillingError::Config(_) | BillingError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Failures worth repeating a whole unit of work for: storage backend
    /// errors and transient processor errors. Domain rule violations never are.
    pub fn is_repeatable(&self) -> bool {
        match self {
            BillingError::Store(StoreError::Database(_)) => true,
            BillingError::Processor(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Structured context for transports that expose it
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            BillingError::DowngradeBlocked(violation) => serde_json::to_value(violation).ok(),
            BillingError::LimitExceeded {
                limit,
                current,
                allowed,
            } => Some(serde_json::json!({
                "limit": limit,
                "current": current,
                "allowed": allowed,
            })),
            BillingError::FeatureNotAvailable(feature) | BillingError::UnknownFeature(feature) => {
                Some(serde_json::json!({ "feature": feature }))
            }
            _ => None,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Store(StoreError::from(err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_errors_map_by_class() {
        let transient = BillingError::from(ProcessorError::transient("op", "busy"));
        assert_eq!(transient.kind(), ErrorKind::UpstreamTransient);
        assert!(transient.is_repeatable());

        let permanent = BillingError::from(ProcessorError::permanent("op", "bad"));
        assert_eq!(permanent.kind(), ErrorKind::UpstreamPermanent);
        assert!(!permanent.is_repeatable());
    }

    #[test]
    fn domain_errors_are_not_repeatable() {
        let err = BillingError::DowngradeBlocked(DowngradeViolation::Feature {
            feature: "accounting".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_repeatable());
        assert_eq!(
            err.details().unwrap()["feature"],
            serde_json::json!("accounting")
        );
    }

    #[test]
    fn database_errors_are_repeatable() {
        let err = BillingError::Store(StoreError::Database("connection reset".to_string()));
        assert!(err.is_repeatable());
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn limit_violation_message_names_values() {
        let violation = DowngradeViolation::Limit {
            limit: "team_members".to_string(),
            current: 4,
            allowed: 1,
        };
        assert_eq!(
            violation.to_string(),
            "current team_members usage (4) exceeds the target plan limit (1)"
        );
    }
}
