//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use subsync_billing::{BillingError, ErrorKind};

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict {
        message: String,
        details: Option<Value>,
    },

    // Plan enforcement
    #[error("{message}")]
    PlanRestricted {
        message: String,
        details: Option<Value>,
    },

    // Payment processor
    #[error("Payment processor unavailable")]
    ProcessorUnavailable,
    #[error("Payment processor rejected the request: {0}")]
    ProcessorRejected(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidToken | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden | ApiError::PlanRestricted { .. } => StatusCode::FORBIDDEN,
            ApiError::Validation { .. } | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::ProcessorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ProcessorRejected(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidToken => "INVALID_TOKEN",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::Validation { .. } => "VALIDATION_ERROR",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict { .. } => "CONFLICT",
            ApiError::PlanRestricted { .. } => "PLAN_RESTRICTED",
            ApiError::ProcessorUnavailable => "PROCESSOR_UNAVAILABLE",
            ApiError::ProcessorRejected(_) => "PROCESSOR_ERROR",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }

    fn details(&self) -> Option<&Value> {
        match self {
            ApiError::Validation { details, .. }
            | ApiError::Conflict { details, .. }
            | ApiError::PlanRestricted { details, .. } => details.as_ref(),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            error["details"] = details.clone();
        }

        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        let details = err.details();
        match err.kind() {
            ErrorKind::Validation => ApiError::Validation {
                message: err.to_string(),
                details,
            },
            ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
            ErrorKind::Forbidden => ApiError::PlanRestricted {
                message: err.to_string(),
                details,
            },
            ErrorKind::Conflict => ApiError::Conflict {
                message: err.to_string(),
                details,
            },
            ErrorKind::UpstreamTransient => {
                tracing::warn!(error = %err, "Processor unavailable after retries");
                ApiError::ProcessorUnavailable
            }
            ErrorKind::UpstreamPermanent => {
                tracing::warn!(error = %err, "Processor rejected request");
                ApiError::ProcessorRejected(err.to_string())
            }
            ErrorKind::WebhookMalformed => ApiError::BadRequest(err.to_string()),
            ErrorKind::Internal => {
                tracing::error!(error = %err, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
