//! Processor webhook ingress

use axum::{extract::State, http::HeaderMap, http::StatusCode};
use subsync_billing::BillingError;

use crate::{error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify and apply one processor event. Anything other than a 2xx makes the
/// processor redeliver, so handler failures surface as 500.
pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(body_len = body.len(), "Processor webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state
        .billing
        .webhooks
        .handle(&body, signature, &state.deadline())
        .await
    {
        Ok(outcome) => {
            tracing::info!(outcome = ?outcome, "Processor webhook handled");
            Ok(StatusCode::OK)
        }
        Err(BillingError::Webhook(rejection)) => {
            tracing::warn!(reason = %rejection, "Processor webhook rejected");
            Err(ApiError::BadRequest(rejection.to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "Processor webhook handling failed");
            Err(ApiError::Internal)
        }
    }
}
