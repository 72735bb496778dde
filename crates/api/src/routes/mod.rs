//! API routes

pub mod billing;
pub mod health;
pub mod plans;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{auth::require_auth, state::AppState};

/// Processor event payloads stay well under this
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth required) - under /api/v1
    let public_api_routes = Router::new()
        .route("/plans", get(plans::list_plans))
        .route("/plans/:descriptor", get(plans::get_plan))
        .route("/checkout/session", post(billing::create_checkout_session))
        // Signature-verified instead of token-authenticated
        .route("/webhooks/processor", post(webhooks::processor_webhook));

    // Protected API routes (auth required) - under /api/v1
    let protected_api_routes = Router::new()
        .route(
            "/subscription",
            get(billing::get_subscription)
                .post(billing::create_or_update_subscription)
                .delete(billing::cancel_subscription),
        )
        .route("/subscription/details", get(billing::subscription_details))
        .route("/subscription/resume", post(billing::resume_subscription))
        .route(
            "/subscription/proration-estimate",
            post(billing::estimate_proration),
        )
        .route(
            "/subscription/trial",
            get(billing::trial_status).post(billing::start_trial),
        )
        .route("/subscription/trial/extend", post(billing::extend_trial))
        .route("/subscription/grace-period", post(billing::set_grace_period))
        .route("/subscription/schedule-change", post(billing::schedule_change))
        .route("/payment-methods/attach", post(billing::attach_payment_method))
        .route(
            "/payment-methods/setup-intent",
            post(billing::create_setup_intent),
        )
        .route(
            "/invoices",
            get(billing::list_invoices).post(billing::create_invoice),
        )
        .route("/invoices/:invoice_id/pay", post(billing::pay_invoice))
        .route("/invoices/:invoice_id/download", get(billing::download_invoice))
        .route("/usage", get(billing::subscription_usage))
        .route("/usage/quota", get(billing::usage_quota))
        .route("/portal/session", post(billing::create_portal_session))
        .route("/tax/calculate", post(billing::calculate_tax))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
