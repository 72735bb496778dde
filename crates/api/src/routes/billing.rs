//! Tenant billing routes

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use subsync_billing::{
    gateway::{InvoiceRecord, ProrationMode, TaxCalculationRecord},
    CheckoutResponse, GracePeriod, InvoiceDownload, InvoiceFilter, InvoiceRequest, PortalResponse,
    ProrationEstimate, ScheduledChange, Subscription, SubscriptionDetails, TrialStatus, UsageQuota,
};
use subsync_shared::Permission;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Request to put the tenant on a plan
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_descriptor: String,
}

/// Request for the cost of switching plans
#[derive(Debug, Deserialize)]
pub struct ProrationRequest {
    pub new_plan_descriptor: String,
}

#[derive(Debug, Deserialize)]
pub struct StartTrialRequest {
    pub plan_descriptor: String,
    pub trial_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExtendTrialRequest {
    pub additional_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct GracePeriodRequest {
    pub grace_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleChangeRequest {
    pub new_plan_descriptor: String,
    /// "YYYY-MM-DD" or RFC 3339
    pub effective_date: String,
    #[serde(default)]
    pub proration_behavior: ProrationMode,
}

#[derive(Debug, Serialize)]
pub struct SetupIntentResponse {
    pub setup_intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub description: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuotaQuery {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachPaymentMethodRequest {
    pub payment_method_id: String,
}

#[derive(Debug, Serialize)]
pub struct AttachPaymentMethodResponse {
    pub payment_method_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceListQuery {
    #[serde(default)]
    pub status: InvoiceFilter,
}

/// Checkout is reachable before sign-in, so the tenant comes from the body
#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub tenant_id: Uuid,
    pub plan_descriptor: String,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePortalRequest {
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaxRequest {
    /// Amount in minor currency units
    pub amount: i64,
    pub currency: String,
}

fn required(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation {
            message: format!("{} is required", field),
            details: None,
        });
    }
    Ok(())
}

// ============================================================================
// Subscription
// ============================================================================

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require(Permission::ViewBilling)?;

    let subscription = state
        .billing
        .subscriptions
        .get_for_tenant(auth_user.tenant_id)
        .await?;
    Ok(Json(subscription))
}

pub async fn create_or_update_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require(Permission::ManageBilling)?;
    required("plan_descriptor", &req.plan_descriptor)?;

    let billing = &state.billing;
    let plan = billing.catalog.get_by_descriptor(&req.plan_descriptor).await?;
    let subscription = billing
        .subscriptions
        .create_or_update(auth_user.tenant_id, &plan, &state.deadline())
        .await?;

    tracing::info!(
        tenant_id = %auth_user.tenant_id,
        user_id = %auth_user.user_id,
        plan = %plan.descriptor,
        status = subscription.status.as_str(),
        "Subscription updated"
    );
    Ok(Json(subscription))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<StatusCode> {
    auth_user.require(Permission::ManageBilling)?;

    state
        .billing
        .subscriptions
        .cancel_immediately(auth_user.tenant_id, &state.deadline())
        .await?;

    tracing::info!(
        tenant_id = %auth_user.tenant_id,
        user_id = %auth_user.user_id,
        "Subscription canceled"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn subscription_details(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionDetails>> {
    auth_user.require(Permission::ViewBilling)?;

    let details = state
        .billing
        .subscriptions
        .subscription_details(auth_user.tenant_id, &state.deadline())
        .await?;
    Ok(Json(details))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require(Permission::ManageBilling)?;

    let subscription = state
        .billing
        .subscriptions
        .resume_if_no_due(auth_user.tenant_id, &state.deadline())
        .await?;
    Ok(Json(subscription))
}

pub async fn estimate_proration(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ProrationRequest>,
) -> ApiResult<Json<ProrationEstimate>> {
    auth_user.require(Permission::ViewBilling)?;
    required("new_plan_descriptor", &req.new_plan_descriptor)?;

    let estimate = state
        .billing
        .subscriptions
        .estimate_proration_for(auth_user.tenant_id, &req.new_plan_descriptor)
        .await?;
    Ok(Json(estimate))
}

// ============================================================================
// Trials, grace periods, and scheduled changes
// ============================================================================

pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<StartTrialRequest>,
) -> ApiResult<Json<Subscription>> {
    auth_user.require(Permission::ManageBilling)?;
    required("plan_descriptor", &req.plan_descriptor)?;

    let billing = &state.billing;
    let plan = billing.catalog.get_by_descriptor(&req.plan_descriptor).await?;
    let subscription = billing
        .subscriptions
        .start_trial(auth_user.tenant_id, &plan, req.trial_days, &state.deadline())
        .await?;

    tracing::info!(
        tenant_id = %auth_user.tenant_id,
        user_id = %auth_user.user_id,
        plan = %plan.descriptor,
        trial_days = req.trial_days,
        "Trial started"
    );
    Ok(Json(subscription))
}

pub async fn extend_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ExtendTrialRequest>,
) -> ApiResult<StatusCode> {
    auth_user.require(Permission::ManageBilling)?;

    state
        .billing
        .subscriptions
        .extend_trial(auth_user.tenant_id, req.additional_days, &state.deadline())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trial_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<TrialStatus>> {
    auth_user.require(Permission::ViewBilling)?;

    let status = state
        .billing
        .subscriptions
        .trial_status(auth_user.tenant_id, &state.deadline())
        .await?;
    Ok(Json(status))
}

pub async fn set_grace_period(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<GracePeriodRequest>,
) -> ApiResult<StatusCode> {
    auth_user.require(Permission::ManageBilling)?;

    let grace: GracePeriod = state
        .billing
        .subscriptions
        .set_grace_period(auth_user.tenant_id, req.grace_days, &state.deadline())
        .await?;

    tracing::info!(
        tenant_id = %auth_user.tenant_id,
        user_id = %auth_user.user_id,
        days = grace.days,
        "Grace period set"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn schedule_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ScheduleChangeRequest>,
) -> ApiResult<Json<ScheduledChange>> {
    auth_user.require(Permission::ManageBilling)?;
    required("new_plan_descriptor", &req.new_plan_descriptor)?;
    required("effective_date", &req.effective_date)?;

    let billing = &state.billing;
    let plan = billing.catalog.get_by_descriptor(&req.new_plan_descriptor).await?;
    let change = billing
        .subscriptions
        .schedule_change(
            auth_user.tenant_id,
            &plan,
            &req.effective_date,
            req.proration_behavior,
            &state.deadline(),
        )
        .await?;
    Ok(Json(change))
}

// ============================================================================
// Payment methods and invoices
// ============================================================================

pub async fn create_setup_intent(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SetupIntentResponse>> {
    auth_user.require(Permission::ManageBilling)?;

    let intent = state
        .billing
        .customers
        .create_setup_intent(auth_user.tenant_id, &state.deadline())
        .await?;
    let client_secret = intent.client_secret.ok_or(ApiError::Internal)?;

    Ok(Json(SetupIntentResponse {
        setup_intent_id: intent.id,
        client_secret,
    }))
}

pub async fn attach_payment_method(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AttachPaymentMethodRequest>,
) -> ApiResult<Json<AttachPaymentMethodResponse>> {
    auth_user.require(Permission::ManageBilling)?;

    state
        .billing
        .customers
        .attach_payment_method(auth_user.tenant_id, &req.payment_method_id, &state.deadline())
        .await?;

    Ok(Json(AttachPaymentMethodResponse {
        payment_method_id: req.payment_method_id,
    }))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvoiceListQuery>,
) -> ApiResult<Json<Vec<InvoiceRecord>>> {
    auth_user.require(Permission::ViewBilling)?;

    let invoices = state
        .billing
        .invoices
        .list_invoices(auth_user.tenant_id, query.status, &state.deadline())
        .await?;
    Ok(Json(invoices))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateInvoiceRequest>,
) -> ApiResult<Json<InvoiceRecord>> {
    auth_user.require(Permission::ManageBilling)?;
    required("description", &req.description)?;
    required("currency", &req.currency)?;

    let request = InvoiceRequest {
        description: req.description,
        amount: req.amount,
        currency: req.currency,
        due_date: req.due_date,
    };
    let invoice = state
        .billing
        .invoices
        .create_invoice(auth_user.tenant_id, &request, &state.deadline())
        .await?;

    tracing::info!(
        tenant_id = %auth_user.tenant_id,
        invoice_id = %invoice.id,
        amount_due = invoice.amount_due,
        "Invoice created"
    );
    Ok(Json(invoice))
}

pub async fn download_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<String>,
) -> ApiResult<Json<InvoiceDownload>> {
    auth_user.require(Permission::ViewBilling)?;

    let download = state
        .billing
        .invoices
        .download_url(auth_user.tenant_id, &invoice_id, &state.deadline())
        .await?;
    Ok(Json(download))
}

pub async fn pay_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<String>,
) -> ApiResult<StatusCode> {
    auth_user.require(Permission::ManageBilling)?;

    let invoice = state
        .billing
        .invoices
        .pay_invoice(auth_user.tenant_id, &invoice_id, &state.deadline())
        .await?;

    tracing::info!(
        tenant_id = %auth_user.tenant_id,
        invoice_id = %invoice.id,
        amount_paid = invoice.amount_paid,
        "Invoice paid"
    );
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Usage
// ============================================================================

pub async fn subscription_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<UsageQuota>>> {
    auth_user.require(Permission::ViewBilling)?;

    let usage = state
        .billing
        .entitlements
        .subscription_usage(auth_user.tenant_id)
        .await?;
    Ok(Json(usage))
}

pub async fn usage_quota(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<UsageQuotaQuery>,
) -> ApiResult<Json<UsageQuota>> {
    auth_user.require(Permission::ViewBilling)?;
    required("type", &query.kind)?;

    let quota = state
        .billing
        .entitlements
        .usage_quota(auth_user.tenant_id, &query.kind)
        .await?;
    Ok(Json(quota))
}

// ============================================================================
// Hosted sessions and tax
// ============================================================================

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    required("plan_descriptor", &req.plan_descriptor)?;

    let billing = &state.billing;
    let plan = billing.catalog.get_by_descriptor(&req.plan_descriptor).await?;
    let session = billing
        .checkout
        .create_session(
            req.tenant_id,
            plan.id,
            req.success_url,
            req.cancel_url,
            &state.deadline(),
        )
        .await?;

    tracing::info!(
        tenant_id = %req.tenant_id,
        plan = %plan.descriptor,
        session_id = %session.id,
        "Created checkout session"
    );
    Ok(Json(session.into()))
}

pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    req: Option<Json<CreatePortalRequest>>,
) -> ApiResult<Json<PortalResponse>> {
    auth_user.require(Permission::ManageBilling)?;

    let return_url = req.and_then(|Json(body)| body.return_url);
    let session = state
        .billing
        .portal
        .create_session(auth_user.tenant_id, return_url, &state.deadline())
        .await?;
    Ok(Json(session.into()))
}

pub async fn calculate_tax(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<TaxRequest>,
) -> ApiResult<Json<TaxCalculationRecord>> {
    auth_user.require(Permission::ViewBilling)?;

    let calculation = state
        .billing
        .tax
        .calculate(auth_user.tenant_id, req.amount, &req.currency, &state.deadline())
        .await?;
    Ok(Json(calculation))
}
