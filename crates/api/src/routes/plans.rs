//! Public plan catalog routes

use axum::{
    extract::{Path, State},
    Json,
};
use subsync_billing::Plan;

use crate::{error::ApiResult, state::AppState};

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    let plans = state.billing.catalog.list_plans().await?;
    Ok(Json(plans))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(descriptor): Path<String>,
) -> ApiResult<Json<Plan>> {
    let plan = state.billing.catalog.get_by_descriptor(&descriptor).await?;
    Ok(Json(plan))
}
