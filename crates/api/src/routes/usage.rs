//! Usage gate and recorder API routes

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use corral_billing::GateResult;

use crate::{error::ApiResult, state::AppState};

fn default_quantity() -> i64 {
    1
}

fn default_plan() -> String {
    "free".to_string()
}

/// Request body for a gate check
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUsageRequest {
    pub user_id: String,
    pub meter: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default = "default_plan")]
    pub plan: String,
}

/// Request body for recording usage
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUsageRequest {
    pub user_id: String,
    pub meter: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RecordUsageResponse {
    pub ok: bool,
}

/// Check whether an action may proceed under current usage. Consumes
/// nothing; recording is a separate call.
pub async fn check_usage(
    State(state): State<AppState>,
    Json(req): Json<CheckUsageRequest>,
) -> ApiResult<Json<GateResult>> {
    let result = state
        .billing
        .usage
        .check_usage(&req.user_id, &req.meter, req.quantity, &req.plan)
        .await?;
    Ok(Json(result))
}

/// Append consumed usage. Callers gate first when enforcement matters.
pub async fn record_usage(
    State(state): State<AppState>,
    Json(req): Json<RecordUsageRequest>,
) -> ApiResult<Json<RecordUsageResponse>> {
    state
        .billing
        .usage
        .record_usage(&req.user_id, &req.meter, req.quantity, req.metadata)
        .await?;
    Ok(Json(RecordUsageResponse { ok: true }))
}
