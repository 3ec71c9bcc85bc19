//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Handle Stripe webhook deliveries.
///
/// The body stays a raw `String`: signature verification runs over the
/// exact bytes Stripe signed, before any parsing or business logic.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let webhooks = state
        .billing
        .webhooks
        .as_ref()
        .ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook missing stripe-signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = webhooks
        .verify_event(body.as_bytes(), signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    webhooks
        .handle_event(&event)
        .await
        .map_err(|e| ApiError::Internal(format!("Webhook handling error: {e}")))?;

    Ok(Json(json!({ "received": true })))
}
