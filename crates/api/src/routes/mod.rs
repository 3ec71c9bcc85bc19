//! API routes

pub mod usage;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

async fn health() -> &'static str {
    "ok"
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/usage/check", post(usage::check_usage))
        .route("/api/usage/record", post(usage::record_usage))
        .route("/webhook/stripe", post(webhook::stripe_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
