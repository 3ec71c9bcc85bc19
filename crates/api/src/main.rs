//! Corral API server

use std::sync::Arc;

use corral_api::{Config, PgUserStore};
use corral_billing::{store, BillingService, StripeClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let billing_config = Arc::new(config.load_billing_config()?);

    let pool = corral_shared::db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    if config.auto_migrate {
        store::ensure_schema(&pool).await?;
        store::snapshot_plan_limits(&pool, &billing_config).await?;
    }

    let stripe = match StripeClient::from_env() {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "Stripe not configured, running with local gating only");
            None
        }
    };

    let users = Arc::new(PgUserStore::new(pool.clone()));
    let billing = Arc::new(BillingService::new(
        pool.clone(),
        billing_config,
        stripe,
        users,
    ));

    let state = corral_api::AppState { pool, billing };
    let app = corral_api::routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
