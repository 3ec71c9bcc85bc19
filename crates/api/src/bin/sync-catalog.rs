//! Catalog synchronization tool
//!
//! Pushes local plan definitions to the Stripe catalog and writes the
//! resolved price ids back into the definitions file.
//!
//! Usage:
//!   cargo run --bin sync-catalog -- [path/to/billing.json]
//!   cargo run --bin sync-catalog -- billing.json --dry-run
//!
//! Environment:
//!   STRIPE_SECRET_KEY, STRIPE_WEBHOOK_SECRET

use corral_billing::{CatalogSynchronizer, StripeClient};
use corral_shared::types::BillingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let path = args
        .iter()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "billing.json".to_string());

    let raw = std::fs::read_to_string(&path)?;
    let mut config: BillingConfig = serde_json::from_str(&raw)?;

    if dry_run {
        println!("Dry run: listing paid plans, no remote calls\n");
        for plan in config.plans.iter().filter(|p| !p.is_free()) {
            println!(
                "  {}  \"{}\"  {} minor units  price id: {}",
                plan.id,
                plan.display_name,
                plan.price_minor_units(),
                plan.remote_price_id.as_deref().unwrap_or("unset"),
            );
        }
        return Ok(());
    }

    let stripe = StripeClient::from_env()?;
    let synchronizer = CatalogSynchronizer::with_stripe(stripe);

    println!("Synchronizing {} plan(s) from {path}\n", config.plans.len());
    let results = synchronizer.sync(&mut config.plans).await;

    for result in &results {
        match &result.error {
            Some(error) => println!("  {}  {}  ({error})", result.plan_id, result.action),
            None => println!(
                "  {}  {}  {}",
                result.plan_id,
                result.action,
                result.remote_price_id.as_deref().unwrap_or("-"),
            ),
        }
    }

    std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
    println!("\nUpdated {path}");

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{failed} plan(s) failed to sync");
    }
    Ok(())
}
