// Billing crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Corral usage metering and billing synchronization
//!
//! ## Components
//!
//! - **Usage gate / recorder** (`usage`): period-bucketed limit checks and
//!   append-only usage recording, with best-effort forwarding to Stripe
//!   billing meters.
//! - **Catalog synchronizer** (`catalog`): pushes local plan definitions
//!   into the remote product/price catalog, converging to a fixed point.
//! - **Webhook reconciler** (`webhooks`): verifies deliveries and applies
//!   subscription-lifecycle events to local plan state.
//! - **Checkout** (`checkout`): builds subscription checkout sessions
//!   carrying the `{userId, planId}` metadata contract.
//! - **Store bootstrap** (`store`): idempotent usage-schema creation and
//!   plan-limit snapshots.

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod error;
pub mod period;
pub mod store;
pub mod usage;
pub mod users;
pub mod webhooks;

// Catalog
pub use catalog::{CatalogApi, CatalogSynchronizer, PlanSyncResult, SyncAction};

// Checkout
pub use checkout::{CheckoutParams, CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Usage
pub use usage::{GateResult, UsageMeter};

// Users
pub use users::UserStore;

// Webhooks
pub use webhooks::{PlanReconciler, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

use corral_shared::types::BillingConfig;

/// Aggregate of the billing services an application wires at startup.
///
/// The usage meter is always available since gating is local; services
/// that talk to Stripe exist only when the processor is configured.
pub struct BillingService {
    pub usage: UsageMeter,
    pub checkout: Option<CheckoutService>,
    pub webhooks: Option<WebhookHandler>,
}

impl BillingService {
    pub fn new(
        pool: PgPool,
        config: Arc<BillingConfig>,
        stripe: Option<StripeClient>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        let usage = UsageMeter::new(pool.clone(), config.clone(), stripe.clone(), users.clone());

        let (checkout, webhooks) = match stripe {
            Some(stripe) => {
                let webhook_secret = stripe.config().webhook_secret.clone();
                let reconciler = PlanReconciler::new(config, users);
                (
                    Some(CheckoutService::new(stripe)),
                    Some(WebhookHandler::new(webhook_secret, reconciler, pool)),
                )
            }
            None => (None, None),
        };

        Self {
            usage,
            checkout,
            webhooks,
        }
    }
}
