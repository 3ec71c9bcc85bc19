//! Injected user-store interface.
//!
//! The engine never touches the application's user rows directly: every
//! plan or flag mutation and every user lookup goes through this trait.
//! The API crate provides the Postgres implementation; tests substitute
//! an in-memory one.

use async_trait::async_trait;

/// User mutations and lookups the billing engine needs.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Assign a plan to a user.
    async fn set_plan(&self, user_id: &str, plan_id: &str) -> anyhow::Result<()>;

    /// Set a non-blocking boolean flag on a user (e.g. `paymentFailed`).
    async fn set_flag(&self, user_id: &str, key: &str, value: bool) -> anyhow::Result<()>;

    /// Resolve a user id by email. Used when event metadata is absent.
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<String>>;

    /// The user's Stripe customer id, if one has been linked.
    async fn stripe_customer_id(&self, user_id: &str) -> anyhow::Result<Option<String>>;

    /// Link a Stripe customer id to a user.
    async fn set_stripe_customer(&self, user_id: &str, customer_id: &str) -> anyhow::Result<()>;
}
