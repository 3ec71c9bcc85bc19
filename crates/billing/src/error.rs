//! Billing error types

use thiserror::Error;

/// Errors produced by the metering and synchronization engine.
#[derive(Debug, Error)]
pub enum BillingError {
    /// A gate or recorder call named a meter that is not configured.
    /// Always surfaced to the caller.
    #[error("unknown meter: {0}")]
    UnknownMeter(String),

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Catalog synchronization failure for one plan. Captured into that
    /// plan's result entry; never aborts the batch.
    #[error("remote catalog error for plan {plan_id}: {message}")]
    RemoteCatalog { plan_id: String, message: String },

    /// Best-effort meter-event forwarding failed. Logged and swallowed by
    /// the recorder; the local write has already committed.
    #[error("remote meter-event forward failed: {0}")]
    RemoteForward(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("user store error: {0}")]
    UserStore(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for BillingError {
    fn from(err: anyhow::Error) -> Self {
        BillingError::UserStore(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
