//! Stripe client configuration

use serde_json::Value;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for the Stripe integration.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Create config from environment variables.
    ///
    /// Returns `Err` when Stripe is not configured. Callers branch on the
    /// result once at startup and run with local gating only, rather than
    /// probing for the processor at individual call sites.
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
        })
    }
}

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Stripe billing client.
///
/// Wraps the SDK client plus a plain HTTP client for the endpoints the
/// SDK's pinned API version does not expose (billing meter events,
/// embedded checkout sessions).
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self {
            client,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner SDK client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// POST a form-encoded request straight to the Stripe REST API.
    pub(crate) async fn form_post(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<Value> {
        let url = format!("{STRIPE_API_BASE}{path}");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| BillingError::StripeApi(format!("invalid response from {path}: {e}")))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(BillingError::StripeApi(format!(
                "{path} returned {status}: {message}"
            )));
        }

        Ok(body)
    }

    /// Send a billing meter event (counter increment) for a customer.
    ///
    /// The `identifier` field makes redelivered sends idempotent on
    /// Stripe's side.
    pub async fn send_meter_event(
        &self,
        event_name: &str,
        customer_id: &str,
        value: i64,
    ) -> BillingResult<()> {
        let form = vec![
            ("event_name".to_string(), event_name.to_string()),
            ("identifier".to_string(), uuid::Uuid::new_v4().to_string()),
            (
                "payload[stripe_customer_id]".to_string(),
                customer_id.to_string(),
            ),
            ("payload[value]".to_string(), value.to_string()),
        ];
        self.form_post("/v1/billing/meter_events", &form)
            .await
            .map_err(|e| BillingError::RemoteForward(e.to_string()))?;
        Ok(())
    }
}
