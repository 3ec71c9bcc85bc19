//! Stripe Checkout sessions

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionDiscounts,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Metadata keys echoed back inside subscription-lifecycle events. The
/// webhook reconciler reads these exact keys; rename both sides together.
pub const METADATA_USER_ID: &str = "userId";
pub const METADATA_PLAN_ID: &str = "planId";

/// Inputs for a subscription checkout session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutParams {
    pub user_id: String,
    pub user_email: String,
    pub price_id: String,
    pub plan_id: String,
    pub success_url: String,
    pub cancel_url: String,
    #[serde(default)]
    pub trial_days: Option<u32>,
    #[serde(default)]
    pub coupon: Option<String>,
}

impl CheckoutParams {
    /// Metadata attached to both the session and the subscription it
    /// creates, so every later lifecycle event can be traced back to the
    /// local user and plan.
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), self.user_id.clone());
        metadata.insert(METADATA_PLAN_ID.to_string(), self.plan_id.clone());
        metadata
    }
}

/// Response for creating a checkout session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    /// Redirect URL (redirect-based checkout).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Client secret (embedded checkout).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a redirect-based subscription checkout session.
    pub async fn create_session(&self, params: &CheckoutParams) -> BillingResult<CheckoutResponse> {
        let metadata = params.metadata();

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(params.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }];

        let subscription_data = CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            trial_period_days: params.trial_days,
            ..Default::default()
        };

        let discounts = params.coupon.as_ref().map(|coupon| {
            vec![CreateCheckoutSessionDiscounts {
                coupon: Some(coupon.clone()),
                ..Default::default()
            }]
        });

        let create = CreateCheckoutSession {
            customer_email: Some(&params.user_email),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&params.success_url),
            cancel_url: Some(&params.cancel_url),
            metadata: Some(metadata),
            subscription_data: Some(subscription_data),
            // Promotion codes and an explicit coupon are mutually exclusive.
            allow_promotion_codes: if params.coupon.is_some() {
                None
            } else {
                Some(true)
            },
            discounts,
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), create).await?;

        tracing::info!(
            user_id = %params.user_id,
            plan_id = %params.plan_id,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url: session.url,
            client_secret: None,
        })
    }

    /// Create an embedded checkout session, returning the client secret
    /// the frontend mounts. Goes through the REST fallback because the
    /// SDK's pinned API version predates `ui_mode`.
    pub async fn create_embedded_session(
        &self,
        params: &CheckoutParams,
        return_url: &str,
    ) -> BillingResult<CheckoutResponse> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("ui_mode".to_string(), "embedded".to_string()),
            ("return_url".to_string(), return_url.to_string()),
            ("customer_email".to_string(), params.user_email.clone()),
            ("line_items[0][price]".to_string(), params.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];
        for (key, value) in params.metadata() {
            form.push((format!("metadata[{key}]"), value.clone()));
            form.push((format!("subscription_data[metadata][{key}]"), value));
        }
        if let Some(days) = params.trial_days {
            form.push((
                "subscription_data[trial_period_days]".to_string(),
                days.to_string(),
            ));
        }
        if let Some(coupon) = &params.coupon {
            form.push(("discounts[0][coupon]".to_string(), coupon.clone()));
        }

        let body = self.stripe.form_post("/v1/checkout/sessions", &form).await?;

        let session_id = body["id"]
            .as_str()
            .ok_or_else(|| BillingError::StripeApi("checkout session missing id".to_string()))?
            .to_string();
        let client_secret = body["client_secret"].as_str().map(str::to_string);

        tracing::info!(
            user_id = %params.user_id,
            plan_id = %params.plan_id,
            session_id = %session_id,
            "Created embedded checkout session"
        );

        Ok(CheckoutResponse {
            session_id,
            url: None,
            client_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CheckoutParams {
        CheckoutParams {
            user_id: "u1".to_string(),
            user_email: "ada@example.com".to_string(),
            price_id: "price_123".to_string(),
            plan_id: "pro".to_string(),
            success_url: "https://app.example.com/billing/success".to_string(),
            cancel_url: "https://app.example.com/billing/cancel".to_string(),
            trial_days: None,
            coupon: None,
        }
    }

    #[test]
    fn metadata_carries_the_reconciler_contract() {
        let metadata = params().metadata();
        assert_eq!(metadata.get(METADATA_USER_ID).map(String::as_str), Some("u1"));
        assert_eq!(metadata.get(METADATA_PLAN_ID).map(String::as_str), Some("pro"));
        assert_eq!(metadata.len(), 2);
    }
}
