//! Stripe webhook verification and reconciliation.
//!
//! Signature verification is the only hard-fail path. Business-logic
//! failures are soft: they log and the event is still acknowledged,
//! because Stripe only redelivers on non-2xx and an already-actioned
//! event must not be blocked from acknowledgment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;

use corral_shared::types::BillingConfig;

use crate::error::{BillingError, BillingResult};
use crate::users::UserStore;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated skew between Stripe's signature timestamp and our clock.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `stripe-signature` header against the exact request bytes.
///
/// The header carries `t=<unix>,v1=<hex hmac>`; the MAC covers
/// `"{t}.{payload}"` with the endpoint's signing secret. Deterministic in
/// `now_unix` so tests can travel in time.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::SignatureInvalid);
    }

    Ok(())
}

fn event_object(event: &Value) -> &Value {
    &event["data"]["object"]
}

fn metadata_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj["metadata"][key].as_str().filter(|s| !s.is_empty())
}

/// Applies subscription-lifecycle events to local plan state.
///
/// Every mutation goes through the injected [`UserStore`]; the reconciler
/// has no direct access to user rows. Events arrive as raw JSON and are
/// read with targeted lookups rather than full SDK structs; payload
/// shapes vary by API version and only a handful of fields matter here.
pub struct PlanReconciler {
    config: Arc<BillingConfig>,
    /// Static remote-price-id -> plan-id map, built once at construction
    /// from the synced plan definitions.
    price_to_plan: HashMap<String, String>,
    users: Arc<dyn UserStore>,
}

impl PlanReconciler {
    pub fn new(config: Arc<BillingConfig>, users: Arc<dyn UserStore>) -> Self {
        let price_to_plan = config.price_to_plan();
        Self {
            config,
            price_to_plan,
            users,
        }
    }

    /// Dispatch one verified event.
    ///
    /// Resolution misses (no user, unmapped price, absent metadata) log
    /// and return `Ok` so the delivery is acknowledged; store failures
    /// propagate as errors so the processor redelivers.
    pub async fn apply(&self, event: &Value) -> BillingResult<()> {
        let event_type = event["type"].as_str().unwrap_or("");
        let obj = event_object(event);

        match event_type {
            "checkout.session.completed" => self.checkout_completed(obj).await,
            "customer.subscription.updated" => self.subscription_updated(obj).await,
            "customer.subscription.deleted" => self.subscription_deleted(obj).await,
            "invoice.payment_failed" => self.invoice_payment_failed(obj).await,
            "customer.subscription.trial_will_end" => {
                tracing::info!(
                    subscription_id = obj["id"].as_str().unwrap_or("unknown"),
                    trial_end = obj["trial_end"].as_i64(),
                    "Trial ending soon"
                );
                Ok(())
            }
            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type, acknowledging");
                Ok(())
            }
        }
    }

    async fn checkout_completed(&self, session: &Value) -> BillingResult<()> {
        let user_id = match self
            .resolve_user(
                metadata_str(session, "userId"),
                session["customer_details"]["email"].as_str(),
            )
            .await?
        {
            Some(id) => id,
            None => {
                tracing::warn!("Checkout completed without a resolvable user, skipping");
                return Ok(());
            }
        };

        // Never guess a plan from the price at this stage; metadata is the
        // contract with the checkout builder.
        let Some(plan_id) = metadata_str(session, "planId") else {
            tracing::warn!(
                user_id = %user_id,
                "Checkout completed without planId metadata, skipping"
            );
            return Ok(());
        };

        self.users.set_plan(&user_id, plan_id).await?;
        tracing::info!(user_id = %user_id, plan_id = %plan_id, "Plan set from checkout");

        if let Some(customer_id) = session["customer"].as_str() {
            if let Err(e) = self.users.set_stripe_customer(&user_id, customer_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to link Stripe customer");
            }
        }

        Ok(())
    }

    async fn subscription_updated(&self, subscription: &Value) -> BillingResult<()> {
        let Some(user_id) = metadata_str(subscription, "userId") else {
            tracing::warn!("Subscription update without userId metadata, skipping");
            return Ok(());
        };

        let plan_id = subscription["items"]["data"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|item| item["price"]["id"].as_str())
            .find_map(|price_id| self.price_to_plan.get(price_id));

        let Some(plan_id) = plan_id else {
            tracing::warn!(
                user_id = %user_id,
                "Subscription price id not mapped to a local plan, skipping"
            );
            return Ok(());
        };

        self.users.set_plan(user_id, plan_id).await?;
        tracing::info!(user_id = %user_id, plan_id = %plan_id, "Plan set from subscription update");
        Ok(())
    }

    async fn subscription_deleted(&self, subscription: &Value) -> BillingResult<()> {
        let Some(user_id) = metadata_str(subscription, "userId") else {
            tracing::warn!("Subscription deleted without userId metadata, skipping");
            return Ok(());
        };

        let baseline = &self.config.baseline_plan;
        self.users.set_plan(user_id, baseline).await?;
        tracing::info!(
            user_id = %user_id,
            plan_id = %baseline,
            "Downgraded after subscription deletion"
        );
        Ok(())
    }

    async fn invoice_payment_failed(&self, invoice: &Value) -> BillingResult<()> {
        let metadata_user = invoice["subscription_details"]["metadata"]["userId"]
            .as_str()
            .filter(|s| !s.is_empty());

        let user_id = match self
            .resolve_user(metadata_user, invoice["customer_email"].as_str())
            .await?
        {
            Some(id) => id,
            None => {
                tracing::warn!("Payment-failed invoice without a resolvable user, skipping");
                return Ok(());
            }
        };

        self.users.set_flag(&user_id, "paymentFailed", true).await?;
        tracing::warn!(user_id = %user_id, "Marked payment failed");
        Ok(())
    }

    /// Metadata first, customer email second.
    async fn resolve_user(
        &self,
        metadata_user: Option<&str>,
        email: Option<&str>,
    ) -> BillingResult<Option<String>> {
        if let Some(id) = metadata_user {
            return Ok(Some(id.to_string()));
        }
        let Some(email) = email else {
            return Ok(None);
        };
        Ok(self.users.find_by_email(email).await?)
    }
}

/// Verifies, deduplicates, and processes webhook deliveries.
pub struct WebhookHandler {
    webhook_secret: String,
    reconciler: PlanReconciler,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(webhook_secret: String, reconciler: PlanReconciler, pool: PgPool) -> Self {
        Self {
            webhook_secret,
            reconciler,
            pool,
        }
    }

    /// Verify the signature over the exact request bytes and parse the
    /// event. Verification precedes any business logic.
    pub fn verify_event(&self, payload: &[u8], signature_header: &str) -> BillingResult<Value> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| BillingError::SignatureInvalid)?
            .as_secs() as i64;
        verify_signature(payload, signature_header, &self.webhook_secret, now)?;

        serde_json::from_slice(payload).map_err(|e| {
            tracing::error!(error = %e, "Verified webhook payload is not valid JSON");
            BillingError::InvalidInput("webhook payload is not valid JSON".to_string())
        })
    }

    /// Process a verified event, deduplicating by event id.
    pub async fn handle_event(&self, event: &Value) -> BillingResult<()> {
        let event_id = event["id"].as_str().unwrap_or("").to_string();
        let event_type = event["type"].as_str().unwrap_or("unknown").to_string();

        let claimed = if event_id.is_empty() {
            // Nothing to deduplicate on.
            true
        } else {
            match self.claim_event(&event_id, &event_type).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Event ledger unavailable, processing at-least-once"
                    );
                    true
                }
            }
        };

        if !claimed {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, acknowledging"
            );
            return Ok(());
        }

        tracing::info!(event_id = %event_id, event_type = %event_type, "Processing webhook event");
        let result = self.reconciler.apply(event).await;

        if !event_id.is_empty() {
            let (outcome, message) = match &result {
                Ok(()) => ("success", None),
                Err(e) => ("error", Some(e.to_string())),
            };
            if let Err(e) = sqlx::query(
                r#"
                UPDATE stripe_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE stripe_event_id = $3
                "#,
            )
            .bind(outcome)
            .bind(&message)
            .bind(&event_id)
            .execute(&self.pool)
            .await
            {
                tracing::error!(event_id = %event_id, error = %e, "Failed to record webhook outcome");
            }
        }

        result
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// The insert wins for fresh ids; redeliveries of an event whose
    /// previous attempt errored may be re-claimed. Successfully processed
    /// ids are never claimed again.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events (stripe_event_id, event_type, processing_result)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (stripe_event_id) DO UPDATE
                SET processing_result = 'processing', error_message = NULL
                WHERE stripe_webhook_events.processing_result = 'error'
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_shared::types::{BillingInterval, PlanConfig};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockUserStore {
        plan_calls: Mutex<Vec<(String, String)>>,
        flag_calls: Mutex<Vec<(String, String, bool)>>,
        customer_links: Mutex<Vec<(String, String)>>,
        users_by_email: Mutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl UserStore for MockUserStore {
        async fn set_plan(&self, user_id: &str, plan_id: &str) -> anyhow::Result<()> {
            self.plan_calls
                .lock()
                .unwrap()
                .push((user_id.to_string(), plan_id.to_string()));
            Ok(())
        }

        async fn set_flag(&self, user_id: &str, key: &str, value: bool) -> anyhow::Result<()> {
            self.flag_calls
                .lock()
                .unwrap()
                .push((user_id.to_string(), key.to_string(), value));
            Ok(())
        }

        async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<String>> {
            Ok(self.users_by_email.lock().unwrap().get(email).cloned())
        }

        async fn stripe_customer_id(&self, _user_id: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn set_stripe_customer(
            &self,
            user_id: &str,
            customer_id: &str,
        ) -> anyhow::Result<()> {
            self.customer_links
                .lock()
                .unwrap()
                .push((user_id.to_string(), customer_id.to_string()));
            Ok(())
        }
    }

    fn test_config() -> Arc<BillingConfig> {
        Arc::new(BillingConfig {
            plans: vec![
                PlanConfig {
                    id: "free".to_string(),
                    display_name: "Free".to_string(),
                    price: 0.0,
                    billing_interval: BillingInterval::Month,
                    remote_price_id: None,
                },
                PlanConfig {
                    id: "pro".to_string(),
                    display_name: "Pro".to_string(),
                    price: 29.0,
                    billing_interval: BillingInterval::Month,
                    remote_price_id: Some("price_pro".to_string()),
                },
            ],
            meters: HashMap::new(),
            baseline_plan: "free".to_string(),
            upgrade_url: "/pricing".to_string(),
        })
    }

    fn reconciler(users: Arc<MockUserStore>) -> PlanReconciler {
        PlanReconciler::new(test_config(), users)
    }

    #[tokio::test]
    async fn checkout_completed_sets_plan_exactly_once() {
        let users = Arc::new(MockUserStore::default());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "customer": "cus_9",
                "metadata": {"userId": "u1", "planId": "pro"}
            }}
        });

        r.apply(&event).await.unwrap();

        let plans = users.plan_calls.lock().unwrap();
        assert_eq!(*plans, [("u1".to_string(), "pro".to_string())]);
        let links = users.customer_links.lock().unwrap();
        assert_eq!(*links, [("u1".to_string(), "cus_9".to_string())]);
    }

    #[tokio::test]
    async fn checkout_without_plan_id_mutates_nothing() {
        let users = Arc::new(MockUserStore::default());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_2",
                "metadata": {"userId": "u1"}
            }}
        });

        r.apply(&event).await.unwrap();
        assert!(users.plan_calls.lock().unwrap().is_empty());
        assert!(users.flag_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkout_falls_back_to_email_lookup() {
        let users = Arc::new(MockUserStore::default());
        users
            .users_by_email
            .lock()
            .unwrap()
            .insert("ada@example.com".to_string(), "u7".to_string());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_3",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_3",
                "customer_details": {"email": "ada@example.com"},
                "metadata": {"planId": "pro"}
            }}
        });

        r.apply(&event).await.unwrap();
        let plans = users.plan_calls.lock().unwrap();
        assert_eq!(*plans, [("u7".to_string(), "pro".to_string())]);
    }

    #[tokio::test]
    async fn subscription_update_maps_price_to_plan() {
        let users = Arc::new(MockUserStore::default());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_4",
            "type": "customer.subscription.updated",
            "data": {"object": {
                "id": "sub_1",
                "metadata": {"userId": "u1"},
                "items": {"data": [{"price": {"id": "price_pro"}}]}
            }}
        });

        r.apply(&event).await.unwrap();
        let plans = users.plan_calls.lock().unwrap();
        assert_eq!(*plans, [("u1".to_string(), "pro".to_string())]);
    }

    #[tokio::test]
    async fn unmapped_price_id_is_a_no_op() {
        let users = Arc::new(MockUserStore::default());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_5",
            "type": "customer.subscription.updated",
            "data": {"object": {
                "id": "sub_2",
                "metadata": {"userId": "u1"},
                "items": {"data": [{"price": {"id": "price_someone_elses"}}]}
            }}
        });

        r.apply(&event).await.unwrap();
        assert!(users.plan_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_deletion_downgrades_to_baseline() {
        let users = Arc::new(MockUserStore::default());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_6",
            "type": "customer.subscription.deleted",
            "data": {"object": {
                "id": "sub_3",
                "metadata": {"userId": "u1"}
            }}
        });

        r.apply(&event).await.unwrap();
        let plans = users.plan_calls.lock().unwrap();
        assert_eq!(*plans, [("u1".to_string(), "free".to_string())]);
    }

    #[tokio::test]
    async fn payment_failure_sets_flag_without_touching_plan() {
        let users = Arc::new(MockUserStore::default());
        users
            .users_by_email
            .lock()
            .unwrap()
            .insert("ada@example.com".to_string(), "u7".to_string());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_7",
            "type": "invoice.payment_failed",
            "data": {"object": {
                "id": "in_1",
                "customer_email": "ada@example.com"
            }}
        });

        r.apply(&event).await.unwrap();
        assert!(users.plan_calls.lock().unwrap().is_empty());
        let flags = users.flag_calls.lock().unwrap();
        assert_eq!(*flags, [("u7".to_string(), "paymentFailed".to_string(), true)]);
    }

    #[tokio::test]
    async fn unrecognized_event_is_acknowledged() {
        let users = Arc::new(MockUserStore::default());
        let r = reconciler(users.clone());

        let event = json!({
            "id": "evt_8",
            "type": "customer.created",
            "data": {"object": {"id": "cus_1"}}
        });

        assert!(r.apply(&event).await.is_ok());
        assert!(users.plan_calls.lock().unwrap().is_empty());
        assert!(users.flag_calls.lock().unwrap().is_empty());
    }

    // ---- signature verification ----

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(payload, SECRET, NOW);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(payload, "whsec_other", NOW);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(payload, SECRET, NOW);
        let tampered = br#"{"type":"checkout.session.completed","extra":true}"#;
        assert!(verify_signature(tampered, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = br#"{}"#;
        let header = sign(payload, SECRET, NOW - 600);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let payload = br#"{}"#;
        assert!(verify_signature(payload, "garbage", SECRET, NOW).is_err());
        assert!(verify_signature(payload, "", SECRET, NOW).is_err());
        assert!(verify_signature(payload, "t=123", SECRET, NOW).is_err());
        assert!(verify_signature(payload, "v1=deadbeef", SECRET, NOW).is_err());
    }
}
