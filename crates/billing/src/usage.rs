//! Usage metering: the request-time gate and the append-only recorder.
//!
//! The gate is read-only and never consumes quota. Recording is a separate
//! unconditional append, so callers can batch-check before a long-running
//! operation and record incrementally afterward. The local store is the
//! source of truth for enforcement; forwarding to Stripe is best-effort.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use corral_shared::types::{BillingConfig, MeterConfig, MeterKind};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::period::{period_key, reset_at};
use crate::users::UserStore;

/// Outcome of a gate check. Not persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub allowed: bool,
    pub current: i64,
    pub limit: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
    pub upgrade_url: String,
    /// Copy of the meter configuration, for caller convenience.
    pub meter: MeterConfig,
}

/// Pure decision rule. Flags are binary entitlements; counters compare the
/// would-be total against the plan's allowance.
fn gate_decision(kind: MeterKind, limit: i64, current: i64, quantity: i64) -> bool {
    match kind {
        MeterKind::Flag => limit > 0,
        MeterKind::Counter => current + quantity <= limit,
    }
}

/// Usage metering service
#[derive(Clone)]
pub struct UsageMeter {
    pool: PgPool,
    config: Arc<BillingConfig>,
    stripe: Option<StripeClient>,
    users: Arc<dyn UserStore>,
}

impl UsageMeter {
    pub fn new(
        pool: PgPool,
        config: Arc<BillingConfig>,
        stripe: Option<StripeClient>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            pool,
            config,
            stripe,
            users,
        }
    }

    fn meter(&self, meter_id: &str) -> BillingResult<&MeterConfig> {
        self.config
            .meter(meter_id)
            .ok_or_else(|| BillingError::UnknownMeter(meter_id.to_string()))
    }

    /// Decide whether `quantity` more units may be consumed. Read-only;
    /// safe to call repeatedly without consuming quota.
    pub async fn check_usage(
        &self,
        user_id: &str,
        meter_id: &str,
        quantity: i64,
        plan_id: &str,
    ) -> BillingResult<GateResult> {
        let meter = self.meter(meter_id)?;
        let limit = meter.limit_for(plan_id);
        let now = OffsetDateTime::now_utc();
        let key = period_key(now, meter.reset_period);

        let current = self.current_usage(user_id, meter_id, &key).await;
        let allowed = gate_decision(meter.kind, limit, current, quantity);

        if meter.kind == MeterKind::Counter && limit > 0 {
            let used_pct = current * 100 / limit;
            if used_pct >= i64::from(meter.warning_at) {
                tracing::warn!(
                    user_id = %user_id,
                    meter_id = %meter_id,
                    current = current,
                    limit = limit,
                    "Usage at or above warning threshold"
                );
            }
        }

        Ok(GateResult {
            allowed,
            current,
            limit,
            reset_at: reset_at(now, meter.reset_period)?,
            upgrade_url: self.config.upgrade_url.clone(),
            meter: meter.clone(),
        })
    }

    /// Sum recorded usage for the period.
    ///
    /// Degrades to zero when the store is unreachable or not yet
    /// bootstrapped: limits still apply at their configured values, and a
    /// metering outage must not take the caller down with it.
    async fn current_usage(&self, user_id: &str, meter_id: &str, key: &str) -> i64 {
        let result: Result<Option<(i64,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM usage_events
            WHERE user_id = $1 AND meter_id = $2 AND period_key = $3
            "#,
        )
        .bind(user_id)
        .bind(meter_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(|(total,)| total).unwrap_or(0),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    meter_id = %meter_id,
                    error = %e,
                    "Usage lookup failed, treating current usage as 0"
                );
                0
            }
        }
    }

    /// Append one usage event.
    ///
    /// Does not re-check the limit; callers gate first when enforcement is
    /// required.
    pub async fn record_usage(
        &self,
        user_id: &str,
        meter_id: &str,
        quantity: i64,
        metadata: Option<serde_json::Value>,
    ) -> BillingResult<()> {
        let meter = self.meter(meter_id)?.clone();
        if quantity < 0 {
            return Err(BillingError::InvalidInput(format!(
                "negative quantity: {quantity}"
            )));
        }

        let now = OffsetDateTime::now_utc();
        let key = period_key(now, meter.reset_period);

        sqlx::query(
            r#"
            INSERT INTO usage_events (id, user_id, meter_id, quantity, metadata, period_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(meter_id)
        .bind(quantity)
        .bind(&metadata)
        .bind(&key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if let Some(event_name) = meter.remote_meter_name.as_deref() {
            self.forward_meter_event(user_id, event_name, quantity).await;
        }

        Ok(())
    }

    /// Best-effort counter increment to Stripe. Never fails the local
    /// write: the local ledger has already committed and remains
    /// authoritative for gating.
    async fn forward_meter_event(&self, user_id: &str, event_name: &str, quantity: i64) {
        let Some(stripe) = &self.stripe else {
            tracing::debug!(meter_event = %event_name, "Stripe not configured, skipping forward");
            return;
        };

        let customer_id = match self.users.stripe_customer_id(user_id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::debug!(
                    user_id = %user_id,
                    meter_event = %event_name,
                    "No billing customer linked to user, skipping forward"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Customer lookup failed, skipping forward"
                );
                return;
            }
        };

        let strategy = ExponentialBackoff::from_millis(200).factor(2).take(2);
        let send = || stripe.send_meter_event(event_name, &customer_id, quantity);

        if let Err(e) = Retry::spawn(strategy, send).await {
            tracing::warn!(
                user_id = %user_id,
                meter_event = %event_name,
                error = %e,
                "Failed to forward meter event to Stripe"
            );
        }
    }
}
