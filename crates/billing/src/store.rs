//! Usage store bootstrap.
//!
//! Schema creation runs at startup when auto-migration is enabled. Every
//! statement is discrete and idempotent; concurrent bootstrap from several
//! instances must not fail or destroy existing data.

use std::collections::HashMap;

use sqlx::PgPool;
use uuid::Uuid;

use corral_shared::types::BillingConfig;

use crate::error::BillingResult;

/// Discrete DDL statements, executed in order.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS usage_events (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        meter_id TEXT NOT NULL,
        quantity BIGINT NOT NULL,
        metadata JSONB,
        period_key TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_usage_events_user_meter_period
        ON usage_events (user_id, meter_id, period_key)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plan_limits (
        id UUID PRIMARY KEY,
        plan_id TEXT NOT NULL,
        meter_id TEXT NOT NULL,
        limit_value BIGINT NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_plan_limits_plan_meter
        ON plan_limits (plan_id, meter_id, captured_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stripe_webhook_events (
        stripe_event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        processing_result TEXT NOT NULL,
        error_message TEXT,
        received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Postgres codes raised when another instance won a creation race.
const DUPLICATE_OBJECT_CODES: &[&str] = &["42P07", "42710", "23505"];

/// Ensure the usage schema exists. Safe to run concurrently and repeatedly.
pub async fn ensure_schema(pool: &PgPool) -> BillingResult<()> {
    for statement in SCHEMA_STATEMENTS {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            if is_duplicate_object(&e) {
                tracing::debug!("Schema object already exists, continuing");
                continue;
            }
            return Err(e.into());
        }
    }
    tracing::info!("Usage schema ensured");
    Ok(())
}

fn is_duplicate_object(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| DUPLICATE_OBJECT_CODES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}

/// Append a snapshot row for every (plan, meter) limit that differs from
/// the latest recorded value. Keeps an audit trail of limit changes over
/// time without rewriting history.
pub async fn snapshot_plan_limits(pool: &PgPool, config: &BillingConfig) -> BillingResult<usize> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (plan_id, meter_id) plan_id, meter_id, limit_value
        FROM plan_limits
        ORDER BY plan_id, meter_id, captured_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let latest: HashMap<(String, String), i64> = rows
        .into_iter()
        .map(|(plan, meter, limit)| ((plan, meter), limit))
        .collect();

    let mut written = 0;
    for meter in config.meters.values() {
        for (plan_id, limit) in &meter.limits {
            if latest.get(&(plan_id.clone(), meter.id.clone())) == Some(limit) {
                continue;
            }
            sqlx::query(
                "INSERT INTO plan_limits (id, plan_id, meter_id, limit_value) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(plan_id)
            .bind(&meter.id)
            .bind(limit)
            .execute(pool)
            .await?;
            written += 1;
        }
    }

    if written > 0 {
        tracing::info!(snapshots = written, "Recorded plan limit changes");
    }
    Ok(written)
}
