//! Plan and meter configuration shared across the platform.
//!
//! These types are the in-memory shape of the `billing` section of the
//! application config. Parsing and environment substitution happen
//! upstream; everything here is plain data.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a meter counts usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    /// Accumulating counter checked against a per-plan allowance.
    Counter,
    /// Binary entitlement; any positive limit grants access.
    Flag,
}

/// When a meter's counters start over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPeriod {
    Day,
    Month,
}

/// Billing interval for subscription prices. Month-only today; the enum
/// keeps config files forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Month,
}

/// A metered resource dimension with per-plan limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterConfig {
    pub id: String,
    /// Human-readable unit, e.g. "requests".
    pub unit: String,
    pub kind: MeterKind,
    pub reset_period: ResetPeriod,
    /// plan id -> allowance per period. Plans not listed get 0.
    #[serde(default)]
    pub limits: HashMap<String, i64>,
    /// Percentage of the limit at which callers should surface a warning.
    #[serde(default = "default_warning_at")]
    pub warning_at: u8,
    /// Stripe billing meter event name, when usage is also reported remotely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_meter_name: Option<String>,
}

fn default_warning_at() -> u8 {
    80
}

impl MeterConfig {
    /// The allowance this meter grants a plan. Unlisted plans get nothing.
    pub fn limit_for(&self, plan_id: &str) -> i64 {
        self.limits.get(plan_id).copied().unwrap_or(0)
    }
}

/// A subscription tier as defined locally.
///
/// `remote_price_id` is written back by the catalog synchronizer;
/// everything else is operator-owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConfig {
    pub id: String,
    pub display_name: String,
    /// Price in major currency units, e.g. 19.99.
    pub price: f64,
    #[serde(default)]
    pub billing_interval: BillingInterval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_price_id: Option<String>,
}

impl PlanConfig {
    /// Price in minor units (cents), rounded half-up so repeated catalog
    /// runs converge on the same amount.
    pub fn price_minor_units(&self) -> i64 {
        (self.price * 100.0).round() as i64
    }

    pub fn is_free(&self) -> bool {
        self.price_minor_units() <= 0
    }
}

/// The billing section of the application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingConfig {
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
    /// Meters keyed by id (the key and `MeterConfig::id` agree).
    #[serde(default)]
    pub meters: HashMap<String, MeterConfig>,
    /// Plan users land on when their subscription goes away.
    #[serde(default = "default_baseline_plan")]
    pub baseline_plan: String,
    /// Where gate responses point callers who hit a limit.
    #[serde(default = "default_upgrade_url")]
    pub upgrade_url: String,
}

fn default_baseline_plan() -> String {
    "free".to_string()
}

fn default_upgrade_url() -> String {
    "/pricing".to_string()
}

impl BillingConfig {
    pub fn meter(&self, meter_id: &str) -> Option<&MeterConfig> {
        self.meters.get(meter_id)
    }

    pub fn plan(&self, plan_id: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Static remote-price-id -> plan-id map used by the webhook
    /// reconciler. Plans without a synced price are absent.
    pub fn price_to_plan(&self) -> HashMap<String, String> {
        self.plans
            .iter()
            .filter_map(|p| {
                p.remote_price_id
                    .clone()
                    .map(|price_id| (price_id, p.id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(id: &str, price: f64) -> PlanConfig {
        PlanConfig {
            id: id.to_string(),
            display_name: id.to_string(),
            price,
            billing_interval: BillingInterval::Month,
            remote_price_id: None,
        }
    }

    #[test]
    fn minor_units_round_half_up() {
        assert_eq!(plan("pro", 29.0).price_minor_units(), 2900);
        assert_eq!(plan("pro", 19.99).price_minor_units(), 1999);
        assert_eq!(plan("free", 0.0).price_minor_units(), 0);
    }

    #[test]
    fn zero_and_negative_prices_are_free() {
        assert!(plan("free", 0.0).is_free());
        assert!(plan("weird", -5.0).is_free());
        assert!(!plan("pro", 0.01).is_free());
    }

    #[test]
    fn price_map_skips_unsynced_plans() {
        let mut pro = plan("pro", 29.0);
        pro.remote_price_id = Some("price_123".to_string());
        let config = BillingConfig {
            plans: vec![plan("free", 0.0), pro],
            meters: HashMap::new(),
            baseline_plan: "free".to_string(),
            upgrade_url: "/pricing".to_string(),
        };

        let map = config.price_to_plan();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("price_123").map(String::as_str), Some("pro"));
    }

    #[test]
    fn config_defaults_apply() {
        let config: BillingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.baseline_plan, "free");
        assert_eq!(config.upgrade_url, "/pricing");
        assert!(config.plans.is_empty());
    }

    #[test]
    fn meter_limit_defaults_to_zero() {
        let meter = MeterConfig {
            id: "api_calls".to_string(),
            unit: "requests".to_string(),
            kind: MeterKind::Counter,
            reset_period: ResetPeriod::Month,
            limits: HashMap::from([("pro".to_string(), 50_000)]),
            warning_at: 80,
            remote_meter_name: None,
        };
        assert_eq!(meter.limit_for("pro"), 50_000);
        assert_eq!(meter.limit_for("unknown"), 0);
    }
}
