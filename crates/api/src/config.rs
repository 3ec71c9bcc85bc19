//! Application configuration

use std::env;

use corral_shared::types::BillingConfig;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Path to the plan/meter definitions file (JSON).
    pub billing_config_path: String,
    /// Ensure the usage schema at startup.
    pub auto_migrate: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    MissingVar(&'static str),

    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid billing config {path}: {source}")]
    Invalid {
        path: String,
        source: serde_json::Error,
    },
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?,
            billing_config_path: env::var("CORRAL_BILLING_CONFIG")
                .unwrap_or_else(|_| "billing.json".to_string()),
            auto_migrate: env::var("AUTO_MIGRATE")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }

    /// Load the plan/meter definitions this server enforces.
    pub fn load_billing_config(&self) -> Result<BillingConfig, ConfigError> {
        let raw = std::fs::read_to_string(&self.billing_config_path).map_err(|source| {
            ConfigError::Unreadable {
                path: self.billing_config_path.clone(),
                source,
            }
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Invalid {
            path: self.billing_config_path.clone(),
            source,
        })
    }
}
