//! Configuration management for the escrow service
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub foreign_chain: ForeignChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscrowConfig {
    /// Denomination accepted as collateral (base units, e.g. `wei`)
    pub collateral_denom: String,
    /// Denomination the solver must deliver on the foreign chain
    pub requested_denom: String,
    /// Bech32 human-readable prefix of foreign-chain recipients
    pub recipient_prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    /// Absent means verification is retried until the claim resolves
    #[serde(default)]
    pub max_verification_attempts: Option<u32>,
    /// How often CLAIMED requests without a poller are picked back up
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Serve operator routes (collateral refunds) under `/admin`
    #[serde(default)]
    pub admin_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForeignChainConfig {
    pub chain_id: String,
    pub lcd_urls: Vec<String>,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_max_poll_interval_ms() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_stale_claim_secs() -> u64 {
    3_600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_confirmation_blocks() -> u64 {
    1
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from the file named by `ZEROMILES_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("ZEROMILES_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Collateral custody lives in process memory; a durable request store
    /// outlives it across restarts.
    pub fn custody_warning(&self) -> Option<&'static str> {
        self.database.as_ref().map(|_| {
            "Requests persist in PostgreSQL but collateral custody is in-memory: \
             collateral held at shutdown is lost, and releases for requests \
             recovered after a restart will fail"
        })
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let escrow = &self.escrow;
        if escrow.collateral_denom.is_empty() || escrow.requested_denom.is_empty() {
            anyhow::bail!("Collateral and requested denominations must be set");
        }
        if escrow.recipient_prefix.is_empty() {
            anyhow::bail!("Recipient address prefix must be set");
        }
        if escrow.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        if escrow.max_poll_interval_ms < escrow.poll_interval_ms {
            anyhow::bail!("max_poll_interval_ms must not be below poll_interval_ms");
        }
        if escrow.backoff_multiplier < 1.0 {
            anyhow::bail!("backoff_multiplier must be at least 1.0");
        }
        if escrow.sweep_interval_secs == 0 || escrow.health_check_interval_secs == 0 {
            anyhow::bail!("sweep and health check intervals must be greater than zero");
        }
        if escrow.max_verification_attempts == Some(0) {
            anyhow::bail!("max_verification_attempts must be greater than zero when set");
        }

        if self.foreign_chain.lcd_urls.is_empty() {
            anyhow::bail!(
                "Foreign chain {} has no LCD URLs configured",
                self.foreign_chain.chain_id
            );
        }

        if self.database.is_none() {
            tracing::warn!("No database configured - requests will be kept in memory only");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
