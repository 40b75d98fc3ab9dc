use anyhow::{Context, bail};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::idempotency::GuardTtl;
use crate::subject_lock::SubjectLockConfig;
use crate::transfer::adapters::CredentialParams;
use crate::transfer::strategy::TransferPolicy;
use crate::transfer::types::UserTier;
use crate::transfer::{RedeliveryPolicy, RetryPolicy, SweeperConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL; in-memory store when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub postgres_pool_size: u32,
    pub saga: SagaConfig,
    #[serde(default)]
    pub policy: TransferPolicy,
    #[serde(default)]
    pub mock_risk: MockRiskConfig,
    /// Demo accounts opened at startup (dev only)
    #[serde(default)]
    pub seed_accounts: Vec<SeedAccount>,
}

fn default_pool_size() -> u32 {
    8
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SagaConfig {
    /// HMAC key for ledger integrity codes
    pub integrity_secret: String,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub idempotency: GuardTtl,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub subject_lock: SubjectLockConfig,
    #[serde(default)]
    pub risk_redelivery: RedeliveryPolicy,
    #[serde(default)]
    pub credential: CredentialParams,
    /// Clearing / SWIFT gateway; logging gateway when absent
    #[serde(default)]
    pub network_url: Option<String>,
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_network_timeout_ms() -> u64 {
    5_000
}

fn default_event_buffer() -> usize {
    1024
}

/// In-process risk engine answering risk requests (feature `mock-risk-engine`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MockRiskConfig {
    /// Approve strictly below this amount, reject at or above
    #[serde(default = "default_approve_below")]
    pub approve_below: Decimal,
    #[serde(default = "default_mock_latency_ms")]
    pub latency_ms: u64,
}

fn default_approve_below() -> Decimal {
    Decimal::from(50_000)
}

fn default_mock_latency_ms() -> u64 {
    200
}

impl Default for MockRiskConfig {
    fn default() -> Self {
        Self {
            approve_below: default_approve_below(),
            latency_ms: default_mock_latency_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SeedAccount {
    pub account_no: String,
    pub account_name: String,
    pub user_id: String,
    #[serde(default)]
    pub tier: UserTier,
    pub currency: String,
    #[serde(default)]
    pub opening_balance: Decimal,
    /// Transaction password enrolled for `user_id`
    #[serde(default)]
    pub credential: Option<String>,
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", config_path))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.saga.integrity_secret.trim().len() < 16 {
            bail!("saga.integrity_secret must be at least 16 characters");
        }
        if self.policy.currencies.is_empty() {
            bail!("policy.currencies must not be empty");
        }
        if self.saga.sweeper.batch_size == 0 {
            bail!("saga.sweeper.batch_size must be positive");
        }
        if self.saga.retry.max_attempts == 0 {
            bail!("saga.retry.max_attempts must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: saga.log
use_json: false
rotation: daily
saga:
  integrity_secret: "0123456789abcdef-dev"
"#;

    #[test]
    fn test_defaults_match_reference_values() {
        let config = AppConfig::parse(MINIMAL).unwrap();
        assert!(config.postgres_url.is_none());
        assert_eq!(config.saga.sweeper.interval_secs, 60);
        assert_eq!(config.saga.sweeper.freeze_timeout_secs, 1800);
        assert_eq!(config.saga.sweeper.batch_size, 100);
        assert_eq!(config.saga.idempotency.processing_secs, 60);
        assert_eq!(config.saga.idempotency.success_secs, 86_400);
        assert_eq!(config.saga.retry.max_attempts, 3);
        assert_eq!(config.policy.fee_account, "FEE-INCOME");
        assert!(config.seed_accounts.is_empty());
    }

    #[test]
    fn test_short_secret_rejected() {
        let raw = MINIMAL.replace("0123456789abcdef-dev", "short");
        let err = AppConfig::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("integrity_secret"));
    }

    #[test]
    fn test_dev_config_parses() {
        let raw = fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.yaml"))
            .unwrap();
        let config = AppConfig::parse(&raw).unwrap();
        assert!(!config.seed_accounts.is_empty());
        assert!(!config.policy.fees.is_empty());
    }
}
