//! Ingestion configuration
//!
//! Everything is read from environment variables (a `.env` file is honored)
//! and validated once at startup. Defaults match a local development setup.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default number of records per insert call.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Default number of retries after the first insert attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default first backoff delay in milliseconds.
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;

/// Default backoff cap in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Default flush latency hint handed to the store, in milliseconds.
pub const DEFAULT_FLUSH_LATENCY_MS: u64 = 1_000;

/// Default pause between the parent and child insert of a batch.
pub const DEFAULT_PHASE_PAUSE_MS: u64 = 100;

/// Default total entity count for a run.
pub const DEFAULT_TOTAL_ENTITIES: u64 = 100_000;

/// Default number of parallel workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default row limit of one bounded reconciliation DELETE.
pub const DEFAULT_RECONCILE_BATCH_LIMIT: u64 = 50_000;

/// Backoff settings for insert retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

/// Names of the tables and channels the engine writes to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    pub schema: String,
    pub orders_table: String,
    pub order_items_table: String,
    pub customers_table: String,
    /// Base channel name for orders; workers append `_instance_<id>`
    pub orders_channel: String,
    /// Base channel name for order items; workers append `_instance_<id>`
    pub order_items_channel: String,
}

impl TargetConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (var, value) in [
            ("INGEST_SCHEMA", &self.schema),
            ("INGEST_ORDERS_TABLE", &self.orders_table),
            ("INGEST_ORDER_ITEMS_TABLE", &self.order_items_table),
            ("INGEST_CUSTOMERS_TABLE", &self.customers_table),
            ("INGEST_ORDERS_CHANNEL", &self.orders_channel),
            ("INGEST_ORDER_ITEMS_CHANNEL", &self.order_items_channel),
        ] {
            if !is_plain_identifier(value) {
                anyhow::bail!(
                    "{} must be a plain identifier ([A-Za-z_][A-Za-z0-9_]*), got: {:?}",
                    var,
                    value
                );
            }
        }
        if self.orders_channel == self.order_items_channel {
            anyhow::bail!("INGEST_ORDERS_CHANNEL and INGEST_ORDER_ITEMS_CHANNEL must differ");
        }
        Ok(())
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            schema: "raw".to_string(),
            orders_table: "orders".to_string(),
            order_items_table: "order_items".to_string(),
            customers_table: "customers".to_string(),
            orders_channel: "ORDERS_CHANNEL".to_string(),
            order_items_channel: "ORDER_ITEMS_CHANNEL".to_string(),
        }
    }
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per insert call
    pub batch_size: usize,
    pub retry: RetryConfig,
    /// Buffering/latency tradeoff of the remote store; passed through, not enforced
    pub flush_latency_ms: u64,
    /// Pause between inserting parents and children of one batch
    pub phase_pause_ms: u64,
    pub total_entities: u64,
    pub worker_count: usize,
    /// Generator seed; a random one is drawn (and logged) when unset
    pub seed: Option<u64>,
    pub targets: TargetConfig,
    pub reconcile_batch_limit: u64,
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = TargetConfig::default();
        let config = Self {
            batch_size: env_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            retry: RetryConfig {
                max_retries: env_or("INGEST_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                base_backoff_ms: env_or("INGEST_BASE_BACKOFF_MS", DEFAULT_BASE_BACKOFF_MS)?,
                max_backoff_ms: env_or("INGEST_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF_MS)?,
            },
            flush_latency_ms: env_or("INGEST_FLUSH_LATENCY_MS", DEFAULT_FLUSH_LATENCY_MS)?,
            phase_pause_ms: env_or("INGEST_PHASE_PAUSE_MS", DEFAULT_PHASE_PAUSE_MS)?,
            total_entities: env_or("INGEST_TOTAL_ENTITIES", DEFAULT_TOTAL_ENTITIES)?,
            worker_count: env_or("INGEST_WORKER_COUNT", DEFAULT_WORKER_COUNT)?,
            seed: env_opt("INGEST_SEED")?,
            targets: TargetConfig {
                schema: std::env::var("INGEST_SCHEMA").unwrap_or(defaults.schema),
                orders_table: std::env::var("INGEST_ORDERS_TABLE")
                    .unwrap_or(defaults.orders_table),
                order_items_table: std::env::var("INGEST_ORDER_ITEMS_TABLE")
                    .unwrap_or(defaults.order_items_table),
                customers_table: std::env::var("INGEST_CUSTOMERS_TABLE")
                    .unwrap_or(defaults.customers_table),
                orders_channel: std::env::var("INGEST_ORDERS_CHANNEL")
                    .unwrap_or(defaults.orders_channel),
                order_items_channel: std::env::var("INGEST_ORDER_ITEMS_CHANNEL")
                    .unwrap_or(defaults.order_items_channel),
            },
            reconcile_batch_limit: env_or(
                "INGEST_RECONCILE_BATCH_LIMIT",
                DEFAULT_RECONCILE_BATCH_LIMIT,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("INGEST_BATCH_SIZE must be greater than 0");
        }
        if self.worker_count == 0 {
            anyhow::bail!("INGEST_WORKER_COUNT must be greater than 0");
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!(
                "INGEST_BASE_BACKOFF_MS ({}) cannot be greater than INGEST_MAX_BACKOFF_MS ({})",
                self.retry.base_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        if self.reconcile_batch_limit == 0 {
            anyhow::bail!("INGEST_RECONCILE_BATCH_LIMIT must be greater than 0");
        }
        self.targets.validate()?;
        Ok(())
    }

    pub fn phase_pause(&self) -> Duration {
        Duration::from_millis(self.phase_pause_ms)
    }

    pub fn flush_latency(&self) -> Duration {
        Duration::from_millis(self.flush_latency_ms)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryConfig::default(),
            flush_latency_ms: DEFAULT_FLUSH_LATENCY_MS,
            phase_pause_ms: DEFAULT_PHASE_PAUSE_MS,
            total_entities: DEFAULT_TOTAL_ENTITIES,
            worker_count: DEFAULT_WORKER_COUNT,
            seed: None,
            targets: TargetConfig::default(),
            reconcile_batch_limit: DEFAULT_RECONCILE_BATCH_LIMIT,
        }
    }
}

fn env_opt<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

pub(crate) fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

pub(crate) fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_ingest_config_default_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.targets.orders_channel, "ORDERS_CHANNEL");
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let config = IngestConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_workers() {
        let config = IngestConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_backoff_order() {
        let mut config = IngestConfig::default();
        config.retry.base_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_sql_in_identifiers() {
        let mut config = IngestConfig::default();
        config.targets.orders_table = "orders; DROP TABLE customers".to_string();
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.targets.order_items_channel = config.targets.orders_channel.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("order_items"));
        assert!(is_plain_identifier("_staging2"));
        assert!(!is_plain_identifier("2orders"));
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("raw.orders"));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("INGEST_BATCH_SIZE", "2500");
        std::env::set_var("INGEST_WORKER_COUNT", "8");
        std::env::set_var("INGEST_SEED", "1234");
        std::env::set_var("INGEST_SCHEMA", "staging");

        let config = IngestConfig::from_env().unwrap();

        std::env::remove_var("INGEST_BATCH_SIZE");
        std::env::remove_var("INGEST_WORKER_COUNT");
        std::env::remove_var("INGEST_SEED");
        std::env::remove_var("INGEST_SCHEMA");

        assert_eq!(config.batch_size, 2500);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.seed, Some(1234));
        assert_eq!(config.targets.schema, "staging");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unparsable_numbers() {
        std::env::set_var("INGEST_MAX_RETRIES", "many");
        let result = IngestConfig::from_env();
        std::env::remove_var("INGEST_MAX_RETRIES");
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.max_delay(), Duration::from_secs(30));
    }
}
