//! Postgres connection pool
//!
//! Shared by the channel client, the customer directory and reconciliation.
//! The pool's acquire timeout doubles as a saturation signal: when every
//! connection is busy, inserts surface it as backpressure.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::env_or;
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Also the longest an insert waits for a free connection
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// `DATABASE_URL` plus the optional `DB_*` pool settings
    pub fn from_env() -> Result<Self, StoreError> {
        dotenvy::dotenv().ok();

        let url = std::env::var("DATABASE_URL")
            .map_err(|_| StoreError::Config("DATABASE_URL not set".to_string()))?;

        let setting = |key: &str, default: u64| {
            env_or(key, default).map_err(|e| StoreError::Config(format!("{:#}", e)))
        };

        Ok(Self {
            url,
            max_connections: setting("DB_MAX_CONNECTIONS", 20)? as u32,
            min_connections: setting("DB_MIN_CONNECTIONS", 2)? as u32,
            acquire_timeout: Duration::from_secs(setting("DB_CONNECT_TIMEOUT", 30)?),
        })
    }

    /// Size the pool so every worker can hold one connection per channel at once
    pub fn sized_for_workers(mut self, workers: usize) -> Self {
        let wanted = (workers as u32).saturating_mul(2).saturating_add(2);
        if self.max_connections < wanted {
            tracing::warn!(
                configured = self.max_connections,
                wanted,
                workers,
                "Raising DB_MAX_CONNECTIONS to fit the worker count"
            );
            self.max_connections = wanted;
        }
        self
    }
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Database connection pool created"
    );

    Ok(pool)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn config(max_connections: u32) -> DbConfig {
        DbConfig {
            url: "postgresql://localhost/orderstream".to_string(),
            max_connections,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_pool_grows_to_fit_workers() {
        assert_eq!(config(4).sized_for_workers(8).max_connections, 18);
    }

    #[test]
    fn test_pool_keeps_larger_setting() {
        assert_eq!(config(20).sized_for_workers(2).max_connections, 20);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_pool_settings() {
        std::env::set_var("DATABASE_URL", "postgresql://db/orderstream");
        std::env::set_var("DB_MAX_CONNECTIONS", "12");
        std::env::set_var("DB_CONNECT_TIMEOUT", "5");

        let config = DbConfig::from_env().unwrap();

        std::env::remove_var("DB_MAX_CONNECTIONS");
        std::env::remove_var("DB_CONNECT_TIMEOUT");

        assert_eq!(config.url, "postgresql://db/orderstream");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));

        std::env::set_var("DB_MIN_CONNECTIONS", "few");
        let result = DbConfig::from_env();
        std::env::remove_var("DB_MIN_CONNECTIONS");
        std::env::remove_var("DATABASE_URL");
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
