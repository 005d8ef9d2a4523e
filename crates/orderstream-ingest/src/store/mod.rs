//! Remote store seams
//!
//! Besides the append channels, the engine needs two things from the store:
//! read-only access to customers ([`CustomerDirectory`]) and the set-based
//! cleanup statements run after ingestion ([`ReconciliationStore`]).
//!
//! Two implementations ship with the crate: [`postgres::PgStore`] for real runs
//! and [`memory::MemoryStore`] for dry runs and tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use orderstream_common::types::{Customer, CustomerRange};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    Invalid(String),
}

/// Read-only customer reference data
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    /// Highest existing customer id, 0 when there are no customers
    async fn max_customer_id(&self) -> Result<i64, StoreError>;

    /// Every customer in `range`, ordered by id
    async fn segments_in_range(&self, range: CustomerRange) -> Result<Vec<Customer>, StoreError>;
}

/// Bounded, idempotent cleanup statements
///
/// Every `delete_*` call removes at most `limit` units and returns the rows it
/// removed, so callers loop until a call comes back short.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Delete parents without children, at most `limit` order ids per call
    async fn delete_orphaned_orders(&self, limit: u64) -> Result<u64, StoreError>;

    /// Delete children whose parent is missing, at most `limit` order ids per call
    async fn delete_orphaned_items(&self, limit: u64) -> Result<u64, StoreError>;

    /// Parent rows that share an `order_id` with an earlier row
    async fn count_duplicate_orders(&self) -> Result<u64, StoreError>;

    /// Delete all but the earliest row of each `order_id`, at most `limit` rows per call
    async fn delete_duplicate_orders(&self, limit: u64) -> Result<u64, StoreError>;

    async fn count_orders(&self) -> Result<u64, StoreError>;

    async fn count_items(&self) -> Result<u64, StoreError>;
}
