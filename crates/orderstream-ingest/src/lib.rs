//! Orderstream Ingest Library
//!
//! Parallel synthetic order ingestion into a store that exposes resumable
//! append channels, followed by reconciliation of whatever the partial
//! failures left behind.
//!
//! # Layout
//!
//! - [`channel`]: channel handles, offset tokens and the per-worker manager
//! - [`generator`]: deterministic order and order item generation
//! - [`engine`]: one worker's batch state machine
//! - [`orchestrator`]: partitioning, worker tasks and the run summary
//! - [`reconcile`]: orphan and duplicate cleanup
//! - [`store`]: Postgres and in-memory stores
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orderstream_ingest::config::IngestConfig;
//! use orderstream_ingest::orchestrator::ParallelOrchestrator;
//! use orderstream_ingest::store::memory::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::with_customers(20_000, 1));
//!     let orchestrator = ParallelOrchestrator::new(
//!         IngestConfig::default(),
//!         store.clone(),
//!         store.clone(),
//!         store,
//!     );
//!     let summary = orchestrator.run(50_000, 5).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod channel;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod generator;
pub mod orchestrator;
pub mod partition;
pub mod reconcile;
pub mod retry;
pub mod store;

pub use error::{IngestError, Result};
