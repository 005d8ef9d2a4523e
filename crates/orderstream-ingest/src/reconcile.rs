//! Post-ingestion consistency repair
//!
//! Runs three idempotent passes in order:
//!
//! 1. orders without items (left behind by an atomicity violation)
//! 2. items whose order is missing
//! 3. duplicate orders (a batch resent after its commit was not acknowledged),
//!    keeping the earliest row of each `order_id`
//!
//! Deletes are bounded; each pass repeats until a call removes fewer rows
//! than the limit.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::store::{ReconciliationStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationStats {
    pub orphaned_orders_found: u64,
    pub orphaned_orders_deleted: u64,
    pub orphaned_items_found: u64,
    pub orphaned_items_deleted: u64,
    pub duplicate_orders_found: u64,
    pub duplicate_orders_deleted: u64,
    pub final_orders_count: u64,
    pub final_items_count: u64,
    pub duration_ms: u64,
}

impl ReconciliationStats {
    pub fn rows_deleted(&self) -> u64 {
        self.orphaned_orders_deleted + self.orphaned_items_deleted + self.duplicate_orders_deleted
    }

    /// True when the store needed no repair
    pub fn was_clean(&self) -> bool {
        self.orphaned_orders_found == 0
            && self.orphaned_items_found == 0
            && self.duplicate_orders_found == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    OrphanedOrders,
    OrphanedItems,
    DuplicateOrders,
}

impl Pass {
    fn as_str(&self) -> &'static str {
        match self {
            Pass::OrphanedOrders => "orphaned orders",
            Pass::OrphanedItems => "orphaned items",
            Pass::DuplicateOrders => "duplicate orders",
        }
    }
}

pub struct ReconciliationManager {
    store: Arc<dyn ReconciliationStore>,
    batch_limit: u64,
}

impl ReconciliationManager {
    pub fn new(store: Arc<dyn ReconciliationStore>, batch_limit: u64) -> Self {
        Self {
            store,
            batch_limit: batch_limit.max(1),
        }
    }

    pub async fn reconcile(&self) -> Result<ReconciliationStats, StoreError> {
        let started = Instant::now();
        info!("Starting reconciliation");

        let mut stats = ReconciliationStats::default();

        // Deleted here is found: the passes select and delete in one statement
        let orphaned_orders = self.drain(Pass::OrphanedOrders).await?;
        stats.orphaned_orders_found = orphaned_orders;
        stats.orphaned_orders_deleted = orphaned_orders;

        let orphaned_items = self.drain(Pass::OrphanedItems).await?;
        stats.orphaned_items_found = orphaned_items;
        stats.orphaned_items_deleted = orphaned_items;

        stats.duplicate_orders_found = self.store.count_duplicate_orders().await?;
        if stats.duplicate_orders_found > 0 {
            stats.duplicate_orders_deleted = self.drain(Pass::DuplicateOrders).await?;
        }
        if stats.duplicate_orders_deleted != stats.duplicate_orders_found {
            warn!(
                found = stats.duplicate_orders_found,
                deleted = stats.duplicate_orders_deleted,
                "Duplicate count changed during reconciliation"
            );
        }

        stats.final_orders_count = self.store.count_orders().await?;
        stats.final_items_count = self.store.count_items().await?;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            orphaned_orders = stats.orphaned_orders_deleted,
            orphaned_items = stats.orphaned_items_deleted,
            duplicate_orders = stats.duplicate_orders_deleted,
            final_orders = stats.final_orders_count,
            final_items = stats.final_items_count,
            duration_ms = stats.duration_ms,
            "Reconciliation complete"
        );

        Ok(stats)
    }

    async fn drain(&self, pass: Pass) -> Result<u64, StoreError> {
        let mut total = 0u64;
        loop {
            let deleted = match pass {
                Pass::OrphanedOrders => self.store.delete_orphaned_orders(self.batch_limit).await?,
                Pass::OrphanedItems => self.store.delete_orphaned_items(self.batch_limit).await?,
                Pass::DuplicateOrders => self.store.delete_duplicate_orders(self.batch_limit).await?,
            };
            total += deleted;
            if deleted > 0 {
                info!(pass = pass.as_str(), deleted, total, "Deleted rows");
            }
            if deleted < self.batch_limit {
                return Ok(total);
            }
        }
    }
}
