//! Per-worker batch ingestion
//!
//! A [`BatchIngestionEngine`] owns one partition and walks it through a small
//! state machine:
//!
//! ```text
//! Init -> OpenChannels -> (Generate -> InsertParents -> Pause -> InsertChildren)* -> Close -> Done
//!                                                          any failure -> Close -> Failed
//! ```
//!
//! Parents of a batch are always committed before its children. If the
//! children then fail for good, the parents stay committed: that is reported
//! as an [`AtomicityViolation`] and repaired by reconciliation afterwards.
//! Channels are closed on every path, panics included.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{ChannelClient, ChannelError, ChannelManager, Target};
use crate::config::{IngestConfig, TargetConfig};
use crate::error::IngestError;
use crate::generator::{EntityGenerator, GeneratedBatch, SegmentTable};
use crate::partition::Partition;
use crate::retry::{RetryFailure, RetryPolicy};
use crate::store::CustomerDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Init,
    OpenChannels,
    Generate,
    InsertParents,
    Pause,
    InsertChildren,
    Close,
    Done,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Init => "init",
            EngineState::OpenChannels => "open_channels",
            EngineState::Generate => "generate",
            EngineState::InsertParents => "insert_parents",
            EngineState::Pause => "pause",
            EngineState::InsertChildren => "insert_children",
            EngineState::Close => "close",
            EngineState::Done => "done",
            EngineState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parents committed while their children were not
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtomicityViolation {
    pub worker_id: u32,
    pub orders_committed: usize,
    pub items_lost: usize,
    pub first_order_id: i64,
    pub last_order_id: i64,
}

impl std::fmt::Display for AtomicityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Atomicity violation on worker {}: {} orders ({}..={}) committed without their {} items",
            self.worker_id,
            self.orders_committed,
            self.first_order_id,
            self.last_order_id,
            self.items_lost
        )
    }
}

/// Settings shared by all workers of a run
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub phase_pause: Duration,
    pub retry: RetryPolicy,
    pub seed: u64,
    pub targets: TargetConfig,
    /// Order dates are drawn from the year before this instant
    pub reference_time: NaiveDateTime,
}

impl EngineSettings {
    pub fn from_config(config: &IngestConfig, seed: u64, reference_time: NaiveDateTime) -> Self {
        Self {
            batch_size: config.batch_size,
            phase_pause: config.phase_pause(),
            retry: config.retry.policy(),
            seed,
            targets: config.targets.clone(),
            reference_time,
        }
    }
}

/// Outcome of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: u32,
    pub partition: Partition,
    pub entities_generated: u64,
    pub items_generated: u64,
    pub batches_committed: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub final_state: EngineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_after: Option<String>,
    /// Latest offsets the store acknowledged when the worker stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_order_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_item_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomicity_violation: Option<AtomicityViolation>,
}

impl WorkerReport {
    /// Report for a worker whose task died before it could report itself
    pub fn lost(partition: Partition, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            worker_id: partition.worker_id,
            partition,
            entities_generated: 0,
            items_generated: 0,
            batches_committed: 0,
            duration_ms: duration.as_millis() as u64,
            success: false,
            final_state: EngineState::Failed,
            resumed_after: None,
            last_order_offset: None,
            last_item_offset: None,
            error: Some(error.into()),
            atomicity_violation: None,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    entities: u64,
    items: u64,
    batches: u64,
    resumed_after: Option<String>,
    violation: Option<AtomicityViolation>,
}

pub struct BatchIngestionEngine {
    partition: Partition,
    settings: Arc<EngineSettings>,
    client: Arc<dyn ChannelClient>,
    directory: Arc<dyn CustomerDirectory>,
    state: EngineState,
}

impl BatchIngestionEngine {
    pub fn new(
        partition: Partition,
        settings: Arc<EngineSettings>,
        client: Arc<dyn ChannelClient>,
        directory: Arc<dyn CustomerDirectory>,
    ) -> Self {
        Self {
            partition,
            settings,
            client,
            directory,
            state: EngineState::Init,
        }
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "Worker state change");
        self.state = next;
    }

    /// Ingest the partition's quota; never fails, the outcome is in the report
    pub async fn run(mut self) -> WorkerReport {
        let worker_id = self.partition.worker_id;
        let span = info_span!("worker", worker_id);

        async move {
            let started = Instant::now();
            info!(
                customers = %self.partition.customers,
                quota = self.partition.quota,
                "Worker starting"
            );

            let mut channels = ChannelManager::new(Arc::clone(&self.client), worker_id);
            let mut progress = Progress::default();

            let outcome = AssertUnwindSafe(self.drive(&mut channels, &mut progress))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(IngestError::Panicked(panic_message(payload))));

            self.transition(EngineState::Close);
            let last_order_offset = final_offset(&channels, Target::Orders).await;
            let last_item_offset = final_offset(&channels, Target::OrderItems).await;
            info!(
                last_order_offset = last_order_offset.as_deref().unwrap_or("none"),
                last_item_offset = last_item_offset.as_deref().unwrap_or("none"),
                "Committed offsets"
            );
            channels.close().await;

            let duration_ms = started.elapsed().as_millis() as u64;
            let error = match outcome {
                Ok(()) => {
                    self.transition(EngineState::Done);
                    info!(
                        entities = progress.entities,
                        items = progress.items,
                        duration_ms,
                        "Worker completed"
                    );
                    None
                },
                Err(e) => {
                    self.transition(EngineState::Failed);
                    error!(
                        entities = progress.entities,
                        duration_ms,
                        error = %e,
                        "Worker failed"
                    );
                    Some(e.to_string())
                },
            };

            WorkerReport {
                worker_id,
                partition: self.partition,
                entities_generated: progress.entities,
                items_generated: progress.items,
                batches_committed: progress.batches,
                duration_ms,
                success: error.is_none(),
                final_state: self.state,
                resumed_after: progress.resumed_after,
                last_order_offset,
                last_item_offset,
                error,
                atomicity_violation: progress.violation,
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &mut self,
        channels: &mut ChannelManager,
        progress: &mut Progress,
    ) -> Result<(), IngestError> {
        let range = self.partition.customers;
        let customers = self.directory.segments_in_range(range).await?;
        if customers.is_empty() {
            warn!(customers = %range, "No customers found in partition, drawing ids uniformly");
        }
        let segments = SegmentTable::new(range, customers);

        self.transition(EngineState::OpenChannels);
        let resume = channels.open(&self.settings.targets).await?;

        let mut generator = EntityGenerator::new(
            self.partition.worker_id,
            self.settings.seed,
            segments,
            self.settings.reference_time,
        );
        generator.resume_from(resume.last_order, resume.last_item)?;
        progress.resumed_after = resume.last_order.map(|t| t.to_string());

        let channels: &ChannelManager = channels;
        let quota = self.partition.quota;

        while progress.entities < quota {
            let count = (quota - progress.entities).min(self.settings.batch_size as u64) as usize;

            self.transition(EngineState::Generate);
            let batch = generator.generate_batch(count);

            self.transition(EngineState::InsertParents);
            self.settings
                .retry
                .run("insert orders", ChannelError::is_backpressure, || {
                    channels.insert_orders(&batch.orders)
                })
                .await
                .map_err(|failure| insert_error(Target::Orders, batch.orders.len(), failure))?;

            self.transition(EngineState::Pause);
            tokio::time::sleep(self.settings.phase_pause).await;

            self.transition(EngineState::InsertChildren);
            let children = self
                .settings
                .retry
                .run("insert order items", ChannelError::is_backpressure, || {
                    channels.insert_items(&batch.items)
                })
                .await;

            if let Err(failure) = children {
                let violation = self.violation(&batch);
                warn!(
                    orders_committed = violation.orders_committed,
                    items_lost = violation.items_lost,
                    first_order_id = violation.first_order_id,
                    last_order_id = violation.last_order_id,
                    "ATOMICITY VIOLATION: orders committed but their items failed, reconciliation will remove them"
                );
                progress.violation = Some(violation.clone());
                return Err(IngestError::AtomicityViolation {
                    violation,
                    source: Box::new(insert_error(Target::OrderItems, batch.items.len(), failure)),
                });
            }

            progress.entities += count as u64;
            progress.items += batch.items.len() as u64;
            progress.batches += 1;
            info!(
                processed = progress.entities,
                quota,
                items = batch.items.len(),
                "Batch committed"
            );
        }

        Ok(())
    }

    fn violation(&self, batch: &GeneratedBatch) -> AtomicityViolation {
        AtomicityViolation {
            worker_id: self.partition.worker_id,
            orders_committed: batch.orders.len(),
            items_lost: batch.items.len(),
            first_order_id: batch.orders.first().map_or(0, |o| o.order_id),
            last_order_id: batch.orders.last().map_or(0, |o| o.order_id),
        }
    }
}

/// `None` when the channel never opened or the store cannot answer
async fn final_offset(channels: &ChannelManager, target: Target) -> Option<String> {
    match channels.latest_committed(target).await {
        Ok(offset) => offset.map(|t| t.to_string()),
        Err(e) => {
            debug!(%target, error = %e, "Committed offset unavailable");
            None
        },
    }
}

fn insert_error(target: Target, rows: usize, failure: RetryFailure<ChannelError>) -> IngestError {
    if failure.exhausted {
        IngestError::RetriesExhausted {
            target,
            rows,
            attempts: failure.attempts,
            source: failure.error,
        }
    } else {
        IngestError::Channel(failure.error)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::memory::{Fault, MemoryStore};
    use crate::store::ReconciliationStore;
    use chrono::Utc;
    use orderstream_common::types::CustomerRange;

    fn settings(batch_size: usize) -> Arc<EngineSettings> {
        Arc::new(EngineSettings {
            batch_size,
            phase_pause: Duration::from_millis(10),
            retry: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20)),
            seed: 99,
            targets: TargetConfig::default(),
            reference_time: Utc::now().naive_utc(),
        })
    }

    fn partition(worker_id: u32, quota: u64) -> Partition {
        Partition {
            worker_id,
            customers: CustomerRange::new(1, 100).unwrap(),
            quota,
        }
    }

    fn engine(store: &Arc<MemoryStore>, worker_id: u32, quota: u64, batch_size: usize) -> BatchIngestionEngine {
        BatchIngestionEngine::new(
            partition(worker_id, quota),
            settings(batch_size),
            store.clone(),
            store.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_ingests_quota_in_batches() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        let report = engine(&store, 0, 25, 10).run().await;

        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.final_state, EngineState::Done);
        assert_eq!(report.entities_generated, 25);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(store.count_orders().await.unwrap(), 25);
        assert_eq!(store.count_items().await.unwrap(), report.items_generated);
        assert!(!store.is_channel_open("ORDERS_CHANNEL_instance_0").await);
        assert!(!store.is_channel_open("ORDER_ITEMS_CHANNEL_instance_0").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_carries_last_committed_offsets() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        let report = engine(&store, 3, 25, 10).run().await;
        assert!(report.success);

        let last_order = store.orders().await.iter().map(|r| r.row.order_id).max().unwrap();
        let last_item = store.items().await.iter().map(|r| r.row.order_item_id).max().unwrap();
        assert_eq!(report.last_order_offset, Some(format!("order_{}", last_order)));
        assert_eq!(report.last_item_offset, Some(format!("item_{}", last_item)));
        assert_eq!(
            store.committed_offset("ORDERS_CHANNEL_instance_3").await.unwrap().to_string(),
            format!("order_{}", last_order)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_batch_reports_no_offsets() {
        let store = Arc::new(MemoryStore::new());
        store.inject(Fault::reject(Target::Orders)).await;

        let report = engine(&store, 0, 10, 10).run().await;

        assert!(!report.success);
        assert_eq!(report.last_order_offset, None);
        assert_eq!(report.last_item_offset, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_quota_opens_and_closes() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        let report = engine(&store, 1, 0, 10).run().await;

        assert!(report.success);
        assert_eq!(report.entities_generated, 0);
        assert_eq!(store.channel_opens("ORDERS_CHANNEL_instance_1").await, 1);
        assert!(!store.is_channel_open("ORDERS_CHANNEL_instance_1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_backpressure_is_absorbed() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        store.inject(Fault::backpressure(Target::Orders).times(2)).await;

        let report = engine(&store, 0, 10, 10).run().await;

        assert!(report.success);
        assert_eq!(store.insert_attempts(Target::Orders).await, 3);
        assert_eq!(store.count_orders().await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_failure_stops_before_children() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        store.inject(Fault::reject(Target::Orders)).await;

        let report = engine(&store, 0, 10, 10).run().await;

        assert!(!report.success);
        assert_eq!(report.final_state, EngineState::Failed);
        assert!(report.atomicity_violation.is_none());
        assert_eq!(store.insert_attempts(Target::Orders).await, 1);
        assert_eq!(store.insert_attempts(Target::OrderItems).await, 0);
        assert!(!store.is_channel_open("ORDERS_CHANNEL_instance_0").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_children_report_atomicity_violation() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        store
            .inject(Fault::backpressure(Target::OrderItems).after(1).always())
            .await;

        let report = engine(&store, 0, 20, 10).run().await;

        assert!(!report.success);
        assert_eq!(report.entities_generated, 10);
        let violation = report.atomicity_violation.expect("violation reported");
        assert_eq!(violation.orders_committed, 10);
        // 1 good insert, then 1 + 3 retries on the second batch
        assert_eq!(store.insert_attempts(Target::OrderItems).await, 5);
        assert_eq!(store.count_orders().await.unwrap(), 20);
        assert!(report.error.unwrap().contains("Atomicity violation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained_and_channels_closed() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        store.inject(Fault::panic(Target::OrderItems)).await;

        let report = engine(&store, 4, 5, 5).run().await;

        assert!(!report.success);
        assert!(report.error.unwrap().contains("panicked"));
        assert!(!store.is_channel_open("ORDERS_CHANNEL_instance_4").await);
        assert!(!store.is_channel_open("ORDER_ITEMS_CHANNEL_instance_4").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_continues_identities() {
        let store = Arc::new(MemoryStore::with_customers(100, 1));
        assert!(engine(&store, 2, 10, 10).run().await.success);
        let second = engine(&store, 2, 10, 10).run().await;

        assert!(second.success);
        assert!(second.resumed_after.is_some());
        assert_eq!(store.count_orders().await.unwrap(), 20);
        assert_eq!(store.count_duplicate_orders().await.unwrap(), 0);
    }
}
