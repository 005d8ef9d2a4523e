//! Parallel ingestion run
//!
//! Fetches the customer id ceiling once, partitions the work, runs one
//! engine per partition as its own tokio task, waits for all of them and then
//! reconciles. A failing worker never cancels its siblings; reconciliation
//! runs whether or not every worker succeeded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::ChannelClient;
use crate::config::IngestConfig;
use crate::engine::{BatchIngestionEngine, EngineSettings, WorkerReport};
use crate::error::IngestError;
use crate::partition::{compute_partitions, Partition};
use crate::reconcile::{ReconciliationManager, ReconciliationStats};
use crate::store::{CustomerDirectory, ReconciliationStore};

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub seed: u64,
    pub total_requested: u64,
    pub worker_count: usize,
    pub entities_generated: u64,
    pub items_generated: u64,
    pub failed_workers: usize,
    pub duration_ms: u64,
    pub workers: Vec<WorkerReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_error: Option<String>,
}

impl RunSummary {
    /// Every worker finished its quota; a reconciliation failure is reported
    /// separately in `reconciliation_error`
    pub fn is_success(&self) -> bool {
        self.failed_workers == 0
    }

    /// Process exit code: non-zero iff at least one worker failed
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

pub struct ParallelOrchestrator {
    config: IngestConfig,
    client: Arc<dyn ChannelClient>,
    directory: Arc<dyn CustomerDirectory>,
    reconciler: ReconciliationManager,
}

impl ParallelOrchestrator {
    pub fn new(
        config: IngestConfig,
        client: Arc<dyn ChannelClient>,
        directory: Arc<dyn CustomerDirectory>,
        reconciliation: Arc<dyn ReconciliationStore>,
    ) -> Self {
        let reconciler = ReconciliationManager::new(reconciliation, config.reconcile_batch_limit);
        Self {
            config,
            client,
            directory,
            reconciler,
        }
    }

    /// One worker over every customer
    pub async fn run_single(&self, count: u64) -> Result<RunSummary, IngestError> {
        self.run(count, 1).await
    }

    /// `workers` concurrent engines sharing `total` entities
    pub async fn run(&self, total: u64, workers: usize) -> Result<RunSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let seed = self.config.seed.unwrap_or_else(rand::random);

        let max_customer_id = self.directory.max_customer_id().await?;
        let partitions = compute_partitions(total, workers, max_customer_id)?;

        info!(
            %run_id,
            total,
            workers,
            max_customer_id,
            seed,
            batch_size = self.config.batch_size,
            "Starting ingestion run"
        );

        let settings = Arc::new(EngineSettings::from_config(
            &self.config,
            seed,
            Utc::now().naive_utc(),
        ));

        let handles: Vec<(Partition, tokio::task::JoinHandle<WorkerReport>)> = partitions
            .into_iter()
            .map(|partition| {
                let engine = BatchIngestionEngine::new(
                    partition,
                    Arc::clone(&settings),
                    Arc::clone(&self.client),
                    Arc::clone(&self.directory),
                );
                (partition, tokio::spawn(engine.run()))
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (partition, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(worker_id = partition.worker_id, error = %e, "Worker task did not finish");
                    WorkerReport::lost(partition, started.elapsed(), format!("worker task failed: {}", e))
                },
            };
            reports.push(report);
        }

        let failed_workers = reports.iter().filter(|r| !r.success).count();
        if failed_workers > 0 {
            warn!(failed_workers, workers, "Some workers failed, reconciling anyway");
        }

        let (reconciliation, reconciliation_error) = match self.reconciler.reconcile().await {
            Ok(stats) => (Some(stats), None),
            Err(e) => {
                error!(error = %e, "Reconciliation failed");
                (None, Some(e.to_string()))
            },
        };

        let summary = RunSummary {
            run_id,
            seed,
            total_requested: total,
            worker_count: workers,
            entities_generated: reports.iter().map(|r| r.entities_generated).sum(),
            items_generated: reports.iter().map(|r| r.items_generated).sum(),
            failed_workers,
            duration_ms: duration_ms(started.elapsed()),
            workers: reports,
            reconciliation,
            reconciliation_error,
        };

        info!(
            %run_id,
            entities = summary.entities_generated,
            items = summary.items_generated,
            failed_workers = summary.failed_workers,
            duration_ms = summary.duration_ms,
            "Ingestion run finished"
        );

        Ok(summary)
    }

    /// Reconciliation without ingestion
    pub async fn reconcile_only(&self) -> Result<ReconciliationStats, IngestError> {
        Ok(self.reconciler.reconcile().await?)
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}
