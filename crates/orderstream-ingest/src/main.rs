//! Orderstream Ingest - parallel synthetic order ingestion

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use orderstream_common::logging::{init_logging, LogConfig};
use orderstream_ingest::config::IngestConfig;
use orderstream_ingest::db::{create_pool, DbConfig};
use orderstream_ingest::orchestrator::{ParallelOrchestrator, RunSummary};
use orderstream_ingest::reconcile::ReconciliationStats;
use orderstream_ingest::store::memory::MemoryStore;
use orderstream_ingest::store::postgres::PgStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "orderstream-ingest")]
#[command(author, version, about = "Parallel synthetic order ingestion with reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store to ingest into
    #[arg(long, value_enum, default_value_t = StoreKind::Postgres, global = true)]
    store: StoreKind,

    /// Customers to seed the in-memory store with
    #[arg(long, default_value_t = 20_000, global = true)]
    customers: u64,

    /// Summary format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    output: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest with a single worker over every customer
    Single {
        /// Orders to generate (defaults to INGEST_TOTAL_ENTITIES)
        count: Option<u64>,
    },

    /// Ingest with several concurrent workers
    Parallel {
        /// Orders to generate across all workers (defaults to INGEST_TOTAL_ENTITIES)
        total: Option<u64>,

        /// Worker count (defaults to INGEST_WORKER_COUNT)
        workers: Option<usize>,
    },

    /// Only run reconciliation
    Reconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Environment variables take precedence over flags
    let log_config = LogConfig::for_binary("orderstream-ingest")
        .verbose(cli.verbose)
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Invalid ingestion configuration")?;

    let workers = match &cli.command {
        Command::Single { .. } | Command::Reconcile => 1,
        Command::Parallel { workers, .. } => workers.unwrap_or(config.worker_count),
    };

    let orchestrator = build_orchestrator(&cli, config.clone(), workers).await?;

    let code = match cli.command {
        Command::Single { count } => {
            let count = count.unwrap_or(config.total_entities);
            info!(count, "Single-worker ingestion");
            let summary = orchestrator.run_single(count).await?;
            print_summary(&summary, cli.output)?;
            summary.exit_code()
        },
        Command::Parallel { total, .. } => {
            let total = total.unwrap_or(config.total_entities);
            info!(total, workers, "Parallel ingestion");
            let summary = orchestrator.run(total, workers).await?;
            print_summary(&summary, cli.output)?;
            summary.exit_code()
        },
        Command::Reconcile => {
            let stats = orchestrator.reconcile_only().await?;
            print_reconciliation(&stats, cli.output)?;
            0
        },
    };

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn build_orchestrator(
    cli: &Cli,
    config: IngestConfig,
    workers: usize,
) -> Result<ParallelOrchestrator> {
    let orchestrator = match cli.store {
        StoreKind::Postgres => {
            let db_config = DbConfig::from_env()?.sized_for_workers(workers);
            let pool = create_pool(&db_config).await?;
            let store = Arc::new(PgStore::new(pool, config.targets.clone(), config.flush_latency()));
            store.ensure_channel_table().await?;
            ParallelOrchestrator::new(config, store.clone(), store.clone(), store)
        },
        StoreKind::Memory => {
            info!(customers = cli.customers, "Using in-memory store");
            let store = Arc::new(MemoryStore::with_customers(cli.customers, config.seed.unwrap_or(0)));
            ParallelOrchestrator::new(config, store.clone(), store.clone(), store)
        },
    };

    Ok(orchestrator)
}

fn print_summary(summary: &RunSummary, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Run {} (seed {})", summary.run_id, summary.seed);
    println!(
        "  {} of {} orders generated with {} items in {} ms",
        summary.entities_generated,
        summary.total_requested,
        summary.items_generated,
        summary.duration_ms
    );
    for worker in &summary.workers {
        let status = if worker.success { "ok" } else { "FAILED" };
        println!(
            "  worker {:>3} customers {:<15} {:>10} orders {:>8} ms  {}",
            worker.worker_id,
            worker.partition.customers.to_string(),
            worker.entities_generated,
            worker.duration_ms,
            status
        );
        if let (Some(order), Some(item)) = (&worker.last_order_offset, &worker.last_item_offset) {
            println!("      committed through {} / {}", order, item);
        }
        if let Some(error) = &worker.error {
            println!("      {}", error);
        }
    }
    match (&summary.reconciliation, &summary.reconciliation_error) {
        (Some(stats), _) => print_reconciliation(stats, OutputFormat::Text)?,
        (None, Some(error)) => println!("Reconciliation failed: {}", error),
        (None, None) => {},
    }
    Ok(())
}

fn print_reconciliation(stats: &ReconciliationStats, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("Reconciliation");
    println!("  orphaned orders deleted:  {}", stats.orphaned_orders_deleted);
    println!("  orphaned items deleted:   {}", stats.orphaned_items_deleted);
    println!(
        "  duplicate orders deleted: {} of {}",
        stats.duplicate_orders_deleted, stats.duplicate_orders_found
    );
    println!(
        "  final counts: {} orders, {} items",
        stats.final_orders_count, stats.final_items_count
    );
    Ok(())
}
