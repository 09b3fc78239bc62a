use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use boardroom::config::{DedupConfig, LifecycleConfig, ScanConfig, WorkerConfig};
use boardroom::jobs::scheduler::spawn_scan_scheduler;
use boardroom::jobs::{JobQueue, Poller};
use boardroom::llm::{AnthropicFactory, LlmConfig};
use boardroom::movements::{EvidenceFeed, JsonFileFeed, StaticFeed};
use boardroom::pipelines::PipelineRegistry;
use boardroom::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing();

    let worker_config = WorkerConfig::from_env()?;
    let llm_config = LlmConfig::from_env()?;
    let lifecycle_config = LifecycleConfig::from_env()?;
    let dedup_config = DedupConfig::from_env()?;
    let scan_config = ScanConfig::from_env()?;

    eprintln!("🏛  Boardroom worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", worker_config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&worker_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open database at {}",
                    worker_config.db_path.display()
                )
            })?,
    );

    if let Some(api_key) = &llm_config.api_key {
        db.upsert_credential(&scan_config.owner_ref, api_key)
            .await
            .context("failed to store credential")?;
        eprintln!("   Credential: seeded for owner '{}'", scan_config.owner_ref);
    }

    // ── Pipelines ────────────────────────────────────────────────────────
    let feed: Arc<dyn EvidenceFeed> = match &scan_config.feed_path {
        Some(path) => {
            eprintln!("   Evidence feed: {}", path.display());
            Arc::new(JsonFileFeed::new(path))
        }
        None => {
            eprintln!("   Evidence feed: none (scans ingest nothing)");
            Arc::new(StaticFeed::empty())
        }
    };
    let registry = PipelineRegistry::standard(
        Arc::clone(&db),
        feed,
        &scan_config,
        &lifecycle_config,
        &dedup_config,
    );
    let providers = Arc::new(AnthropicFactory::new(llm_config)?);

    // ── Scan scheduler ───────────────────────────────────────────────────
    let scheduler = match &scan_config.schedule {
        Some(schedule) => {
            eprintln!("   Scan schedule: {schedule}");
            Some(spawn_scan_scheduler(
                JobQueue::new(Arc::clone(&db)),
                schedule,
                scan_config.owner_ref.clone(),
            )?)
        }
        None => {
            eprintln!("   Scan schedule: disabled");
            None
        }
    };

    // ── Poller ───────────────────────────────────────────────────────────
    let poller = Poller::new(Arc::clone(&db), registry, providers, worker_config);
    eprintln!("   Job types: {:?}\n", poller.job_types());
    let (poller_handle, poller_shutdown) = poller.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested, finishing current job");

    poller_shutdown.store(true, Ordering::SeqCst);
    if let Some((handle, shutdown)) = scheduler {
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
    }
    poller_handle.await.context("poller task panicked")?;

    tracing::info!("Worker stopped");
    Ok(())
}

/// Console logging, plus a daily rolling file when `BOARDROOM_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("BOARDROOM_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "boardroom.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter())
                .with(console)
                .init();
            None
        }
    }
}
