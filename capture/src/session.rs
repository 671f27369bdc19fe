//! Process bootstrap: load configuration, take the device lock, run the
//! capture session with optional upload workers, and shut down in order
//! (scheduler, then uploads, then the lock).

use crate::cli::{Cli, Command, EXIT_FAILURE, EXIT_IN_USE, EXIT_OK, SyncBacklogArgs};
use crate::config::{CaptureConfig, ConfigLoader};
use crate::intake::PipelineSink;
use crate::logging;
use crate::source::CommandCapture;
use crate::storage;
use anyhow::{Context, bail};
use cinepi_async_utils::{Bounded, deadline_or_cancel};
use cinepi_audit::SqliteAuditLog;
use cinepi_lock::{LockHandle, LockManager, lock_path_for};
use cinepi_protocol::{AuditKind, AuditOutcome, MemoryAuditSink};
use cinepi_scheduler::{ArtifactSink, DiscardSink, IntervalScheduler, SessionReport};
use cinepi_sync::{BacklogReport, HttpBackend, SyncPipeline, SyncStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Entry point shared by `main`. Returns the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut config = ConfigLoader::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_overrides(&mut config)
        .context("invalid command-line options")?;

    let mut log_settings = config.logging.clone();
    if cli.dry_run {
        log_settings.file_logging = false;
    }
    let _log_guard = logging::init_logging(&log_settings, cli.verbose)?;

    match &cli.command {
        Some(Command::LockStatus) => lock_status(&config),
        Some(Command::SyncBacklog(args)) => sync_backlog(&config, args).await,
        None if cli.dry_run => Ok(dry_run(&config)),
        None => run_session(&config).await,
    }
}

fn dry_run(config: &CaptureConfig) -> u8 {
    let t = &config.timelapse;
    let duration = match t.duration_seconds {
        0 => "until stopped".to_string(),
        secs => format!("{secs}s"),
    };
    let sync = if config.sync.enabled {
        format!("{} (bucket {})", config.sync.backend_url, config.sync.bucket)
    } else {
        "disabled".to_string()
    };
    println!("Configuration OK (dry run, nothing captured)");
    println!("  interval:        {}s", t.interval_seconds);
    println!("  duration:        {duration}");
    println!("  output:          {}", t.output_dir.display());
    println!(
        "  lock:            {}",
        lock_path_for(&config.lock.lock_dir, &config.lock.resource_id).display()
    );
    println!("  capture command: {}", config.capture.command.join(" "));
    println!("  sync:            {sync}");
    EXIT_OK
}

async fn run_session(config: &CaptureConfig) -> anyhow::Result<u8> {
    let output_dir = &config.timelapse.output_dir;
    storage::ensure_writable(output_dir)?;
    let free_mb = storage::check_free_space(output_dir, config.timelapse.min_free_space_mb)?;
    tracing::info!(output_dir = %output_dir.display(), free_mb, "Output directory ready");

    let audit = Arc::new(
        SqliteAuditLog::open(&config.logging.audit_db).context("failed to open audit ledger")?,
    );
    let locks = LockManager::new(&config.lock.lock_dir, audit.clone())
        .with_poll_interval(Duration::from_millis(config.lock.poll_interval_ms));
    let handle = match locks
        .acquire(&config.lock.resource_id, Duration::from_millis(config.lock.acquire_timeout_ms))
        .await
    {
        Ok(handle) => handle,
        Err(e) if e.is_in_use() => {
            tracing::error!(resource = %config.lock.resource_id, error = %e, "Capture device unavailable");
            eprintln!("{e}");
            return Ok(EXIT_IN_USE);
        }
        Err(e) => return Err(e).context("failed to acquire device lock"),
    };

    let signals = StopSignals::new();
    spawn_signal_listener(signals.clone());

    let uploads = if config.sync.enabled {
        match UploadWorkers::start(config, audit.clone()) {
            Ok(workers) => Some(workers),
            Err(e) => {
                release_lock(&locks, handle);
                return Err(e);
            }
        }
    } else {
        None
    };
    let sink: Arc<dyn ArtifactSink> = match &uploads {
        Some(workers) => Arc::new(PipelineSink::new(workers.pipeline.clone())),
        None => Arc::new(DiscardSink),
    };

    let outcome = match IntervalScheduler::new(
        config.scheduler_config(),
        Arc::new(CommandCapture::from_config(config)),
        audit.clone(),
    ) {
        Ok(scheduler) => scheduler.with_sink(sink).run(&handle, signals.stop.clone()).await,
        Err(e) => Err(e),
    };

    let drain = Duration::from_secs(config.sync.drain_timeout_seconds);
    let upload_status = match uploads {
        Some(workers) => {
            let pipeline = workers.pipeline.clone();
            let status = workers.shutdown(drain, &signals.force).await;
            pipeline.flush_audit(drain, &signals.force).await;
            Some(status)
        }
        None => None,
    };

    release_lock(&locks, handle);

    log_audit_summary(&audit);
    let report = outcome.context("capture session could not run")?;
    print_session_summary(&report, upload_status.as_ref());
    Ok(if report.is_success() { EXIT_OK } else { EXIT_FAILURE })
}

fn lock_status(config: &CaptureConfig) -> anyhow::Result<u8> {
    // Status queries never take the lock, so nothing worth auditing.
    let locks = LockManager::new(&config.lock.lock_dir, Arc::new(MemoryAuditSink::new()));
    let resource = &config.lock.resource_id;
    let status = locks
        .is_held(resource)
        .with_context(|| format!("failed to inspect lock for {resource}"))?;
    match status.holder.filter(|_| status.held) {
        Some(holder) => {
            println!("{resource}: held by {}", holder.display_summary());
            Ok(EXIT_IN_USE)
        }
        None => {
            println!("{resource}: free");
            Ok(EXIT_OK)
        }
    }
}

async fn sync_backlog(config: &CaptureConfig, args: &SyncBacklogArgs) -> anyhow::Result<u8> {
    if config.sync.backend_url.trim().is_empty() {
        bail!("sync.backend_url is not configured");
    }
    let dir = args.dir.as_ref().unwrap_or(&config.timelapse.output_dir);

    let audit = Arc::new(
        SqliteAuditLog::open(&config.logging.audit_db).context("failed to open audit ledger")?,
    );
    let backend = HttpBackend::new(config.http_backend_config()).context("failed to build sync backend")?;
    let pipeline = SyncPipeline::new(config.pipeline_config(), Arc::new(backend), audit.clone())
        .context("failed to build sync pipeline")?;

    let paths = pipeline
        .scan_backlog(dir, &config.timelapse.image_format)
        .await
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    if paths.is_empty() {
        println!("Nothing to sync in {}", dir.display());
        return Ok(EXIT_OK);
    }

    let signals = StopSignals::new();
    spawn_signal_listener(signals.clone());
    let concurrency = args.concurrency.unwrap_or(config.sync.workers);
    let report = pipeline.sync_backlog(paths, concurrency, &signals.stop).await;
    pipeline
        .flush_audit(Duration::from_secs(config.sync.drain_timeout_seconds), &signals.force)
        .await;

    log_audit_summary(&audit);
    print_backlog_summary(&report);
    let clean = report.failed == 0
        && report.failed_local == 0
        && report.aborted == 0
        && report.deferred == 0
        && !report.cancelled;
    Ok(if clean { EXIT_OK } else { EXIT_FAILURE })
}

/// Give the device lock back. Returns false, after logging, if the marker
/// could not be removed cleanly.
fn release_lock(locks: &LockManager, handle: LockHandle) -> bool {
    let resource = handle.resource_id().to_string();
    match locks.release(handle) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(resource = %resource, error = %e, "Failed to release device lock cleanly");
            false
        }
    }
}

/// Upload pool running alongside a capture session.
struct UploadWorkers {
    pipeline: SyncPipeline,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UploadWorkers {
    fn start(config: &CaptureConfig, ledger: Arc<SqliteAuditLog>) -> anyhow::Result<Self> {
        let backend = HttpBackend::new(config.http_backend_config()).context("failed to build sync backend")?;
        let pipeline = SyncPipeline::new(config.pipeline_config(), Arc::new(backend), ledger)
            .context("failed to build sync pipeline")?;
        Ok(Self::spawn(pipeline, config.sync.workers))
    }

    fn spawn(pipeline: SyncPipeline, workers: usize) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run_workers(workers, cancel).await }
        });
        Self {
            pipeline,
            cancel,
            task,
        }
    }

    /// Give queued uploads up to `drain` to finish, then stop the workers.
    /// Once `force` fires, in-flight uploads are abandoned as well.
    async fn shutdown(self, drain: Duration, force: &CancellationToken) -> SyncStatus {
        let outcome = deadline_or_cancel(self.pipeline.wait_idle(), drain, force).await;
        if !matches!(outcome, Bounded::Completed(())) {
            let status = self.pipeline.status();
            tracing::warn!(
                pending = status.pending,
                in_flight = status.in_flight,
                drain_secs = drain.as_secs(),
                forced = force.is_cancelled(),
                "Upload drain cut short; remaining frames left for backlog sync"
            );
        }
        self.cancel.cancel();
        if force.is_cancelled() {
            self.task.abort();
        }
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Upload worker pool panicked");
        }
        self.pipeline.status()
    }
}

/// Escalating stop requests: the first asks for an orderly stop, the
/// second skips whatever draining is left.
#[derive(Clone, Default)]
struct StopSignals {
    stop: CancellationToken,
    force: CancellationToken,
}

impl StopSignals {
    fn new() -> Self {
        Self::default()
    }

    /// Record one more stop request. Returns true once draining is skipped.
    fn escalate(&self) -> bool {
        if self.stop.is_cancelled() {
            self.force.cancel();
            true
        } else {
            self.stop.cancel();
            false
        }
    }
}

fn spawn_signal_listener(signals: StopSignals) {
    tokio::spawn(async move {
        loop {
            shutdown_signal().await;
            if signals.escalate() {
                tracing::warn!("Second stop request; skipping the upload drain");
                break;
            }
            tracing::info!("Stop requested; send again to skip the upload drain");
        }
    });
}

/// Log the ledger totals once a run is over.
fn log_audit_summary(audit: &SqliteAuditLog) {
    match audit.summary() {
        Ok(summary) => tracing::info!(
            records = summary.total,
            uploads_ok = summary.count(AuditKind::UploadAttempt, AuditOutcome::Success),
            upload_failures = summary.count(AuditKind::UploadAttempt, AuditOutcome::Failure),
            capture_failures = summary.count(AuditKind::CaptureFailed, AuditOutcome::Failure),
            clock_jumps = summary.count(AuditKind::ClockJump, AuditOutcome::Info),
            "Audit ledger totals"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to summarize audit ledger"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; only Ctrl-C stops the session");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_session_summary(report: &SessionReport, uploads: Option<&SyncStatus>) {
    let timing = &report.timing;
    println!("Session {} {}", report.session_id, report.status.as_str());
    println!(
        "  captures: {} ok, {} failed ({} ticks, {} expected)",
        report.captures_ok, report.capture_failures, report.ticks, report.expected_ticks
    );
    println!(
        "  timing:   {} clock jumps, {} skipped slots, max drift {}ms",
        timing.clock_jumps, timing.skipped_slots, timing.max_abs_drift_ms
    );
    if let Some(status) = uploads {
        println!(
            "  uploads:  {} succeeded, {} failed, {} left for backlog",
            status.succeeded,
            status.failed,
            status.pending + status.in_flight + status.cancelled
        );
    }
    if let Some(reason) = &report.stop_reason {
        println!("  stopped:  {reason}");
    }
    if let Some(error) = &report.error {
        println!("  error:    {error}");
    }
}

fn print_backlog_summary(report: &BacklogReport) {
    println!(
        "Backlog: {} files in {} chunks: {} uploaded, {} already synced, {} failed ({} unreadable)",
        report.total,
        report.chunks_run,
        report.uploaded,
        report.deduplicated,
        report.failed + report.failed_local,
        report.failed_local
    );
    if report.aborted > 0 || report.deferred > 0 {
        println!(
            "  fail-fast: {} aborted, {} deferred{}",
            report.aborted,
            report.deferred,
            if report.systemic_failure { " (systemic failure)" } else { "" }
        );
    }
    if report.cancelled {
        println!("  cancelled before completion ({} left for the next run)", report.cancelled_items);
    }
}
