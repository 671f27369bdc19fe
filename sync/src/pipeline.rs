//! Upload intake queue, worker pool, and chunked backlog runs.
//!
//! Every attempt is appended to the audit ledger before the task's status
//! moves, and the ledger is consulted by content hash before any upload,
//! so a crash between "uploaded" and "marked succeeded" never leads to a
//! second upload of the same bytes.

use crate::backend::{RemoteBackend, UploadRequest};
use crate::error::{ErrorClass, RetryClassifiable, SyncError, UploadError};
use crate::hash::content_hash;
use crate::key::remote_key_for;
use crate::policy::RetryPolicy;
use chrono::{DateTime, Utc};
use cinepi_async_utils::{Bounded, OrCancelExt, deadline_or_cancel, sleep_or_cancel};
use cinepi_protocol::{
    ArtifactRef, AuditKind, AuditOutcome, AuditRecord, TaskId, UploadLedger, UploadStatus,
    UploadTask,
};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;


#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub policy: RetryPolicy,
    /// Intake queue bound; a full queue pushes back on producers.
    pub queue_capacity: usize,
    pub attempt_timeout: Duration,
    pub key_prefix: Option<String>,
    /// Also send audit records to the backend after the local append.
    pub forward_audit: bool,
    /// Finished tasks (any terminal status) kept for inspection and replay
    /// before being folded into the counters.
    pub retain_finished: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            queue_capacity: 256,
            attempt_timeout: Duration::from_secs(30),
            key_prefix: None,
            forward_audit: true,
            retain_finished: 1024,
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SyncStatus {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// Totals for one [`SyncPipeline::sync_backlog`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BacklogReport {
    pub total: usize,
    pub chunks_run: usize,
    pub uploaded: usize,
    pub deduplicated: usize,
    /// Remote or exhausted-retry failures; these feed the fail-fast ratio.
    pub failed: usize,
    /// Artifacts that could not be read locally.
    pub failed_local: usize,
    /// Items skipped after their chunk tripped fail-fast.
    pub aborted: usize,
    /// Items left unattempted or abandoned mid-retry by cancellation.
    pub cancelled_items: usize,
    /// Items in chunks never started.
    pub deferred: usize,
    pub systemic_failure: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AttemptOutcome {
    Uploaded,
    Deduplicated,
    Retry(Duration),
    Failed(ErrorClass),
    Cancelled,
    /// Skipped because its chunk already tripped fail-fast.
    Aborted,
    /// Task missing or no longer pending.
    Stale,
}

struct Entry {
    task: UploadTask,
    captured_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    tasks: BTreeMap<TaskId, Entry>,
    /// Terminal tasks, oldest first.
    finished: VecDeque<TaskId>,
    evicted: SyncStatus,
}

impl Registry {
    /// Queue a task that just reached a terminal status for eventual
    /// eviction, dropping the oldest finished tasks past `retain`.
    fn retire(&mut self, id: TaskId, retain: usize) {
        self.finished.retain(|queued| *queued != id);
        self.finished.push_back(id);
        while self.finished.len() > retain {
            let Some(old) = self.finished.pop_front() else {
                break;
            };
            let Some(entry) = self.tasks.remove(&old) else {
                continue;
            };
            match entry.task.status {
                UploadStatus::Succeeded => self.evicted.succeeded += 1,
                UploadStatus::Failed => self.evicted.failed += 1,
                UploadStatus::Cancelled => self.evicted.cancelled += 1,
                UploadStatus::Pending | UploadStatus::InFlight => {
                    self.tasks.insert(old, entry);
                }
            }
        }
    }
}

struct Inner {
    config: PipelineConfig,
    backend: Arc<dyn RemoteBackend>,
    ledger: Arc<dyn UploadLedger>,
    tx: mpsc::Sender<TaskId>,
    rx: tokio::sync::Mutex<mpsc::Receiver<TaskId>>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    idle: Notify,
    /// Audit forwards still talking to the backend.
    forwards: TaskTracker,
}

/// Cheap to clone; clones share the queue and the task registry.
#[derive(Clone)]
pub struct SyncPipeline {
    inner: Arc<Inner>,
}

impl SyncPipeline {
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn RemoteBackend>,
        ledger: Arc<dyn UploadLedger>,
    ) -> Result<Self, SyncError> {
        config.policy.validate()?;
        if config.queue_capacity == 0 {
            return Err(SyncError::InvalidPolicy("queue_capacity must be at least 1".into()));
        }
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backend,
                ledger,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                idle: Notify::new(),
                forwards: TaskTracker::new(),
            }),
        })
    }

    /// Queue `path` for upload, waiting for room if the queue is full.
    pub async fn enqueue(&self, path: impl Into<PathBuf>) -> Result<UploadTask, SyncError> {
        let path = path.into();
        let permit = self.inner.tx.reserve().await.map_err(|_| SyncError::QueueClosed)?;
        let (size, captured_at) = file_facts(&path).await;
        let task = self.register(path, size, captured_at);
        permit.send(task.id);
        Ok(task)
    }

    /// Queue a fresh capture without waiting. A full queue is reported as
    /// [`SyncError::QueueFull`]; the file stays on disk for a backlog run.
    pub fn try_enqueue(&self, artifact: &ArtifactRef) -> Result<UploadTask, SyncError> {
        let permit = self.inner.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => SyncError::QueueFull,
            mpsc::error::TrySendError::Closed(()) => SyncError::QueueClosed,
        })?;
        let task = self.register(
            artifact.path.clone(),
            artifact.size_bytes.unwrap_or_default(),
            artifact.captured_at,
        );
        permit.send(task.id);
        Ok(task)
    }

    pub fn status(&self) -> SyncStatus {
        let registry = self.registry();
        let mut status = registry.evicted;
        for entry in registry.tasks.values() {
            match entry.task.status {
                UploadStatus::Pending => status.pending += 1,
                UploadStatus::InFlight => status.in_flight += 1,
                UploadStatus::Succeeded => status.succeeded += 1,
                UploadStatus::Failed => status.failed += 1,
                UploadStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    pub fn task(&self, id: TaskId) -> Option<UploadTask> {
        self.registry().tasks.get(&id).map(|e| e.task.clone())
    }

    /// Tasks that ended `Failed`; kept for inspection and manual replay.
    pub fn failed_tasks(&self) -> Vec<UploadTask> {
        self.registry()
            .tasks
            .values()
            .filter(|e| e.task.status == UploadStatus::Failed)
            .map(|e| e.task.clone())
            .collect()
    }

    /// Put a failed or cancelled task back on the queue with a fresh
    /// attempt budget.
    pub async fn replay(&self, id: TaskId) -> Result<UploadTask, SyncError> {
        {
            let registry = self.registry();
            let entry = registry.tasks.get(&id).ok_or(SyncError::UnknownTask(id))?;
            if !matches!(entry.task.status, UploadStatus::Failed | UploadStatus::Cancelled) {
                return Err(SyncError::NotReplayable {
                    id,
                    status: entry.task.status,
                });
            }
        }
        let permit = self.inner.tx.reserve().await.map_err(|_| SyncError::QueueClosed)?;
        self.registry().finished.retain(|queued| *queued != id);
        let task = self
            .update(id, |entry| {
                entry.task.attempt = 0;
                entry.task.status = UploadStatus::Pending;
                entry.task.last_error = None;
                entry.task.clone()
            })
            .ok_or(SyncError::UnknownTask(id))?;
        permit.send(id);
        tracing::info!(task = %id, path = %task.artifact_path.display(), "Upload task replayed");
        Ok(task)
    }

    /// Resolves once nothing is pending or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.status().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drain the intake queue with `concurrency` workers until `cancel`
    /// fires. In-flight attempts finish (bounded by the attempt timeout);
    /// tasks still pending afterwards are marked cancelled.
    pub async fn run_workers(&self, concurrency: usize, cancel: CancellationToken) {
        let concurrency = concurrency.max(1);
        tracing::info!(workers = concurrency, "Upload workers started");

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            let this = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { this.worker_loop(worker, cancel).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Upload worker panicked");
            }
        }

        let abandoned = self.cancel_pending();
        let status = self.status();
        tracing::info!(
            abandoned,
            succeeded = status.succeeded,
            failed = status.failed,
            "Upload workers stopped"
        );
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let next = async { self.inner.rx.lock().await.recv().await }
                .or_cancel(&cancel)
                .await;
            let Ok(Some(id)) = next else {
                break;
            };
            tracing::trace!(worker, task = %id, "Picked up upload task");
            if let AttemptOutcome::Retry(delay) = self.attempt(id).await {
                self.schedule_retry(id, delay, cancel.clone());
            }
        }
    }

    fn schedule_retry(&self, id: TaskId, delay: Duration, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            if sleep_or_cancel(delay, &cancel).await.is_err() {
                this.mark_cancelled(id);
                return;
            }
            if this.inner.tx.send(id).await.is_err() {
                this.mark_cancelled(id);
            }
        });
    }

    /// Upload a backlog in chunks of `policy.chunk_size`.
    ///
    /// Items inside a chunk run `concurrency` at a time, each through its
    /// full retry budget. Once a chunk's failure ratio passes the
    /// fail-fast threshold its unstarted items are cancelled, a
    /// `chunk_aborted` record is written, and later chunks are deferred.
    pub async fn sync_backlog(
        &self,
        paths: Vec<PathBuf>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> BacklogReport {
        let policy = self.inner.config.policy.clone();
        let started = Instant::now();
        let mut report = BacklogReport {
            total: paths.len(),
            ..BacklogReport::default()
        };
        tracing::info!(
            total = paths.len(),
            chunk_size = policy.chunk_size,
            "Backlog sync started"
        );

        let mut done = 0;
        for (index, chunk) in paths.chunks(policy.chunk_size).enumerate() {
            if index > 0 && sleep_or_cancel(policy.chunk_delay, cancel).await.is_err() {
                report.cancelled = true;
            }
            if report.cancelled || cancel.is_cancelled() {
                report.cancelled = true;
                report.deferred = paths.len() - done;
                break;
            }

            let aborted = self.run_chunk(index, chunk, concurrency, cancel, &mut report).await;
            report.chunks_run += 1;
            done += chunk.len();
            if aborted {
                report.systemic_failure = true;
                report.deferred = paths.len() - done;
                break;
            }
        }

        tracing::info!(
            uploaded = report.uploaded,
            deduplicated = report.deduplicated,
            failed = report.failed,
            failed_local = report.failed_local,
            aborted = report.aborted,
            cancelled = report.cancelled_items,
            deferred = report.deferred,
            systemic_failure = report.systemic_failure,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backlog sync finished"
        );
        report
    }

    /// Returns true when the chunk tripped fail-fast.
    async fn run_chunk(
        &self,
        index: usize,
        chunk: &[PathBuf],
        concurrency: usize,
        cancel: &CancellationToken,
        report: &mut BacklogReport,
    ) -> bool {
        let policy = &self.inner.config.policy;
        let started = Instant::now();
        let mut ids = Vec::with_capacity(chunk.len());
        for path in chunk {
            let (size, captured_at) = file_facts(path).await;
            ids.push(self.register(path.clone(), size, captured_at).id);
        }

        let abort = AtomicBool::new(false);
        let abort_flag = &abort;
        let mut results = futures::stream::iter(ids)
            .map(move |id| async move {
                if cancel.is_cancelled() {
                    self.mark_cancelled(id);
                    return AttemptOutcome::Cancelled;
                }
                if abort_flag.load(Ordering::SeqCst) {
                    self.mark_cancelled(id);
                    return AttemptOutcome::Aborted;
                }
                self.drive_to_completion(id, cancel).await
            })
            .buffer_unordered(concurrency.max(1));

        let mut failures = 0;
        while let Some(outcome) = results.next().await {
            match outcome {
                AttemptOutcome::Uploaded => report.uploaded += 1,
                AttemptOutcome::Deduplicated => report.deduplicated += 1,
                AttemptOutcome::Failed(ErrorClass::Local) => report.failed_local += 1,
                AttemptOutcome::Failed(_) => {
                    report.failed += 1;
                    failures += 1;
                }
                AttemptOutcome::Aborted => report.aborted += 1,
                AttemptOutcome::Cancelled => {
                    report.cancelled = true;
                    report.cancelled_items += 1;
                }
                AttemptOutcome::Retry(_) | AttemptOutcome::Stale => {}
            }

            if !abort.load(Ordering::SeqCst) && policy.chunk_should_abort(failures, chunk.len()) {
                abort.store(true, Ordering::SeqCst);
                tracing::warn!(
                    chunk = index,
                    failures,
                    chunk_len = chunk.len(),
                    threshold = policy.fail_fast_threshold,
                    "Failure rate over threshold; aborting chunk"
                );
                self.record(
                    AuditRecord::new(AuditKind::ChunkAborted, format!("chunk-{index}"), AuditOutcome::Failure)
                        .with_detail("failures", failures)
                        .with_detail("chunk_len", chunk.len())
                        .with_detail("threshold", policy.fail_fast_threshold),
                );
            }
        }

        tracing::debug!(
            chunk = index,
            len = chunk.len(),
            failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chunk finished"
        );
        abort.load(Ordering::SeqCst)
    }

    async fn drive_to_completion(&self, id: TaskId, cancel: &CancellationToken) -> AttemptOutcome {
        loop {
            if cancel.is_cancelled() {
                self.mark_cancelled(id);
                return AttemptOutcome::Cancelled;
            }
            match self.attempt(id).await {
                AttemptOutcome::Retry(delay) => {
                    if sleep_or_cancel(delay, cancel).await.is_err() {
                        self.mark_cancelled(id);
                        return AttemptOutcome::Cancelled;
                    }
                }
                outcome => return outcome,
            }
        }
    }

    /// List files under `dir` with extension `extension` that have no
    /// successful upload on record.
    pub async fn scan_backlog(&self, dir: &Path, extension: &str) -> Result<Vec<PathBuf>, SyncError> {
        let mut stack = vec![dir.to_path_buf()];
        let mut found = Vec::new();
        while let Some(current) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let matches = path
                    .extension()
                    .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(extension));
                if !file_type.is_file() || !matches {
                    continue;
                }
                let hash = content_hash(&tokio::fs::read(&path).await?);
                match self.inner.ledger.has_successful_upload(&hash) {
                    Ok(true) => {}
                    Ok(false) => found.push(path),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Ledger lookup failed; treating as not uploaded");
                        found.push(path);
                    }
                }
            }
        }
        found.sort();
        tracing::info!(dir = %dir.display(), backlog = found.len(), "Backlog scan complete");
        Ok(found)
    }

    /// One attempt for `id`. Only pending tasks are attempted.
    async fn attempt(&self, id: TaskId) -> AttemptOutcome {
        let Some((path, captured_at, attempt)) = self.update(id, |entry| {
            if entry.task.status != UploadStatus::Pending {
                return None;
            }
            entry.task.status = UploadStatus::InFlight;
            entry.task.attempt += 1;
            Some((entry.task.artifact_path.clone(), entry.captured_at, entry.task.attempt))
        })
        .flatten() else {
            return AttemptOutcome::Stale;
        };

        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) => {
                let err = UploadError::Fatal(format!("{}: {e}", path.display()));
                self.record(
                    AuditRecord::new(AuditKind::UploadAttempt, path.display().to_string(), AuditOutcome::Failure)
                        .with_detail("task_id", id.to_string())
                        .with_detail("attempt", attempt)
                        .with_detail("error_class", ErrorClass::Local.as_str())
                        .with_detail("error", err.to_string()),
                );
                return self.settle_failure(id, attempt, err);
            }
        };
        let hash = content_hash(&body);
        let size = body.len() as u64;
        self.update(id, |entry| {
            entry.task.content_hash = Some(hash.clone());
            entry.task.size_bytes = size;
        });

        match self.inner.ledger.has_successful_upload(&hash) {
            Ok(true) => return self.settle_duplicate(id, &hash, &path),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "Ledger lookup failed; relying on backend dedup");
            }
        }

        let key = remote_key_for(&path, self.inner.config.key_prefix.as_deref(), captured_at);
        let request = UploadRequest {
            key: key.key.clone(),
            body,
            content_hash: hash.clone(),
            captured_at,
            tag: key.tag,
        };

        let started = Instant::now();
        let timeout = self.inner.config.attempt_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.backend.upload(&request)).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::transient(format!(
                "attempt timed out after {}s",
                timeout.as_secs()
            ))),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let mut record = AuditRecord::new(AuditKind::UploadAttempt, hash.clone(), outcome)
            .with_detail("task_id", id.to_string())
            .with_detail("attempt", attempt)
            .with_detail("key", key.key)
            .with_detail("path", path.display().to_string())
            .with_detail("size_bytes", size)
            .with_detail("elapsed_ms", elapsed_ms);
        if let Err(err) = &result {
            record = record
                .with_detail("error_class", err.classify().as_str())
                .with_detail("error", err.to_string());
        }
        self.record(record);

        match result {
            Ok(()) => {
                tracing::debug!(task = %id, attempt, elapsed_ms, "Upload succeeded");
                self.settle_success(id, false);
                AttemptOutcome::Uploaded
            }
            Err(err) => self.settle_failure(id, attempt, err),
        }
    }

    fn settle_duplicate(&self, id: TaskId, hash: &str, path: &Path) -> AttemptOutcome {
        tracing::info!(task = %id, path = %path.display(), "Content already uploaded; skipping");
        self.record(
            AuditRecord::new(AuditKind::UploadSkipped, hash, AuditOutcome::Info)
                .with_detail("task_id", id.to_string())
                .with_detail("path", path.display().to_string())
                .with_detail("reason", "already_uploaded"),
        );
        self.settle_success(id, true);
        AttemptOutcome::Deduplicated
    }

    fn settle_success(&self, id: TaskId, deduplicated: bool) {
        self.finish(id, |entry| {
            entry.task.status = UploadStatus::Succeeded;
            entry.task.last_error = None;
            entry.task.deduplicated = deduplicated;
        });
    }

    fn settle_failure(&self, id: TaskId, attempt: u32, err: UploadError) -> AttemptOutcome {
        let policy = &self.inner.config.policy;
        let class = err.classify();
        let message = err.to_string();

        if class == ErrorClass::Retryable && policy.can_retry(attempt) {
            let delay = err
                .suggested_backoff()
                .map_or_else(|| policy.retry_delay(attempt), |d| d.min(policy.max_delay));
            self.update(id, |entry| {
                entry.task.status = UploadStatus::Pending;
                entry.task.last_error = Some(message.clone());
            });
            tracing::warn!(
                task = %id,
                attempt,
                max_attempts = policy.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "Upload attempt failed; retrying"
            );
            return AttemptOutcome::Retry(delay);
        }

        self.finish(id, |entry| {
            entry.task.status = UploadStatus::Failed;
            entry.task.last_error = Some(message.clone());
        });
        match class {
            ErrorClass::Local => {
                tracing::error!(task = %id, error = %message, "Artifact unreadable; upload abandoned");
            }
            _ => {
                tracing::warn!(
                    task = %id,
                    attempt,
                    error_class = class.as_str(),
                    error = %message,
                    "Upload failed permanently"
                );
            }
        }
        AttemptOutcome::Failed(class)
    }

    fn mark_cancelled(&self, id: TaskId) {
        self.finish(id, |entry| {
            if !entry.task.status.is_terminal() {
                entry.task.status = UploadStatus::Cancelled;
            }
        });
    }

    fn cancel_pending(&self) -> usize {
        let retain = self.inner.config.retain_finished;
        let mut cancelled = Vec::new();
        {
            let mut guard = self.registry();
            let registry = &mut *guard;
            for (id, entry) in registry.tasks.iter_mut() {
                if entry.task.status == UploadStatus::Pending {
                    entry.task.status = UploadStatus::Cancelled;
                    cancelled.push(*id);
                }
            }
            for id in &cancelled {
                registry.retire(*id, retain);
            }
        }
        self.inner.idle.notify_waiters();
        cancelled.len()
    }

    /// Apply a terminal transition and queue the task for eviction.
    fn finish(&self, id: TaskId, f: impl FnOnce(&mut Entry)) {
        let retain = self.inner.config.retain_finished;
        {
            let mut guard = self.registry();
            let registry = &mut *guard;
            if let Some(entry) = registry.tasks.get_mut(&id) {
                f(entry);
                if entry.task.status.is_terminal() {
                    registry.retire(id, retain);
                }
            }
        }
        self.inner.idle.notify_waiters();
    }

    /// Wait for audit forwards still in flight, up to `limit` or until
    /// `cancel` fires. Returns true once every forward has finished.
    pub async fn flush_audit(&self, limit: Duration, cancel: &CancellationToken) -> bool {
        let forwards = &self.inner.forwards;
        forwards.close();
        let outcome = deadline_or_cancel(forwards.wait(), limit, cancel).await;
        forwards.reopen();
        match outcome {
            Bounded::Completed(()) => true,
            Bounded::TimedOut | Bounded::Cancelled => {
                tracing::warn!(
                    pending = forwards.len(),
                    "Audit forwards still in flight; records kept in the local ledger only"
                );
                false
            }
        }
    }

    /// Append locally, then forward to the backend in the background;
    /// [`SyncPipeline::flush_audit`] waits for those forwards.
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.inner.ledger.append(&record) {
            tracing::error!(kind = record.kind.as_str(), error = %e, "Failed to append audit record");
        }
        if !self.inner.config.forward_audit {
            return;
        }
        let backend = Arc::clone(&self.inner.backend);
        self.inner.forwards.spawn(async move {
            if let Err(e) = backend.append_audit(&record).await {
                tracing::warn!(kind = record.kind.as_str(), error = %e, "Audit forward failed; kept locally");
            }
        });
    }

    fn register(&self, path: PathBuf, size: u64, captured_at: DateTime<Utc>) -> UploadTask {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let task = UploadTask::new(id, path, size);
        self.registry().tasks.insert(
            id,
            Entry {
                task: task.clone(),
                captured_at,
            },
        );
        tracing::debug!(task = %id, path = %task.artifact_path.display(), "Upload task queued");
        task
    }

    fn update<R>(&self, id: TaskId, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        self.registry().tasks.get_mut(&id).map(f)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn file_facts(path: &Path) -> (u64, DateTime<Utc>) {
    match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            (meta.len(), modified)
        }
        Err(_) => (0, Utc::now()),
    }
}
