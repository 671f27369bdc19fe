use crate::LockError;
use crate::holder::LockHolder;
use crate::marker::{self, MarkerContents};
use chrono::{DateTime, Utc};
use cinepi_protocol::{AuditKind, AuditOutcome, AuditRecord, AuditSink};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of a single contention probe.
enum Attempt {
    Acquired(LockHandle),
    /// A live holder (or a writer mid-flight, `None`) has the marker.
    Held(Option<LockHolder>),
    /// A stale or corrupt marker was removed, or vanished; probe again now.
    Reclaimed,
    /// Our freshly created marker was taken over before we could lock it.
    LostRace,
}

/// Answer to [`LockManager::is_held`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldStatus {
    pub held: bool,
    pub holder: Option<LockHolder>,
}

impl HeldStatus {
    pub fn holder_id(&self) -> Option<u32> {
        self.holder.as_ref().map(|h| h.pid)
    }
}

/// Grants and denies the exclusive device lock for this host.
pub struct LockManager {
    lock_dir: PathBuf,
    poll_interval: Duration,
    audit: Arc<dyn AuditSink>,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            audit,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn lock_path(&self, resource_id: &str) -> PathBuf {
        marker::lock_path_for(&self.lock_dir, resource_id)
    }

    /// Acquire `resource_id`, polling until `timeout` elapses.
    ///
    /// A zero timeout probes exactly once. When the wait runs out while a
    /// live peer holds the marker the error is `Busy`; `Timeout` means the
    /// wait ended without a conclusive observation.
    pub async fn acquire(&self, resource_id: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        if !marker::valid_resource_id(resource_id) {
            return Err(LockError::InvalidResource(resource_id.to_string()));
        }
        std::fs::create_dir_all(&self.lock_dir)?;
        let path = self.lock_path(resource_id);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_holder: Option<Option<LockHolder>> = None;

        loop {
            match self.probe(resource_id, &path)? {
                Attempt::Acquired(handle) => {
                    tracing::info!(
                        resource = resource_id,
                        pid = handle.holder_id(),
                        path = %path.display(),
                        "Lock acquired"
                    );
                    self.emit(
                        AuditRecord::new(
                            AuditKind::LockAcquired,
                            handle.holder.holder_id(),
                            AuditOutcome::Success,
                        )
                        .with_detail("resource", resource_id)
                        .with_detail("lock_path", path.display().to_string())
                        .with_detail("host", handle.holder.host.clone()),
                    );
                    return Ok(handle);
                }
                Attempt::Reclaimed => continue,
                Attempt::Held(holder) => last_holder = Some(holder),
                Attempt::LostRace => last_holder = None,
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                return Err(match last_holder {
                    Some(holder) => {
                        tracing::info!(
                            resource = resource_id,
                            holder = holder.as_ref().map(|h| h.pid),
                            "Lock busy"
                        );
                        let subject = holder
                            .as_ref()
                            .map_or_else(|| "unknown".to_string(), LockHolder::holder_id);
                        self.emit(
                            AuditRecord::new(AuditKind::LockBusy, subject, AuditOutcome::Failure)
                                .with_detail("resource", resource_id)
                                .with_detail("waited_ms", millis(waited)),
                        );
                        LockError::Busy {
                            resource: resource_id.to_string(),
                            holder,
                        }
                    }
                    None => {
                        self.emit(
                            AuditRecord::new(
                                AuditKind::LockTimeout,
                                std::process::id().to_string(),
                                AuditOutcome::Failure,
                            )
                            .with_detail("resource", resource_id)
                            .with_detail("waited_ms", millis(waited)),
                        );
                        LockError::Timeout {
                            resource: resource_id.to_string(),
                            waited,
                        }
                    }
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release a handle. Only the current owner may remove the marker.
    pub fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        handle.release()
    }

    /// Whether a live holder currently owns `resource_id`.
    ///
    /// Stale and unreadable markers report as not held; they are left in
    /// place for the next acquirer to reclaim.
    pub fn is_held(&self, resource_id: &str) -> Result<HeldStatus, LockError> {
        if !marker::valid_resource_id(resource_id) {
            return Err(LockError::InvalidResource(resource_id.to_string()));
        }
        let not_held = HeldStatus {
            held: false,
            holder: None,
        };
        let mut file = match File::open(self.lock_path(resource_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(not_held),
            Err(e) => return Err(LockError::Io(e)),
        };
        let status = match marker::read_from(&mut file, resource_id)? {
            MarkerContents::Holder(holder) if holder_is_live(&holder, &file) => HeldStatus {
                held: true,
                holder: Some(holder),
            },
            _ => not_held,
        };
        Ok(status)
    }

    fn probe(&self, resource_id: &str, path: &Path) -> Result<Attempt, LockError> {
        // Try to create the marker atomically (O_CREAT | O_EXCL)
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                if let Err(e) = file.try_lock_exclusive() {
                    if e.kind() == fs2::lock_contended_error().kind() {
                        return Ok(Attempt::LostRace);
                    }
                    let _ = std::fs::remove_file(path);
                    return Err(LockError::Io(e));
                }
                // A reclaimer may have unlinked our empty file before we
                // locked it; only the inode still at `path` counts.
                if !marker::same_file(&file, path)? {
                    return Ok(Attempt::LostRace);
                }
                let holder = LockHolder::current(resource_id);
                if let Err(e) = marker::write_marker(&mut file, &holder) {
                    let _ = std::fs::remove_file(path);
                    let _ = FileExt::unlock(&file);
                    return Err(LockError::Io(e));
                }
                Ok(Attempt::Acquired(LockHandle {
                    resource_id: resource_id.to_string(),
                    holder,
                    lock_path: path.to_path_buf(),
                    file: Some(file),
                    audit: Arc::clone(&self.audit),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.inspect_existing(resource_id, path)
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn inspect_existing(&self, resource_id: &str, path: &Path) -> Result<Attempt, LockError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Attempt::Reclaimed),
            Err(e) => return Err(LockError::Io(e)),
        };
        // Liveness is probed on every contested attempt, never cached.
        match marker::read_from(&mut file, resource_id)? {
            MarkerContents::Holder(holder) if holder_is_live(&holder, &file) => {
                Ok(Attempt::Held(Some(holder)))
            }
            MarkerContents::Holder(holder) => self.reclaim(&file, path, resource_id, Some(holder), None),
            MarkerContents::Corrupt(reason) => self.reclaim(&file, path, resource_id, None, Some(reason)),
        }
    }

    /// Remove a dead or unreadable marker. Exactly one reclaimer can win:
    /// the flock on the stale inode serialises them, and the inode check
    /// stops anyone from deleting a marker that was already replaced.
    fn reclaim(
        &self,
        file: &File,
        path: &Path,
        resource_id: &str,
        stale: Option<LockHolder>,
        corrupt_reason: Option<String>,
    ) -> Result<Attempt, LockError> {
        if file.try_lock_exclusive().is_err() {
            // Somebody still has it open and locked: a writer mid-flight.
            return Ok(Attempt::Held(stale));
        }
        if !marker::same_file(file, path)? {
            let _ = FileExt::unlock(file);
            return Ok(Attempt::Reclaimed);
        }
        let removed = match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        let _ = FileExt::unlock(file);
        removed?;

        match (stale, corrupt_reason) {
            (Some(holder), _) => {
                tracing::warn!(
                    resource = resource_id,
                    pid = holder.pid,
                    host = %holder.host,
                    "Removing stale lock left by a terminated holder"
                );
                self.emit(
                    AuditRecord::new(AuditKind::LockReclaimed, holder.holder_id(), AuditOutcome::Info)
                        .with_detail("resource", resource_id)
                        .with_detail("reclaimed_by", std::process::id())
                        .with_detail("stale_since", holder.acquired_at.to_rfc3339()),
                );
            }
            (None, reason) => {
                let reason = reason.unwrap_or_default();
                tracing::warn!(
                    resource = resource_id,
                    path = %path.display(),
                    reason = %reason,
                    "Removing unreadable lock marker"
                );
                self.emit(
                    AuditRecord::new(AuditKind::LockCorrupt, "unknown", AuditOutcome::Info)
                        .with_detail("resource", resource_id)
                        .with_detail("reason", reason),
                );
            }
        }
        Ok(Attempt::Reclaimed)
    }

    fn emit(&self, record: AuditRecord) {
        emit(self.audit.as_ref(), &record);
    }
}

fn emit(audit: &dyn AuditSink, record: &AuditRecord) {
    if let Err(e) = audit.append(record) {
        tracing::warn!(kind = record.kind.as_str(), error = %e, "Failed to append audit record");
    }
}

/// The holder's process must still run and, where the marker promises one,
/// still hold the flock. A recycled PID passes the first check only.
fn holder_is_live(holder: &LockHolder, file: &File) -> bool {
    if holder.is_stale() {
        return false;
    }
    if !holder.keeps_flock() {
        return true;
    }
    match file.try_lock_shared() {
        Ok(()) => {
            let _ = FileExt::unlock(file);
            false
        }
        Err(_) => true,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Ownership of the exclusive resource.
///
/// Dropping the handle releases the marker if this process still owns it,
/// so every exit path (including task cancellation) gives the lock back.
/// A crash skips this; the next acquirer's staleness check recovers.
pub struct LockHandle {
    resource_id: String,
    holder: LockHolder,
    lock_path: PathBuf,
    /// Kept open (and flocked) for as long as we own the marker.
    file: Option<File>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource_id", &self.resource_id)
            .field("holder", &self.holder)
            .field("lock_path", &self.lock_path)
            .field("released", &self.file.is_none())
            .finish()
    }
}

impl LockHandle {
    pub fn holder_id(&self) -> u32 {
        self.holder.pid
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.holder.acquired_at
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Re-check that the marker on disk is still ours.
    pub fn is_valid(&self) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        matches!(marker::same_file(file, &self.lock_path), Ok(true))
            && matches!(
                marker::read_marker(&self.lock_path, &self.resource_id),
                Ok(Some(MarkerContents::Holder(ref h))) if h.pid == self.holder.pid
            )
    }

    /// Remove the marker. Fails with `NotOwner` if it now belongs to someone else.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        if !marker::same_file(&file, &self.lock_path)? {
            let current = match marker::read_marker(&self.lock_path, &self.resource_id)? {
                Some(MarkerContents::Holder(h)) => h.display_summary(),
                Some(MarkerContents::Corrupt(_)) => "unreadable marker".to_string(),
                None => "none".to_string(),
            };
            return Err(LockError::NotOwner {
                resource: self.resource_id.clone(),
                current,
            });
        }

        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::Io(e)),
        }
        let _ = FileExt::unlock(&file);

        let held_ms = Utc::now()
            .signed_duration_since(self.holder.acquired_at)
            .num_milliseconds();
        tracing::info!(resource = %self.resource_id, pid = self.holder.pid, held_ms, "Lock released");
        emit(
            self.audit.as_ref(),
            &AuditRecord::new(
                AuditKind::LockReleased,
                self.holder.holder_id(),
                AuditOutcome::Success,
            )
            .with_detail("resource", self.resource_id.clone())
            .with_detail("held_ms", held_ms),
        );
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.file.is_some()
            && let Err(e) = self.release_inner()
        {
            tracing::warn!(resource = %self.resource_id, error = %e, "Lock release on drop failed");
        }
    }
}
