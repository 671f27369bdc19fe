//! Cross-process exclusive lock for the capture device.
//!
//! ## Protocol
//! - One marker file per resource at `<lock_dir>/cinepi-<resource>.lock`,
//!   created with exclusive-create semantics. Whoever creates it owns the
//!   resource.
//! - The first line of the marker is the holder PID in plain text so shell
//!   tooling can read it; a JSON [`LockHolder`] follows on the next line.
//! - The owner keeps the marker open with an advisory `flock` for the
//!   lifetime of its [`LockHandle`]. The kernel drops that flock when the
//!   owner dies, including on `kill -9`.
//! - A marker whose PID is no longer running is stale. Reclaiming it
//!   requires taking the flock on the very inode the path still points at,
//!   so two reclaimers can never both delete and recreate.
//!
//! This is advisory locking: every participant must go through
//! [`LockManager`].
#![allow(clippy::result_large_err)]

mod holder;
mod manager;
mod marker;

pub use holder::LockHolder;
pub use manager::DEFAULT_ACQUIRE_TIMEOUT;
pub use manager::DEFAULT_POLL_INTERVAL;
pub use manager::HeldStatus;
pub use manager::LockHandle;
pub use manager::LockManager;
pub use marker::lock_path_for;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A live peer holds the resource.
    #[error("resource {resource} is in use by {}", holder_summary(.holder.as_ref()))]
    Busy {
        resource: String,
        holder: Option<LockHolder>,
    },

    /// The wait expired without a conclusive answer (lost reclamation races).
    #[error("timed out after {waited:?} waiting for resource {resource}")]
    Timeout { resource: String, waited: Duration },

    #[error("lock on {resource} is not owned by this handle (marker holder: {current})")]
    NotOwner { resource: String, current: String },

    #[error("invalid resource id {0:?}")]
    InvalidResource(String),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    /// Busy and Timeout are operator-recoverable ("resource in use").
    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Timeout { .. })
    }
}

fn holder_summary(holder: Option<&LockHolder>) -> String {
    holder.map_or_else(|| "an unknown holder".to_string(), LockHolder::display_summary)
}
