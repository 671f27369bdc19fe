use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity written into the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// Process ID of the lock holder
    pub pid: u32,

    /// Hostname where the lock was acquired
    pub host: String,

    /// Username of the lock holder
    pub user: String,

    pub acquired_at: DateTime<Utc>,

    pub resource: String,

    /// Marker schema version (for forward compatibility)
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

pub(crate) fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_summary())
    }
}

impl LockHolder {
    /// Identity of the current process.
    pub fn current(resource: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            user: whoami::username(),
            acquired_at: Utc::now(),
            resource: resource.to_string(),
            schema_version: 1,
        }
    }

    /// Holder recovered from a bare-PID marker written by other tooling.
    pub(crate) fn from_pid(pid: u32, resource: &str) -> Self {
        Self {
            pid,
            host: current_host(),
            user: "unknown".to_string(),
            acquired_at: Utc::now(),
            resource: resource.to_string(),
            schema_version: 0,
        }
    }

    /// Holder id used as the audit subject.
    pub fn holder_id(&self) -> String {
        self.pid.to_string()
    }

    /// True when the recorded process is known to be gone.
    ///
    /// Markers from another host are never considered stale: their PIDs
    /// cannot be probed from here.
    pub fn is_stale(&self) -> bool {
        if self.host != current_host() {
            return false;
        }
        !is_process_running(self.pid)
    }

    /// Markers with full metadata come from [`LockHolder::current`], whose
    /// writer keeps the marker flocked for as long as it owns it. Bare-PID
    /// markers from other tooling carry no such promise.
    pub(crate) fn keeps_flock(&self) -> bool {
        self.schema_version >= 1 && self.host == current_host()
    }

    pub fn display_summary(&self) -> String {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        let age_str = if age.num_hours() > 0 {
            format!("{}h {}m ago", age.num_hours(), age.num_minutes() % 60)
        } else if age.num_minutes() > 0 {
            format!("{}m {}s ago", age.num_minutes(), age.num_seconds() % 60)
        } else {
            format!("{}s ago", age.num_seconds().max(0))
        };
        format!(
            "PID {} on {}@{} (acquired {age_str})",
            self.pid, self.user, self.host
        )
    }
}

/// Signal-zero liveness probe.
///
/// `EPERM` means the process exists but belongs to someone else, which
/// still counts as alive.
#[cfg(unix)]
pub(crate) fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn is_process_running(_pid: u32) -> bool {
    // No cheap probe here; never reclaim.
    true
}
