//! On-disk marker format and the low-level file checks behind it.

use crate::holder::LockHolder;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// What a marker file said when we read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MarkerContents {
    Holder(LockHolder),
    /// Empty or unparseable; possibly a writer mid-flight.
    Corrupt(String),
}

/// Marker path for `resource` under `lock_dir`.
pub fn lock_path_for(lock_dir: &Path, resource: &str) -> PathBuf {
    lock_dir.join(format!("cinepi-{resource}.lock"))
}

pub(crate) fn valid_resource_id(resource: &str) -> bool {
    !resource.is_empty()
        && resource.len() <= 64
        && resource
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !resource.starts_with('.')
}

pub(crate) fn render(holder: &LockHolder) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(holder)?;
    Ok(format!("{}\n{json}\n", holder.pid))
}

pub(crate) fn write_marker(file: &mut File, holder: &LockHolder) -> std::io::Result<()> {
    let text = render(holder).map_err(std::io::Error::other)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()
}

pub(crate) fn parse(text: &str, resource: &str) -> MarkerContents {
    let mut lines = text.lines();
    let Some(first) = lines.next().map(str::trim).filter(|l| !l.is_empty()) else {
        return MarkerContents::Corrupt("empty marker".to_string());
    };
    let Ok(pid) = first.parse::<u32>() else {
        return MarkerContents::Corrupt(format!("unparseable pid line {first:?}"));
    };

    let rest: String = lines.collect::<Vec<_>>().join("\n");
    if rest.trim().is_empty() {
        return MarkerContents::Holder(LockHolder::from_pid(pid, resource));
    }
    match serde_json::from_str::<LockHolder>(rest.trim()) {
        Ok(holder) if holder.pid == pid => MarkerContents::Holder(holder),
        Ok(holder) => MarkerContents::Corrupt(format!(
            "pid line {pid} disagrees with metadata pid {}",
            holder.pid
        )),
        // Metadata is advisory; the PID line alone is enough to probe.
        Err(_) => MarkerContents::Holder(LockHolder::from_pid(pid, resource)),
    }
}

pub(crate) fn read_from(file: &mut File, resource: &str) -> std::io::Result<MarkerContents> {
    let mut text = String::new();
    match file.read_to_string(&mut text) {
        Ok(_) => Ok(parse(&text, resource)),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            Ok(MarkerContents::Corrupt("marker is not valid UTF-8".to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Read the marker at `path`. `Ok(None)` when no marker exists.
pub(crate) fn read_marker(path: &Path, resource: &str) -> std::io::Result<Option<MarkerContents>> {
    match File::open(path) {
        Ok(mut file) => read_from(&mut file, resource).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// True when `path` still names the inode behind `file`.
#[cfg(unix)]
pub(crate) fn same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
pub(crate) fn same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rendered_marker_starts_with_plain_pid() {
        let holder = LockHolder::current("camera0");
        let text = render(&holder).unwrap();
        let first = text.lines().next().unwrap();
        assert_eq!(first, std::process::id().to_string());
        assert_eq!(parse(&text, "camera0"), MarkerContents::Holder(holder));
    }

    #[test]
    fn bare_pid_marker_is_accepted() {
        match parse("4242\n", "camera0") {
            MarkerContents::Holder(holder) => {
                assert_eq!(holder.pid, 4242);
                assert_eq!(holder.resource, "camera0");
            }
            other => panic!("expected holder, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(matches!(parse("", "c"), MarkerContents::Corrupt(_)));
        assert!(matches!(parse("not-a-pid\n", "c"), MarkerContents::Corrupt(_)));
    }

    #[test]
    fn resource_ids_are_restricted_to_file_safe_names() {
        assert!(valid_resource_id("camera0"));
        assert!(valid_resource_id("cam-0_a.b"));
        assert!(!valid_resource_id(""));
        assert!(!valid_resource_id("../etc/passwd"));
        assert!(!valid_resource_id(".hidden"));
    }
}
