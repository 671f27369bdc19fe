//! Output directory checks run at startup and before each capture.

use std::io;
use std::path::{Path, PathBuf};

const PROBE_FILE: &str = ".cinepi_write_probe";
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("{path} is not writable: {source}")]
    NotWritable { path: PathBuf, source: io::Error },

    #[error("cannot query free space on {path}: {source}")]
    Query { path: PathBuf, source: io::Error },

    #[error("only {available_mb} MB free on {path}, need {required_mb} MB")]
    LowSpace {
        path: PathBuf,
        available_mb: u64,
        required_mb: u64,
    },
}

/// Create `dir` if needed and prove a file can be written into it.
pub fn ensure_writable(dir: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(dir).map_err(|source| StorageError::Create {
        path: dir.to_path_buf(),
        source,
    })?;
    let probe = dir.join(PROBE_FILE);
    std::fs::write(&probe, b"ok").map_err(|source| StorageError::NotWritable {
        path: dir.to_path_buf(),
        source,
    })?;
    // Leftover probe files are harmless.
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Free megabytes on the filesystem holding `dir`.
pub fn free_space_mb(dir: &Path) -> Result<u64, StorageError> {
    fs2::available_space(dir)
        .map(|bytes| bytes / BYTES_PER_MB)
        .map_err(|source| StorageError::Query {
            path: dir.to_path_buf(),
            source,
        })
}

/// Fails with [`StorageError::LowSpace`] below `required_mb`.
pub fn check_free_space(dir: &Path, required_mb: u64) -> Result<u64, StorageError> {
    let available_mb = free_space_mb(dir)?;
    if available_mb < required_mb {
        return Err(StorageError::LowSpace {
            path: dir.to_path_buf(),
            available_mb,
            required_mb,
        });
    }
    Ok(available_mb)
}
