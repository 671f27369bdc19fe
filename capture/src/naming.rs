//! Frame file naming and daily directories.

use crate::config::TimelapseConfig;
use chrono::{DateTime, Local};
use std::io;
use std::path::{Path, PathBuf};

const MAX_COLLISION_SUFFIX: u32 = 999;

#[derive(Debug, Clone)]
pub struct FrameNamer {
    output_dir: PathBuf,
    prefix: String,
    extension: String,
    add_timestamp: bool,
    daily_dirs: bool,
}

impl FrameNamer {
    pub fn from_config(config: &TimelapseConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            prefix: config.filename_prefix.clone(),
            extension: config.image_format.trim_start_matches('.').to_ascii_lowercase(),
            add_timestamp: config.add_timestamp,
            daily_dirs: config.create_daily_dirs,
        }
    }

    /// Directory frames captured at `at` go to, created if missing.
    pub fn directory_for(&self, at: DateTime<Local>) -> io::Result<PathBuf> {
        let dir = if self.daily_dirs {
            self.output_dir.join(at.format("%Y-%m-%d").to_string())
        } else {
            self.output_dir.clone()
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// A path that does not exist yet for frame `sequence`.
    ///
    /// Collisions get a `_NNN` suffix; past 999 of them the sub-second
    /// timestamp is appended instead.
    pub fn path_for(&self, sequence: u64, at: DateTime<Local>) -> io::Result<PathBuf> {
        let dir = self.directory_for(at)?;
        let stem = if self.add_timestamp {
            format!("{}_{}_{sequence:06}", self.prefix, at.format("%Y%m%d_%H%M%S_%3f"))
        } else {
            format!("{}_{sequence:06}", self.prefix)
        };

        let candidate = self.file(&dir, &stem);
        if !candidate.exists() {
            return Ok(candidate);
        }
        for n in 1..=MAX_COLLISION_SUFFIX {
            let candidate = self.file(&dir, &format!("{stem}_{n:03}"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        let micros = at.timestamp_micros();
        tracing::warn!(stem = %stem, "Filename collisions exhausted; using timestamp suffix");
        Ok(self.file(&dir, &format!("{stem}_{micros}")))
    }

    fn file(&self, dir: &Path, stem: &str) -> PathBuf {
        dir.join(format!("{stem}.{}", self.extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn namer(dir: &Path, add_timestamp: bool, daily_dirs: bool) -> FrameNamer {
        FrameNamer::from_config(&TimelapseConfig {
            output_dir: dir.to_path_buf(),
            add_timestamp,
            create_daily_dirs: daily_dirs,
            ..TimelapseConfig::default()
        })
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, 14, 30, 5).unwrap()
    }

    #[test]
    fn timestamped_name_in_daily_dir() {
        let dir = TempDir::new().unwrap();
        let path = namer(dir.path(), true, true).path_for(7, at()).unwrap();
        assert_eq!(
            path,
            dir.path().join("2025-06-01").join("timelapse_20250601_143005_000_000007.jpg")
        );
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn plain_sequence_name_without_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = namer(dir.path(), false, false).path_for(42, at()).unwrap();
        assert_eq!(path, dir.path().join("timelapse_000042.jpg"));
    }

    #[test]
    fn collisions_get_numbered_suffixes() {
        let dir = TempDir::new().unwrap();
        let namer = namer(dir.path(), false, false);
        std::fs::write(dir.path().join("timelapse_000001.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("timelapse_000001_001.jpg"), b"x").unwrap();

        let path = namer.path_for(1, at()).unwrap();
        assert_eq!(path, dir.path().join("timelapse_000001_002.jpg"));
    }
}
