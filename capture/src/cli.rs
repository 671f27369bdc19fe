//! Command-line surface of `cinepi-capture`.

use crate::config::{CaptureConfig, ConfigError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Clean stop, or a dry run.
pub const EXIT_OK: u8 = 0;
/// Errored session, bad configuration, or a failed startup check.
pub const EXIT_FAILURE: u8 = 1;
/// The capture device is held by another process.
pub const EXIT_IN_USE: u8 = 3;

/// Interval still capture with exclusive device locking and remote sync.
#[derive(Debug, Parser)]
#[command(name = "cinepi-capture", version)]
pub struct Cli {
    /// Seconds between captures (1-3600).
    #[arg(short = 'i', long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Session length in seconds; 0 runs until stopped.
    #[arg(short = 'd', long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Directory frames are written to.
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Configuration file (YAML, TOML, or JSON).
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Validate configuration and exit without locking or capturing.
    #[arg(long)]
    pub dry_run: bool,

    /// Log drift and clock-jump events at debug level only.
    #[arg(long)]
    pub suppress_drift: bool,

    /// Keep frames local even if sync is enabled in the configuration.
    #[arg(long)]
    pub no_sync: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Report whether the capture device lock is held, and by whom.
    LockStatus,
    /// Upload frames in the output directory that were never synced.
    SyncBacklog(SyncBacklogArgs),
}

#[derive(Debug, Parser)]
pub struct SyncBacklogArgs {
    /// Directory to scan instead of the configured output directory.
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Concurrent uploads per chunk; defaults to `sync.workers`.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,
}

impl Cli {
    /// Apply flag overrides on top of the loaded configuration and
    /// re-check the result.
    pub fn apply_overrides(&self, config: &mut CaptureConfig) -> Result<(), ConfigError> {
        if let Some(interval) = self.interval {
            config.timelapse.interval_seconds = interval;
        }
        if let Some(duration) = self.duration {
            config.timelapse.duration_seconds = duration;
        }
        if let Some(dir) = &self.output_dir {
            config.timelapse.output_dir = dir.clone();
        }
        if self.suppress_drift {
            config.scheduler.suppress_drift_warnings = true;
        }
        if self.no_sync {
            config.sync.enabled = false;
        }
        config.validate_semantics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_override_configuration() {
        let cli = Cli::parse_from([
            "cinepi-capture",
            "-i",
            "10",
            "--duration",
            "30",
            "-o",
            "/tmp/frames",
            "--suppress-drift",
        ]);
        let mut config = CaptureConfig::default();
        cli.apply_overrides(&mut config).unwrap();
        assert_eq!(config.timelapse.interval_seconds, 10);
        assert_eq!(config.timelapse.duration_seconds, 30);
        assert_eq!(config.timelapse.output_dir, PathBuf::from("/tmp/frames"));
        assert!(config.scheduler.suppress_drift_warnings);
    }

    #[test]
    fn out_of_range_interval_override_is_rejected() {
        let cli = Cli::parse_from(["cinepi-capture", "--interval", "0"]);
        let mut config = CaptureConfig::default();
        assert!(cli.apply_overrides(&mut config).is_err());
    }

    #[test]
    fn no_sync_disables_configured_sync() {
        let cli = Cli::parse_from(["cinepi-capture", "--no-sync"]);
        let mut config = CaptureConfig::default();
        config.sync.enabled = true;
        config.sync.backend_url = "https://example.invalid".into();
        cli.apply_overrides(&mut config).unwrap();
        assert!(!config.sync.enabled);
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from(["cinepi-capture", "sync-backlog", "--concurrency", "4"]);
        match cli.command {
            Some(Command::SyncBacklog(args)) => assert_eq!(args.concurrency, Some(4)),
            other => panic!("unexpected command {other:?}"),
        }
        let cli = Cli::parse_from(["cinepi-capture", "lock-status"]);
        assert!(matches!(cli.command, Some(Command::LockStatus)));
    }
}
