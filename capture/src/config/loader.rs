use crate::config::error::{ConfigError, Result};
use cinepi_scheduler::{DriftLogPolicy, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS, SchedulerConfig};
use cinepi_sync::{HttpBackendConfig, PipelineConfig, RetryPolicy};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the capture process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub timelapse: TimelapseConfig,

    #[serde(default)]
    pub capture: CaptureCommandConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Session cadence and where frames are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// 0 runs until stopped.
    #[serde(default)]
    pub duration_seconds: u64,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,

    #[serde(default = "default_image_format")]
    pub image_format: String,

    /// Embed the capture time in file names.
    #[serde(default = "default_true")]
    pub add_timestamp: bool,

    /// Group frames into `YYYY-MM-DD` subdirectories.
    #[serde(default = "default_true")]
    pub create_daily_dirs: bool,

    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

/// External still-capture command. `{output}` is replaced with the target
/// path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureCommandConfig {
    #[serde(default = "default_capture_command")]
    pub command: Vec<String>,

    #[serde(default = "default_capture_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_jump_threshold_ms")]
    pub jump_threshold_ms: u64,

    #[serde(default = "default_poll_slice_ms")]
    pub poll_slice_ms: u64,

    #[serde(default = "default_drift_tolerance_ms")]
    pub drift_tolerance_ms: u64,

    #[serde(default = "default_drift_warning_limit")]
    pub drift_warning_limit: u32,

    #[serde(default)]
    pub suppress_drift_warnings: bool,

    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_resource_id")]
    pub resource_id: String,

    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub backend_url: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,

    /// Usually supplied through `CINEPI_SYNC__API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_attempt_timeout_seconds")]
    pub attempt_timeout_seconds: u64,

    /// How long a finished session waits for queued uploads.
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub forward_audit: bool,

    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,

    #[serde(default = "default_fail_fast_threshold")]
    pub fail_fast_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Daily-rolling file log next to stderr output.
    #[serde(default = "default_true")]
    pub file_logging: bool,

    /// JSONL capture ledger, relative to the output directory.
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,

    #[serde(default = "default_audit_db")]
    pub audit_db: PathBuf,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_interval_seconds() -> u64 {
    30
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output/images")
}
fn default_filename_prefix() -> String {
    "timelapse".to_string()
}
fn default_image_format() -> String {
    "jpg".to_string()
}
fn default_min_free_space_mb() -> u64 {
    100
}
fn default_capture_command() -> Vec<String> {
    ["rpicam-still", "--nopreview", "-o", "{output}"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_capture_timeout_seconds() -> u64 {
    30
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_jump_threshold_ms() -> u64 {
    1000
}
fn default_poll_slice_ms() -> u64 {
    500
}
fn default_drift_tolerance_ms() -> u64 {
    250
}
fn default_drift_warning_limit() -> u32 {
    3
}
fn default_progress_every() -> u64 {
    10
}
fn default_resource_id() -> String {
    "camera0".to_string()
}
fn default_lock_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_acquire_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_bucket() -> String {
    "timelapse-images".to_string()
}
fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    256
}
fn default_attempt_timeout_seconds() -> u64 {
    30
}
fn default_drain_timeout_seconds() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter_fraction() -> f64 {
    0.1
}
fn default_chunk_size() -> usize {
    100
}
fn default_chunk_delay_ms() -> u64 {
    100
}
fn default_fail_fast_threshold() -> f64 {
    0.1
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metadata_file() -> String {
    "capture_metadata.jsonl".to_string()
}
fn default_audit_db() -> PathBuf {
    PathBuf::from("logs/audit.db")
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            duration_seconds: 0,
            output_dir: default_output_dir(),
            filename_prefix: default_filename_prefix(),
            image_format: default_image_format(),
            add_timestamp: default_true(),
            create_daily_dirs: default_true(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl Default for CaptureCommandConfig {
    fn default() -> Self {
        Self {
            command: default_capture_command(),
            timeout_seconds: default_capture_timeout_seconds(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            jump_threshold_ms: default_jump_threshold_ms(),
            poll_slice_ms: default_poll_slice_ms(),
            drift_tolerance_ms: default_drift_tolerance_ms(),
            drift_warning_limit: default_drift_warning_limit(),
            suppress_drift_warnings: false,
            progress_every: default_progress_every(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            resource_id: default_resource_id(),
            lock_dir: default_lock_dir(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            backend_url: String::new(),
            bucket: default_bucket(),
            key_prefix: None,
            api_key: None,
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            attempt_timeout_seconds: default_attempt_timeout_seconds(),
            drain_timeout_seconds: default_drain_timeout_seconds(),
            forward_audit: default_true(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            fail_fast_threshold: default_fail_fast_threshold(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            file_logging: default_true(),
            metadata_file: default_metadata_file(),
            audit_db: default_audit_db(),
        }
    }
}

impl CaptureConfig {
    /// Checks the schema cannot express.
    pub fn validate_semantics(&self) -> Result<()> {
        let interval = self.timelapse.interval_seconds;
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval) {
            return Err(ConfigError::ValidationError(format!(
                "timelapse.interval_seconds must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS}, got {interval}"
            )));
        }
        if self.capture.command.is_empty() {
            return Err(ConfigError::ValidationError("capture.command must not be empty".into()));
        }
        if !self.capture.command.iter().any(|arg| arg.contains("{output}")) {
            return Err(ConfigError::ValidationError(
                "capture.command must contain an {output} placeholder".into(),
            ));
        }
        if self.sync.enabled && self.sync.backend_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "sync.backend_url is required when sync is enabled".into(),
            ));
        }
        self.retry_policy()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            interval: Duration::from_secs(self.timelapse.interval_seconds),
            duration_limit: Duration::from_secs(self.timelapse.duration_seconds),
            jump_threshold: Duration::from_millis(s.jump_threshold_ms),
            poll_slice: Duration::from_millis(s.poll_slice_ms),
            drift_tolerance: Duration::from_millis(s.drift_tolerance_ms),
            drift_policy: DriftLogPolicy {
                warn_limit: s.drift_warning_limit,
                suppress: s.suppress_drift_warnings,
            },
            max_consecutive_failures: self.capture.max_consecutive_failures,
            progress_every: s.progress_every,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.sync.retry;
        RetryPolicy {
            max_attempts: r.max_attempts,
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
            jitter_fraction: r.jitter_fraction,
            chunk_size: r.chunk_size,
            chunk_delay: Duration::from_millis(r.chunk_delay_ms),
            fail_fast_threshold: r.fail_fast_threshold,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            policy: self.retry_policy(),
            queue_capacity: self.sync.queue_capacity,
            attempt_timeout: Duration::from_secs(self.sync.attempt_timeout_seconds),
            key_prefix: self.sync.key_prefix.clone(),
            forward_audit: self.sync.forward_audit,
            ..PipelineConfig::default()
        }
    }

    pub fn http_backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            base_url: self.sync.backend_url.clone(),
            bucket: self.sync.bucket.clone(),
            api_key: self.sync.api_key.clone(),
            request_timeout: Duration::from_secs(self.sync.attempt_timeout_seconds),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.timelapse.output_dir.join(&self.logging.metadata_file)
    }
}

/// Layered loader: defaults, then a config file, then `CINEPI_*`
/// environment variables.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn load(&self) -> Result<CaptureConfig> {
        let mut builder = Config::builder();

        // Defaults are serialized so every key exists before overrides.
        let defaults_json = serde_json::to_string(&CaptureConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        // e.g. CINEPI_TIMELAPSE__INTERVAL_SECONDS=10
        builder = builder.add_source(
            Environment::with_prefix("CINEPI")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("capture.command"),
        );

        let config: CaptureConfig = builder.build()?.try_deserialize()?;
        crate::config::validator::SchemaValidator::new()?.validate(&config)?;
        config.validate_semantics()?;
        Ok(config)
    }

    /// First existing file among `./cinepi.yaml`, `./config.yaml`, and
    /// `<config dir>/cinepi/config.yaml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [PathBuf::from("./cinepi.yaml"), PathBuf::from("./config.yaml")];
        if let Some(found) = candidates.into_iter().find(|p| p.exists()) {
            return Some(found);
        }
        dirs::config_dir()
            .map(|dir| dir.join("cinepi").join("config.yaml"))
            .filter(|p| p.exists())
    }

    /// Load from `path` if given, else from the first default location.
    pub fn load_from(path: Option<&Path>) -> Result<CaptureConfig> {
        let loader = match path.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = CaptureConfig::default();
        assert_eq!(config.timelapse.interval_seconds, 30);
        assert_eq!(config.timelapse.duration_seconds, 0);
        assert_eq!(config.capture.command[0], "rpicam-still");
        assert_eq!(config.lock.resource_id, "camera0");
        assert_eq!(config.sync.retry.max_attempts, 3);
        assert_eq!(config.sync.retry.chunk_size, 100);
        assert!(!config.sync.enabled);
        assert!(config.validate_semantics().is_ok());
    }

    #[test]
    #[serial]
    fn defaults_load_without_file() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.timelapse.filename_prefix, "timelapse");
        assert_eq!(config.scheduler.drift_warning_limit, 3);
    }

    #[test]
    #[serial]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "timelapse:\n  interval_seconds: 10\n  duration_seconds: 30\nsync:\n  retry:\n    max_attempts: 5"
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(file.path()).load().unwrap();
        assert_eq!(config.timelapse.interval_seconds, 10);
        assert_eq!(config.timelapse.duration_seconds, 30);
        assert_eq!(config.sync.retry.max_attempts, 5);
        assert_eq!(config.sync.retry.base_delay_ms, 1000);
    }

    #[test]
    #[serial]
    fn environment_overrides_file_values() {
        unsafe {
            env::set_var("CINEPI_TIMELAPSE__INTERVAL_SECONDS", "15");
            env::set_var("CINEPI_SCHEDULER__SUPPRESS_DRIFT_WARNINGS", "true");
        }
        let result = ConfigLoader::new().load();
        unsafe {
            env::remove_var("CINEPI_TIMELAPSE__INTERVAL_SECONDS");
            env::remove_var("CINEPI_SCHEDULER__SUPPRESS_DRIFT_WARNINGS");
        }

        let config = result.unwrap();
        assert_eq!(config.timelapse.interval_seconds, 15);
        assert!(config.scheduler.suppress_drift_warnings);
    }

    #[test]
    #[serial]
    fn missing_file_is_reported() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/cinepi.yaml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn interval_bounds_are_enforced() {
        let mut config = CaptureConfig::default();
        config.timelapse.interval_seconds = 0;
        assert!(config.validate_semantics().is_err());
        config.timelapse.interval_seconds = 3601;
        assert!(config.validate_semantics().is_err());
        config.timelapse.interval_seconds = 3600;
        assert!(config.validate_semantics().is_ok());
    }

    #[test]
    fn enabled_sync_needs_backend_url() {
        let mut config = CaptureConfig::default();
        config.sync.enabled = true;
        assert!(config.validate_semantics().is_err());
        config.sync.backend_url = "https://example.invalid".into();
        assert!(config.validate_semantics().is_ok());
    }

    #[test]
    fn settings_convert_to_component_configs() {
        let mut config = CaptureConfig::default();
        config.timelapse.interval_seconds = 10;
        config.scheduler.suppress_drift_warnings = true;
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.interval, Duration::from_secs(10));
        assert!(scheduler.drift_policy.suppress);

        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }
}
