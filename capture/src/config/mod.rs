//! Capture configuration: layered loading plus schema validation.

mod error;
mod loader;
mod validator;

pub use error::ConfigError;
pub use loader::CaptureCommandConfig;
pub use loader::CaptureConfig;
pub use loader::ConfigLoader;
pub use loader::LockSettings;
pub use loader::LoggingSettings;
pub use loader::RetrySettings;
pub use loader::SchedulerSettings;
pub use loader::SyncSettings;
pub use loader::TimelapseConfig;
pub use validator::SchemaValidator;
