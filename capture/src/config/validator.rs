use crate::config::error::{ConfigError, Result};
use crate::config::loader::CaptureConfig;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

/// Validates a [`CaptureConfig`] against the embedded JSON Schema.
pub struct SchemaValidator {
    schema: JSONSchema,
}

impl SchemaValidator {
    pub fn new() -> Result<Self> {
        let raw = include_str!("schemas/capture_config.schema.json");
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            ConfigError::SchemaValidationError(format!("Failed to parse capture schema: {e}"))
        })?;
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&value)
            .map_err(|e| {
                ConfigError::SchemaValidationError(format!("Failed to compile capture schema: {e}"))
            })?;
        Ok(Self { schema })
    }

    /// Reports every violation at once, each with its JSON path.
    pub fn validate(&self, config: &CaptureConfig) -> Result<()> {
        let value = serde_json::to_value(config).map_err(|e| {
            ConfigError::SchemaValidationError(format!("Failed to serialize config: {e}"))
        })?;

        if let Err(errors) = self.schema.validate(&value) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    let path = if path.is_empty() { "root".to_string() } else { path };
                    format!("{e} at '{path}'")
                })
                .collect();
            return Err(ConfigError::SchemaValidationError(format!(
                "Configuration validation failed ({} error{}):\n  - {}",
                messages.len(),
                if messages.len() == 1 { "" } else { "s" },
                messages.join("\n  - ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let validator = SchemaValidator::new().unwrap();
        let result = validator.validate(&CaptureConfig::default());
        assert!(result.is_ok(), "default config should be valid: {result:?}");
    }

    #[test]
    fn out_of_range_values_are_reported_with_path() {
        let mut config = CaptureConfig::default();
        config.timelapse.interval_seconds = 7200;
        config.sync.retry.fail_fast_threshold = 1.5;

        let err = SchemaValidator::new().unwrap().validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("2 errors"), "{message}");
        assert!(message.contains("interval_seconds"), "{message}");
        assert!(message.contains("fail_fast_threshold"), "{message}");
    }

    #[test]
    fn unknown_image_format_is_rejected() {
        let mut config = CaptureConfig::default();
        config.timelapse.image_format = "gif".into();
        assert!(SchemaValidator::new().unwrap().validate(&config).is_err());
    }
}
