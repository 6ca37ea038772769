//! Engine configuration.
//!
//! Separate from imposter configuration: this controls the injection gate,
//! the out-of-process proxy callback base and shell execution limits.
//!
//! ```yaml
//! allowInjection: true
//! callbackUrl: http://localhost:2525/imposters/4545/_requests
//! shellTransformTimeoutMs: 5000
//! logLevel: debug
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Single gate for every injection surface (JavaScript and shell).
    #[serde(default)]
    pub allow_injection: bool,

    /// Base URL for out-of-process proxy callbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// Kill shellTransform commands running longer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_transform_timeout_ms: Option<u64>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_injection: false,
            callback_url: None,
            shell_transform_timeout_ms: None,
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML or JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        // YAML is a superset of JSON, one parser covers both
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logLevel '{}'. Expected one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        if let Some(url) = &self.callback_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("callbackUrl must be an http(s) URL, got '{url}'");
            }
        }

        if self.shell_transform_timeout_ms == Some(0) {
            anyhow::bail!("shellTransformTimeoutMs must be greater than 0 when set");
        }

        Ok(())
    }

    pub fn shell_transform_timeout(&self) -> Option<Duration> {
        self.shell_transform_timeout_ms.map(Duration::from_millis)
    }

    /// Callback base without a trailing slash.
    pub fn callback_base(&self) -> Option<String> {
        self.callback_url
            .as_ref()
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(!config.allow_injection);
        assert!(config.callback_url.is_none());
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "allowInjection: true\ncallbackUrl: http://localhost:2525/imposters/3000/_requests/\nshellTransformTimeoutMs: 250"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.allow_injection);
        assert_eq!(
            config.callback_base().as_deref(),
            Some("http://localhost:2525/imposters/3000/_requests")
        );
        assert_eq!(
            config.shell_transform_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"allowInjection": false, "logLevel": "debug"}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(!config.allow_injection);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            callback_url: Some("ftp://nope".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            shell_transform_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<EngineConfig, _> = serde_yaml::from_str("allowInjections: true");
        assert!(result.is_err());
    }
}
