use serde::{Deserialize, Serialize};

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_logging_config() {
        let toml = r#"
            [logging]
            level = "stepflow=debug"
            json_format = true
        "#;

        let config: ObservabilityConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, "stepflow=debug");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_logging_defaults() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
    }
}
