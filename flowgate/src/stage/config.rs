//! Stage configuration.

use flowgate_shared::errors::{FlowgateError, FlowgateResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_STAGE_NAME: &str = "parallel-stage";

/// Order in which a stage forwards results downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Completion order. Maximizes throughput.
    #[default]
    Unordered,
    /// Upstream arrival order, reconstructed with a reorder buffer.
    Ordered,
}

/// Configuration for one [`ParallelStage`](super::ParallelStage).
///
/// ```json
/// { "name": "resize", "concurrency": 4, "ordered": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Stage name used in logs, errors and metrics.
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of task units in flight. Required, must be positive.
    pub concurrency: usize,
    /// Preserve upstream order downstream.
    #[serde(default)]
    pub ordered: bool,
}

fn default_name() -> String {
    DEFAULT_STAGE_NAME.to_string()
}

impl StageConfig {
    /// Unordered stage with the given concurrency ceiling.
    pub fn new(concurrency: usize) -> Self {
        Self {
            name: default_name(),
            concurrency,
            ordered: false,
        }
    }

    /// Ordered stage with the given concurrency ceiling.
    pub fn ordered(concurrency: usize) -> Self {
        Self {
            ordered: true,
            ..Self::new(concurrency)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.ordered = delivery == Delivery::Ordered;
        self
    }

    pub fn delivery(&self) -> Delivery {
        if self.ordered {
            Delivery::Ordered
        } else {
            Delivery::Unordered
        }
    }

    /// Check the configuration before any stage is built from it.
    pub fn validate(&self) -> FlowgateResult<()> {
        if self.concurrency == 0 {
            return Err(FlowgateError::Configuration(format!(
                "stage '{}': concurrency must be greater than 0",
                self.name
            )));
        }
        if self.name.trim().is_empty() {
            return Err(FlowgateError::Configuration(
                "stage name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> FlowgateResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FlowgateError::Configuration(format!("invalid stage config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(path: &Path) -> FlowgateResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json).map_err(|e| match e {
            FlowgateError::Configuration(msg) => {
                FlowgateError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builders() {
        let config = StageConfig::ordered(4).with_name("resize");
        assert_eq!(config.delivery(), Delivery::Ordered);
        assert_eq!(config.name, "resize");
        assert!(config.validate().is_ok());

        let config = config.with_delivery(Delivery::Unordered);
        assert!(!config.ordered);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = StageConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, FlowgateError::Configuration(_)));
        assert!(err.to_string().contains("concurrency must be greater than 0"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = StageConfig::new(1).with_name("  ").validate().unwrap_err();
        assert!(err.to_string().contains("name must not be empty"));
    }

    #[test]
    fn test_json_defaults() {
        let config = StageConfig::from_json_str(r#"{ "concurrency": 3 }"#).unwrap();
        assert_eq!(config, StageConfig::new(3));
    }

    #[test]
    fn test_json_requires_concurrency() {
        let err = StageConfig::from_json_str(r#"{ "ordered": true }"#).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_json_rejects_unknown_fields() {
        let err = StageConfig::from_json_str(r#"{ "concurrency": 1, "retries": 3 }"#).unwrap_err();
        assert!(matches!(err, FlowgateError::Configuration(_)));
    }

    #[test]
    fn test_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "name": "fetch", "concurrency": 8, "ordered": true }}"#).unwrap();

        let config = StageConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config, StageConfig::ordered(8).with_name("fetch"));
    }

    #[test]
    fn test_json_file_missing() {
        let err = StageConfig::from_json_file(Path::new("/nonexistent/stage.json")).unwrap_err();
        assert!(matches!(err, FlowgateError::Io(_)));
    }
}
