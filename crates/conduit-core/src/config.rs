//! Connector configuration documents.
//!
//! The admin API accepts the configuration as a JSON object. Unknown
//! top-level fields are rejected so typos surface as `InvalidConfig`
//! instead of being silently ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WorkloadKind;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("malformed connector config: {0}")]
    Malformed(String),
    #[error("invalid connector config: {0}")]
    Invalid(String),
    #[error("{field} cannot be altered on update")]
    Immutable { field: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingGuarantees {
    #[default]
    AtLeastOnce,
    AtMostOnce,
    EffectivelyOnce,
}

/// Per-instance resource request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Resources {
    pub cpu: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            ram_bytes: 1024 * 1024 * 1024,
            disk_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Desired configuration of a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Entry class inside the package. Optional for builtin packages.
    pub class_name: Option<String>,
    /// Output topic (sources and functions).
    pub topic_name: Option<String>,
    /// Input topics (sinks and functions).
    pub inputs: Vec<String>,
    /// Number of instances to run.
    pub parallelism: u32,
    pub processing_guarantees: ProcessingGuarantees,
    pub resources: Resources,
    /// Connector-specific settings, opaque to the control plane.
    pub configs: serde_json::Map<String, serde_json::Value>,
    pub runtime_flags: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            class_name: None,
            topic_name: None,
            inputs: Vec::new(),
            parallelism: 1,
            processing_guarantees: ProcessingGuarantees::default(),
            resources: Resources::default(),
            configs: serde_json::Map::new(),
            runtime_flags: None,
        }
    }
}

impl ConnectorConfig {
    /// Parse a config document from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::Malformed("expected a JSON object".to_string()));
        }
        serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Number of instances the supervisor should keep.
    pub fn desired_instances(&self) -> u32 {
        self.parallelism
    }

    /// Validate the document for a workload kind.
    ///
    /// `builtin` is true when the package comes from the builtin catalog, in
    /// which case the entry class is taken from the catalog definition.
    pub fn validate(
        &self,
        kind: WorkloadKind,
        builtin: bool,
        max_parallelism: u32,
    ) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid("parallelism must be positive".to_string()));
        }
        if self.parallelism > max_parallelism {
            return Err(ConfigError::Invalid(format!(
                "parallelism {} exceeds maximum {max_parallelism}",
                self.parallelism
            )));
        }
        if !builtin && blank(&self.class_name) {
            return Err(ConfigError::Invalid(format!(
                "{kind} class name is required for non-builtin packages"
            )));
        }
        match kind {
            WorkloadKind::Source => {
                if blank(&self.topic_name) {
                    return Err(ConfigError::Invalid(
                        "source topic name is required".to_string(),
                    ));
                }
            }
            WorkloadKind::Sink | WorkloadKind::Function => {
                if self.inputs.iter().all(|t| t.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "{kind} requires at least one input topic"
                    )));
                }
            }
        }
        if self.resources.cpu <= 0.0 || self.resources.ram_bytes == 0 {
            return Err(ConfigError::Invalid(
                "resources must request positive cpu and ram".to_string(),
            ));
        }
        Ok(())
    }

    /// Check fields that may not change between the current and new config.
    pub fn validate_update(&self, current: &ConnectorConfig) -> Result<(), ConfigError> {
        if self.topic_name != current.topic_name {
            return Err(ConfigError::Immutable { field: "topic_name" });
        }
        if self.processing_guarantees != current.processing_guarantees {
            return Err(ConfigError::Immutable {
                field: "processing_guarantees",
            });
        }
        Ok(())
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source_config() -> ConnectorConfig {
        ConnectorConfig::from_value(json!({
            "class_name": "org.example.KafkaSource",
            "topic_name": "persistent://t1/n1/out",
            "parallelism": 3,
            "configs": {"bootstrap": "kafka:9092"}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_defaults() {
        let cfg = ConnectorConfig::from_value(json!({"topic_name": "out"})).unwrap();
        assert_eq!(cfg.parallelism, 1);
        assert_eq!(cfg.processing_guarantees, ProcessingGuarantees::AtLeastOnce);
        assert!(cfg.configs.is_empty());
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let err = ConnectorConfig::from_value(json!({"paralelism": 2})).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
        let err = ConnectorConfig::from_value(json!("nope")).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn source_requires_topic() {
        let mut cfg = source_config();
        assert!(cfg.validate(WorkloadKind::Source, false, 16).is_ok());
        cfg.topic_name = None;
        assert!(cfg.validate(WorkloadKind::Source, false, 16).is_err());
    }

    #[test]
    fn sink_requires_inputs() {
        let mut cfg = source_config();
        assert!(cfg.validate(WorkloadKind::Sink, false, 16).is_err());
        cfg.inputs = vec!["persistent://t1/n1/in".to_string()];
        assert!(cfg.validate(WorkloadKind::Sink, false, 16).is_ok());
    }

    #[test]
    fn class_name_optional_for_builtin() {
        let mut cfg = source_config();
        cfg.class_name = None;
        assert!(cfg.validate(WorkloadKind::Source, false, 16).is_err());
        assert!(cfg.validate(WorkloadKind::Source, true, 16).is_ok());
    }

    #[test]
    fn parallelism_bounds() {
        let mut cfg = source_config();
        cfg.parallelism = 0;
        assert!(cfg.validate(WorkloadKind::Source, false, 16).is_err());
        cfg.parallelism = 17;
        assert!(cfg.validate(WorkloadKind::Source, false, 16).is_err());
    }

    #[test]
    fn update_cannot_change_topic_or_guarantees() {
        let current = source_config();
        let mut next = current.clone();
        next.parallelism = 5;
        assert!(next.validate_update(&current).is_ok());

        next.topic_name = Some("other".to_string());
        assert_eq!(
            next.validate_update(&current),
            Err(ConfigError::Immutable { field: "topic_name" })
        );

        let mut next = current.clone();
        next.processing_guarantees = ProcessingGuarantees::EffectivelyOnce;
        assert!(next.validate_update(&current).is_err());
    }
}
