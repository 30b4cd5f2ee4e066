//! Builtin connector catalog.
//!
//! Each builtin connector is described by a TOML file in the connectors
//! directory:
//!
//! ```toml
//! name = "kafka"
//! description = "Kafka source and sink"
//! source_class = "org.example.io.KafkaSource"
//! sink_class = "org.example.io.KafkaSink"
//!
//! [config_schema]
//! required = ["bootstrap_servers"]
//!
//! [config_schema.properties]
//! bootstrap_servers = "string"
//! batch_size = "integer"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::types::WorkloadKind;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("duplicate builtin connector: {0}")]
    Duplicate(String),
}

/// Value type accepted for a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Any => true,
        }
    }
}

/// Declared schema for the opaque `configs` map of a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSchema {
    pub required: Vec<String>,
    pub properties: BTreeMap<String, FieldKind>,
}

impl ConfigSchema {
    /// Validate a `configs` map, returning every violation found.
    pub fn validate(
        &self,
        configs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        for key in &self.required {
            if !configs.contains_key(key) {
                problems.push(format!("missing required config `{key}`"));
            }
        }
        for (key, value) in configs {
            match self.properties.get(key) {
                Some(kind) if !kind.accepts(value) => {
                    problems.push(format!("config `{key}` must be {kind:?}"));
                }
                Some(_) => {}
                None if !self.properties.is_empty() => {
                    problems.push(format!("unknown config `{key}`"));
                }
                None => {}
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Descriptor of a connector type shipped with the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_class: Option<String>,
    pub sink_class: Option<String>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
}

impl ConnectorDefinition {
    /// Entry class for the given kind, if this connector provides one.
    pub fn class_for(&self, kind: WorkloadKind) -> Option<&str> {
        let class = match kind {
            WorkloadKind::Source => self.source_class.as_deref(),
            WorkloadKind::Sink => self.sink_class.as_deref(),
            WorkloadKind::Function => None,
        };
        class.filter(|c| !c.trim().is_empty())
    }
}

/// The set of builtin connectors known to this control plane.
#[derive(Debug, Clone, Default)]
pub struct ConnectorCatalog {
    definitions: BTreeMap<String, ConnectorDefinition>,
}

impl ConnectorCatalog {
    pub fn new(definitions: Vec<ConnectorDefinition>) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        for def in definitions {
            catalog.insert(def)?;
        }
        Ok(catalog)
    }

    /// Load every `*.toml` descriptor below `dir`.
    ///
    /// A missing directory yields an empty catalog.
    pub fn from_dir(dir: &Path) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        if !dir.exists() {
            warn!(?dir, "connectors directory does not exist, builtin catalog is empty");
            return Ok(catalog);
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| CatalogError::Io {
                path: dir.to_path_buf(),
                source: e.into(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("toml")
            {
                continue;
            }
            let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let def: ConnectorDefinition =
                toml::from_str(&content).map_err(|source| CatalogError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            debug!(name = %def.name, ?path, "builtin connector loaded");
            catalog.insert(def)?;
        }
        info!(count = catalog.definitions.len(), ?dir, "builtin catalog loaded");
        Ok(catalog)
    }

    fn insert(&mut self, def: ConnectorDefinition) -> Result<(), CatalogError> {
        if self.definitions.contains_key(&def.name) {
            return Err(CatalogError::Duplicate(def.name));
        }
        self.definitions.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ConnectorDefinition> {
        self.definitions.get(name)
    }

    /// Definitions exposing an entry class for `kind`, sorted by name.
    pub fn for_kind(&self, kind: WorkloadKind) -> Vec<ConnectorDefinition> {
        self.definitions
            .values()
            .filter(|d| d.class_for(kind).is_some())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
