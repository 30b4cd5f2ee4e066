//! Shared identity types used across Conduit crates.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allowed characters for a tenant, namespace, or connector name segment.
static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-=:.\w]+$").expect("static regex"));

/// The kind of workload a lifecycle manager is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Ingests external data into the messaging layer.
    Source,
    /// Drains topics into an external system.
    Sink,
    /// Topic-to-topic processing function.
    Function,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 3] = [Self::Source, Self::Sink, Self::Function];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Source => "source",
            WorkloadKind::Sink => "sink",
            WorkloadKind::Function => "function",
        }
    }

    /// Path segment used by the admin API (`/admin/v3/sources`, ...).
    pub fn plural(&self) -> &'static str {
        match self {
            WorkloadKind::Source => "sources",
            WorkloadKind::Sink => "sinks",
            WorkloadKind::Function => "functions",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} contains invalid characters: {value:?}")]
    Invalid { field: &'static str, value: String },
}

/// Globally unique connector identity within a workload kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorId {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
}

impl ConnectorId {
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Check every segment is non-empty and uses only allowed characters.
    pub fn validate(&self) -> Result<(), IdentityError> {
        validate_segment("tenant", &self.tenant)?;
        validate_segment("namespace", &self.namespace)?;
        validate_segment("name", &self.name)
    }

    /// Composite key `{kind}/{tenant}/{namespace}/{name}` used by the state store.
    pub fn key(&self, kind: WorkloadKind) -> String {
        format!(
            "{}/{}/{}/{}",
            kind.as_str(),
            self.tenant,
            self.namespace,
            self.name
        )
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

/// Key prefix covering every connector of `kind` in a namespace.
pub fn namespace_prefix(kind: WorkloadKind, tenant: &str, namespace: &str) -> String {
    format!("{}/{tenant}/{namespace}/", kind.as_str())
}

/// Validate a single identity segment (also used for list requests).
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Missing { field });
    }
    if !SEGMENT_RE.is_match(value) {
        return Err(IdentityError::Invalid {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identity() {
        let id = ConnectorId::new("public", "default", "kafka-in.v2");
        assert!(id.validate().is_ok());
        assert_eq!(id.key(WorkloadKind::Source), "source/public/default/kafka-in.v2");
        assert_eq!(id.to_string(), "public/default/kafka-in.v2");
    }

    #[test]
    fn empty_segment_is_rejected() {
        let id = ConnectorId::new("public", "", "s1");
        assert_eq!(
            id.validate(),
            Err(IdentityError::Missing { field: "namespace" })
        );
    }

    #[test]
    fn slash_in_name_is_rejected() {
        let id = ConnectorId::new("public", "default", "a/b");
        assert!(matches!(
            id.validate(),
            Err(IdentityError::Invalid { field: "name", .. })
        ));
    }

    #[test]
    fn namespace_prefix_matches_keys() {
        let id = ConnectorId::new("t1", "n1", "s1");
        let prefix = namespace_prefix(WorkloadKind::Sink, "t1", "n1");
        assert!(id.key(WorkloadKind::Sink).starts_with(&prefix));
        assert!(!id.key(WorkloadKind::Source).starts_with(&prefix));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&WorkloadKind::Function).unwrap();
        assert_eq!(json, "\"function\"");
        assert_eq!(WorkloadKind::Sink.plural(), "sinks");
    }
}
