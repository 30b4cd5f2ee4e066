//! Domain types for the Conduit state store.
//!
//! These types represent the persisted desired state of connectors and the
//! observed state of their instances. All types are serializable to/from
//! JSON for storage in redb tables.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use conduit_core::{ConnectorConfig, ConnectorId, WorkloadKind};

// ── Connector ─────────────────────────────────────────────────────

/// Lifecycle state of a connector record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Starting,
    Running,
    Updating,
    Deleting,
    Failed,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Starting => "starting",
            ConnectorState::Running => "running",
            ConnectorState::Updating => "updating",
            ConnectorState::Deleting => "deleting",
            ConnectorState::Failed => "failed",
        }
    }
}

/// Where a connector's code lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHandle {
    /// `package://{key}` for uploads, otherwise the original url.
    pub location: String,
    /// Hex sha256 of the package bytes (empty for builtin packages).
    pub digest: String,
    pub size_bytes: u64,
}

impl PackageHandle {
    pub fn is_builtin(&self) -> bool {
        self.location.starts_with("builtin://")
    }
}

/// Desired state of a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub kind: WorkloadKind,
    pub id: ConnectorId,
    pub package: PackageHandle,
    pub config: ConnectorConfig,
    pub state: ConnectorState,
    /// Bumped on every update; instances launched from an older
    /// generation are stale.
    pub generation: u64,
    /// Asynchronous failure surfaced on the next query.
    pub last_error: Option<String>,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this record was last updated.
    pub updated_at: u64,
}

impl ConnectorRecord {
    /// Build the composite key for the connectors table.
    pub fn table_key(&self) -> String {
        self.id.key(self.kind)
    }

    pub fn desired_instances(&self) -> u32 {
        self.config.desired_instances()
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Observed status of a single connector instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed,
}

/// Runtime state of one numbered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Key of the owning connector.
    pub connector_key: String,
    pub instance_id: u32,
    pub status: InstanceStatus,
    /// Worker reference returned by the launcher while assigned.
    pub worker: Option<String>,
    /// Connector generation this instance was launched from.
    pub generation: u64,
    pub restart_count: u32,
    /// Unix timestamp of the last liveness confirmation.
    pub last_heartbeat: Option<u64>,
    pub last_error: Option<String>,
    /// Unix timestamp of last status change.
    pub updated_at: u64,
}

impl InstanceRecord {
    pub fn new(connector_key: &str, instance_id: u32, generation: u64) -> Self {
        Self {
            connector_key: connector_key.to_string(),
            instance_id,
            status: InstanceStatus::Starting,
            worker: None,
            generation,
            restart_count: 0,
            last_heartbeat: None,
            last_error: None,
            updated_at: epoch_secs(),
        }
    }

    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.connector_key, self.instance_id)
    }
}

/// Instance table key; zero-padded so keys sort by instance id.
pub fn instance_key(connector_key: &str, instance_id: u32) -> String {
    format!("{connector_key}#{instance_id:05}")
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
