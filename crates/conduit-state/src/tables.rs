//! redb table definitions for the Conduit state store.
//!
//! Each table uses `&str` keys. Record tables hold JSON-serialized values,
//! the package table holds raw bytes.

use redb::TableDefinition;

/// Connector records keyed by `{kind}/{tenant}/{namespace}/{name}`.
pub const CONNECTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("connectors");

/// Instance records keyed by `{connector_key}#{instance_id:05}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Uploaded package blobs keyed by connector key.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");
