//! StateStore: redb-backed state persistence for Conduit.
//!
//! Provides typed CRUD operations over connector records, instance records
//! and package blobs. Records are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult, StorageOp};
use crate::tables::*;
use crate::types::*;

/// Closure turning any `Display` error into the matching `StateError`.
macro_rules! map_err {
    (Serialize) => {
        |e| StateError::Encode(e.to_string())
    };
    (Deserialize) => {
        |e| StateError::Corrupt(e.to_string())
    };
    ($op:ident) => {
        |e| StateError::Storage {
            op: StorageOp::$op,
            detail: e.to_string(),
        }
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONNECTORS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(PACKAGES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Connectors ─────────────────────────────────────────────────

    /// Insert a new connector record, failing if the key is taken.
    ///
    /// The existence check and the insert share one write transaction.
    pub fn create_connector(&self, record: &ConnectorRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONNECTORS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "connector created");
        Ok(())
    }

    /// Insert or replace a connector record.
    pub fn put_connector(&self, record: &ConnectorRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONNECTORS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, state = record.state.as_str(), "connector stored");
        Ok(())
    }

    /// Get a connector by its composite key.
    pub fn get_connector(&self, key: &str) -> StateResult<Option<ConnectorRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONNECTORS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ConnectorRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List connectors whose key starts with `prefix`, in key order.
    ///
    /// An empty prefix lists every connector.
    pub fn list_connectors(&self, prefix: &str) -> StateResult<Vec<ConnectorRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONNECTORS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let record: ConnectorRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Remove a connector together with its package blob and any instance
    /// records, in one transaction. Returns true if the record existed.
    pub fn purge_connector(&self, key: &str) -> StateResult<bool> {
        let instance_keys = self.instance_keys(key)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut connectors = txn.open_table(CONNECTORS).map_err(map_err!(Table))?;
            existed = connectors.remove(key).map_err(map_err!(Write))?.is_some();
            let mut packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            packages.remove(key).map_err(map_err!(Write))?;
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for k in &instance_keys {
                instances.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "connector purged");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance record.
    pub fn get_instance(
        &self,
        connector_key: &str,
        instance_id: u32,
    ) -> StateResult<Option<InstanceRecord>> {
        let key = instance_key(connector_key, instance_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all instance records of a connector, ordered by instance id.
    pub fn list_instances(&self, connector_key: &str) -> StateResult<Vec<InstanceRecord>> {
        let prefix = format!("{connector_key}#");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, connector_key: &str, instance_id: u32) -> StateResult<bool> {
        let key = instance_key(connector_key, instance_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn instance_keys(&self, connector_key: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{connector_key}#");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let k = key.value();
            if !k.starts_with(&prefix) {
                break;
            }
            keys.push(k.to_string());
        }
        Ok(keys)
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Store (or replace) the package blob for a connector.
    pub fn put_package(&self, connector_key: &str, bytes: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            table.insert(connector_key, bytes).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%connector_key, size = bytes.len(), "package stored");
        Ok(())
    }

    /// Fetch the package blob for a connector.
    pub fn get_package(&self, connector_key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
        Ok(table
            .get(connector_key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// Delete a package blob. Returns true if it existed.
    pub fn delete_package(&self, connector_key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            existed = table.remove(connector_key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
