//! StateStore — redb-backed persistence for nodegrid.
//!
//! Owns the database handle shared by the variable store, transaction-unit
//! commits, and the persisted-state reader. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{map_err, StateResult};
use crate::reader::NodeStateReader;
use crate::tables::*;
use crate::transaction::{self, CommitSummary, TransactionUnit};
use crate::types::*;
use crate::variables::VariableStore;

/// Thread-safe state store backed by redb.
///
/// Cloning shares the same database; every replica of a cluster holds a
/// clone of one store.
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
        for table in [
            VARIABLES,
            NODES,
            UPDATE_QUEUE,
            JUST_LAUNCHED,
            CONTAINERS_TO_CLEAN,
            FINISHED_APPS,
            HEARTBEATS,
            NEXT_HEARTBEAT,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(ACTIVE_NODES).map_err(map_err!(Table))?;
        txn.open_table(INACTIVE_NODES).map_err(map_err!(Table))?;
        txn.open_table(PENDING_EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Cluster-wide variables backed by this store.
    pub fn variables(&self) -> VariableStore {
        VariableStore::new(Arc::clone(&self.db))
    }

    // ── Transaction units ──────────────────────────────────────────

    /// Apply a transaction unit in a single write transaction.
    ///
    /// Any failing mutation drops the transaction, which discards every
    /// change the unit made so far.
    pub fn commit(&self, unit: TransactionUnit) -> StateResult<CommitSummary> {
        let mutations = unit.into_mutations();
        let mut summary = CommitSummary::default();
        if mutations.is_empty() {
            return Ok(summary);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for mutation in &mutations {
            transaction::apply_mutation(&txn, mutation, &mut summary)?;
            summary.applied += 1;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            applied = summary.applied,
            pending_events = summary.pending_event_ids.len(),
            "transaction unit committed"
        );
        Ok(summary)
    }

    // ── Nodes and registries ───────────────────────────────────────

    /// List every persisted node record.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Active registry as `(node_id, host)` pairs.
    pub fn active_nodes(&self) -> StateResult<Vec<(String, String)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVE_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push((key.value().to_string(), value.value().to_string()));
        }
        Ok(results)
    }

    /// Inactive registry as `(host, node_id)` pairs.
    pub fn inactive_nodes(&self) -> StateResult<Vec<(String, String)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INACTIVE_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push((key.value().to_string(), value.value().to_string()));
        }
        Ok(results)
    }

    // ── Pending events ─────────────────────────────────────────────

    /// Every pending-event marker, oldest first.
    pub fn pending_events(&self) -> StateResult<Vec<PendingEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: PendingEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }

    /// Pending-event markers of one node, oldest first.
    pub fn pending_events_for(&self, node_id: &str) -> StateResult<Vec<PendingEvent>> {
        Ok(self
            .pending_events()?
            .into_iter()
            .filter(|event| event.node_id == node_id)
            .collect())
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Every row of `table` whose key falls under `node_id`, in key order.
    fn scan_node<T: DeserializeOwned>(&self, table: JsonTable, node_id: &str) -> StateResult<Vec<T>> {
        let prefix = node_prefix(node_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }
}

impl NodeStateReader for StateStore {
    fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get_json(NODES, node_id)
    }

    fn get_just_launched_containers(&self, node_id: &str) -> StateResult<Vec<ContainerStatus>> {
        self.scan_node(JUST_LAUNCHED, node_id)
    }

    fn get_containers_to_clean(&self, node_id: &str) -> StateResult<BTreeSet<ContainerId>> {
        Ok(self
            .scan_node::<ContainerId>(CONTAINERS_TO_CLEAN, node_id)?
            .into_iter()
            .collect())
    }

    fn get_finished_applications(&self, node_id: &str) -> StateResult<Vec<ApplicationId>> {
        self.scan_node(FINISHED_APPS, node_id)
    }

    fn get_updated_container_info(&self, node_id: &str) -> StateResult<Vec<UpdatedContainerInfo>> {
        self.scan_node(UPDATE_QUEUE, node_id)
    }

    fn get_last_heartbeat_response(&self, node_id: &str) -> StateResult<Option<HeartbeatResponse>> {
        self.get_json(HEARTBEATS, node_id)
    }

    fn get_next_heartbeat(&self, node_id: &str) -> StateResult<Option<bool>> {
        self.get_json(NEXT_HEARTBEAT, node_id)
    }
}
