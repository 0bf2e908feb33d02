//! TransactionUnit — one atomic batch of persisted mutations.
//!
//! A unit is opened for every inbound node event, filled by the state
//! machine while it holds the node's write lock, and committed by the
//! caller afterwards. Staging is in-memory only; `commit` applies every
//! mutation inside a single redb write transaction, so either all of them
//! become visible or none do.
//!
//! Units are `Serialize` so a replicated log can carry them as a single
//! entry.

use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{map_err, StateError, StateResult};
use crate::store::StateStore;
use crate::tables::*;
use crate::types::*;
use crate::variables::{self, Variable};

/// A single staged change against one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    PutNode(NodeRecord),
    AddActiveNode { node_id: String, host: String },
    RemoveActiveNode { node_id: String },
    AddInactiveNode { host: String, node_id: String },
    RemoveInactiveNode { host: String },
    AddUpdatedContainerInfo { node_id: String, info: UpdatedContainerInfo },
    RemoveUpdatedContainerInfo { node_id: String, id: u32 },
    AddJustLaunched { node_id: String, status: ContainerStatus },
    RemoveJustLaunched { node_id: String, container_id: ContainerId },
    AddContainerToClean { node_id: String, container_id: ContainerId },
    RemoveContainerToClean { node_id: String, container_id: ContainerId },
    AddFinishedApplication { node_id: String, app_id: ApplicationId },
    RemoveFinishedApplication { node_id: String, app_id: ApplicationId },
    SetHeartbeatResponse { node_id: String, response: HeartbeatResponse },
    SetNextHeartbeat { node_id: String, next_heartbeat: bool },
    /// Pending-event marker; its id is drawn from `PendingEventId` at commit.
    AddPendingEvent {
        node_id: String,
        kind: PendingEventKind,
        detail: Option<String>,
    },
    RemovePendingEvent { id: u64 },
}

impl Mutation {
    /// Key of the entity this mutation touches.
    pub fn entity_key(&self) -> String {
        match self {
            Mutation::PutNode(record) => record.node_id.to_string(),
            Mutation::AddActiveNode { node_id, .. }
            | Mutation::RemoveActiveNode { node_id }
            | Mutation::AddUpdatedContainerInfo { node_id, .. }
            | Mutation::RemoveUpdatedContainerInfo { node_id, .. }
            | Mutation::AddJustLaunched { node_id, .. }
            | Mutation::RemoveJustLaunched { node_id, .. }
            | Mutation::AddContainerToClean { node_id, .. }
            | Mutation::RemoveContainerToClean { node_id, .. }
            | Mutation::AddFinishedApplication { node_id, .. }
            | Mutation::RemoveFinishedApplication { node_id, .. }
            | Mutation::SetHeartbeatResponse { node_id, .. }
            | Mutation::SetNextHeartbeat { node_id, .. }
            | Mutation::AddPendingEvent { node_id, .. } => node_id.clone(),
            Mutation::AddInactiveNode { host, .. } | Mutation::RemoveInactiveNode { host } => {
                format!("inactive/{host}")
            }
            Mutation::RemovePendingEvent { id } => format!("pending/{id}"),
        }
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub applied: usize,
    /// Ids assigned to the pending-event markers of the unit, in staging order.
    pub pending_event_ids: Vec<u64>,
}

/// Open batch of mutations for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionUnit {
    mutations: Vec<Mutation>,
}

impl TransactionUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation. Nothing reaches the store until `commit`.
    pub fn stage(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Staged pending-event markers as `(node_id, kind)` pairs.
    pub fn pending_events(&self) -> impl Iterator<Item = (&str, PendingEventKind)> {
        self.mutations.iter().filter_map(|m| match m {
            Mutation::AddPendingEvent { node_id, kind, .. } => Some((node_id.as_str(), *kind)),
            _ => None,
        })
    }

    /// Apply every staged mutation atomically.
    pub fn commit(self, store: &StateStore) -> StateResult<CommitSummary> {
        store.commit(self)
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

// ── Application inside a write transaction ─────────────────────────

pub(crate) fn apply_mutation(
    txn: &WriteTransaction,
    mutation: &Mutation,
    summary: &mut CommitSummary,
) -> StateResult<()> {
    match mutation {
        Mutation::PutNode(record) => put_json(txn, NODES, &record.node_id.to_string(), record),
        Mutation::AddActiveNode { node_id, host } => {
            let mut table = txn.open_table(ACTIVE_NODES).map_err(map_err!(Table))?;
            table
                .insert(node_id.as_str(), host.as_str())
                .map_err(map_err!(Write))?;
            Ok(())
        }
        Mutation::RemoveActiveNode { node_id } => {
            let mut table = txn.open_table(ACTIVE_NODES).map_err(map_err!(Table))?;
            table.remove(node_id.as_str()).map_err(map_err!(Write))?;
            Ok(())
        }
        Mutation::AddInactiveNode { host, node_id } => {
            let mut table = txn.open_table(INACTIVE_NODES).map_err(map_err!(Table))?;
            table
                .insert(host.as_str(), node_id.as_str())
                .map_err(map_err!(Write))?;
            Ok(())
        }
        Mutation::RemoveInactiveNode { host } => {
            let mut table = txn.open_table(INACTIVE_NODES).map_err(map_err!(Table))?;
            table.remove(host.as_str()).map_err(map_err!(Write))?;
            Ok(())
        }
        Mutation::AddUpdatedContainerInfo { node_id, info } => {
            put_json(txn, UPDATE_QUEUE, &update_key(node_id, info.id), info)
        }
        Mutation::RemoveUpdatedContainerInfo { node_id, id } => {
            remove_key(txn, UPDATE_QUEUE, &update_key(node_id, *id))
        }
        Mutation::AddJustLaunched { node_id, status } => put_json(
            txn,
            JUST_LAUNCHED,
            &member_key(node_id, status.container_id),
            status,
        ),
        Mutation::RemoveJustLaunched {
            node_id,
            container_id,
        } => remove_key(txn, JUST_LAUNCHED, &member_key(node_id, container_id)),
        Mutation::AddContainerToClean {
            node_id,
            container_id,
        } => put_json(
            txn,
            CONTAINERS_TO_CLEAN,
            &member_key(node_id, container_id),
            container_id,
        ),
        Mutation::RemoveContainerToClean {
            node_id,
            container_id,
        } => remove_key(txn, CONTAINERS_TO_CLEAN, &member_key(node_id, container_id)),
        Mutation::AddFinishedApplication { node_id, app_id } => {
            put_json(txn, FINISHED_APPS, &member_key(node_id, app_id), app_id)
        }
        Mutation::RemoveFinishedApplication { node_id, app_id } => {
            remove_key(txn, FINISHED_APPS, &member_key(node_id, app_id))
        }
        Mutation::SetHeartbeatResponse { node_id, response } => {
            put_json(txn, HEARTBEATS, node_id, response)
        }
        Mutation::SetNextHeartbeat {
            node_id,
            next_heartbeat,
        } => put_json(txn, NEXT_HEARTBEAT, node_id, next_heartbeat),
        Mutation::AddPendingEvent {
            node_id,
            kind,
            detail,
        } => {
            let counter = variables::increment_locked(txn, Variable::PendingEventId, 1)?;
            let id = u64::try_from(counter.start)
                .map_err(|_| StateError::Overflow(Variable::PendingEventId.name()))?;
            let event = PendingEvent {
                id,
                node_id: node_id.clone(),
                kind: *kind,
                status: PendingEventStatus::New,
                detail: detail.clone(),
            };
            let bytes = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(PENDING_EVENTS).map_err(map_err!(Table))?;
            table.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
            summary.pending_event_ids.push(id);
            debug!(%node_id, ?kind, id, "pending event recorded");
            Ok(())
        }
        Mutation::RemovePendingEvent { id } => {
            let mut table = txn.open_table(PENDING_EVENTS).map_err(map_err!(Table))?;
            table.remove(*id).map_err(map_err!(Write))?;
            Ok(())
        }
    }
}

fn put_json<T: Serialize>(
    txn: &WriteTransaction,
    table: JsonTable,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn remove_key(txn: &WriteTransaction, table: JsonTable, key: &str) -> StateResult<()> {
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    table.remove(key).map_err(map_err!(Write))?;
    Ok(())
}
