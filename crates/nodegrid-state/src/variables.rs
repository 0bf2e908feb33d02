//! VariableStore — cluster-wide singleton variables.
//!
//! Each variable is one row of the `variables` table, keyed by its name and
//! holding a JSON-encoded [`Value`]. The set of variables is closed
//! ([`Variable`]) and every variable has a declared [`ValueKind`].
//!
//! Reads that do not intend to mutate go through [`VariableStore::get`],
//! a single-operation read transaction that never blocks writers.
//! Read-modify-write sequences take a [`VariableLock`]: the redb write
//! transaction behind it is exclusive for the whole database, so holding
//! the lock from the read until [`VariableLock::commit`] serializes every
//! replica sharing the store.

use std::ops::Range;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{map_err, StateError, StateResult};
use crate::tables::VARIABLES;

/// The closed set of cluster-wide variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    BlockId,
    INodeId,
    QuotaUpdateId,
    ReplicationIndex,
    SIdCounter,
    MisReplicatedFilesIndex,
    ClusterInSafeMode,
    StorageInfo,
    BlockTokenKeys,
    MaxNnId,
    RollBackStatus,
    RollBackRequestStatus,
    SnapShotStatus,
    SnapshotRequestStatus,
    RemoveSnapshotStatus,
    PendingEventId,
}

impl Variable {
    pub const ALL: [Variable; 16] = [
        Variable::BlockId,
        Variable::INodeId,
        Variable::QuotaUpdateId,
        Variable::ReplicationIndex,
        Variable::SIdCounter,
        Variable::MisReplicatedFilesIndex,
        Variable::ClusterInSafeMode,
        Variable::StorageInfo,
        Variable::BlockTokenKeys,
        Variable::MaxNnId,
        Variable::RollBackStatus,
        Variable::RollBackRequestStatus,
        Variable::SnapShotStatus,
        Variable::SnapshotRequestStatus,
        Variable::RemoveSnapshotStatus,
        Variable::PendingEventId,
    ];

    /// Row key in the `variables` table.
    pub fn name(self) -> &'static str {
        match self {
            Variable::BlockId => "BlockId",
            Variable::INodeId => "INodeId",
            Variable::QuotaUpdateId => "QuotaUpdateId",
            Variable::ReplicationIndex => "ReplicationIndex",
            Variable::SIdCounter => "SIdCounter",
            Variable::MisReplicatedFilesIndex => "MisReplicatedFilesIndex",
            Variable::ClusterInSafeMode => "ClusterInSafeMode",
            Variable::StorageInfo => "StorageInfo",
            Variable::BlockTokenKeys => "BlockTokenKeys",
            Variable::MaxNnId => "MaxNnId",
            Variable::RollBackStatus => "RollBackStatus",
            Variable::RollBackRequestStatus => "RollBackRequestStatus",
            Variable::SnapShotStatus => "SnapShotStatus",
            Variable::SnapshotRequestStatus => "SnapshotRequestStatus",
            Variable::RemoveSnapshotStatus => "RemoveSnapshotStatus",
            Variable::PendingEventId => "PendingEventId",
        }
    }

    /// Declared type of the variable.
    pub fn kind(self) -> ValueKind {
        match self {
            Variable::INodeId
            | Variable::QuotaUpdateId
            | Variable::SIdCounter
            | Variable::ClusterInSafeMode => ValueKind::Int,
            Variable::BlockId
            | Variable::MisReplicatedFilesIndex
            | Variable::MaxNnId
            | Variable::PendingEventId => ValueKind::Long,
            Variable::RollBackStatus
            | Variable::RollBackRequestStatus
            | Variable::SnapShotStatus
            | Variable::SnapshotRequestStatus
            | Variable::RemoveSnapshotStatus => ValueKind::Str,
            Variable::ReplicationIndex | Variable::StorageInfo | Variable::BlockTokenKeys => {
                ValueKind::List
            }
        }
    }

    /// Value written when the cluster is formatted.
    pub fn default_value(self) -> Value {
        match self {
            Variable::BlockId => Value::Long(0),
            // 1 is the parent of the root and 2 is the root itself.
            Variable::INodeId => Value::Int(3),
            Variable::QuotaUpdateId => Value::Int(0),
            Variable::ReplicationIndex => Value::List(vec![Primitive::Int(0); 5]),
            Variable::SIdCounter => Value::Int(0),
            Variable::MisReplicatedFilesIndex => Value::Long(0),
            Variable::ClusterInSafeMode => Value::Int(1),
            Variable::StorageInfo => Value::List(Vec::new()),
            Variable::BlockTokenKeys => Value::List(Vec::new()),
            Variable::MaxNnId => Value::Long(0),
            Variable::RollBackStatus => Value::Str("NOT_STARTED".to_string()),
            Variable::RollBackRequestStatus => Value::Str("NOT_REQUESTED".to_string()),
            Variable::SnapShotStatus => Value::Str("NO_SNAPSHOT".to_string()),
            Variable::SnapshotRequestStatus => Value::Str("NOT_REQUESTED".to_string()),
            Variable::RemoveSnapshotStatus => Value::Str("NOT_STARTED".to_string()),
            Variable::PendingEventId => Value::Long(0),
        }
    }
}

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Long,
    Str,
    Bytes,
    List,
}

/// A stored variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i32),
    Long(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Primitive>),
}

/// Element of a list-typed variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Int(i32),
    Long(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
        }
    }

    /// Numeric view of integer and long values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Primitive]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// An id range handed out by a counter increment: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Value before the increment.
    pub start: i64,
    /// Value after the increment.
    pub end: i64,
}

impl Counter {
    pub fn ids(&self) -> Range<i64> {
        self.start..self.end
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

// ── Locked primitives (shared with TransactionUnit commits) ────────

pub(crate) fn read_locked(txn: &WriteTransaction, var: Variable) -> StateResult<Value> {
    let table = txn.open_table(VARIABLES).map_err(map_err!(Table))?;
    let bytes = table
        .get(var.name())
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec());
    match bytes {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)),
        None => Err(StateError::NotFound(var.name().to_string())),
    }
}

pub(crate) fn write_locked(txn: &WriteTransaction, var: Variable, value: &Value) -> StateResult<()> {
    check_kind(var, value)?;
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(VARIABLES).map_err(map_err!(Table))?;
    table
        .insert(var.name(), bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

pub(crate) fn increment_locked(
    txn: &WriteTransaction,
    var: Variable,
    delta: i64,
) -> StateResult<Counter> {
    let (start, next) = match read_locked(txn, var)? {
        Value::Int(old) => {
            check_delta(var, delta)?;
            let step = i32::try_from(delta).map_err(|_| StateError::Overflow(var.name()))?;
            let new = old
                .checked_add(step)
                .ok_or(StateError::Overflow(var.name()))?;
            (i64::from(old), Value::Int(new))
        }
        Value::Long(old) => {
            check_delta(var, delta)?;
            let new = old
                .checked_add(delta)
                .ok_or(StateError::Overflow(var.name()))?;
            (old, Value::Long(new))
        }
        other => {
            return Err(StateError::IllegalVariableType {
                variable: var.name(),
                actual: other.kind(),
            });
        }
    };
    write_locked(txn, var, &next)?;
    Ok(Counter {
        start,
        end: start + delta,
    })
}

/// Counters only move forward; a zero-width range would hand out nothing.
fn check_delta(var: Variable, delta: i64) -> StateResult<()> {
    if delta <= 0 {
        return Err(StateError::InvalidDelta {
            variable: var.name(),
            delta,
        });
    }
    Ok(())
}

fn check_kind(var: Variable, value: &Value) -> StateResult<()> {
    if value.kind() != var.kind() {
        return Err(StateError::TypeMismatch {
            variable: var.name(),
            expected: var.kind(),
            actual: value.kind(),
        });
    }
    Ok(())
}

// ── VariableStore ──────────────────────────────────────────────────

/// Typed access to the cluster-wide variables.
///
/// Shares the redb database of the [`StateStore`](crate::StateStore) it was
/// obtained from; cloning is cheap.
#[derive(Clone)]
pub struct VariableStore {
    db: Arc<Database>,
}

impl VariableStore {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Read the last committed value without taking the exclusive lock.
    pub fn get(&self, var: Variable) -> StateResult<Value> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VARIABLES).map_err(map_err!(Table))?;
        match table.get(var.name()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(var.name().to_string())),
        }
    }

    /// Take the exclusive write lock. Changes made through the returned
    /// guard become visible together when it is committed; dropping it
    /// discards them.
    ///
    /// Do not commit a `TransactionUnit` on the same thread while the
    /// guard is alive: both need the single redb writer.
    pub fn lock(&self) -> StateResult<VariableLock> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(VariableLock { txn })
    }

    /// Replace a variable's value in its own locked transaction.
    pub fn update(&self, var: Variable, value: Value) -> StateResult<()> {
        let mut lock = self.lock()?;
        lock.set(var, value)?;
        lock.commit()
    }

    /// Atomically add `delta` to an integer or long variable.
    ///
    /// Returns the range `[old, new)` so callers can hand out the ids in it.
    pub fn increment_counter(&self, var: Variable, delta: i64) -> StateResult<Counter> {
        let mut lock = self.lock()?;
        let counter = lock.increment(var, delta)?;
        lock.commit()?;
        debug!(variable = var.name(), start = counter.start, end = counter.end, "counter incremented");
        Ok(counter)
    }

    /// Write `value` unless the variable already holds one.
    ///
    /// Returns `true` when the default was written.
    pub fn register_default(&self, var: Variable, value: Value) -> StateResult<bool> {
        check_kind(var, &value)?;
        let lock = self.lock()?;
        let exists = match read_locked(&lock.txn, var) {
            Ok(_) => true,
            Err(StateError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if exists {
            lock.abort()?;
            return Ok(false);
        }
        write_locked(&lock.txn, var, &value)?;
        lock.commit()?;
        Ok(true)
    }

    /// Register the built-in default of every variable.
    ///
    /// Returns the number of variables that were initialized by this call.
    pub fn register_defaults(&self) -> StateResult<usize> {
        let mut written = 0;
        for var in Variable::ALL {
            if self.register_default(var, var.default_value())? {
                written += 1;
            }
        }
        info!(written, "cluster variable defaults registered");
        Ok(written)
    }
}

/// Exclusive lock over the variable store, scoped to one write transaction.
pub struct VariableLock {
    txn: WriteTransaction,
}

impl VariableLock {
    /// Locking read of a variable.
    pub fn get(&self, var: Variable) -> StateResult<Value> {
        read_locked(&self.txn, var)
    }

    /// Replace a variable's value. Fails with `TypeMismatch` when the value
    /// does not have the variable's declared type.
    pub fn set(&mut self, var: Variable, value: Value) -> StateResult<()> {
        write_locked(&self.txn, var, &value)
    }

    /// Add `delta` to an integer or long variable under this lock.
    pub fn increment(&mut self, var: Variable, delta: i64) -> StateResult<Counter> {
        increment_locked(&self.txn, var, delta)
    }

    /// Make every change visible and release the lock.
    pub fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))
    }

    /// Discard every change and release the lock.
    pub fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStore;

    fn formatted() -> VariableStore {
        let store = StateStore::open_in_memory().unwrap();
        let vars = store.variables();
        vars.register_defaults().unwrap();
        vars
    }

    #[test]
    fn every_default_matches_declared_kind() {
        for var in Variable::ALL {
            assert_eq!(var.default_value().kind(), var.kind(), "{}", var.name());
        }
    }

    #[test]
    fn get_before_registration_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.variables().get(Variable::BlockId).unwrap_err();
        assert!(matches!(err, StateError::NotFound(name) if name == "BlockId"));
    }

    #[test]
    fn register_default_never_overwrites() {
        let vars = formatted();
        vars.update(Variable::MaxNnId, Value::Long(17)).unwrap();

        assert!(!vars.register_default(Variable::MaxNnId, Value::Long(0)).unwrap());
        assert_eq!(vars.get(Variable::MaxNnId).unwrap(), Value::Long(17));
        assert_eq!(vars.register_defaults().unwrap(), 0);
    }

    #[test]
    fn increment_inode_counter_from_default() {
        let vars = formatted();
        let counter = vars.increment_counter(Variable::INodeId, 5).unwrap();
        assert_eq!(counter, Counter { start: 3, end: 8 });
        assert_eq!(counter.ids().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7]);
        assert_eq!(vars.get(Variable::INodeId).unwrap(), Value::Int(8));
    }

    #[test]
    fn zero_delta_is_rejected_without_touching_counter() {
        let vars = formatted();
        vars.increment_counter(Variable::INodeId, 5).unwrap();
        let err = vars.increment_counter(Variable::INodeId, 0).unwrap_err();
        assert!(matches!(err, StateError::InvalidDelta { delta: 0, .. }));
        assert_eq!(vars.get(Variable::INodeId).unwrap(), Value::Int(8));
    }

    #[test]
    fn increment_long_counter() {
        let vars = formatted();
        let first = vars.increment_counter(Variable::BlockId, 1000).unwrap();
        let second = vars.increment_counter(Variable::BlockId, 1000).unwrap();
        assert_eq!(first, Counter { start: 0, end: 1000 });
        assert_eq!(second, Counter { start: 1000, end: 2000 });
    }

    #[test]
    fn increment_string_variable_is_illegal() {
        let vars = formatted();
        let err = vars
            .increment_counter(Variable::RollBackStatus, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::IllegalVariableType {
                actual: ValueKind::Str,
                ..
            }
        ));
    }

    #[test]
    fn set_with_wrong_type_is_rejected() {
        let vars = formatted();
        let mut lock = vars.lock().unwrap();
        let err = lock.set(Variable::INodeId, Value::Str("x".into())).unwrap_err();
        assert!(matches!(
            err,
            StateError::TypeMismatch {
                expected: ValueKind::Int,
                actual: ValueKind::Str,
                ..
            }
        ));
        lock.abort().unwrap();
    }

    #[test]
    fn aborted_lock_leaves_no_trace() {
        let vars = formatted();
        let mut lock = vars.lock().unwrap();
        lock.increment(Variable::QuotaUpdateId, 10).unwrap();
        assert_eq!(lock.get(Variable::QuotaUpdateId).unwrap(), Value::Int(10));
        lock.abort().unwrap();
        assert_eq!(vars.get(Variable::QuotaUpdateId).unwrap(), Value::Int(0));
    }

    #[test]
    fn concurrent_increments_hand_out_disjoint_contiguous_ranges() {
        let vars = formatted();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let vars = vars.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| vars.increment_counter(Variable::BlockId, 1).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ranges: Vec<Counter> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ranges.sort_by_key(|c| c.start);

        assert_eq!(ranges.len(), 400);
        for (i, range) in ranges.iter().enumerate() {
            assert_eq!(range.start, i as i64);
            assert_eq!(range.end, i as i64 + 1);
        }
        assert_eq!(vars.get(Variable::BlockId).unwrap(), Value::Long(400));
    }
}
