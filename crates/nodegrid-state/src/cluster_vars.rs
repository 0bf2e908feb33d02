//! Typed accessors over the cluster variables.
//!
//! Id allocators, the cluster safe-mode gate, replication cursor, storage
//! descriptor, block-token key material, and the upgrade/snapshot status
//! strings. Reads use the light-weight path of [`VariableStore::get`];
//! writes each run in their own exclusive lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{map_err, StateError, StateResult};
use crate::variables::{Counter, Primitive, Value, Variable, VariableLock, VariableStore};

/// Storage descriptor of the cluster, written at format time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub layout_version: i32,
    pub namespace_id: i32,
    pub cluster_id: String,
    pub ctime: i64,
    pub block_pool_id: String,
}

impl StorageInfo {
    fn to_value(&self) -> Value {
        Value::List(vec![
            Primitive::Int(self.layout_version),
            Primitive::Int(self.namespace_id),
            Primitive::Str(self.cluster_id.clone()),
            Primitive::Long(self.ctime),
            Primitive::Str(self.block_pool_id.clone()),
        ])
    }

    fn from_value(value: &Value) -> StateResult<Option<Self>> {
        let items = list_of(Variable::StorageInfo, value)?;
        if items.is_empty() {
            return Ok(None);
        }
        match items {
            [
                Primitive::Int(layout_version),
                Primitive::Int(namespace_id),
                Primitive::Str(cluster_id),
                Primitive::Long(ctime),
                Primitive::Str(block_pool_id),
            ] => Ok(Some(Self {
                layout_version: *layout_version,
                namespace_id: *namespace_id,
                cluster_id: cluster_id.clone(),
                ctime: *ctime,
                block_pool_id: block_pool_id.clone(),
            })),
            _ => Err(StateError::Deserialize(
                "malformed StorageInfo variable".to_string(),
            )),
        }
    }
}

/// Role of a block-token key, given by its slot in the key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKeyType {
    Current,
    Next,
    Simple,
}

impl BlockKeyType {
    const SLOTS: [BlockKeyType; 3] = [BlockKeyType::Current, BlockKeyType::Next, BlockKeyType::Simple];
}

/// Block-token secret key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockKey {
    pub key_id: i32,
    pub expiry_date: i64,
    pub encoded_key: Vec<u8>,
    pub key_type: BlockKeyType,
}

#[derive(Serialize, Deserialize)]
struct EncodedBlockKey {
    key_id: i32,
    expiry_date: i64,
    encoded_key: Vec<u8>,
}

impl BlockKey {
    pub fn new(key_id: i32, expiry_date: i64, encoded_key: Vec<u8>) -> Self {
        Self {
            key_id,
            expiry_date,
            encoded_key,
            key_type: BlockKeyType::Current,
        }
    }

    fn encode(&self) -> StateResult<Primitive> {
        let encoded = EncodedBlockKey {
            key_id: self.key_id,
            expiry_date: self.expiry_date,
            encoded_key: self.encoded_key.clone(),
        };
        let bytes = serde_json::to_vec(&encoded).map_err(map_err!(Serialize))?;
        Ok(Primitive::Bytes(bytes))
    }

    fn decode(slot: BlockKeyType, item: &Primitive) -> StateResult<Self> {
        let Primitive::Bytes(bytes) = item else {
            return Err(StateError::Deserialize(
                "block token key is not a byte array".to_string(),
            ));
        };
        let encoded: EncodedBlockKey =
            serde_json::from_slice(bytes).map_err(map_err!(Deserialize))?;
        Ok(Self {
            key_id: encoded.key_id,
            expiry_date: encoded.expiry_date,
            encoded_key: encoded.encoded_key,
            key_type: slot,
        })
    }
}

fn decode_block_keys(value: &Value) -> StateResult<Vec<BlockKey>> {
    let items = list_of(Variable::BlockTokenKeys, value)?;
    if items.len() > BlockKeyType::SLOTS.len() {
        return Err(StateError::Deserialize(format!(
            "expected at most 3 block token keys, found {}",
            items.len()
        )));
    }
    items
        .iter()
        .zip(BlockKeyType::SLOTS)
        .map(|(item, slot)| BlockKey::decode(slot, item))
        .collect()
}

fn list_of(var: Variable, value: &Value) -> StateResult<&[Primitive]> {
    value.as_list().ok_or(StateError::TypeMismatch {
        variable: var.name(),
        expected: var.kind(),
        actual: value.kind(),
    })
}

fn numeric(var: Variable, value: &Value) -> StateResult<i64> {
    value.as_i64().ok_or(StateError::TypeMismatch {
        variable: var.name(),
        expected: var.kind(),
        actual: value.kind(),
    })
}

fn string(var: Variable, value: Value) -> StateResult<String> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(StateError::TypeMismatch {
            variable: var.name(),
            expected: var.kind(),
            actual: other.kind(),
        }),
    }
}

impl VariableStore {
    // ── Id counters ────────────────────────────────────────────────

    /// Allocate `delta` block ids.
    pub fn increment_block_id_counter(&self, delta: i64) -> StateResult<Counter> {
        self.increment_counter(Variable::BlockId, delta)
    }

    /// Allocate `delta` inode ids.
    pub fn increment_inode_id_counter(&self, delta: i64) -> StateResult<Counter> {
        self.increment_counter(Variable::INodeId, delta)
    }

    /// Allocate `delta` quota-update ids.
    pub fn increment_quota_update_id_counter(&self, delta: i64) -> StateResult<Counter> {
        self.increment_counter(Variable::QuotaUpdateId, delta)
    }

    /// Advance the mis-replicated-files scan cursor by `delta` and return
    /// the new position. A delta of 0 rewinds the cursor to 0.
    pub fn increment_mis_replicated_index(&self, delta: i64) -> StateResult<i64> {
        let var = Variable::MisReplicatedFilesIndex;
        let mut lock = self.lock()?;
        let old = match lock.get(var) {
            Ok(value) => numeric(var, &value)?,
            Err(StateError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        let new = if delta == 0 {
            0
        } else {
            old.checked_add(delta).ok_or(StateError::Overflow(var.name()))?
        };
        lock.set(var, Value::Long(new))?;
        lock.commit()?;
        Ok(new)
    }

    pub fn reset_mis_replicated_index(&self) -> StateResult<()> {
        self.increment_mis_replicated_index(0).map(|_| ())
    }

    // ── Safe mode ──────────────────────────────────────────────────

    pub fn enter_cluster_safe_mode(&self) -> StateResult<()> {
        self.update(Variable::ClusterInSafeMode, Value::Int(1))?;
        info!("cluster entered safe mode");
        Ok(())
    }

    pub fn exit_cluster_safe_mode(&self) -> StateResult<()> {
        self.update(Variable::ClusterInSafeMode, Value::Int(0))?;
        info!("cluster left safe mode");
        Ok(())
    }

    /// High-frequency poll; never takes the exclusive lock.
    pub fn is_cluster_in_safe_mode(&self) -> StateResult<bool> {
        let var = Variable::ClusterInSafeMode;
        Ok(numeric(var, &self.get(var)?)? == 1)
    }

    // ── Replication cursor ─────────────────────────────────────────

    pub fn set_replication_index(&self, indices: &[i32]) -> StateResult<()> {
        let list = indices.iter().copied().map(Primitive::Int).collect();
        self.update(Variable::ReplicationIndex, Value::List(list))
    }

    pub fn replication_index(&self) -> StateResult<Vec<i32>> {
        let var = Variable::ReplicationIndex;
        let value = self.get(var)?;
        list_of(var, &value)?
            .iter()
            .map(|item| match item {
                Primitive::Int(v) => Ok(*v),
                _ => Err(StateError::Deserialize(
                    "replication index entry is not an integer".to_string(),
                )),
            })
            .collect()
    }

    // ── Storage descriptor ─────────────────────────────────────────

    pub fn set_storage_info(&self, info: &StorageInfo) -> StateResult<()> {
        self.update(Variable::StorageInfo, info.to_value())
    }

    /// `None` until the cluster has been formatted with a descriptor.
    pub fn storage_info(&self) -> StateResult<Option<StorageInfo>> {
        StorageInfo::from_value(&self.get(Variable::StorageInfo)?)
    }

    // ── Block-token keys ───────────────────────────────────────────

    /// Replace the block-token key set. Slot order encodes the key type.
    pub fn update_block_token_keys(
        &self,
        current: &BlockKey,
        next: &BlockKey,
        simple: Option<&BlockKey>,
    ) -> StateResult<()> {
        let mut list = vec![current.encode()?, next.encode()?];
        if let Some(simple) = simple {
            list.push(simple.encode()?);
        }
        self.update(Variable::BlockTokenKeys, Value::List(list))
    }

    pub fn block_token_keys_by_id(&self) -> StateResult<HashMap<i32, BlockKey>> {
        let keys = decode_block_keys(&self.get(Variable::BlockTokenKeys)?)?;
        Ok(keys.into_iter().map(|k| (k.key_id, k)).collect())
    }

    pub fn block_token_keys_by_type(&self) -> StateResult<HashMap<BlockKeyType, BlockKey>> {
        let keys = decode_block_keys(&self.get(Variable::BlockTokenKeys)?)?;
        Ok(keys.into_iter().map(|k| (k.key_type, k)).collect())
    }

    // ── Plain counters and ids ─────────────────────────────────────

    pub fn sid_counter(&self) -> StateResult<i32> {
        let var = Variable::SIdCounter;
        let value = numeric(var, &self.get(var)?)?;
        i32::try_from(value).map_err(|_| StateError::Overflow(var.name()))
    }

    pub fn set_sid_counter(&self, sid: i32) -> StateResult<()> {
        self.update(Variable::SIdCounter, Value::Int(sid))
    }

    pub fn max_nn_id(&self) -> StateResult<i64> {
        let var = Variable::MaxNnId;
        numeric(var, &self.get(var)?)
    }

    pub fn set_max_nn_id(&self, id: i64) -> StateResult<()> {
        self.update(Variable::MaxNnId, Value::Long(id))
    }

    // ── Upgrade and snapshot status ────────────────────────────────

    pub fn rollback_status(&self) -> StateResult<String> {
        self.status(Variable::RollBackStatus)
    }

    pub fn set_rollback_status(&self, status: &str) -> StateResult<()> {
        self.set_status(Variable::RollBackStatus, status)
    }

    pub fn rollback_request_status(&self) -> StateResult<String> {
        self.status(Variable::RollBackRequestStatus)
    }

    pub fn set_rollback_request_status(&self, status: &str) -> StateResult<()> {
        self.set_status(Variable::RollBackRequestStatus, status)
    }

    pub fn snapshot_status(&self) -> StateResult<String> {
        self.status(Variable::SnapShotStatus)
    }

    pub fn set_snapshot_status(&self, status: &str) -> StateResult<()> {
        self.set_status(Variable::SnapShotStatus, status)
    }

    pub fn snapshot_request_status(&self) -> StateResult<String> {
        self.status(Variable::SnapshotRequestStatus)
    }

    pub fn set_snapshot_request_status(&self, status: &str) -> StateResult<()> {
        self.set_status(Variable::SnapshotRequestStatus, status)
    }

    pub fn remove_snapshot_status(&self) -> StateResult<String> {
        self.status(Variable::RemoveSnapshotStatus)
    }

    pub fn set_remove_snapshot_status(&self, status: &str) -> StateResult<()> {
        self.set_status(Variable::RemoveSnapshotStatus, status)
    }

    fn status(&self, var: Variable) -> StateResult<String> {
        string(var, self.get(var)?)
    }

    fn set_status(&self, var: Variable, status: &str) -> StateResult<()> {
        self.update(var, Value::Str(status.to_string()))?;
        info!(variable = var.name(), %status, "status updated");
        Ok(())
    }
}

impl VariableLock {
    /// Block-token keys read under the exclusive lock.
    pub fn block_token_keys(&self) -> StateResult<Vec<BlockKey>> {
        decode_block_keys(&self.get(Variable::BlockTokenKeys)?)
    }
}
