//! Persisted-state reader — last committed per-node state.
//!
//! Used by `recover` when a replica restarts or becomes leader, and by
//! non-leader replicas to refresh cleanup bookkeeping that the leader may
//! have changed behind their back.

use std::collections::BTreeSet;

use crate::error::StateResult;
use crate::types::*;

/// Everything committed for one node, gathered in one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistedNodeState {
    pub record: Option<NodeRecord>,
    pub just_launched: Vec<ContainerStatus>,
    pub containers_to_clean: BTreeSet<ContainerId>,
    pub finished_applications: Vec<ApplicationId>,
    /// Update batches in batch-id order.
    pub updated_container_info: Vec<UpdatedContainerInfo>,
    pub last_heartbeat_response: Option<HeartbeatResponse>,
    pub next_heartbeat: Option<bool>,
}

/// Read access to the last committed values for one node.
pub trait NodeStateReader: Send + Sync {
    fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>>;

    fn get_just_launched_containers(&self, node_id: &str) -> StateResult<Vec<ContainerStatus>>;

    fn get_containers_to_clean(&self, node_id: &str) -> StateResult<BTreeSet<ContainerId>>;

    fn get_finished_applications(&self, node_id: &str) -> StateResult<Vec<ApplicationId>>;

    /// Update batches in batch-id order.
    fn get_updated_container_info(&self, node_id: &str) -> StateResult<Vec<UpdatedContainerInfo>>;

    fn get_last_heartbeat_response(&self, node_id: &str) -> StateResult<Option<HeartbeatResponse>>;

    fn get_next_heartbeat(&self, node_id: &str) -> StateResult<Option<bool>>;

    fn load_node_state(&self, node_id: &str) -> StateResult<PersistedNodeState> {
        Ok(PersistedNodeState {
            record: self.get_node(node_id)?,
            just_launched: self.get_just_launched_containers(node_id)?,
            containers_to_clean: self.get_containers_to_clean(node_id)?,
            finished_applications: self.get_finished_applications(node_id)?,
            updated_container_info: self.get_updated_container_info(node_id)?,
            last_heartbeat_response: self.get_last_heartbeat_response(node_id)?,
            next_heartbeat: self.get_next_heartbeat(node_id)?,
        })
    }
}
