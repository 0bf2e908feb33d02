//! Node — one worker node and its membership state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use nodegrid_state::{
    ApplicationId, ContainerId, ContainerStatus, HeartbeatResponse, Mutation, NodeId,
    NodeRecord, NodeState, NodeStateReader, Resource, StateResult, UpdatedContainerInfo,
};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::context::ClusterContext;
use crate::error::InvalidTransition;
use crate::event::NodeEvent;
use crate::event_unit::EventUnit;
use crate::notifier::NodeReport;
use crate::transitions::{self, Step};

const INITIAL_HEALTH_REPORT: &str = "Healthy";

/// Mutable part of a node, guarded by the node lock.
#[derive(Debug, Clone)]
pub(crate) struct NodeInner {
    pub(crate) state: NodeState,
    pub(crate) capability: Resource,
    pub(crate) health_report: String,
    pub(crate) last_health_report_time: u64,
    pub(crate) containers_to_clean: BTreeSet<ContainerId>,
    pub(crate) finished_applications: Vec<ApplicationId>,
    pub(crate) just_launched: BTreeMap<ContainerId, ContainerStatus>,
    pub(crate) update_queue: VecDeque<UpdatedContainerInfo>,
    pub(crate) next_update_id: u32,
    pub(crate) latest_response: HeartbeatResponse,
    /// A heartbeat response is owed to the scheduler.
    pub(crate) next_heartbeat: bool,
    /// The last state change has been committed.
    pub(crate) persisted: bool,
}

/// A worker node tracked by the resource manager.
///
/// Identity fields are immutable. Everything else sits behind one
/// reader/writer lock: [`handle`](Node::handle) and the queue operations
/// take the writer, accessors take the reader.
pub struct Node {
    id: NodeId,
    key: String,
    http_port: u16,
    node_manager_version: String,
    inner: RwLock<NodeInner>,
}

/// Result of an applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transitioned {
    pub from: NodeState,
    pub to: NodeState,
}

impl Transitioned {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.key)
            .field("http_port", &self.http_port)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// A freshly registered node in state `NEW`.
    pub fn new(
        id: NodeId,
        http_port: u16,
        capability: Resource,
        node_manager_version: impl Into<String>,
    ) -> Self {
        let key = id.to_string();
        Self {
            id,
            key,
            http_port,
            node_manager_version: node_manager_version.into(),
            inner: RwLock::new(NodeInner {
                state: NodeState::New,
                capability,
                health_report: INITIAL_HEALTH_REPORT.to_string(),
                last_health_report_time: 0,
                containers_to_clean: BTreeSet::new(),
                finished_applications: Vec::new(),
                just_launched: BTreeMap::new(),
                update_queue: VecDeque::new(),
                next_update_id: 0,
                latest_response: HeartbeatResponse::default(),
                next_heartbeat: true,
                persisted: true,
            }),
        }
    }

    /// Rebuild a node's scalar fields from its persisted record. Queues and
    /// cleanup sets are restored separately by [`recover`](Node::recover).
    pub fn from_record(record: &NodeRecord) -> Self {
        let node = Self::new(
            record.node_id.clone(),
            record.http_port,
            record.capability,
            record.node_manager_version.clone(),
        );
        {
            let mut inner = node.inner.write();
            inner.state = record.state;
            inner.health_report = record.health_report.clone();
            inner.last_health_report_time = record.last_health_report_time;
            inner.next_update_id = record.next_update_id;
        }
        node
    }

    // ── Identity ───────────────────────────────────────────────────

    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    /// `host:port` string used as the registry and table key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.id.host
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn node_manager_version(&self) -> &str {
        &self.node_manager_version
    }

    // ── Read-only snapshots ────────────────────────────────────────

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    pub fn capability(&self) -> Resource {
        self.inner.read().capability
    }

    pub fn health_report(&self) -> String {
        self.inner.read().health_report.clone()
    }

    pub fn last_health_report_time(&self) -> u64 {
        self.inner.read().last_health_report_time
    }

    pub fn apps_to_cleanup(&self) -> Vec<ApplicationId> {
        self.inner.read().finished_applications.clone()
    }

    /// Containers pending cleanup in container-id order.
    pub fn containers_to_cleanup(&self) -> Vec<ContainerId> {
        self.inner.read().containers_to_clean.iter().copied().collect()
    }

    pub fn just_launched_containers(&self) -> Vec<ContainerId> {
        self.inner.read().just_launched.keys().copied().collect()
    }

    pub fn last_heartbeat_response(&self) -> HeartbeatResponse {
        self.inner.read().latest_response.clone()
    }

    pub fn next_heartbeat(&self) -> bool {
        self.inner.read().next_heartbeat
    }

    pub fn is_persisted(&self) -> bool {
        self.inner.read().persisted
    }

    /// Called once the unit carrying the last transition has committed.
    pub fn mark_persisted(&self) {
        self.inner.write().persisted = true;
    }

    pub(crate) fn restore(&self, snapshot: NodeInner) {
        *self.inner.write() = snapshot;
    }

    pub fn queue_size(&self) -> usize {
        self.inner.read().update_queue.len()
    }

    /// Test hook: force the owed-heartbeat flag.
    pub fn set_next_heartbeat(&self, next_heartbeat: bool) {
        self.inner.write().next_heartbeat = next_heartbeat;
    }

    pub fn report(&self) -> NodeReport {
        let inner = self.inner.read();
        NodeReport {
            node_id: self.id.clone(),
            http_port: self.http_port,
            capability: inner.capability,
            state: inner.state,
            health_report: inner.health_report.clone(),
        }
    }

    pub fn record(&self) -> NodeRecord {
        self.record_of(&self.inner.read())
    }

    pub(crate) fn record_of(&self, inner: &NodeInner) -> NodeRecord {
        NodeRecord {
            node_id: self.id.clone(),
            http_port: self.http_port,
            capability: inner.capability,
            health_report: inner.health_report.clone(),
            last_health_report_time: inner.last_health_report_time,
            state: inner.state,
            node_manager_version: self.node_manager_version.clone(),
            next_update_id: inner.next_update_id,
        }
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Run the transition for `event` and stage its persisted changes.
    ///
    /// Registry moves, metrics and notifications are deferred in `unit` and
    /// applied when it commits. A replacement node's `Started` is handled
    /// into the same unit once the node lock is released.
    pub fn handle(
        self: &Arc<Self>,
        ctx: &ClusterContext,
        event: NodeEvent,
        unit: &mut EventUnit,
    ) -> Result<Transitioned, InvalidTransition> {
        let kind = event.kind();
        debug!(node_id = %self.key, event = %kind, "processing node event");

        let (transitioned, effects) = {
            let mut inner = self.inner.write();
            let from = inner.state;
            let Some(rule) = transitions::rule_for(from, kind) else {
                error!(node_id = %self.key, state = ?from, event = %kind, "invalid event for current node state");
                return Err(InvalidTransition {
                    node_id: self.key.clone(),
                    state: from,
                    event: kind,
                });
            };
            unit.snapshot(self, &inner);
            let mut step = Step::new(self, ctx, unit.transaction_mut());
            let to = rule.apply(&mut inner, &mut step, &event);
            let effects = step.into_effects();
            inner.state = to;
            unit.stage(Mutation::PutNode(self.record_of(&inner)));
            (Transitioned { from, to }, effects)
        };

        if transitioned.changed() {
            info!(
                node_id = %self.key,
                from = ?transitioned.from,
                to = ?transitioned.to,
                "node transitioned"
            );
        }
        ctx.stage_effects(self, effects, unit);
        Ok(transitioned)
    }

    /// Drain every queued update batch for the scheduler.
    ///
    /// The drain is staged into `unit`; committing it is what makes the
    /// hand-over durable. Marks the next heartbeat as owed.
    pub fn pull_updates(self: &Arc<Self>, unit: &mut EventUnit) -> Vec<UpdatedContainerInfo> {
        let mut inner = self.inner.write();
        unit.snapshot(self, &inner);
        let drained: Vec<UpdatedContainerInfo> = inner.update_queue.drain(..).collect();
        for info in &drained {
            unit.stage(Mutation::RemoveUpdatedContainerInfo {
                node_id: self.key.clone(),
                id: info.id,
            });
        }
        inner.next_heartbeat = true;
        unit.stage(Mutation::SetNextHeartbeat {
            node_id: self.key.clone(),
            next_heartbeat: true,
        });
        debug!(node_id = %self.key, batches = drained.len(), "container updates pulled");
        drained
    }

    /// Move pending container and application cleanup into `response`.
    pub fn update_heartbeat_response_for_cleanup(
        self: &Arc<Self>,
        ctx: &ClusterContext,
        response: &mut HeartbeatResponse,
        unit: &mut EventUnit,
    ) {
        let mut inner = self.inner.write();
        unit.snapshot(self, &inner);
        if ctx.relay_enabled() {
            refresh_cleanup_sets(&self.key, &mut inner, ctx);
        }
        let containers = std::mem::take(&mut inner.containers_to_clean);
        let apps = std::mem::take(&mut inner.finished_applications);
        debug!(
            node_id = %self.key,
            containers = containers.len(),
            applications = apps.len(),
            "cleanup added to heartbeat response"
        );
        for container_id in &containers {
            unit.stage(Mutation::RemoveContainerToClean {
                node_id: self.key.clone(),
                container_id: *container_id,
            });
        }
        for app_id in &apps {
            unit.stage(Mutation::RemoveFinishedApplication {
                node_id: self.key.clone(),
                app_id: *app_id,
            });
        }
        response.containers_to_cleanup.extend(containers);
        response.applications_to_cleanup.extend(apps);
    }

    /// Restore queues, cleanup sets and heartbeat bookkeeping from the last
    /// committed state.
    ///
    /// Batch ids resume after the highest id ever handed out, whether it is
    /// still queued or was already drained.
    pub fn recover(&self, reader: &dyn NodeStateReader) -> StateResult<()> {
        let saved = reader.load_node_state(&self.key)?;
        let mut inner = self.inner.write();

        for status in saved.just_launched {
            inner.just_launched.insert(status.container_id, status);
        }
        inner.containers_to_clean.extend(saved.containers_to_clean);
        for app_id in saved.finished_applications {
            if !inner.finished_applications.contains(&app_id) {
                inner.finished_applications.push(app_id);
            }
        }

        let mut next_update_id = saved
            .record
            .map_or(inner.next_update_id, |record| record.next_update_id);
        if let Some(last) = saved.updated_container_info.last() {
            next_update_id = next_update_id.max(last.id.saturating_add(1));
        }
        inner.next_update_id = next_update_id.max(inner.next_update_id);
        inner.update_queue.extend(saved.updated_container_info);

        if let Some(response) = saved.last_heartbeat_response {
            inner.latest_response = response;
        }
        if let Some(next_heartbeat) = saved.next_heartbeat {
            inner.next_heartbeat = next_heartbeat;
        }
        inner.persisted = true;

        debug!(
            node_id = %self.key,
            queued = inner.update_queue.len(),
            next_update_id = inner.next_update_id,
            "node state recovered"
        );
        Ok(())
    }
}

/// Replace the in-memory cleanup sets with what the leader committed.
pub(crate) fn refresh_cleanup_sets(key: &str, inner: &mut NodeInner, ctx: &ClusterContext) {
    let Some(reader) = ctx.reader() else {
        return;
    };
    let refreshed = reader
        .get_containers_to_clean(key)
        .and_then(|containers| Ok((containers, reader.get_finished_applications(key)?)));
    match refreshed {
        Ok((containers, apps)) => {
            inner.containers_to_clean = containers;
            inner.finished_applications = apps;
        }
        Err(e) => error!(node_id = %key, error = %e, "failed to refresh cleanup sets"),
    }
}

#[cfg(test)]
mod tests {
    use nodegrid_state::{ContainerStatus, TransactionUnit};

    use super::*;
    use crate::test_support::*;

    #[test]
    fn new_node_owes_a_heartbeat() {
        let n = node("h1", 8041);
        assert_eq!(n.state(), NodeState::New);
        assert_eq!(n.key(), "h1:8041");
        assert_eq!(n.health_report(), "Healthy");
        assert!(n.next_heartbeat());
        assert!(n.is_persisted());
        assert_eq!(n.last_heartbeat_response().response_id, 0);
    }

    #[test]
    fn pull_updates_drains_and_marks_heartbeat_owed() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        assert!(!n.next_heartbeat());
        assert!(n.is_persisted());

        let mut unit = EventUnit::new();
        let first = n.pull_updates(&mut unit);
        assert_eq!(first.len(), 1);
        assert!(n.next_heartbeat());
        // Not yet committed: the batch is still persisted.
        assert_eq!(h.store.get_updated_container_info(n.key()).unwrap().len(), 1);
        unit.commit(&h.ctx, &h.store).unwrap();
        assert!(h.store.get_updated_container_info(n.key()).unwrap().is_empty());
        assert_eq!(h.store.get_next_heartbeat(n.key()).unwrap(), Some(true));

        assert!(h.pull(&n).is_empty());
    }

    #[test]
    fn cleanup_moves_into_heartbeat_response() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, NodeEvent::CleanupContainer(cid(1, 2))).unwrap();
        h.send(&n, NodeEvent::CleanupContainer(cid(1, 1))).unwrap();
        h.send(&n, NodeEvent::CleanupApp(app(3))).unwrap();

        let mut response = HeartbeatResponse::with_id(5);
        let mut unit = EventUnit::new();
        n.update_heartbeat_response_for_cleanup(&h.ctx, &mut response, &mut unit);
        unit.commit(&h.ctx, &h.store).unwrap();

        assert_eq!(response.response_id, 5);
        assert_eq!(response.containers_to_cleanup, vec![cid(1, 1), cid(1, 2)]);
        assert_eq!(response.applications_to_cleanup, vec![app(3)]);
        assert!(n.containers_to_cleanup().is_empty());
        assert!(n.apps_to_cleanup().is_empty());
        assert!(h.store.get_containers_to_clean(n.key()).unwrap().is_empty());
        assert!(h.store.get_finished_applications(n.key()).unwrap().is_empty());
    }

    #[test]
    fn recovery_resumes_batch_ids_after_drain() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 2))])).unwrap();
        assert_eq!(h.pull(&n).iter().map(|u| u.id).collect::<Vec<_>>(), vec![0, 1]);
        h.send(&n, heartbeat(vec![ContainerStatus::completed(cid(1, 1), 0)])).unwrap();

        let record = h.store.get_node(n.key()).unwrap().unwrap();
        let restored = Node::from_record(&record);
        restored.recover(&h.store).unwrap();

        assert_eq!(restored.state(), NodeState::Running);
        assert_eq!(restored.queue_size(), 1);
        assert_eq!(restored.just_launched_containers(), vec![cid(1, 2)]);
        assert_eq!(restored.last_heartbeat_response(), n.last_heartbeat_response());

        let restored = Arc::new(restored);
        h.send(&restored, heartbeat(vec![ContainerStatus::completed(cid(1, 2), 0)])).unwrap();
        let ids: Vec<u32> = h.pull(&restored).iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn recovery_uses_queue_when_record_lags() {
        let h = harness();
        let mut unit = TransactionUnit::new();
        let mut record = node("h9", 1).record();
        record.state = NodeState::Running;
        unit.stage(Mutation::PutNode(record.clone()));
        unit.stage(Mutation::AddUpdatedContainerInfo {
            node_id: "h9:1".into(),
            info: UpdatedContainerInfo {
                newly_launched: vec![ContainerStatus::running(cid(1, 1))],
                completed: Vec::new(),
                id: 6,
            },
        });
        unit.commit(&h.store).unwrap();

        let restored = Node::from_record(&record);
        restored.recover(&h.store).unwrap();
        assert_eq!(restored.record().next_update_id, 7);
    }
}
