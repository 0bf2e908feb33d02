//! ClusterContext — registries, metrics and collaborators shared by every node.
//!
//! One context is built at process start-up and passed to every
//! `Node::handle` call; nothing here is a process-wide singleton.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nodegrid_state::{Mutation, NodeState, NodeStateReader, StateResult, StateStore};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::error::{InvalidTransition, LifecycleError, LifecycleResult};
use crate::event::NodeEvent;
use crate::event_unit::EventUnit;
use crate::leader::{LeaderFlag, LeadershipQuery};
use crate::metrics::ClusterMetrics;
use crate::node::{Node, Transitioned};
use crate::notifier::{Notification, SchedulerNotifier};
use crate::transitions::Effect;

/// Shared state of one manager replica.
///
/// Lock order: a node's write lock may be held while taking a registry
/// lock, never the reverse. Registry guards are released before any node
/// method is called.
pub struct ClusterContext {
    /// `node_id` → node.
    active: RwLock<HashMap<String, Arc<Node>>>,
    /// host → last node seen on that host.
    inactive: RwLock<HashMap<String, Arc<Node>>>,
    metrics: ClusterMetrics,
    leadership: Arc<dyn LeadershipQuery>,
    notifier: Arc<dyn SchedulerNotifier>,
    reader: Option<Arc<dyn NodeStateReader>>,
    distributed: bool,
    excluded_hosts: HashSet<String>,
}

impl ClusterContext {
    /// A standalone, always-leader context.
    pub fn new(notifier: Arc<dyn SchedulerNotifier>) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            inactive: RwLock::new(HashMap::new()),
            metrics: ClusterMetrics::default(),
            leadership: Arc::new(LeaderFlag::new(true)),
            notifier,
            reader: None,
            distributed: false,
            excluded_hosts: HashSet::new(),
        }
    }

    pub fn with_leadership(mut self, leadership: Arc<dyn LeadershipQuery>) -> Self {
        self.leadership = leadership;
        self
    }

    /// Reader of committed state, consulted by non-leader replicas.
    pub fn with_reader(mut self, reader: Arc<dyn NodeStateReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Enable the pending-event relay for non-leader replicas.
    pub fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    /// Hosts excluded from the cluster. They count as decommissioned from
    /// the moment the list is loaded.
    pub fn with_excluded_hosts(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        let before = self.excluded_hosts.len();
        self.excluded_hosts.extend(hosts);
        self.metrics
            .add_decommissioned((self.excluded_hosts.len() - before) as u64);
        self
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    /// Scheduler notifications must be deferred to the leader.
    pub fn relay_enabled(&self) -> bool {
        self.distributed && !self.leadership.is_leader()
    }

    pub fn reader(&self) -> Option<&dyn NodeStateReader> {
        self.reader.as_deref()
    }

    pub fn is_excluded(&self, host: &str) -> bool {
        self.excluded_hosts.contains(host)
    }

    pub fn notifier(&self) -> &dyn SchedulerNotifier {
        self.notifier.as_ref()
    }

    // ── Registries ─────────────────────────────────────────────────

    pub fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.active.read().get(node_id).cloned()
    }

    /// Active nodes ordered by node id.
    pub fn active_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.active.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.key().cmp(b.key()));
        nodes
    }

    pub fn inactive_node(&self, host: &str) -> Option<Arc<Node>> {
        self.inactive.read().get(host).cloned()
    }

    /// Inactive nodes ordered by host.
    pub fn inactive_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.inactive.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.host().cmp(b.host()));
        nodes
    }

    /// Look a node up in either registry.
    pub fn find_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.node(node_id).or_else(|| {
            self.inactive
                .read()
                .values()
                .find(|node| node.key() == node_id)
                .cloned()
        })
    }

    // ── Entry points ───────────────────────────────────────────────

    /// Register a node reported by the heartbeat service.
    ///
    /// A node id seen for the first time is started and joins the active
    /// registry when `unit` commits. A known id receives `Reconnected`
    /// carrying the new entity.
    pub fn register_node(
        &self,
        node: Arc<Node>,
        unit: &mut EventUnit,
    ) -> Result<Transitioned, InvalidTransition> {
        match self.node(node.key()) {
            None => {
                info!(node_id = %node.key(), http_port = node.http_port(), "node registered");
                node.handle(self, NodeEvent::Started, unit)
            }
            Some(existing) => {
                info!(node_id = %node.key(), "node reconnected");
                existing.handle(self, NodeEvent::Reconnected(node), unit)
            }
        }
    }

    /// Deliver `event` to the active node `node_id`.
    pub fn dispatch(
        &self,
        node_id: &str,
        event: NodeEvent,
        unit: &mut EventUnit,
    ) -> LifecycleResult<Transitioned> {
        let node = self
            .node(node_id)
            .ok_or_else(|| LifecycleError::UnknownNode(node_id.to_string()))?;
        Ok(node.handle(self, event, unit)?)
    }

    /// Rebuild registries, node queues and metrics from committed state.
    ///
    /// Used when a replica starts or takes over leadership. Returns the
    /// number of nodes restored.
    pub fn recover_from(&self, store: &StateStore) -> StateResult<usize> {
        let active_ids: HashSet<String> = store
            .active_nodes()?
            .into_iter()
            .map(|(node_id, _)| node_id)
            .collect();
        let inactive_hosts: HashMap<String, String> = store
            .inactive_nodes()?
            .into_iter()
            .map(|(host, node_id)| (node_id, host))
            .collect();

        let mut restored = 0;
        for record in store.list_nodes()? {
            let node = Arc::new(Node::from_record(&record));
            if active_ids.contains(node.key()) {
                node.recover(store)?;
                self.metrics.restore(node.state(), true);
                self.active.write().insert(node.key().to_string(), node);
                restored += 1;
            } else if let Some(host) = inactive_hosts.get(node.key()) {
                node.recover(store)?;
                self.metrics.restore(node.state(), !self.is_excluded(host));
                self.inactive.write().insert(host.clone(), node);
                restored += 1;
            }
        }
        info!(restored, "cluster state recovered");
        Ok(restored)
    }

    // ── Effects ────────────────────────────────────────────────────

    /// Stage the registry rows behind `effects` and defer the rest of
    /// their work until `unit` commits.
    pub(crate) fn stage_effects(&self, node: &Arc<Node>, effects: Vec<Effect>, unit: &mut EventUnit) {
        for effect in effects {
            match effect {
                Effect::Join => {
                    unit.stage(Mutation::AddActiveNode {
                        node_id: node.key().to_string(),
                        host: node.host().to_string(),
                    });
                    if self.inactive.read().contains_key(node.host()) {
                        unit.stage(Mutation::RemoveInactiveNode {
                            host: node.host().to_string(),
                        });
                    }
                    unit.defer(node, Effect::Join);
                }
                Effect::Deactivate { initial, target } => {
                    unit.stage(Mutation::RemoveActiveNode {
                        node_id: node.key().to_string(),
                    });
                    unit.stage(Mutation::AddInactiveNode {
                        host: node.host().to_string(),
                        node_id: node.key().to_string(),
                    });
                    unit.defer(node, Effect::Deactivate { initial, target });
                }
                Effect::Replace {
                    node: replacement,
                    previous,
                    next_heartbeat,
                } => {
                    unit.defer(
                        node,
                        Effect::Replace {
                            node: Arc::clone(&replacement),
                            previous,
                            next_heartbeat,
                        },
                    );
                    self.stage_replacement(&replacement, next_heartbeat, unit);
                }
                effect => unit.defer(node, effect),
            }
        }
    }

    fn stage_replacement(&self, replacement: &Arc<Node>, next_heartbeat: bool, unit: &mut EventUnit) {
        replacement.set_next_heartbeat(next_heartbeat);
        unit.stage(Mutation::SetNextHeartbeat {
            node_id: replacement.key().to_string(),
            next_heartbeat,
        });
        unit.stage(Mutation::SetHeartbeatResponse {
            node_id: replacement.key().to_string(),
            response: replacement.last_heartbeat_response(),
        });
        debug!(node_id = %replacement.key(), "replacement node staged");
        if let Err(e) = replacement.handle(self, NodeEvent::Started, unit) {
            error!(node_id = %replacement.key(), error = %e, "replacement node failed to start");
        }
    }

    /// Apply one deferred effect of a committed unit.
    pub(crate) fn apply_committed(&self, node: &Arc<Node>, effect: Effect) {
        match effect {
            Effect::Notify(kind) => self.notifier.notify(Notification::new(kind, node)),
            Effect::BecameUnhealthy { initial } => {
                self.metrics.deactivated(initial, NodeState::Unhealthy, true)
            }
            Effect::BecameHealthy => self.metrics.rejoined(NodeState::Unhealthy),
            Effect::Join => self.join(node),
            Effect::Deactivate { initial, target } => {
                self.deactivate(node);
                self.metrics
                    .deactivated(initial, target, !self.is_excluded(node.host()));
            }
            Effect::Replace {
                node: replacement,
                previous,
                ..
            } => {
                self.metrics.replaced(previous);
                self.active
                    .write()
                    .insert(replacement.key().to_string(), replacement);
            }
        }
    }

    fn join(&self, node: &Arc<Node>) {
        self.active
            .write()
            .insert(node.key().to_string(), Arc::clone(node));
        let previous = self.inactive.write().remove(node.host());
        match previous {
            Some(previous) => {
                let state = previous.state();
                self.metrics.rejoined(state);
                info!(node_id = %node.key(), previous = ?state, "node rejoined");
            }
            None => self.metrics.incr_active(),
        }
    }

    fn deactivate(&self, node: &Arc<Node>) {
        {
            let mut active = self.active.write();
            if active.get(node.key()).is_some_and(|n| Arc::ptr_eq(n, node)) {
                active.remove(node.key());
            }
        }
        self.inactive
            .write()
            .insert(node.host().to_string(), Arc::clone(node));
    }
}

#[cfg(test)]
mod tests {
    use nodegrid_state::ContainerStatus;

    use super::*;
    use crate::notifier::ChannelNotifier;
    use crate::test_support::*;

    #[test]
    fn dispatch_to_unknown_node_fails() {
        let h = harness();
        let mut unit = EventUnit::new();
        let err = h
            .ctx
            .dispatch("ghost:1", NodeEvent::Expire, &mut unit)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownNode(id) if id == "ghost:1"));
    }

    #[test]
    fn dispatch_reports_invalid_transitions() {
        let mut h = harness();
        h.running("h1");
        let mut unit = EventUnit::new();
        let err = h
            .ctx
            .dispatch("h1:8041", NodeEvent::Started, &mut unit)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition(_)));
    }

    #[test]
    fn relay_only_applies_to_distributed_followers() {
        assert!(!harness().ctx.relay_enabled());
        assert!(!distributed(true).ctx.relay_enabled());
        let h = distributed(false);
        assert!(h.ctx.relay_enabled());
        h.leader.set(true);
        assert!(!h.ctx.relay_enabled());
    }

    #[test]
    fn recovery_rebuilds_registries_and_metrics() {
        let mut h = with_excluded(&["h3"]);
        let a = h.running("h1");
        h.send(&a, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        let b = h.running("h2");
        h.send(&b, unhealthy_heartbeat()).unwrap();
        let c = h.running("h3");
        h.send(&c, NodeEvent::Decommission).unwrap();
        let d = h.running("h4");
        h.send(&d, NodeEvent::Expire).unwrap();

        let (notifier, _rx) = ChannelNotifier::new();
        let ctx = ClusterContext::new(Arc::new(notifier)).with_excluded_hosts(vec!["h3".to_string()]);
        assert_eq!(ctx.recover_from(&h.store).unwrap(), 4);

        let active: Vec<String> = ctx.active_nodes().iter().map(|n| n.key().to_string()).collect();
        assert_eq!(active, vec!["h1:8041", "h2:8041"]);
        let inactive: Vec<NodeState> = ctx.inactive_nodes().iter().map(|n| n.state()).collect();
        assert_eq!(inactive, vec![NodeState::Decommissioned, NodeState::Lost]);
        assert_eq!(ctx.node("h1:8041").unwrap().queue_size(), 1);
        assert_eq!(ctx.find_node("h4:8041").unwrap().state(), NodeState::Lost);
        assert_eq!(ctx.metrics().snapshot(), h.ctx.metrics().snapshot());
    }
}
