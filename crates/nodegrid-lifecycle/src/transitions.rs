//! The node transition table.
//!
//! Each rule maps `(state, event)` to a transition function and the set of
//! states that function may return. Functions run under the node's write
//! lock. They mutate the node, stage persisted changes into the unit, and
//! describe everything else as [`Effect`]s. Effects that touch registries
//! stage their rows once the lock is gone; all of them take hold in memory
//! only when the unit commits.

use std::sync::Arc;

use nodegrid_state::{ContainerState, Mutation, NodeState, PendingEventKind, TransactionUnit, UpdatedContainerInfo};
use tracing::{debug, info};

use crate::context::ClusterContext;
use crate::event::{NodeEvent, NodeEventKind, StatusUpdate};
use crate::node::{refresh_cleanup_sets, Node, NodeInner};
use crate::notifier::NotificationKind;
use crate::relay::{self, Delivery};

use NodeEventKind as E;
use NodeState as S;

/// Work deferred past the node lock and applied on commit.
#[derive(Debug)]
pub(crate) enum Effect {
    Notify(NotificationKind),
    /// A running node reported itself unhealthy.
    BecameUnhealthy { initial: NodeState },
    /// An unhealthy node reported itself healthy again.
    BecameHealthy,
    /// Register the node as active; roll rejoin metrics if its host was inactive.
    Join,
    /// Move the node from the active to the inactive registry.
    Deactivate { initial: NodeState, target: NodeState },
    /// Put `node` in place of the handling node and start it.
    Replace {
        node: Arc<Node>,
        previous: NodeState,
        next_heartbeat: bool,
    },
}

/// Per-event scratch state handed to a transition function.
pub(crate) struct Step<'a> {
    pub(crate) node: &'a Node,
    pub(crate) ctx: &'a ClusterContext,
    pub(crate) unit: &'a mut TransactionUnit,
    effects: Vec<Effect>,
}

impl<'a> Step<'a> {
    pub(crate) fn new(node: &'a Node, ctx: &'a ClusterContext, unit: &'a mut TransactionUnit) -> Self {
        Self {
            node,
            ctx,
            unit,
            effects: Vec::new(),
        }
    }

    pub(crate) fn into_effects(self) -> Vec<Effect> {
        self.effects
    }

    /// Scheduler notification: direct on the leader, a pending marker otherwise.
    fn scheduler(&mut self, kind: PendingEventKind) {
        if let Delivery::Direct = relay::route(self.ctx, self.unit, self.node.key(), kind, None) {
            self.effects.push(Effect::Notify(kind.into()));
        }
    }

    fn nodes_list(&mut self, kind: NotificationKind) {
        self.effects.push(Effect::Notify(kind));
    }

    fn key(&self) -> String {
        self.node.key().to_string()
    }

    /// Discard every queued update batch.
    fn drain_queue(&mut self, inner: &mut NodeInner) {
        debug!(node_id = %self.node.key(), size = inner.update_queue.len(), "update queue cleared");
        for info in inner.update_queue.drain(..) {
            self.unit.stage(Mutation::RemoveUpdatedContainerInfo {
                node_id: self.node.key().to_string(),
                id: info.id,
            });
        }
    }
}

type TransitionFn = fn(&mut NodeInner, &mut Step<'_>, &NodeEvent) -> NodeState;

/// One row of the transition table.
pub struct Rule {
    pub from: NodeState,
    pub event: NodeEventKind,
    pub targets: &'static [NodeState],
    action: TransitionFn,
}

impl Rule {
    pub(crate) fn apply(&self, inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
        let to = (self.action)(inner, step, event);
        debug_assert!(
            self.targets.contains(&to),
            "{:?} on {:?} produced {:?}",
            self.event,
            self.from,
            to
        );
        to
    }
}

static RULES: [Rule; 15] = [
    Rule { from: S::New, event: E::Started, targets: &[S::Running], action: add_node },
    Rule { from: S::Running, event: E::StatusUpdate, targets: &[S::Running, S::Unhealthy], action: status_update_when_healthy },
    Rule { from: S::Running, event: E::Decommission, targets: &[S::Decommissioned], action: deactivate },
    Rule { from: S::Running, event: E::Expire, targets: &[S::Lost], action: deactivate },
    Rule { from: S::Running, event: E::Rebooting, targets: &[S::Rebooted], action: deactivate },
    Rule { from: S::Running, event: E::CleanupApp, targets: &[S::Running], action: cleanup_app },
    Rule { from: S::Running, event: E::CleanupContainer, targets: &[S::Running], action: cleanup_container },
    Rule { from: S::Running, event: E::Reconnected, targets: &[S::Running], action: reconnect },
    Rule { from: S::Unhealthy, event: E::StatusUpdate, targets: &[S::Unhealthy, S::Running], action: status_update_when_unhealthy },
    Rule { from: S::Unhealthy, event: E::Decommission, targets: &[S::Decommissioned], action: deactivate },
    Rule { from: S::Unhealthy, event: E::Expire, targets: &[S::Lost], action: deactivate },
    Rule { from: S::Unhealthy, event: E::Rebooting, targets: &[S::Rebooted], action: deactivate },
    Rule { from: S::Unhealthy, event: E::Reconnected, targets: &[S::Unhealthy], action: reconnect },
    Rule { from: S::Unhealthy, event: E::CleanupApp, targets: &[S::Unhealthy], action: cleanup_app },
    Rule { from: S::Unhealthy, event: E::CleanupContainer, targets: &[S::Unhealthy], action: cleanup_container },
];

/// Every rule of the table.
pub fn rules() -> &'static [Rule] {
    &RULES
}

pub(crate) fn rule_for(from: NodeState, event: NodeEventKind) -> Option<&'static Rule> {
    RULES.iter().find(|rule| rule.from == from && rule.event == event)
}

/// States `event` may lead to from `from`; `None` when the pair is invalid.
pub fn targets(from: NodeState, event: NodeEventKind) -> Option<&'static [NodeState]> {
    rule_for(from, event).map(|rule| rule.targets)
}

// ── Transition functions ───────────────────────────────────────────

fn add_node(_inner: &mut NodeInner, step: &mut Step<'_>, _event: &NodeEvent) -> NodeState {
    step.scheduler(PendingEventKind::NodeAdded);
    step.nodes_list(NotificationKind::NodeUsable);
    step.effects.push(Effect::Join);
    S::Running
}

fn record_heartbeat(inner: &mut NodeInner, step: &mut Step<'_>, update: &StatusUpdate) {
    inner.latest_response = update.latest_response.clone();
    step.unit.stage(Mutation::SetHeartbeatResponse {
        node_id: step.key(),
        response: inner.latest_response.clone(),
    });
    inner.health_report = update.health.health_report.clone();
    inner.last_health_report_time = update.health.last_health_report_time;
}

fn status_update_when_healthy(inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
    let NodeEvent::StatusUpdate(update) = event else {
        return inner.state;
    };
    record_heartbeat(inner, step, update);

    if !update.health.healthy {
        info!(
            node_id = %step.node.key(),
            report = %update.health.health_report,
            "node reported unhealthy"
        );
        step.drain_queue(inner);
        step.scheduler(PendingEventKind::NodeRemoved);
        step.nodes_list(NotificationKind::NodeUnusable);
        step.effects.push(Effect::BecameUnhealthy { initial: inner.state });
        return S::Unhealthy;
    }

    // The leader may have cleaned up containers since this replica looked.
    if step.ctx.relay_enabled() {
        refresh_cleanup_sets(step.node.key(), inner, step.ctx);
    }

    let mut newly_launched = Vec::new();
    let mut completed = Vec::new();
    for remote in &update.containers {
        let container_id = remote.container_id;
        if inner.containers_to_clean.contains(&container_id) {
            debug!(container = %container_id, "container already scheduled for cleanup");
            continue;
        }
        if inner.finished_applications.contains(&container_id.application_id()) {
            debug!(container = %container_id, "container belongs to a finished application");
            continue;
        }
        if remote.state == ContainerState::Running {
            if !inner.just_launched.contains_key(&container_id) {
                inner.just_launched.insert(container_id, remote.clone());
                step.unit.stage(Mutation::AddJustLaunched {
                    node_id: step.key(),
                    status: remote.clone(),
                });
                newly_launched.push(remote.clone());
            }
        } else if inner.just_launched.remove(&container_id).is_some() {
            step.unit.stage(Mutation::RemoveJustLaunched {
                node_id: step.key(),
                container_id,
            });
            completed.push(remote.clone());
        }
    }

    if !newly_launched.is_empty() || !completed.is_empty() {
        let info = UpdatedContainerInfo {
            newly_launched,
            completed,
            id: inner.next_update_id,
        };
        inner.next_update_id = inner.next_update_id.wrapping_add(1);
        debug!(node_id = %step.node.key(), batch = info.id, "update batch queued");
        step.unit.stage(Mutation::AddUpdatedContainerInfo {
            node_id: step.key(),
            info: info.clone(),
        });
        inner.update_queue.push_back(info);
    }

    // A non-leader only learns that the scheduler pulled updates through the store.
    if step.ctx.relay_enabled() && inner.persisted && !inner.next_heartbeat {
        if let Some(reader) = step.ctx.reader() {
            match reader.get_next_heartbeat(step.node.key()) {
                Ok(Some(next_heartbeat)) => inner.next_heartbeat = next_heartbeat,
                Ok(None) => {}
                Err(e) => debug!(node_id = %step.node.key(), error = %e, "next heartbeat flag unavailable"),
            }
        }
    }

    if inner.next_heartbeat {
        inner.next_heartbeat = false;
        inner.persisted = false;
        step.unit.stage(Mutation::SetNextHeartbeat {
            node_id: step.key(),
            next_heartbeat: false,
        });
        step.scheduler(PendingEventKind::NodeUpdated);
    }
    S::Running
}

fn status_update_when_unhealthy(inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
    let NodeEvent::StatusUpdate(update) = event else {
        return inner.state;
    };
    record_heartbeat(inner, step, update);

    if update.health.healthy {
        step.scheduler(PendingEventKind::NodeAdded);
        step.nodes_list(NotificationKind::NodeUsable);
        step.effects.push(Effect::BecameHealthy);
        return S::Running;
    }
    S::Unhealthy
}

fn deactivate(inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
    let target = match event.kind() {
        E::Decommission => S::Decommissioned,
        E::Expire => S::Lost,
        E::Rebooting => S::Rebooted,
        _ => return inner.state,
    };
    step.drain_queue(inner);
    let initial = inner.state;
    // An unhealthy node was already removed from the scheduler.
    if initial != S::Unhealthy {
        step.scheduler(PendingEventKind::NodeRemoved);
    }
    step.nodes_list(NotificationKind::NodeUnusable);
    info!(node_id = %step.node.key(), ?target, "deactivating node");
    step.effects.push(Effect::Deactivate { initial, target });
    target
}

fn cleanup_app(inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
    if let NodeEvent::CleanupApp(app_id) = event {
        if !inner.finished_applications.contains(app_id) {
            inner.finished_applications.push(*app_id);
        }
        step.unit.stage(Mutation::AddFinishedApplication {
            node_id: step.key(),
            app_id: *app_id,
        });
        debug!(node_id = %step.node.key(), app = %app_id, "application queued for cleanup");
    }
    inner.state
}

fn cleanup_container(inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
    if let NodeEvent::CleanupContainer(container_id) = event {
        inner.containers_to_clean.insert(*container_id);
        step.unit.stage(Mutation::AddContainerToClean {
            node_id: step.key(),
            container_id: *container_id,
        });
        debug!(node_id = %step.node.key(), container = %container_id, "container queued for cleanup");
    }
    inner.state
}

fn reconnect(inner: &mut NodeInner, step: &mut Step<'_>, event: &NodeEvent) -> NodeState {
    let NodeEvent::Reconnected(new_node) = event else {
        return inner.state;
    };
    step.drain_queue(inner);
    step.scheduler(PendingEventKind::NodeRemoved);

    // The reconnect may carry this very entity; reading its lock would deadlock.
    let unchanged = std::ptr::eq(step.node, new_node.as_ref())
        || (inner.capability == new_node.capability() && step.node.http_port() == new_node.http_port());
    if unchanged {
        // The node restarted; its response sequence starts over.
        inner.latest_response.response_id = 0;
        step.unit.stage(Mutation::SetHeartbeatResponse {
            node_id: step.key(),
            response: inner.latest_response.clone(),
        });
        if inner.state != S::Unhealthy {
            step.scheduler(PendingEventKind::NodeAdded);
        }
    } else {
        info!(node_id = %step.node.key(), "reconnected node differs, replacing");
        // The replacement reuses this key; rows of the old entity must not
        // resurface when it is recovered.
        for container_id in std::mem::take(&mut inner.just_launched).into_keys() {
            step.unit.stage(Mutation::RemoveJustLaunched {
                node_id: step.key(),
                container_id,
            });
        }
        for container_id in std::mem::take(&mut inner.containers_to_clean) {
            step.unit.stage(Mutation::RemoveContainerToClean {
                node_id: step.key(),
                container_id,
            });
        }
        for app_id in std::mem::take(&mut inner.finished_applications) {
            step.unit.stage(Mutation::RemoveFinishedApplication {
                node_id: step.key(),
                app_id,
            });
        }
        step.effects.push(Effect::Replace {
            node: Arc::clone(new_node),
            previous: inner.state,
            next_heartbeat: inner.next_heartbeat,
        });
    }
    step.nodes_list(NotificationKind::NodeUsable);
    inner.state
}

#[cfg(test)]
mod tests {
    use nodegrid_state::{
        ContainerStatus, HeartbeatResponse, NodeHealthStatus, NodeStateReader, Resource,
    };

    use super::*;
    use crate::event_unit::EventUnit;
    use crate::notifier::{ChannelNotifier, NotificationKind as N};
    use crate::test_support::*;

    const ALL_STATES: [NodeState; 6] = [
        S::New,
        S::Running,
        S::Unhealthy,
        S::Decommissioned,
        S::Lost,
        S::Rebooted,
    ];

    fn event_of(kind: NodeEventKind) -> NodeEvent {
        match kind {
            E::Started => NodeEvent::Started,
            E::StatusUpdate => heartbeat(Vec::new()),
            E::Decommission => NodeEvent::Decommission,
            E::Expire => NodeEvent::Expire,
            E::Rebooting => NodeEvent::Rebooting,
            E::CleanupApp => NodeEvent::CleanupApp(app(1)),
            E::CleanupContainer => NodeEvent::CleanupContainer(cid(1, 1)),
            E::Reconnected => NodeEvent::Reconnected(node("h1", 8041)),
        }
    }

    /// A node of host `h1` driven into `state`.
    fn node_in(h: &mut Harness, state: NodeState) -> Arc<Node> {
        if state == S::New {
            return node("h1", 8041);
        }
        let n = h.running("h1");
        let event = match state {
            S::Running => None,
            S::Unhealthy => Some(unhealthy_heartbeat()),
            S::Decommissioned => Some(NodeEvent::Decommission),
            S::Lost => Some(NodeEvent::Expire),
            S::Rebooted => Some(NodeEvent::Rebooting),
            S::New => unreachable!(),
        };
        if let Some(event) = event {
            h.send(&n, event).unwrap();
        }
        assert_eq!(n.state(), state);
        h.drain();
        n
    }

    #[test]
    fn table_is_keyed_by_state_and_event() {
        for (i, a) in rules().iter().enumerate() {
            for b in &rules()[i + 1..] {
                assert!(!(a.from == b.from && a.event == b.event), "{:?}/{:?} twice", a.from, a.event);
            }
        }
        for state in [S::Decommissioned, S::Lost, S::Rebooted] {
            assert!(state.is_terminal());
            assert!(rules().iter().all(|r| r.from != state));
        }
    }

    #[test]
    fn valid_pairs_reach_only_table_targets() {
        for rule in rules() {
            let mut h = harness();
            let n = node_in(&mut h, rule.from);
            let result = h.send(&n, event_of(rule.event)).unwrap();
            assert_eq!(result.from, rule.from);
            assert!(
                rule.targets.contains(&result.to),
                "{:?} on {:?} reached {:?}",
                rule.event,
                rule.from,
                result.to
            );
            assert_eq!(n.state(), result.to);
        }
    }

    #[test]
    fn invalid_pairs_are_rejected_and_leave_state() {
        for state in ALL_STATES {
            for kind in NodeEventKind::ALL {
                if targets(state, kind).is_some() {
                    continue;
                }
                let mut h = harness();
                let n = node_in(&mut h, state);
                let before = h.store.get_node(n.key()).unwrap();

                let mut unit = EventUnit::new();
                let err = n.handle(&h.ctx, event_of(kind), &mut unit).unwrap_err();
                assert_eq!(err.state, state);
                assert_eq!(err.event, kind);
                assert!(unit.is_empty());
                assert_eq!(n.state(), state);
                assert_eq!(h.store.get_node(n.key()).unwrap(), before);
                assert!(h.drain().is_empty());
            }
        }
    }

    #[test]
    fn started_registers_active_node() {
        let mut h = harness();
        let n = node("n1", 8041);
        let t = h.register(n.clone()).unwrap();

        assert_eq!((t.from, t.to), (S::New, S::Running));
        assert_eq!(h.ctx.metrics().snapshot().active, 1);
        assert!(Arc::ptr_eq(&h.ctx.node("n1:8041").unwrap(), &n));
        assert_eq!(
            h.store.active_nodes().unwrap(),
            vec![("n1:8041".to_string(), "n1".to_string())]
        );
        assert_eq!(
            h.drain(),
            vec![(N::NodeAdded, "n1:8041".into()), (N::NodeUsable, "n1:8041".into())]
        );
        assert_eq!(h.store.get_node("n1:8041").unwrap().unwrap().state, S::Running);
    }

    #[test]
    fn heartbeat_scenario_queues_monotonic_batches() {
        let mut h = harness();
        let n1 = h.running("n1");
        let c1 = cid(1, 1);

        let t = h.send(&n1, heartbeat(vec![ContainerStatus::running(c1)])).unwrap();
        assert_eq!(t.to, S::Running);
        assert_eq!(n1.queue_size(), 1);
        assert_eq!(h.drain(), vec![(N::NodeUpdated, "n1:8041".into())]);

        let pulled = h.pull(&n1);
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].id, 0);
        assert_eq!(pulled[0].newly_launched, vec![ContainerStatus::running(c1)]);
        assert!(pulled[0].completed.is_empty());
        assert_eq!(n1.queue_size(), 0);

        h.send(&n1, heartbeat(vec![ContainerStatus::completed(c1, 0)])).unwrap();
        let pulled = h.pull(&n1);
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].id, 1);
        assert!(pulled[0].newly_launched.is_empty());
        assert_eq!(pulled[0].completed, vec![ContainerStatus::completed(c1, 0)]);
    }

    #[test]
    fn redelivered_heartbeats_are_idempotent() {
        let mut h = harness();
        let n = h.running("h1");
        let running = vec![ContainerStatus::running(cid(1, 1)), ContainerStatus::running(cid(1, 2))];

        h.send(&n, heartbeat(running.clone())).unwrap();
        h.send(&n, heartbeat(running)).unwrap();
        assert_eq!(n.queue_size(), 1);
        assert_eq!(n.just_launched_containers(), vec![cid(1, 1), cid(1, 2)]);

        let done = vec![ContainerStatus::completed(cid(1, 1), 0)];
        h.send(&n, heartbeat(done.clone())).unwrap();
        h.send(&n, heartbeat(done)).unwrap();
        assert_eq!(n.queue_size(), 2);
        assert_eq!(n.just_launched_containers(), vec![cid(1, 2)]);
        assert_eq!(h.store.get_just_launched_containers(n.key()).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_and_finished_apps_filter_heartbeats() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, NodeEvent::CleanupContainer(cid(1, 1))).unwrap();
        h.send(&n, NodeEvent::CleanupContainer(cid(1, 1))).unwrap();
        h.send(&n, NodeEvent::CleanupApp(app(2))).unwrap();
        assert_eq!(n.containers_to_cleanup(), vec![cid(1, 1)]);
        assert_eq!(n.apps_to_cleanup(), vec![app(2)]);

        h.send(
            &n,
            heartbeat(vec![ContainerStatus::running(cid(1, 1)), ContainerStatus::running(cid(2, 5))]),
        )
        .unwrap();
        assert_eq!(n.queue_size(), 0);
        assert!(n.just_launched_containers().is_empty());
    }

    #[test]
    fn unhealthy_report_drains_queue_and_removes_node() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        h.drain();

        let t = h.send(&n, unhealthy_heartbeat()).unwrap();
        assert_eq!(t.to, S::Unhealthy);
        assert_eq!(n.queue_size(), 0);
        assert!(h.store.get_updated_container_info(n.key()).unwrap().is_empty());
        assert_eq!(n.health_report(), "disk failure");
        assert_eq!(n.last_heartbeat_response().response_id, 2);
        assert_eq!(
            h.drain(),
            vec![(N::NodeRemoved, "h1:8041".into()), (N::NodeUnusable, "h1:8041".into())]
        );
        let m = h.ctx.metrics().snapshot();
        assert_eq!((m.active, m.unhealthy), (0, 1));

        // Still unhealthy: containers are not processed.
        h.send(
            &n,
            NodeEvent::StatusUpdate(StatusUpdate {
                health: NodeHealthStatus::unhealthy("disk failure", 3_000),
                containers: vec![ContainerStatus::running(cid(1, 9))],
                latest_response: HeartbeatResponse::with_id(3),
            }),
        )
        .unwrap();
        assert_eq!(n.state(), S::Unhealthy);
        assert_eq!(n.queue_size(), 0);
        assert!(h.drain().is_empty());

        let t = h.send(&n, heartbeat(Vec::new())).unwrap();
        assert_eq!(t.to, S::Running);
        assert_eq!(
            h.drain(),
            vec![(N::NodeAdded, "h1:8041".into()), (N::NodeUsable, "h1:8041".into())]
        );
        let m = h.ctx.metrics().snapshot();
        assert_eq!((m.active, m.unhealthy), (1, 0));
    }

    #[test]
    fn deactivation_moves_node_to_inactive() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        h.drain();

        let t = h.send(&n, NodeEvent::Decommission).unwrap();
        assert_eq!(t.to, S::Decommissioned);
        assert_eq!(n.queue_size(), 0);
        assert!(h.ctx.node("h1:8041").is_none());
        assert!(Arc::ptr_eq(&h.ctx.inactive_node("h1").unwrap(), &n));
        assert!(h.store.active_nodes().unwrap().is_empty());
        assert_eq!(
            h.store.inactive_nodes().unwrap(),
            vec![("h1".to_string(), "h1:8041".to_string())]
        );
        assert_eq!(
            h.drain(),
            vec![(N::NodeRemoved, "h1:8041".into()), (N::NodeUnusable, "h1:8041".into())]
        );
        let m = h.ctx.metrics().snapshot();
        assert_eq!((m.active, m.decommissioned), (0, 1));
    }

    #[test]
    fn unhealthy_node_is_not_removed_twice() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, unhealthy_heartbeat()).unwrap();
        h.drain();

        h.send(&n, NodeEvent::Expire).unwrap();
        assert_eq!(n.state(), S::Lost);
        assert_eq!(h.drain(), vec![(N::NodeUnusable, "h1:8041".into())]);
        let m = h.ctx.metrics().snapshot();
        assert_eq!((m.unhealthy, m.lost), (0, 1));
    }

    #[test]
    fn excluded_hosts_count_decommission_once() {
        let mut h = with_excluded(&["h1"]);
        assert_eq!(h.ctx.metrics().snapshot().decommissioned, 1);
        let n = h.running("h1");
        h.send(&n, NodeEvent::Decommission).unwrap();
        assert_eq!(h.ctx.metrics().snapshot().decommissioned, 1);
    }

    #[test]
    fn rejoining_host_leaves_inactive_registry() {
        let mut h = harness();
        let old = h.running("h1");
        h.send(&old, NodeEvent::Rebooting).unwrap();
        assert_eq!(h.ctx.metrics().snapshot().rebooted, 1);

        let fresh = node("h1", 9000);
        h.register(fresh.clone()).unwrap();
        assert_eq!(fresh.state(), S::Running);
        assert!(h.ctx.inactive_node("h1").is_none());
        assert!(h.store.inactive_nodes().unwrap().is_empty());
        let m = h.ctx.metrics().snapshot();
        assert_eq!((m.active, m.rebooted), (1, 0));
    }

    #[test]
    fn reconnect_with_same_capability_resets_response_id() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        assert_eq!(n.last_heartbeat_response().response_id, 1);
        h.drain();

        let t = h.register(node("h1", 8041)).unwrap();
        assert_eq!((t.from, t.to), (S::Running, S::Running));
        assert!(Arc::ptr_eq(&h.ctx.node("h1:8041").unwrap(), &n));
        assert_eq!(n.last_heartbeat_response().response_id, 0);
        assert_eq!(n.queue_size(), 0);
        assert_eq!(
            h.store.get_last_heartbeat_response(n.key()).unwrap().unwrap().response_id,
            0
        );
        let kinds: Vec<_> = h.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![N::NodeRemoved, N::NodeAdded, N::NodeUsable]);
        assert_eq!(h.ctx.metrics().snapshot().active, 1);
    }

    #[test]
    fn unhealthy_reconnect_is_not_re_added() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, unhealthy_heartbeat()).unwrap();
        h.drain();

        h.register(node("h1", 8041)).unwrap();
        assert_eq!(n.state(), S::Unhealthy);
        let kinds: Vec<_> = h.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![N::NodeRemoved, N::NodeUsable]);
    }

    #[test]
    fn reconnect_with_new_capability_replaces_node() {
        let mut h = harness();
        let old = h.running("h1");

        let bigger = Arc::new(Node::new(
            nodegrid_state::NodeId::new("h1", 8041),
            8042,
            Resource::new(16384, 16),
            "3.3.6",
        ));
        h.register(bigger.clone()).unwrap();

        let current = h.ctx.node("h1:8041").unwrap();
        assert!(Arc::ptr_eq(&current, &bigger));
        assert!(!Arc::ptr_eq(&current, &old));
        assert_eq!(bigger.state(), S::Running);
        assert_eq!(old.state(), S::Running);
        assert_eq!(h.ctx.metrics().snapshot().active, 1);
        assert_eq!(
            h.store.get_node("h1:8041").unwrap().unwrap().capability,
            Resource::new(16384, 16)
        );
        let kinds: Vec<_> = h.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![N::NodeRemoved, N::NodeAdded, N::NodeUsable, N::NodeUsable]
        );
    }

    #[test]
    fn replaced_node_recovers_without_old_rows() {
        let mut h = harness();
        let old = h.running("h1");
        h.send(&old, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        h.send(&old, NodeEvent::CleanupContainer(cid(1, 2))).unwrap();
        h.send(&old, NodeEvent::CleanupApp(app(2))).unwrap();
        h.drain();

        let bigger = Arc::new(Node::new(
            nodegrid_state::NodeId::new("h1", 8041),
            8042,
            Resource::new(16384, 16),
            "3.3.6",
        ));
        h.register(bigger.clone()).unwrap();
        assert!(h.store.get_just_launched_containers("h1:8041").unwrap().is_empty());
        assert!(h.store.get_containers_to_clean("h1:8041").unwrap().is_empty());
        assert!(h.store.get_finished_applications("h1:8041").unwrap().is_empty());
        assert!(h.store.get_updated_container_info("h1:8041").unwrap().is_empty());

        let (notifier, _rx) = ChannelNotifier::new();
        let ctx = ClusterContext::new(Arc::new(notifier));
        assert_eq!(ctx.recover_from(&h.store).unwrap(), 1);
        let restored = ctx.node("h1:8041").unwrap();
        assert_eq!(restored.capability(), Resource::new(16384, 16));
        assert!(restored.just_launched_containers().is_empty());
        assert!(restored.containers_to_cleanup().is_empty());
        assert!(restored.apps_to_cleanup().is_empty());
        assert_eq!(restored.queue_size(), 0);
        assert_eq!(restored.last_heartbeat_response().response_id, 0);
    }
}
