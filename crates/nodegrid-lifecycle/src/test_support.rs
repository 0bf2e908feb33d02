use std::sync::Arc;

use nodegrid_state::*;
use tokio::sync::mpsc;

use crate::context::ClusterContext;
use crate::error::InvalidTransition;
use crate::event_unit::EventUnit;
use crate::event::{NodeEvent, StatusUpdate};
use crate::leader::LeaderFlag;
use crate::node::{Node, Transitioned};
use crate::notifier::{ChannelNotifier, Notification, NotificationKind};

pub(crate) struct Harness {
    pub store: StateStore,
    pub ctx: Arc<ClusterContext>,
    pub leader: Arc<LeaderFlag>,
    pub rx: mpsc::UnboundedReceiver<Notification>,
}

pub(crate) fn harness() -> Harness {
    build(false, true, Vec::new(), true)
}

pub(crate) fn distributed(leader: bool) -> Harness {
    build(true, leader, Vec::new(), true)
}

/// A distributed follower over a store whose variables were never
/// registered: any unit carrying a pending-event marker fails to commit.
pub(crate) fn unformatted_follower() -> Harness {
    build(true, false, Vec::new(), false)
}

pub(crate) fn with_excluded(hosts: &[&str]) -> Harness {
    build(false, true, hosts.iter().map(|h| h.to_string()).collect(), true)
}

fn build(distributed: bool, leader: bool, excluded: Vec<String>, formatted: bool) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    if formatted {
        store.variables().register_defaults().unwrap();
    }
    let (notifier, rx) = ChannelNotifier::new();
    let leader = Arc::new(LeaderFlag::new(leader));
    let ctx = ClusterContext::new(Arc::new(notifier))
        .with_leadership(leader.clone())
        .with_reader(Arc::new(store.clone()))
        .with_distributed(distributed)
        .with_excluded_hosts(excluded);
    Harness {
        store,
        ctx: Arc::new(ctx),
        leader,
        rx,
    }
}

impl Harness {
    pub fn register(&self, node: Arc<Node>) -> Result<Transitioned, InvalidTransition> {
        let mut unit = EventUnit::new();
        let result = self.ctx.register_node(node, &mut unit);
        unit.commit(&self.ctx, &self.store).unwrap();
        result
    }

    /// Register and start a node, discarding the start-up notifications.
    pub fn running(&mut self, host: &str) -> Arc<Node> {
        let node = node(host, 8041);
        self.register(node.clone()).unwrap();
        self.drain();
        node
    }

    pub fn send(&self, node: &Arc<Node>, event: NodeEvent) -> Result<Transitioned, InvalidTransition> {
        let mut unit = EventUnit::new();
        let result = node.handle(&self.ctx, event, &mut unit);
        unit.commit(&self.ctx, &self.store).unwrap();
        result
    }

    pub fn pull(&self, node: &Arc<Node>) -> Vec<UpdatedContainerInfo> {
        let mut unit = EventUnit::new();
        let updates = node.pull_updates(&mut unit);
        unit.commit(&self.ctx, &self.store).unwrap();
        updates
    }

    /// Notifications received so far as `(kind, node_id)`.
    pub fn drain(&mut self) -> Vec<(NotificationKind, String)> {
        let mut seen = Vec::new();
        while let Ok(n) = self.rx.try_recv() {
            seen.push((n.kind, n.node.node_id.to_string()));
        }
        seen
    }
}

pub(crate) fn node(host: &str, port: u16) -> Arc<Node> {
    Arc::new(Node::new(NodeId::new(host, port), 8042, Resource::new(8192, 8), "3.3.6"))
}

pub(crate) fn app(id: u32) -> ApplicationId {
    ApplicationId::new(1_700_000_000, id)
}

pub(crate) fn cid(app_id: u32, seq: u64) -> ContainerId {
    ContainerId::new(app(app_id), 1, seq)
}

pub(crate) fn heartbeat(containers: Vec<ContainerStatus>) -> NodeEvent {
    NodeEvent::StatusUpdate(StatusUpdate {
        health: NodeHealthStatus::healthy(1_000),
        containers,
        latest_response: HeartbeatResponse::with_id(1),
    })
}

pub(crate) fn unhealthy_heartbeat() -> NodeEvent {
    NodeEvent::StatusUpdate(StatusUpdate {
        health: NodeHealthStatus::unhealthy("disk failure", 2_000),
        containers: Vec::new(),
        latest_response: HeartbeatResponse::with_id(2),
    })
}
