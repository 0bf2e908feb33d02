//! Outbound notifications to the scheduler and the nodes-list manager.
//!
//! Delivery is fire-and-forget. Transitions never call a notifier while a
//! node lock is held, and implementations must not block.

use nodegrid_state::{NodeId, NodeRecord, NodeState, PendingEventKind, Resource};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NodeAdded,
    NodeRemoved,
    NodeUpdated,
    /// Nodes-list event; never deferred through the relay.
    NodeUsable,
    NodeUnusable,
}

impl From<PendingEventKind> for NotificationKind {
    fn from(kind: PendingEventKind) -> Self {
        match kind {
            PendingEventKind::NodeAdded => NotificationKind::NodeAdded,
            PendingEventKind::NodeRemoved => NotificationKind::NodeRemoved,
            PendingEventKind::NodeUpdated => NotificationKind::NodeUpdated,
        }
    }
}

/// Snapshot of a node as seen by notification consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub http_port: u16,
    pub capability: Resource,
    pub state: NodeState,
    pub health_report: String,
}

impl From<&NodeRecord> for NodeReport {
    fn from(record: &NodeRecord) -> Self {
        Self {
            node_id: record.node_id.clone(),
            http_port: record.http_port,
            capability: record.capability,
            state: record.state,
            health_report: record.health_report.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub node: NodeReport,
}

impl Notification {
    pub fn new(kind: NotificationKind, node: &Node) -> Self {
        Self {
            kind,
            node: node.report(),
        }
    }
}

/// Consumer of node membership notifications.
///
/// `NodeAdded` and `NodeRemoved` may arrive more than once for the same
/// node (pending markers are redelivered after a leadership change), so
/// implementations must treat them as idempotent.
pub trait SchedulerNotifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that forwards into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SchedulerNotifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            warn!(node_id = %e.0.node.node_id, kind = ?e.0.kind, "notification dropped, receiver closed");
        }
    }
}
