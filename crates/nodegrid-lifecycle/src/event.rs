//! Inbound node events.

use std::fmt;
use std::sync::Arc;

use nodegrid_state::{ApplicationId, ContainerId, ContainerStatus, HeartbeatResponse, NodeHealthStatus};

use crate::node::Node;

/// Payload of a node heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub health: NodeHealthStatus,
    pub containers: Vec<ContainerStatus>,
    /// Response the heartbeat service is about to send for this heartbeat.
    pub latest_response: HeartbeatResponse,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Started,
    StatusUpdate(StatusUpdate),
    Decommission,
    Expire,
    Rebooting,
    CleanupApp(ApplicationId),
    CleanupContainer(ContainerId),
    /// A node with the same id registered again; carries the fresh entity.
    Reconnected(Arc<Node>),
}

impl NodeEvent {
    pub fn kind(&self) -> NodeEventKind {
        match self {
            NodeEvent::Started => NodeEventKind::Started,
            NodeEvent::StatusUpdate(_) => NodeEventKind::StatusUpdate,
            NodeEvent::Decommission => NodeEventKind::Decommission,
            NodeEvent::Expire => NodeEventKind::Expire,
            NodeEvent::Rebooting => NodeEventKind::Rebooting,
            NodeEvent::CleanupApp(_) => NodeEventKind::CleanupApp,
            NodeEvent::CleanupContainer(_) => NodeEventKind::CleanupContainer,
            NodeEvent::Reconnected(_) => NodeEventKind::Reconnected,
        }
    }
}

/// Event discriminant used as the transition-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEventKind {
    Started,
    StatusUpdate,
    Decommission,
    Expire,
    Rebooting,
    CleanupApp,
    CleanupContainer,
    Reconnected,
}

impl NodeEventKind {
    pub const ALL: [NodeEventKind; 8] = [
        NodeEventKind::Started,
        NodeEventKind::StatusUpdate,
        NodeEventKind::Decommission,
        NodeEventKind::Expire,
        NodeEventKind::Rebooting,
        NodeEventKind::CleanupApp,
        NodeEventKind::CleanupContainer,
        NodeEventKind::Reconnected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeEventKind::Started => "STARTED",
            NodeEventKind::StatusUpdate => "STATUS_UPDATE",
            NodeEventKind::Decommission => "DECOMMISSION",
            NodeEventKind::Expire => "EXPIRE",
            NodeEventKind::Rebooting => "REBOOTING",
            NodeEventKind::CleanupApp => "CLEANUP_APP",
            NodeEventKind::CleanupContainer => "CLEANUP_CONTAINER",
            NodeEventKind::Reconnected => "RECONNECTED",
        }
    }
}

impl fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
