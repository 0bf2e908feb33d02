//! Domain types for the nodegrid state store.
//!
//! These types represent node identity, container and application
//! identifiers, heartbeat payloads, and the persisted node record. All
//! types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Identity ──────────────────────────────────────────────────────

/// Identity of a worker node: the host plus its command port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identifier of a submitted application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    /// Start time of the resource manager that accepted the application.
    pub cluster_timestamp: u64,
    pub id: u32,
}

impl ApplicationId {
    pub fn new(cluster_timestamp: u64, id: u32) -> Self {
        Self {
            cluster_timestamp,
            id,
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application_{}_{:04}", self.cluster_timestamp, self.id)
    }
}

/// Identifier of a container. Ordering is by application, then attempt,
/// then sequence number, which gives cleanup sets a deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    pub app: ApplicationId,
    pub attempt: u32,
    pub seq: u64,
}

impl ContainerId {
    pub fn new(app: ApplicationId, attempt: u32, seq: u64) -> Self {
        Self { app, attempt, seq }
    }

    /// The application this container belongs to.
    pub fn application_id(&self) -> ApplicationId {
        self.app
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container_{}_{:04}_{:02}_{:06}",
            self.app.cluster_timestamp, self.app.id, self.attempt, self.seq
        )
    }
}

// ── Resources and containers ──────────────────────────────────────

/// Resource capacity advertised by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }
}

/// Lifecycle state of a container as reported by its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    New,
    Running,
    Complete,
}

/// One container entry of a node status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_status: i32,
    pub diagnostics: String,
}

impl ContainerStatus {
    pub fn running(container_id: ContainerId) -> Self {
        Self {
            container_id,
            state: ContainerState::Running,
            exit_status: 0,
            diagnostics: String::new(),
        }
    }

    pub fn completed(container_id: ContainerId, exit_status: i32) -> Self {
        Self {
            container_id,
            state: ContainerState::Complete,
            exit_status,
            diagnostics: String::new(),
        }
    }
}

/// Newly launched and completed containers produced by one heartbeat,
/// queued for delivery to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedContainerInfo {
    pub newly_launched: Vec<ContainerStatus>,
    pub completed: Vec<ContainerStatus>,
    /// Per-node batch id; strictly increasing.
    pub id: u32,
}

// ── Heartbeats ────────────────────────────────────────────────────

/// Health as reported by the node itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealthStatus {
    pub healthy: bool,
    pub health_report: String,
    /// Unix timestamp (millis) of the node's last health check.
    pub last_health_report_time: u64,
}

impl NodeHealthStatus {
    pub fn healthy(last_health_report_time: u64) -> Self {
        Self {
            healthy: true,
            health_report: String::new(),
            last_health_report_time,
        }
    }

    pub fn unhealthy(report: impl Into<String>, last_health_report_time: u64) -> Self {
        Self {
            healthy: false,
            health_report: report.into(),
            last_health_report_time,
        }
    }
}

/// Response returned to a node for its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Sequence number of the response; reset to 0 when a node reconnects.
    pub response_id: u32,
    pub containers_to_cleanup: Vec<ContainerId>,
    pub applications_to_cleanup: Vec<ApplicationId>,
}

impl HeartbeatResponse {
    pub fn with_id(response_id: u32) -> Self {
        Self {
            response_id,
            ..Self::default()
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Membership state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    New,
    Running,
    Unhealthy,
    Decommissioned,
    Lost,
    Rebooted,
}

impl NodeState {
    /// States with no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Decommissioned | NodeState::Lost | NodeState::Rebooted
        )
    }
}

/// Persisted fields of a node, written on every committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub http_port: u16,
    pub capability: Resource,
    pub health_report: String,
    pub last_health_report_time: u64,
    pub state: NodeState,
    pub node_manager_version: String,
    /// Next update batch id to hand out; persisted so ids survive draining.
    pub next_update_id: u32,
}

// ── Pending events ────────────────────────────────────────────────

/// Scheduler notification deferred by a non-leader replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingEventKind {
    NodeAdded,
    NodeRemoved,
    NodeUpdated,
}

/// Processing status of a pending-event marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingEventStatus {
    New,
}

/// A durable pending-event marker as committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Monotonic id drawn from the `PendingEventId` counter at commit time.
    pub id: u64,
    pub node_id: String,
    pub kind: PendingEventKind,
    pub status: PendingEventStatus,
    pub detail: Option<String>,
}
