//! Cluster-wide node counters.

use std::sync::atomic::{AtomicU64, Ordering};

use nodegrid_state::NodeState;
use serde::Serialize;

/// Node counts by membership state.
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    active: AtomicU64,
    unhealthy: AtomicU64,
    lost: AtomicU64,
    rebooted: AtomicU64,
    decommissioned: AtomicU64,
}

/// Point-in-time copy of [`ClusterMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub active: u64,
    pub unhealthy: u64,
    pub lost: u64,
    pub rebooted: u64,
    pub decommissioned: u64,
}

impl ClusterMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active: self.active.load(Ordering::SeqCst),
            unhealthy: self.unhealthy.load(Ordering::SeqCst),
            lost: self.lost.load(Ordering::SeqCst),
            rebooted: self.rebooted.load(Ordering::SeqCst),
            decommissioned: self.decommissioned.load(Ordering::SeqCst),
        }
    }

    pub fn incr_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Excluded hosts are decommissioned before they ever register.
    pub fn add_decommissioned(&self, count: u64) {
        self.decommissioned.fetch_add(count, Ordering::SeqCst);
    }

    /// A node left `previous` and became active again.
    pub fn rejoined(&self, previous: NodeState) {
        self.incr_active();
        if let Some(counter) = self.counter(previous) {
            decr(counter);
        }
    }

    /// A node left `initial` for `target`. `count_decommission` is false
    /// for excluded hosts, which were counted up front.
    pub fn deactivated(&self, initial: NodeState, target: NodeState, count_decommission: bool) {
        match initial {
            NodeState::Running => decr(&self.active),
            NodeState::Unhealthy => decr(&self.unhealthy),
            _ => {}
        }
        if target == NodeState::Decommissioned && !count_decommission {
            return;
        }
        if let Some(counter) = self.counter(target) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop the contribution of a node that is being replaced.
    pub fn replaced(&self, state: NodeState) {
        match state {
            NodeState::Running => decr(&self.active),
            NodeState::Unhealthy => decr(&self.unhealthy),
            _ => {}
        }
    }

    /// Count a recovered node in its persisted state.
    pub(crate) fn restore(&self, state: NodeState, count_decommission: bool) {
        match state {
            NodeState::Running => self.incr_active(),
            NodeState::Decommissioned if !count_decommission => {}
            other => {
                if let Some(counter) = self.counter(other) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn counter(&self, state: NodeState) -> Option<&AtomicU64> {
        match state {
            NodeState::Unhealthy => Some(&self.unhealthy),
            NodeState::Lost => Some(&self.lost),
            NodeState::Rebooted => Some(&self.rebooted),
            NodeState::Decommissioned => Some(&self.decommissioned),
            NodeState::New | NodeState::Running => None,
        }
    }
}

fn decr(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
}
