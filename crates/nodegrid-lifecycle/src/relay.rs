//! PendingEventRelay — deferring scheduler notifications to the leader.
//!
//! A non-leader replica of a distributed deployment must not talk to the
//! scheduler. Instead, [`route`] stages a pending-event marker into the
//! unit of the event being handled, so the marker commits atomically with
//! the transition that produced it.
//!
//! The leader resolves markers with a [`PendingEventSweeper`]: a periodic
//! sweep that runs only while this replica is leader. Each marker is
//! delivered to the notifier and then deleted in its own unit, in creation
//! order. A crash or leadership loss between delivery and deletion
//! redelivers the marker, so delivery is at-least-once and notifiers must
//! be idempotent.

use std::sync::Arc;
use std::time::Duration;

use nodegrid_state::{
    Mutation, NodeStateReader, PendingEvent, PendingEventKind, StateResult, StateStore,
    TransactionUnit,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::ClusterContext;
use crate::error::LifecycleResult;
use crate::notifier::{Notification, NodeReport};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How a scheduler notification left the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The caller notifies the scheduler once the node lock is released.
    Direct,
    /// A pending-event marker was staged in the unit.
    Deferred,
}

/// Decide between direct delivery and a pending-event marker.
pub fn route(
    ctx: &ClusterContext,
    unit: &mut TransactionUnit,
    node_id: &str,
    kind: PendingEventKind,
    detail: Option<String>,
) -> Delivery {
    if !ctx.relay_enabled() {
        return Delivery::Direct;
    }
    unit.stage(Mutation::AddPendingEvent {
        node_id: node_id.to_string(),
        kind,
        detail,
    });
    debug!(%node_id, ?kind, "scheduler notification deferred to leader");
    Delivery::Deferred
}

/// Drains committed pending-event markers while this replica leads.
pub struct PendingEventSweeper {
    store: StateStore,
    ctx: Arc<ClusterContext>,
    interval: Duration,
}

impl PendingEventSweeper {
    pub fn new(store: StateStore, ctx: Arc<ClusterContext>) -> Self {
        Self {
            store,
            ctx,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Apply every committed marker once. Returns the number applied.
    ///
    /// A no-op on a non-leader. Leadership is re-checked before each marker
    /// so a demoted replica stops mid-sweep.
    pub fn sweep_once(&self) -> LifecycleResult<usize> {
        if !self.ctx.is_leader() {
            return Ok(0);
        }
        let mut applied = 0;
        for event in self.store.pending_events()? {
            if !self.ctx.is_leader() {
                info!(applied, "leadership lost, pending-event sweep stopped");
                break;
            }
            self.apply(&event)?;
            applied += 1;
        }
        if applied > 0 {
            info!(applied, "pending events applied");
        }
        Ok(applied)
    }

    fn apply(&self, event: &PendingEvent) -> LifecycleResult<()> {
        match self.report_for(&event.node_id)? {
            Some(node) => self.ctx.notifier().notify(Notification {
                kind: event.kind.into(),
                node,
            }),
            None => warn!(node_id = %event.node_id, id = event.id, "pending event for unknown node discarded"),
        }
        let mut unit = TransactionUnit::new();
        unit.stage(Mutation::RemovePendingEvent { id: event.id });
        unit.commit(&self.store)?;
        debug!(node_id = %event.node_id, id = event.id, kind = ?event.kind, "pending event applied");
        Ok(())
    }

    /// Committed view of the node, falling back to this replica's memory.
    fn report_for(&self, node_id: &str) -> StateResult<Option<NodeReport>> {
        if let Some(record) = self.store.get_node(node_id)? {
            return Ok(Some(NodeReport::from(&record)));
        }
        Ok(self.ctx.find_node(node_id).map(|node| node.report()))
    }

    /// Sweep every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "pending-event sweeper started");
        let mut was_leader = false;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let leader = self.ctx.is_leader();
                    if leader && !was_leader {
                        info!("replica is leader, draining pending events");
                    }
                    was_leader = leader;
                    if leader {
                        if let Err(e) = self.sweep_once() {
                            error!(error = %e, "pending-event sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("pending-event sweeper shutting down");
                    break;
                }
            }
        }
    }
}
