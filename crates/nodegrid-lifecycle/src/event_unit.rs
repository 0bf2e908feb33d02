//! EventUnit — the persisted and in-memory halves of one node event.
//!
//! Transitions change node fields under the node lock and stage persisted
//! mutations into the wrapped [`TransactionUnit`]. Registry moves, metrics
//! and notifications wait here until [`EventUnit::commit`] succeeds.
//!
//! Every node is snapshotted before its first change in the unit. A failed
//! commit, or dropping the unit uncommitted, puts those snapshots back, so
//! the event can be delivered again from scratch.

use std::sync::Arc;

use nodegrid_state::{CommitSummary, Mutation, StateResult, StateStore, TransactionUnit};
use tracing::debug;

use crate::context::ClusterContext;
use crate::node::{Node, NodeInner};
use crate::transitions::Effect;

#[derive(Default)]
pub struct EventUnit {
    unit: TransactionUnit,
    effects: Vec<(Arc<Node>, Effect)>,
    snapshots: Vec<(Arc<Node>, NodeInner)>,
}

impl EventUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted mutations staged so far.
    pub fn transaction(&self) -> &TransactionUnit {
        &self.unit
    }

    /// Nothing staged, nothing deferred, no node touched.
    pub fn is_empty(&self) -> bool {
        self.unit.is_empty() && self.effects.is_empty() && self.snapshots.is_empty()
    }

    pub fn stage(&mut self, mutation: Mutation) {
        self.unit.stage(mutation);
    }

    /// Commit the staged mutations, then apply the deferred effects.
    ///
    /// On error nothing is applied and touched nodes are rolled back.
    pub fn commit(mut self, ctx: &ClusterContext, store: &StateStore) -> StateResult<CommitSummary> {
        let summary = std::mem::take(&mut self.unit).commit(store)?;
        let touched = std::mem::take(&mut self.snapshots);
        for (node, effect) in std::mem::take(&mut self.effects) {
            ctx.apply_committed(&node, effect);
        }
        for (node, _) in touched {
            node.mark_persisted();
        }
        Ok(summary)
    }

    /// Discard the unit and roll touched nodes back.
    pub fn abort(self) {}

    pub(crate) fn transaction_mut(&mut self) -> &mut TransactionUnit {
        &mut self.unit
    }

    /// Remember `inner` as `node`'s rollback point unless one is already held.
    pub(crate) fn snapshot(&mut self, node: &Arc<Node>, inner: &NodeInner) {
        if !self.snapshots.iter().any(|(n, _)| Arc::ptr_eq(n, node)) {
            self.snapshots.push((Arc::clone(node), inner.clone()));
        }
    }

    pub(crate) fn defer(&mut self, node: &Arc<Node>, effect: Effect) {
        self.effects.push((Arc::clone(node), effect));
    }
}

impl Drop for EventUnit {
    fn drop(&mut self) {
        if self.snapshots.is_empty() {
            return;
        }
        debug!(nodes = self.snapshots.len(), "event unit not committed, rolling back nodes");
        for (node, snapshot) in self.snapshots.drain(..) {
            node.restore(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use nodegrid_state::{ContainerStatus, NodeState, NodeStateReader};

    use super::*;
    use crate::event::NodeEvent;
    use crate::test_support::*;

    #[test]
    fn dropped_unit_restores_node_and_defers_nothing() {
        let mut h = harness();
        let n = h.running("h1");
        h.send(&n, heartbeat(vec![ContainerStatus::running(cid(1, 1))])).unwrap();
        h.drain();

        let mut unit = EventUnit::new();
        n.handle(&h.ctx, NodeEvent::Decommission, &mut unit).unwrap();
        assert_eq!(n.state(), NodeState::Decommissioned);
        assert_eq!(n.queue_size(), 0);
        unit.abort();

        assert_eq!(n.state(), NodeState::Running);
        assert_eq!(n.queue_size(), 1);
        assert!(h.ctx.node("h1:8041").is_some());
        assert!(h.ctx.inactive_node("h1").is_none());
        assert_eq!(h.ctx.metrics().snapshot().active, 1);
        assert_eq!(h.ctx.metrics().snapshot().decommissioned, 0);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn effects_wait_for_commit() {
        let mut h = harness();
        let n = node("h1", 8041);
        let mut unit = EventUnit::new();
        h.ctx.register_node(n.clone(), &mut unit).unwrap();
        assert!(!unit.is_empty());
        assert!(h.ctx.node("h1:8041").is_none());
        assert_eq!(h.ctx.metrics().snapshot().active, 0);
        assert!(h.drain().is_empty());

        unit.commit(&h.ctx, &h.store).unwrap();
        assert!(h.ctx.node("h1:8041").is_some());
        assert_eq!(h.ctx.metrics().snapshot().active, 1);
        assert_eq!(h.store.active_nodes().unwrap().len(), 1);
        assert_eq!(h.drain().len(), 2);
    }

    #[test]
    fn failed_commit_rolls_back_and_retry_starts_over() {
        let mut h = unformatted_follower();
        let n = node("h1", 8041);

        // The pending-event counter is missing, so the marker cannot commit.
        let mut unit = EventUnit::new();
        h.ctx.register_node(n.clone(), &mut unit).unwrap();
        assert!(unit.commit(&h.ctx, &h.store).is_err());
        assert_eq!(n.state(), NodeState::New);
        assert!(h.ctx.node("h1:8041").is_none());
        assert_eq!(h.ctx.metrics().snapshot().active, 0);
        assert!(h.store.get_node("h1:8041").unwrap().is_none());
        assert!(h.drain().is_empty());

        h.store.variables().register_defaults().unwrap();
        let t = h.register(n.clone()).unwrap();
        assert_eq!((t.from, t.to), (NodeState::New, NodeState::Running));
        assert_eq!(h.store.active_nodes().unwrap(), vec![("h1:8041".to_string(), "h1".to_string())]);
        let kinds: Vec<_> = h.store.pending_events().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![nodegrid_state::PendingEventKind::NodeAdded]);
        assert_eq!(h.ctx.metrics().snapshot().active, 1);
    }
}
