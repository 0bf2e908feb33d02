//! Leadership query consumed at every direct-vs-deferred decision.

use std::sync::atomic::{AtomicBool, Ordering};

/// Answers "is this replica the leader right now" without blocking.
///
/// Leader election itself is external; implementations only expose its
/// current verdict.
pub trait LeadershipQuery: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership flag flipped by whatever runs the election.
#[derive(Debug, Default)]
pub struct LeaderFlag(AtomicBool);

impl LeaderFlag {
    pub fn new(leader: bool) -> Self {
        Self(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

impl LeadershipQuery for LeaderFlag {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
