use nodegrid_state::{NodeState, StateError};

use crate::event::NodeEventKind;

/// An event was delivered to a node whose current state has no rule for it.
///
/// The node is left untouched. Redelivering the same event will fail the
/// same way, so callers log and drop it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid event {event} on node {node_id} in state {state:?}")]
pub struct InvalidTransition {
    pub node_id: String,
    pub state: NodeState,
    pub event: NodeEventKind,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("event dispatcher is shut down")]
    DispatcherClosed,
}

impl LifecycleError {
    /// Whether the driver may retry the whole event.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LifecycleError::Storage(e) if e.is_storage())
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
