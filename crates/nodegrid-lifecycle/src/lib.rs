//! nodegrid-lifecycle — per-node membership state machine.
//!
//! Every worker node is a [`Node`] guarded by its own reader/writer lock.
//! [`Node::handle`] is the only mutation entry point: it looks up the rule
//! for `(state, event)` in a static transition table, runs the rule's
//! transition function under the write lock, and stages every persisted
//! change into the caller's [`EventUnit`].
//!
//! Transition functions never call out while the lock is held. They return
//! a list of side effects (scheduler notifications, registry moves, metric
//! changes) which the unit holds until its commit succeeds. A unit that
//! fails or is dropped rolls its nodes back. When the replica is not
//! the leader of a distributed deployment, scheduler notifications are
//! staged as durable pending-event markers instead and drained later by
//! the leader's [`PendingEventSweeper`].
//!
//! Cluster-wide registries, metrics and the leadership query live in an
//! explicitly constructed [`ClusterContext`] shared by all nodes.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod event_unit;
pub mod leader;
pub mod metrics;
pub mod node;
pub mod notifier;
pub mod relay;
pub mod transitions;

#[cfg(test)]
mod test_support;

pub use context::ClusterContext;
pub use dispatcher::NodeEventDispatcher;
pub use error::{InvalidTransition, LifecycleError, LifecycleResult};
pub use event::{NodeEvent, NodeEventKind, StatusUpdate};
pub use event_unit::EventUnit;
pub use leader::{LeaderFlag, LeadershipQuery};
pub use metrics::{ClusterMetrics, MetricsSnapshot};
pub use node::{Node, Transitioned};
pub use notifier::{ChannelNotifier, Notification, NotificationKind, NodeReport, SchedulerNotifier};
pub use relay::{Delivery, PendingEventSweeper};
