//! nodegrid-state — shared replicated state for the nodegrid resource manager.
//!
//! Backed by [redb](https://docs.rs/redb). Three concerns live here:
//!
//! - **`variables`** — the closed set of cluster-wide singleton variables
//!   (id counters, safe-mode flag, upgrade/snapshot status) with an
//!   exclusive-lock-then-commit protocol for read-modify-write.
//! - **`transaction`** — `TransactionUnit`, the batch of node mutations and
//!   pending-event markers produced while handling one node event, committed
//!   as a single redb write transaction.
//! - **`reader`** — the persisted-state reader used to rebuild a node's
//!   in-memory queues after a restart or leadership handover.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Per-node rows use composite keys (`{node_id}/{member}`) so that one
//! node's rows can be collected with a prefix scan. Pending-event markers
//! are keyed by a `u64` drawn from the `PendingEventId` counter, so table
//! order is creation order.
//!
//! redb allows a single write transaction at a time. Every write path in
//! this crate therefore doubles as the cluster-wide exclusive lock: the lock
//! is taken by `begin_write` and released by `commit`.

pub mod cluster_vars;
pub mod error;
pub mod reader;
pub mod store;
pub mod tables;
pub mod transaction;
pub mod types;
pub mod variables;

pub use cluster_vars::{BlockKey, BlockKeyType, StorageInfo};
pub use error::{StateError, StateResult};
pub use reader::{NodeStateReader, PersistedNodeState};
pub use store::StateStore;
pub use transaction::{CommitSummary, Mutation, TransactionUnit};
pub use types::*;
pub use variables::{Counter, Primitive, Value, ValueKind, Variable, VariableLock, VariableStore};
