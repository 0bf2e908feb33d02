//! redb table definitions for the nodegrid state store.
//!
//! Most tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Per-node rows use the composite key `{node_id}/{member}`.

use redb::TableDefinition;

/// Shape shared by every JSON-valued table with string keys.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Cluster-wide singleton variables keyed by variable name.
pub const VARIABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("variables");

/// Persisted node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Active-node registry: `{node_id}` → host.
pub const ACTIVE_NODES: TableDefinition<&str, &str> = TableDefinition::new("active_nodes");

/// Inactive-node registry: host → `{node_id}`.
pub const INACTIVE_NODES: TableDefinition<&str, &str> = TableDefinition::new("inactive_nodes");

/// Outbound update batches keyed by `{node_id}/{batch_id:010}`.
pub const UPDATE_QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("update_queue");

/// Running containers already reported to the scheduler, keyed by
/// `{node_id}/{container_id}`.
pub const JUST_LAUNCHED: TableDefinition<&str, &[u8]> = TableDefinition::new("just_launched");

/// Containers pending cleanup keyed by `{node_id}/{container_id}`.
pub const CONTAINERS_TO_CLEAN: TableDefinition<&str, &[u8]> =
    TableDefinition::new("containers_to_clean");

/// Finished applications pending purge keyed by `{node_id}/{app_id}`.
pub const FINISHED_APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("finished_apps");

/// Last heartbeat response keyed by `{node_id}`.
pub const HEARTBEATS: TableDefinition<&str, &[u8]> = TableDefinition::new("heartbeats");

/// `nextHeartbeatPending` flag keyed by `{node_id}`.
pub const NEXT_HEARTBEAT: TableDefinition<&str, &[u8]> = TableDefinition::new("next_heartbeat");

/// Pending-event markers keyed by their monotonic id.
pub const PENDING_EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("pending_events");

/// Key prefix shared by every per-node row of `node_id`.
pub fn node_prefix(node_id: &str) -> String {
    format!("{node_id}/")
}

/// Composite key for one member row of a node.
pub fn member_key(node_id: &str, member: impl std::fmt::Display) -> String {
    format!("{node_id}/{member}")
}

/// Composite key for an update batch; zero-padded so table order is batch order.
pub fn update_key(node_id: &str, batch_id: u32) -> String {
    format!("{node_id}/{batch_id:010}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_keys_sort_by_batch_id() {
        let mut keys = vec![
            update_key("h1:8041", 10),
            update_key("h1:8041", 2),
            update_key("h1:8041", 0),
        ];
        keys.sort();
        assert_eq!(keys[0], "h1:8041/0000000000");
        assert_eq!(keys[2], "h1:8041/0000000010");
    }

    #[test]
    fn prefixes_do_not_overlap_for_port_suffixes() {
        let short = node_prefix("h1:80");
        assert!(!member_key("h1:8041", "x").starts_with(&short));
    }
}
