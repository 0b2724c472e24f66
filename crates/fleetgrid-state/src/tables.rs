//! redb table definitions for the FleetGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{rollout_id}:{ordinal}` or
//! `{rollout_id}:{ordinal}:{controller_id}`; identifiers are validated to be
//! colon-free before insertion so prefix scans cannot cross record boundaries.

use redb::TableDefinition;

/// Registered devices keyed by `{controller_id}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Distribution sets keyed by `{name}:{version}`.
pub const DISTRIBUTION_SETS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("distribution_sets");

/// Rollouts keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Rollout groups keyed by `{rollout_id}:{ordinal}`.
pub const ROLLOUT_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_groups");

/// Frozen group membership keyed by `{rollout_id}:{ordinal}:{controller_id}`.
pub const GROUP_MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_members");

/// Update actions keyed by `{rollout_id}:{ordinal}:{controller_id}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");
