//! StateStore — redb-backed state persistence for FleetGrid.
//!
//! Provides typed CRUD operations over targets, distribution sets, rollouts,
//! rollout groups, group members, and actions. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Two operations are deliberately more than plain CRUD: `update_rollout`
//! enforces optimistic locking on the rollout row, and `activate_group`
//! commits a group transition together with its action and target writes in
//! one transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::filter::TargetFilter;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TARGETS).map_err(map_err!(Table))?;
        txn.open_table(DISTRIBUTION_SETS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert or update a target.
    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        let value = serde_json::to_vec(target).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            table
                .insert(target.controller_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a target by controller ID.
    pub fn get_target(&self, controller_id: &str) -> StateResult<Option<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        match table.get(controller_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let target: Target =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }

    /// List all targets.
    pub fn list_targets(&self) -> StateResult<Vec<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let target: Target =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(target);
        }
        Ok(results)
    }

    /// Delete a target by controller ID. Returns true if it existed.
    pub fn delete_target(&self, controller_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            existed = table.remove(controller_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%controller_id, existed, "target deleted");
        Ok(existed)
    }

    /// All targets matching the filter, ordered by controller ID so the
    /// result is stable across repeated evaluations.
    pub fn resolve_targets(&self, filter: &TargetFilter) -> StateResult<Vec<Target>> {
        let mut matched: Vec<Target> = self
            .list_targets()?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        matched.sort_by(|a, b| a.controller_id.cmp(&b.controller_id));
        Ok(matched)
    }

    // ── Distribution sets ──────────────────────────────────────────

    /// Insert or update a distribution set.
    pub fn put_distribution_set(&self, ds: &DistributionSet) -> StateResult<()> {
        let key = ds.table_key();
        let value = serde_json::to_vec(ds).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(DISTRIBUTION_SETS)
                .map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "distribution set stored");
        Ok(())
    }

    /// Get a distribution set by `{name}:{version}` key.
    pub fn get_distribution_set(&self, key: &str) -> StateResult<Option<DistributionSet>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(DISTRIBUTION_SETS)
            .map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let ds: DistributionSet =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(ds))
            }
            None => Ok(None),
        }
    }

    /// List all distribution sets.
    pub fn list_distribution_sets(&self) -> StateResult<Vec<DistributionSet>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(DISTRIBUTION_SETS)
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let ds: DistributionSet =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(ds);
        }
        Ok(results)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert or overwrite a rollout row without a version check. Only for
    /// initial creation; later updates go through [`StateStore::update_rollout`].
    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        let value = serde_json::to_vec(rollout).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(rollout.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout_id = %rollout.id, "rollout stored");
        Ok(())
    }

    /// Get a rollout by ID.
    pub fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Ok(None),
        }
    }

    /// List all rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rollout);
        }
        Ok(results)
    }

    /// Rollouts that still need housekeeping attention: in creation, in
    /// startup, or running. Paused and terminal rollouts are not included.
    pub fn active_rollouts(&self) -> StateResult<Vec<Rollout>> {
        Ok(self
            .list_rollouts()?
            .into_iter()
            .filter(|r| {
                matches!(
                    r.status,
                    RolloutStatus::Creating | RolloutStatus::Starting | RolloutStatus::Running
                )
            })
            .collect())
    }

    /// Compare-and-swap update of a rollout row.
    ///
    /// Fails with `VersionConflict` if the stored version differs from
    /// `expected_version` (someone else updated the row since it was read).
    /// On success the stored copy carries `expected_version + 1` and is
    /// returned.
    pub fn update_rollout(
        &self,
        rollout: &Rollout,
        expected_version: u64,
    ) -> StateResult<Rollout> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let current: Rollout = match table
                .get(rollout.id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StateError::NotFound(format!("rollout {}", rollout.id)));
                }
            };
            if current.version != expected_version {
                return Err(StateError::VersionConflict(format!(
                    "rollout {}: expected version {expected_version}, found {}",
                    rollout.id, current.version
                )));
            }
            let mut next = rollout.clone();
            next.version = expected_version + 1;
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(next.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored = next;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// Delete a rollout and everything hanging off it: groups, members,
    /// and actions, in one transaction. Returns true if the rollout existed.
    pub fn delete_rollout(&self, rollout_id: &str) -> StateResult<bool> {
        let prefix = format!("{rollout_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            existed = table.remove(rollout_id).map_err(map_err!(Write))?.is_some();
        }
        for def in [ROLLOUT_GROUPS, GROUP_MEMBERS, ACTIONS] {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%rollout_id, existed, "rollout deleted");
        Ok(existed)
    }

    // ── Rollout groups ─────────────────────────────────────────────

    /// Insert the full group plan of a rollout (groups plus frozen
    /// membership) in one transaction.
    pub fn insert_group_plan(
        &self,
        groups: &[RolloutGroup],
        members: &[GroupMember],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            for group in groups {
                let key = group.table_key();
                let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
            for member in members {
                let key = member.table_key();
                let value = serde_json::to_vec(member).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            groups = groups.len(),
            members = members.len(),
            "group plan stored"
        );
        Ok(())
    }

    /// Insert or update a single rollout group.
    pub fn put_group(&self, group: &RolloutGroup) -> StateResult<()> {
        let key = group.table_key();
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a group by rollout ID and ordinal.
    pub fn get_group(&self, rollout_id: &str, ordinal: u32) -> StateResult<Option<RolloutGroup>> {
        let key = format!("{rollout_id}:{ordinal}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let group: RolloutGroup =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// List all groups of a rollout, ordered by ordinal.
    ///
    /// Key order is lexicographic (`:10` sorts before `:2`), so the result
    /// is re-sorted numerically after the scan.
    pub fn list_groups(&self, rollout_id: &str) -> StateResult<Vec<RolloutGroup>> {
        let prefix = format!("{rollout_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let group: RolloutGroup =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(group);
            }
        }
        results.sort_by_key(|g| g.ordinal);
        Ok(results)
    }

    // ── Group members ──────────────────────────────────────────────

    /// List the frozen members of one group, ordered by controller ID.
    pub fn list_group_members(
        &self,
        rollout_id: &str,
        ordinal: u32,
    ) -> StateResult<Vec<GroupMember>> {
        let prefix = format!("{rollout_id}:{ordinal}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let member: GroupMember =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(member);
            }
        }
        results.sort_by(|a, b| a.controller_id.cmp(&b.controller_id));
        Ok(results)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Insert or update an action.
    pub fn put_action(&self, action: &Action) -> StateResult<()> {
        let key = action.table_key();
        let value = serde_json::to_vec(action).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an action by its composite key parts.
    pub fn get_action(
        &self,
        rollout_id: &str,
        ordinal: u32,
        controller_id: &str,
    ) -> StateResult<Option<Action>> {
        let key = format!("{rollout_id}:{ordinal}:{controller_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let action: Action =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(action))
            }
            None => Ok(None),
        }
    }

    /// List all actions of one group.
    pub fn list_group_actions(&self, rollout_id: &str, ordinal: u32) -> StateResult<Vec<Action>> {
        let prefix = format!("{rollout_id}:{ordinal}:");
        self.list_actions_with_prefix(&prefix)
    }

    /// List all actions of a rollout across its groups.
    pub fn list_rollout_actions(&self, rollout_id: &str) -> StateResult<Vec<Action>> {
        let prefix = format!("{rollout_id}:");
        self.list_actions_with_prefix(&prefix)
    }

    /// List every action in the store.
    pub fn list_actions(&self) -> StateResult<Vec<Action>> {
        self.list_actions_with_prefix("")
    }

    fn list_actions_with_prefix(&self, prefix: &str) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let action: Action =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(action);
            }
        }
        Ok(results)
    }

    /// Per-status action counts for one group, from a single table scan.
    pub fn count_group_actions(
        &self,
        rollout_id: &str,
        ordinal: u32,
    ) -> StateResult<ActionStatusCounts> {
        let prefix = format!("{rollout_id}:{ordinal}:");
        self.count_actions_with_prefix(&prefix)
    }

    /// Per-status action counts for a whole rollout, from a single table scan.
    pub fn count_rollout_actions(&self, rollout_id: &str) -> StateResult<ActionStatusCounts> {
        let prefix = format!("{rollout_id}:");
        self.count_actions_with_prefix(&prefix)
    }

    fn count_actions_with_prefix(&self, prefix: &str) -> StateResult<ActionStatusCounts> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let mut counts = ActionStatusCounts::default();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let action: Action =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                counts.record(action.status);
            }
        }
        Ok(counts)
    }

    // ── Group activation ───────────────────────────────────────────

    /// Commit a group activation atomically: the group row (now `Running`,
    /// with its skip count), the freshly created actions, the canceled
    /// actions this activation supersedes, and the updated target rows land
    /// in one transaction, so a crash can never leave a half-activated
    /// group behind.
    pub fn activate_group(
        &self,
        group: &RolloutGroup,
        actions: &[Action],
        superseded: &[Action],
        targets: &[Target],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            let key = group.table_key();
            let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        {
            let mut table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            for action in actions.iter().chain(superseded) {
                let key = action.table_key();
                let value = serde_json::to_vec(action).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            for target in targets {
                let value = serde_json::to_vec(target).map_err(map_err!(Serialize))?;
                table
                    .insert(target.controller_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            rollout_id = %group.rollout_id,
            ordinal = group.ordinal,
            actions = actions.len(),
            skipped = group.finished_by_skip,
            "group activated"
        );
        Ok(())
    }
}
