//! Aggregated progress views over a rollout's actions.
//!
//! The bucket totals are derived from the action rows plus the group's
//! `finished_by_skip` count, so targets that never received an action
//! (deleted before activation, or already on the distribution set) still
//! show up as finished and group denominators stay satisfiable.

use serde::{Deserialize, Serialize};

use fleetgrid_state::{ActionStatusCounts, Rollout, RolloutGroup, StateStore};

use crate::error::RolloutResult;

/// Per-bucket action tally for a rollout or a single group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalTargetCountStatus {
    pub not_started: u64,
    pub scheduled: u64,
    pub running: u64,
    pub finished: u64,
    pub error: u64,
    pub canceled: u64,
    pub total: u64,
}

impl TotalTargetCountStatus {
    /// Fold raw action counts into display buckets. `finished_by_skip`
    /// targets count as finished; in-flight cancellations count as canceled.
    pub fn from_counts(
        counts: &ActionStatusCounts,
        total_targets: u64,
        finished_by_skip: u64,
    ) -> TotalTargetCountStatus {
        let finished = counts.finished + finished_by_skip;
        let canceled = counts.canceled + counts.canceling;
        let accounted = counts.scheduled + counts.running + finished + counts.error + canceled;
        TotalTargetCountStatus {
            not_started: total_targets.saturating_sub(accounted),
            scheduled: counts.scheduled,
            running: counts.running,
            finished,
            error: counts.error,
            canceled,
            total: total_targets,
        }
    }

    /// Actions that can no longer change state.
    pub fn settled(&self) -> u64 {
        self.finished + self.error + self.canceled
    }
}

/// Read-side aggregation over the action table.
#[derive(Clone)]
pub struct StatusAggregator {
    store: StateStore,
}

impl StatusAggregator {
    pub fn new(store: StateStore) -> StatusAggregator {
        StatusAggregator { store }
    }

    /// Bucket totals for one group, against its frozen member count.
    pub fn group_status(&self, group: &RolloutGroup) -> RolloutResult<TotalTargetCountStatus> {
        let counts = self
            .store
            .count_group_actions(&group.rollout_id, group.ordinal)?;
        Ok(TotalTargetCountStatus::from_counts(
            &counts,
            group.total_targets,
            group.finished_by_skip,
        ))
    }

    /// Bucket totals for the whole rollout. Targets in groups that have not
    /// been activated yet appear as `not_started`.
    pub fn rollout_status(&self, rollout: &Rollout) -> RolloutResult<TotalTargetCountStatus> {
        let counts = self.store.count_rollout_actions(&rollout.id)?;
        let skipped: u64 = self
            .store
            .list_groups(&rollout.id)?
            .iter()
            .map(|g| g.finished_by_skip)
            .sum();
        Ok(TotalTargetCountStatus::from_counts(
            &counts,
            rollout.total_targets,
            skipped,
        ))
    }
}
