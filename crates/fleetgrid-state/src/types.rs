//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of targets (devices),
//! distribution sets (software bundles), rollouts, rollout groups, group
//! membership, and update actions. All types are serializable to/from JSON
//! for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a target device.
pub type ControllerId = String;

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// Composite key of a distribution set (`{name}:{version}`).
pub type DistributionSetKey = String;

// ── Target ─────────────────────────────────────────────────────────

/// A registered device that can receive software updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub controller_id: ControllerId,
    pub name: String,
    /// Device-reported attributes (hardware revision, region, etc.),
    /// matchable from target filter expressions.
    pub attributes: HashMap<String, String>,
    /// Distribution set currently assigned for installation.
    pub assigned_ds: Option<DistributionSetKey>,
    /// Distribution set last reported as installed.
    pub installed_ds: Option<DistributionSetKey>,
    pub update_status: TargetUpdateStatus,
    /// Unix timestamp (milliseconds) of the last device poll.
    pub last_poll_at: Option<u64>,
    /// Unix timestamp (milliseconds) when this target was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last state change.
    pub updated_at: u64,
}

/// Update state of a target as derived from its action history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetUpdateStatus {
    /// Never seen by the update server.
    Unknown,
    /// Registered but no update has been assigned yet.
    Registered,
    /// An update action is currently open for this target.
    Pending,
    /// Installed distribution set matches the assigned one.
    InSync,
    /// The last update attempt failed.
    Error,
}

impl TargetUpdateStatus {
    /// Wire name of the status, as used in filter expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetUpdateStatus::Unknown => "unknown",
            TargetUpdateStatus::Registered => "registered",
            TargetUpdateStatus::Pending => "pending",
            TargetUpdateStatus::InSync => "in_sync",
            TargetUpdateStatus::Error => "error",
        }
    }
}

// ── Distribution set ───────────────────────────────────────────────

/// A versioned software bundle that rollouts distribute to targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSet {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// Software module references contained in this set.
    pub modules: Vec<String>,
    /// Whether installation requires a completed migration step first.
    pub required_migration_step: bool,
    /// Unix timestamp (milliseconds) when this set was created.
    pub created_at: u64,
}

// ── Rollout ────────────────────────────────────────────────────────

/// A staged software rollout over a filtered set of targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    /// Distribution set to install, by `{name}:{version}` key.
    pub distribution_set: DistributionSetKey,
    /// Filter expression that selected the member targets.
    pub target_filter: String,
    /// Number of targets captured at creation time. Frozen afterwards.
    pub total_targets: u64,
    pub status: RolloutStatus,
    pub action_type: ActionType,
    /// Deadline (milliseconds) after which time-forced actions escalate.
    pub forced_time: Option<u64>,
    /// Cached count of actions currently in `Running`, refreshed during
    /// housekeeping. Informational only.
    pub running_actions: u64,
    /// Set when an unrecoverable inconsistency was detected; housekeeping
    /// skips the rollout until the hold is released.
    pub on_hold: bool,
    /// Optimistic-locking counter, bumped on every rollout row update.
    pub version: u64,
    /// Unix timestamp (milliseconds) when this rollout was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last state change.
    pub updated_at: u64,
}

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Starting,
    Running,
    Paused,
    Finished,
    Stopped,
    ErrorCreating,
    ErrorStarting,
}

impl RolloutStatus {
    /// Terminal states accept no further transitions.
    /// `ErrorStarting` is not terminal: a failed start may be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Finished | RolloutStatus::Stopped | RolloutStatus::ErrorCreating
        )
    }
}

/// How an update action is applied on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Device decides when to apply the update.
    Soft,
    /// Device must apply the update immediately.
    Forced,
    /// Soft until the rollout's forced time passes, then forced.
    TimeForced,
}

// ── Rollout group ──────────────────────────────────────────────────

/// One stage of a rollout, holding a fixed slice of its targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub rollout_id: RolloutId,
    /// Position in the activation order, starting at 0.
    pub ordinal: u32,
    /// The preceding group; `None` for the first. Groups run strictly
    /// sequentially, so this is always `ordinal - 1`.
    pub parent_ordinal: Option<u32>,
    pub name: String,
    pub status: GroupStatus,
    /// Number of member targets captured at creation time. Frozen afterwards.
    pub total_targets: u64,
    /// Members that were already on the rollout's distribution set (or gone)
    /// at activation. They count as finished without an action.
    pub finished_by_skip: u64,
    pub success_condition: GroupCondition,
    pub success_action: SuccessAction,
    pub error_condition: Option<GroupCondition>,
    pub error_action: ErrorAction,
    /// Unix timestamp (milliseconds) when this group was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last state change.
    pub updated_at: u64,
}

/// Lifecycle status of a rollout group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Waiting for its turn; no actions exist yet.
    Scheduled,
    /// Actions created, waiting for the success condition.
    Running,
    /// Success condition met.
    Finished,
    /// Error condition fired.
    Error,
}

/// A condition evaluated against a group's aggregated action counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupCondition {
    pub kind: ConditionKind,
    /// Condition parameter; a percentage (`"80"`) for `Threshold`, an
    /// absolute count (`"25"`) for `AbsoluteCount`. Malformed expressions
    /// evaluate to false.
    pub expression: String,
}

/// Kinds of group conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Percentage of the group's frozen target count.
    Threshold,
    /// Absolute number of targets.
    AbsoluteCount,
}

/// What happens when a group's success condition fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessAction {
    /// Activate the next group (or finish the rollout after the last one).
    NextGroup,
    /// Pause the rollout and wait for an operator.
    Pause,
}

/// What happens when a group's error condition fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Pause the rollout and wait for an operator.
    Pause,
}

/// Frozen assignment of a target to a rollout group.
///
/// Membership is captured when the rollout is created and never changes,
/// even if the target is later deleted or stops matching the filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMember {
    pub rollout_id: RolloutId,
    pub ordinal: u32,
    pub controller_id: ControllerId,
    /// Unix timestamp (milliseconds) when membership was captured.
    pub created_at: u64,
}

// ── Action ─────────────────────────────────────────────────────────

/// A single update instruction for one target within one rollout group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub rollout_id: RolloutId,
    pub ordinal: u32,
    pub controller_id: ControllerId,
    /// Distribution set to install, by `{name}:{version}` key.
    pub distribution_set: DistributionSetKey,
    pub status: ActionStatus,
    pub action_type: ActionType,
    /// Deadline (milliseconds) after which a time-forced action escalates.
    pub forced_time: Option<u64>,
    /// Unix timestamp (milliseconds) when this action was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last status change.
    pub updated_at: u64,
}

/// Lifecycle status of an update action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Created, not yet picked up by the device.
    Scheduled,
    /// Device reported it is applying the update.
    Running,
    /// Device reported successful installation.
    Finished,
    /// Device reported a failure.
    Error,
    /// Cancellation requested, awaiting device confirmation.
    Canceling,
    /// Cancellation confirmed or applied before device pickup.
    Canceled,
}

impl ActionStatus {
    /// Terminal states accept no further feedback.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Finished | ActionStatus::Error | ActionStatus::Canceled
        )
    }
}

/// Per-status action counts for one group or one rollout, produced by a
/// single prefix scan over the actions table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatusCounts {
    pub scheduled: u64,
    pub running: u64,
    pub finished: u64,
    pub error: u64,
    pub canceling: u64,
    pub canceled: u64,
}

impl ActionStatusCounts {
    /// Add one action in the given status to the tally.
    pub fn record(&mut self, status: ActionStatus) {
        match status {
            ActionStatus::Scheduled => self.scheduled += 1,
            ActionStatus::Running => self.running += 1,
            ActionStatus::Finished => self.finished += 1,
            ActionStatus::Error => self.error += 1,
            ActionStatus::Canceling => self.canceling += 1,
            ActionStatus::Canceled => self.canceled += 1,
        }
    }

    /// Total number of actions counted.
    pub fn total(&self) -> u64 {
        self.scheduled + self.running + self.finished + self.error + self.canceling + self.canceled
    }
}

impl DistributionSet {
    /// Build the composite key for the distribution sets table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

impl RolloutGroup {
    /// Build the composite key for the rollout groups table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.rollout_id, self.ordinal)
    }
}

impl GroupMember {
    /// Build the composite key for the group members table.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.rollout_id, self.ordinal, self.controller_id)
    }
}

impl Action {
    /// Build the composite key for the actions table.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.rollout_id, self.ordinal, self.controller_id)
    }
}
