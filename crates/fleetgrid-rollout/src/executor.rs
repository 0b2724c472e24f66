//! Rollout executor — creation, operator controls, and the housekeeping
//! pass that drives running rollouts forward.
//!
//! All forward progress happens inside [`RolloutExecutor::process_housekeeping`],
//! which any number of server instances may invoke concurrently. Rollout row
//! transitions go through a compare-and-swap on the row's version counter, so
//! two instances evaluating the same rollout cannot disagree about its
//! lifecycle: one wins, the other observes a conflict and retries on the next
//! pass. Group activation is guarded separately by the group's own status and
//! commits in a single storage transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleetgrid_deploy::DeploymentManager;
use fleetgrid_state::{
    Action, ActionStatus, ActionType, Clock, ErrorAction, GroupMember, GroupStatus, Rollout,
    RolloutGroup, RolloutStatus, StateError, StateStore, SuccessAction, Target, TargetFilter,
    TargetUpdateStatus,
};

use crate::condition;
use crate::error::{RolloutError, RolloutResult};
use crate::plan::{self, GroupSpec};
use crate::status::StatusAggregator;

/// A rollout stuck in `Creating` or `Starting` is only recovered by
/// housekeeping once it has not moved for this long, so recovery never races
/// the synchronous create/start call that is still working on it.
const STALE_RECOVERY_MS: u64 = 60_000;

/// Tunables for the rollout executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on groups per rollout.
    pub max_groups: usize,
    /// Wall-clock budget for one housekeeping pass; rollouts not reached
    /// within it wait for the next pass.
    pub housekeeping_budget: Duration,
    /// Action type applied when a creation request does not specify one.
    pub default_action_type: ActionType,
    /// Deadline distance for time-forced rollouts that do not specify one.
    pub default_forced_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_groups: 500,
            housekeeping_budget: Duration::from_secs(30),
            default_action_type: ActionType::Forced,
            default_forced_grace: Duration::from_secs(30 * 60),
        }
    }
}

/// Parameters for creating a rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRollout {
    pub id: String,
    /// Distribution set to install, by `{name}:{version}` key.
    pub distribution_set: String,
    /// Filter expression selecting the member targets.
    pub target_filter: String,
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub action_type: Option<ActionType>,
    /// Escalation deadline for time-forced rollouts, Unix milliseconds.
    #[serde(default)]
    pub forced_time: Option<u64>,
}

/// Outcome of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Rollouts evaluated without error.
    pub processed: usize,
    /// Rollouts skipped: on hold, or lost a concurrent update.
    pub skipped: usize,
    /// Rollouts whose evaluation returned an error.
    pub failed: usize,
    /// Rollouts not reached before the pass budget ran out.
    pub deferred: usize,
}

/// Drives rollouts through their lifecycle.
#[derive(Clone)]
pub struct RolloutExecutor {
    store: StateStore,
    deploy: DeploymentManager,
    aggregator: StatusAggregator,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl RolloutExecutor {
    pub fn new(
        store: StateStore,
        deploy: DeploymentManager,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        let aggregator = StatusAggregator::new(store.clone());
        Self {
            store,
            deploy,
            aggregator,
            clock,
            config,
        }
    }

    /// Aggregated status views over this executor's store.
    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create a rollout: resolve the filter, freeze the matching targets
    /// into groups, and leave the rollout `Ready`.
    ///
    /// Validation failures happen before anything is persisted. A failure
    /// while the group plan is being written leaves the rollout in
    /// `ErrorCreating` instead.
    pub fn create_rollout(&self, req: CreateRollout) -> RolloutResult<Rollout> {
        validate_rollout_id(&req.id)?;
        if self.store.get_rollout(&req.id)?.is_some() {
            return Err(RolloutError::DuplicateRollout(req.id));
        }
        if self
            .store
            .get_distribution_set(&req.distribution_set)?
            .is_none()
        {
            return Err(RolloutError::DistributionSetNotFound(req.distribution_set));
        }
        let filter = TargetFilter::parse(&req.target_filter)
            .map_err(|err| RolloutError::InvalidFilter(err.to_string()))?;
        let targets = self.store.resolve_targets(&filter)?;
        if targets.is_empty() {
            return Err(RolloutError::NoMatchingTargets(req.target_filter));
        }
        let total = targets.len() as u64;
        let sizes = plan::plan_sizes(total, &req.groups, self.config.max_groups)?;

        let now = self.clock.now_millis();
        let action_type = req.action_type.unwrap_or(self.config.default_action_type);
        let forced_time = if action_type == ActionType::TimeForced {
            Some(
                req.forced_time
                    .unwrap_or(now + self.config.default_forced_grace.as_millis() as u64),
            )
        } else {
            None
        };
        let rollout = Rollout {
            id: req.id.clone(),
            distribution_set: req.distribution_set.clone(),
            target_filter: req.target_filter.clone(),
            total_targets: total,
            status: RolloutStatus::Creating,
            action_type,
            forced_time,
            running_actions: 0,
            on_hold: false,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.put_rollout(&rollout)?;
        info!(
            rollout_id = %rollout.id,
            targets = total,
            groups = req.groups.len(),
            "rollout created, writing group plan"
        );

        match self.materialize_groups(&rollout, &req.groups, &sizes, &targets) {
            Ok(()) => {
                let mut ready = rollout.clone();
                ready.status = RolloutStatus::Ready;
                ready.updated_at = self.clock.now_millis();
                let stored = self.cas(&ready, rollout.version)?;
                info!(rollout_id = %stored.id, "rollout ready");
                Ok(stored)
            }
            Err(err) => {
                warn!(
                    rollout_id = %rollout.id,
                    error = %err,
                    "group plan failed, marking rollout errored"
                );
                let mut failed = rollout.clone();
                failed.status = RolloutStatus::ErrorCreating;
                failed.updated_at = self.clock.now_millis();
                if let Err(cas_err) = self.cas(&failed, rollout.version) {
                    warn!(
                        rollout_id = %rollout.id,
                        error = %cas_err,
                        "could not record creation failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Build the group rows and the frozen membership from the resolved
    /// target list and persist them in one transaction.
    fn materialize_groups(
        &self,
        rollout: &Rollout,
        specs: &[GroupSpec],
        sizes: &[u64],
        targets: &[Target],
    ) -> RolloutResult<()> {
        let now = self.clock.now_millis();
        let mut groups = Vec::with_capacity(specs.len());
        let mut members = Vec::new();
        let mut offset = 0usize;
        for (ordinal, (spec, size)) in specs.iter().zip(sizes).enumerate() {
            let ordinal = ordinal as u32;
            let size = *size as usize;
            let slice = &targets[offset..offset + size];
            offset += size;
            groups.push(RolloutGroup {
                rollout_id: rollout.id.clone(),
                ordinal,
                parent_ordinal: ordinal.checked_sub(1),
                name: spec
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("group-{}", ordinal + 1)),
                status: GroupStatus::Scheduled,
                total_targets: size as u64,
                finished_by_skip: 0,
                success_condition: spec.success_condition.clone(),
                success_action: spec.success_action,
                error_condition: spec.error_condition.clone(),
                error_action: spec.error_action,
                created_at: now,
                updated_at: now,
            });
            for target in slice {
                members.push(GroupMember {
                    rollout_id: rollout.id.clone(),
                    ordinal,
                    controller_id: target.controller_id.clone(),
                    created_at: now,
                });
            }
        }
        self.store.insert_group_plan(&groups, &members)?;
        Ok(())
    }

    // ── Operator controls ──────────────────────────────────────────

    /// Start a `Ready` rollout (or retry one that failed to start):
    /// activate the first group and move to `Running`.
    pub fn start(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.require(rollout_id)?;
        if !matches!(
            rollout.status,
            RolloutStatus::Ready | RolloutStatus::ErrorStarting
        ) {
            return Err(self.not_allowed(&rollout, "start"));
        }
        let mut starting = rollout.clone();
        starting.status = RolloutStatus::Starting;
        starting.updated_at = self.clock.now_millis();
        let starting = self.cas(&starting, rollout.version)?;
        info!(rollout_id = %starting.id, "rollout starting");

        match self.finish_start(&starting) {
            Ok(stored) => Ok(stored),
            Err(err) => {
                warn!(rollout_id = %starting.id, error = %err, "rollout start failed");
                if let Ok(current) = self.require(rollout_id)
                    && current.status == RolloutStatus::Starting
                {
                    let mut failed = current.clone();
                    failed.status = RolloutStatus::ErrorStarting;
                    failed.updated_at = self.clock.now_millis();
                    if let Err(cas_err) = self.cas(&failed, current.version) {
                        warn!(
                            rollout_id,
                            error = %cas_err,
                            "could not record start failure"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Pause a running rollout. Open actions keep running; no further
    /// groups activate until [`RolloutExecutor::resume`].
    pub fn pause(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.require(rollout_id)?;
        if rollout.status != RolloutStatus::Running {
            return Err(self.not_allowed(&rollout, "pause"));
        }
        let mut paused = rollout.clone();
        paused.status = RolloutStatus::Paused;
        paused.updated_at = self.clock.now_millis();
        let stored = self.cas(&paused, rollout.version)?;
        info!(rollout_id = %stored.id, "rollout paused");
        Ok(stored)
    }

    /// Resume a paused rollout and evaluate it immediately, so progress
    /// made while paused is acted on without waiting for the next
    /// housekeeping pass. A group that paused the rollout through its error
    /// condition stays in `Error`; the condition does not fire again.
    pub fn resume(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.require(rollout_id)?;
        if rollout.status != RolloutStatus::Paused {
            return Err(self.not_allowed(&rollout, "resume"));
        }
        let mut running = rollout.clone();
        running.status = RolloutStatus::Running;
        running.updated_at = self.clock.now_millis();
        let stored = self.cas(&running, rollout.version)?;
        info!(rollout_id = %stored.id, "rollout resumed");
        if let Err(err) = self.evaluate_running(&stored) {
            warn!(
                rollout_id = %stored.id,
                error = %err,
                "evaluation after resume failed"
            );
        }
        self.require(rollout_id)
    }

    /// Stop a rollout for good: the rollout becomes `Stopped` and every
    /// open action is canceled. Scheduled groups never activate.
    ///
    /// Stopping an already-`Stopped` rollout re-runs the cancellation, so a
    /// store failure between the status flip and the cancel sweep is repaired
    /// by calling `stop` again.
    pub fn stop(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.require(rollout_id)?;
        if rollout.status == RolloutStatus::Stopped {
            let canceled = self.deploy.cancel_rollout_actions(rollout_id)?;
            info!(rollout_id = %rollout.id, canceled, "stop retried");
            return Ok(rollout);
        }
        if rollout.status.is_terminal() || rollout.status == RolloutStatus::Creating {
            return Err(self.not_allowed(&rollout, "stop"));
        }
        let mut stopped = rollout.clone();
        stopped.status = RolloutStatus::Stopped;
        stopped.running_actions = 0;
        stopped.updated_at = self.clock.now_millis();
        let stored = self.cas(&stopped, rollout.version)?;
        let canceled = self.deploy.cancel_rollout_actions(rollout_id)?;
        info!(rollout_id = %stored.id, canceled, "rollout stopped");
        Ok(stored)
    }

    /// Clear the hold flag so housekeeping picks the rollout up again.
    /// Meant for operators after repairing whatever set the hold.
    pub fn release_hold(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.require(rollout_id)?;
        if !rollout.on_hold {
            return Ok(rollout);
        }
        let mut released = rollout.clone();
        released.on_hold = false;
        released.updated_at = self.clock.now_millis();
        let stored = self.cas(&released, rollout.version)?;
        info!(rollout_id = %stored.id, "hold released");
        Ok(stored)
    }

    /// Delete a rollout with everything hanging off it. Only settled
    /// rollouts can go: terminal ones, `Ready` ones that never started,
    /// and `ErrorStarting` ones.
    pub fn delete(&self, rollout_id: &str) -> RolloutResult<()> {
        let rollout = self.require(rollout_id)?;
        if !(rollout.status.is_terminal()
            || matches!(
                rollout.status,
                RolloutStatus::Ready | RolloutStatus::ErrorStarting
            ))
        {
            return Err(self.not_allowed(&rollout, "delete"));
        }
        self.store.delete_rollout(rollout_id)?;
        info!(rollout_id, "rollout deleted");
        Ok(())
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// One housekeeping pass: evaluate every live rollout, within the
    /// configured time budget.
    ///
    /// Safe to run from several instances at once; conflicting passes
    /// resolve through the rollout version counter.
    pub fn process_housekeeping(&self) -> RolloutResult<HousekeepingReport> {
        let started = Instant::now();
        let mut report = HousekeepingReport::default();
        let live = self.store.active_rollouts()?;
        let total = live.len();
        for (idx, rollout) in live.into_iter().enumerate() {
            if started.elapsed() >= self.config.housekeeping_budget {
                report.deferred = total - idx;
                warn!(
                    deferred = report.deferred,
                    "housekeeping budget exhausted, deferring remaining rollouts"
                );
                break;
            }
            if rollout.on_hold {
                error!(rollout_id = %rollout.id, "rollout on hold, skipping");
                report.skipped += 1;
                continue;
            }
            match self.process_one(&rollout) {
                Ok(()) => report.processed += 1,
                Err(RolloutError::Conflict(msg)) => {
                    debug!(
                        rollout_id = %rollout.id,
                        %msg,
                        "rollout updated concurrently, retrying next pass"
                    );
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        rollout_id = %rollout.id,
                        error = %err,
                        "housekeeping failed for rollout"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn process_one(&self, rollout: &Rollout) -> RolloutResult<()> {
        match rollout.status {
            RolloutStatus::Creating => self.recover_creating(rollout),
            RolloutStatus::Starting => self.recover_starting(rollout),
            RolloutStatus::Running => self.evaluate_running(rollout),
            _ => Ok(()),
        }
    }

    /// A rollout that sat in `Creating` past the staleness cutoff lost its
    /// creating process. The group plan commits in one transaction, so its
    /// presence decides: plan landed means only the final flip to `Ready`
    /// was lost, no plan means creation is unrecoverable.
    fn recover_creating(&self, rollout: &Rollout) -> RolloutResult<()> {
        let now = self.clock.now_millis();
        if now.saturating_sub(rollout.updated_at) < STALE_RECOVERY_MS {
            return Ok(());
        }
        let groups = self.store.list_groups(&rollout.id)?;
        let mut next = rollout.clone();
        next.status = if groups.is_empty() {
            RolloutStatus::ErrorCreating
        } else {
            RolloutStatus::Ready
        };
        next.updated_at = now;
        let stored = self.cas(&next, rollout.version)?;
        warn!(
            rollout_id = %stored.id,
            status = ?stored.status,
            "recovered rollout stuck in creation"
        );
        Ok(())
    }

    /// Re-run the start sequence for a rollout stuck in `Starting`.
    /// Activation is idempotent, so this is safe whether the original start
    /// died before or after the first group came up.
    fn recover_starting(&self, rollout: &Rollout) -> RolloutResult<()> {
        let now = self.clock.now_millis();
        if now.saturating_sub(rollout.updated_at) < STALE_RECOVERY_MS {
            return Ok(());
        }
        warn!(rollout_id = %rollout.id, "recovering rollout stuck in starting");
        self.finish_start(rollout)?;
        Ok(())
    }

    /// Activate the first group and flip the rollout to `Running`.
    fn finish_start(&self, rollout: &Rollout) -> RolloutResult<Rollout> {
        self.activate_group(rollout, 0)?;
        let mut running = rollout.clone();
        running.status = RolloutStatus::Running;
        running.updated_at = self.clock.now_millis();
        let stored = self.cas(&running, rollout.version)?;
        info!(rollout_id = %stored.id, "rollout running");
        Ok(stored)
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Walk the groups of a running rollout in order and apply whatever
    /// transition their action counts call for: fire the error condition,
    /// finish a satisfied group, activate the next one, or finish the
    /// rollout once every group is done.
    fn evaluate_running(&self, rollout: &Rollout) -> RolloutResult<()> {
        let groups = self.store.list_groups(&rollout.id)?;
        if let Err(reason) = verify_group_order(&groups) {
            error!(
                rollout_id = %rollout.id,
                %reason,
                "group order corrupted, placing rollout on hold"
            );
            let mut held = rollout.clone();
            held.on_hold = true;
            held.updated_at = self.clock.now_millis();
            self.cas(&held, rollout.version)?;
            return Err(RolloutError::GroupOrderCorrupted(reason));
        }
        let mut idx = 0usize;
        while idx < groups.len() {
            let ordinal = groups[idx].ordinal;
            let Some(group) = self.store.get_group(&rollout.id, ordinal)? else {
                return Err(RolloutError::GroupOrderCorrupted(format!(
                    "rollout {}: group {ordinal} disappeared during evaluation",
                    rollout.id
                )));
            };
            match group.status {
                GroupStatus::Finished => {
                    idx += 1;
                }
                GroupStatus::Scheduled => {
                    // Activation lost or not yet done; the next iteration
                    // re-reads the group as Running.
                    self.activate_group(rollout, ordinal)?;
                }
                GroupStatus::Running | GroupStatus::Error => {
                    let counts = self.aggregator.group_status(&group)?;
                    if group.status == GroupStatus::Running
                        && let Some(error_condition) = &group.error_condition
                        && condition::evaluate(error_condition, counts.error, group.total_targets)
                    {
                        return self.fail_group(rollout, group, counts.error);
                    }
                    if condition::evaluate(
                        &group.success_condition,
                        counts.finished,
                        group.total_targets,
                    ) {
                        // Pausing after the last group would strand a
                        // complete rollout; just let it finish.
                        if group.success_action == SuccessAction::Pause && idx + 1 < groups.len()
                        {
                            // The pause CAS must land before the group flip
                            // is durable: a Finished group whose pause lost
                            // the version race would read as NextGroup on
                            // the next pass.
                            self.pause_after_group(rollout, &group)?;
                            self.finish_group(&group)?;
                            return Ok(());
                        }
                        self.finish_group(&group)?;
                        idx += 1;
                    } else {
                        return self.refresh_running_cache(rollout);
                    }
                }
            }
        }
        self.finish_rollout(rollout)
    }

    /// Activate one group: freeze skips for members that are gone or
    /// already on the distribution set, create actions for the rest, and
    /// mark their targets pending. A target holds at most one open action
    /// at a time, so open actions another rollout left on a member are
    /// canceled in the same transaction. No-op if the group already left
    /// `Scheduled`.
    fn activate_group(&self, rollout: &Rollout, ordinal: u32) -> RolloutResult<()> {
        let Some(mut group) = self.store.get_group(&rollout.id, ordinal)? else {
            return Err(RolloutError::GroupOrderCorrupted(format!(
                "rollout {}: group {ordinal} missing",
                rollout.id
            )));
        };
        if group.status != GroupStatus::Scheduled {
            debug!(
                rollout_id = %rollout.id,
                ordinal,
                status = ?group.status,
                "group already activated"
            );
            return Ok(());
        }
        let members = self.store.list_group_members(&rollout.id, ordinal)?;
        let mut open_actions: HashMap<String, Vec<Action>> = HashMap::new();
        for action in self.store.list_actions()? {
            if action.rollout_id != rollout.id && !action.status.is_terminal() {
                open_actions
                    .entry(action.controller_id.clone())
                    .or_default()
                    .push(action);
            }
        }
        let now = self.clock.now_millis();
        let mut actions = Vec::new();
        let mut superseded = Vec::new();
        let mut updated_targets = Vec::new();
        let mut skipped = 0u64;
        for member in &members {
            match self.store.get_target(&member.controller_id)? {
                Some(mut target) => {
                    if target.installed_ds.as_deref() == Some(rollout.distribution_set.as_str()) {
                        skipped += 1;
                        continue;
                    }
                    for mut stale in open_actions
                        .remove(&member.controller_id)
                        .unwrap_or_default()
                    {
                        let next = match stale.status {
                            ActionStatus::Scheduled => ActionStatus::Canceled,
                            ActionStatus::Running => ActionStatus::Canceling,
                            // Cancellation already in flight.
                            _ => continue,
                        };
                        stale.status = next;
                        stale.updated_at = now;
                        superseded.push(stale);
                    }
                    actions.push(self.deploy.build_action(rollout, ordinal, &target));
                    target.assigned_ds = Some(rollout.distribution_set.clone());
                    target.update_status = TargetUpdateStatus::Pending;
                    target.updated_at = now;
                    updated_targets.push(target);
                }
                None => {
                    // Deleted since the membership freeze. Counted as
                    // finished so the frozen denominator stays satisfiable.
                    skipped += 1;
                }
            }
        }
        group.status = GroupStatus::Running;
        group.finished_by_skip = skipped;
        group.updated_at = now;
        self.store
            .activate_group(&group, &actions, &superseded, &updated_targets)?;
        info!(
            rollout_id = %rollout.id,
            ordinal,
            actions = actions.len(),
            superseded = superseded.len(),
            skipped,
            "group activated"
        );
        Ok(())
    }

    fn finish_group(&self, group: &RolloutGroup) -> RolloutResult<()> {
        let mut finished = group.clone();
        finished.status = GroupStatus::Finished;
        finished.updated_at = self.clock.now_millis();
        self.store.put_group(&finished)?;
        info!(
            rollout_id = %group.rollout_id,
            ordinal = group.ordinal,
            "group finished"
        );
        Ok(())
    }

    /// Error action first, group flip second: a durably `Error` group no
    /// longer re-fires its condition, so losing the rollout CAS after the
    /// flip would drop the pause for good.
    fn fail_group(
        &self,
        rollout: &Rollout,
        mut group: RolloutGroup,
        errors: u64,
    ) -> RolloutResult<()> {
        let now = self.clock.now_millis();
        match group.error_action {
            ErrorAction::Pause => {
                let mut paused = rollout.clone();
                paused.status = RolloutStatus::Paused;
                paused.updated_at = now;
                self.cas(&paused, rollout.version)?;
                info!(rollout_id = %rollout.id, "rollout paused on group error");
            }
        }
        group.status = GroupStatus::Error;
        group.updated_at = now;
        self.store.put_group(&group)?;
        warn!(
            rollout_id = %rollout.id,
            ordinal = group.ordinal,
            errors,
            "group error condition met"
        );
        Ok(())
    }

    fn pause_after_group(&self, rollout: &Rollout, group: &RolloutGroup) -> RolloutResult<()> {
        let mut paused = rollout.clone();
        paused.status = RolloutStatus::Paused;
        paused.updated_at = self.clock.now_millis();
        self.cas(&paused, rollout.version)?;
        info!(
            rollout_id = %rollout.id,
            ordinal = group.ordinal,
            "rollout paused after group success"
        );
        Ok(())
    }

    fn finish_rollout(&self, rollout: &Rollout) -> RolloutResult<()> {
        let mut finished = rollout.clone();
        finished.status = RolloutStatus::Finished;
        finished.running_actions = 0;
        finished.updated_at = self.clock.now_millis();
        self.cas(&finished, rollout.version)?;
        info!(rollout_id = %rollout.id, "rollout finished");
        Ok(())
    }

    /// Refresh the informational running-actions counter on the rollout
    /// row. Written only when it changed, so an idle fleet does not churn
    /// the version counter.
    fn refresh_running_cache(&self, rollout: &Rollout) -> RolloutResult<()> {
        let counts = self.store.count_rollout_actions(&rollout.id)?;
        if counts.running != rollout.running_actions {
            let mut refreshed = rollout.clone();
            refreshed.running_actions = counts.running;
            refreshed.updated_at = self.clock.now_millis();
            self.cas(&refreshed, rollout.version)?;
        }
        Ok(())
    }

    /// Run the housekeeping loop until the shutdown signal flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            "rollout housekeeping started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.process_housekeeping() {
                        Ok(report) if report != HousekeepingReport::default() => {
                            debug!(
                                processed = report.processed,
                                skipped = report.skipped,
                                failed = report.failed,
                                deferred = report.deferred,
                                "housekeeping pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(error = %err, "housekeeping pass failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout housekeeping shutting down");
                    break;
                }
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn require(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::RolloutNotFound(rollout_id.to_string()))
    }

    fn not_allowed(&self, rollout: &Rollout, operation: &'static str) -> RolloutError {
        RolloutError::NotAllowed {
            rollout_id: rollout.id.clone(),
            status: rollout.status,
            operation,
        }
    }

    fn cas(&self, rollout: &Rollout, expected_version: u64) -> RolloutResult<Rollout> {
        match self.store.update_rollout(rollout, expected_version) {
            Ok(stored) => Ok(stored),
            Err(StateError::VersionConflict(msg)) => Err(RolloutError::Conflict(msg)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Check the structural invariants of a rollout's group list: contiguous
/// ordinals, progress non-increasing along the order (no finished group
/// after an unfinished one), and at most one group active at a time.
fn verify_group_order(groups: &[RolloutGroup]) -> Result<(), String> {
    if groups.is_empty() {
        return Err("rollout has no groups".to_string());
    }
    for (idx, group) in groups.iter().enumerate() {
        if group.ordinal != idx as u32 {
            return Err(format!("ordinal {} at position {idx}", group.ordinal));
        }
    }
    fn rank(status: GroupStatus) -> u8 {
        match status {
            GroupStatus::Finished => 2,
            GroupStatus::Running | GroupStatus::Error => 1,
            GroupStatus::Scheduled => 0,
        }
    }
    for pair in groups.windows(2) {
        if rank(pair[0].status) < rank(pair[1].status) {
            return Err(format!(
                "group {} in {:?} precedes group {} in {:?}",
                pair[0].ordinal, pair[0].status, pair[1].ordinal, pair[1].status
            ));
        }
    }
    let active = groups
        .iter()
        .filter(|g| matches!(g.status, GroupStatus::Running | GroupStatus::Error))
        .count();
    if active > 1 {
        return Err(format!("{active} groups active at once"));
    }
    Ok(())
}

/// Rollout IDs become storage key prefixes; the separator character is
/// reserved and length is capped.
fn validate_rollout_id(id: &str) -> RolloutResult<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(RolloutError::InvalidName(format!(
            "rollout ID must be 1-64 characters, got {}",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RolloutError::InvalidName(format!(
            "rollout ID {id:?} contains characters outside [a-zA-Z0-9._-]"
        )));
    }
    Ok(())
}
