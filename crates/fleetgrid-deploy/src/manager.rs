//! DeploymentManager — builds actions and applies device feedback.
//!
//! Every state change a device can cause flows through here: progress
//! feedback on an action, confirmation of a cancellation, and escalation of
//! time-forced actions past their deadline. The affected target row is
//! updated alongside the action so the fleet view stays consistent.
//!
//! Feedback is accepted regardless of the owning rollout's status. A paused
//! rollout stops evaluating its groups, but devices that already hold an
//! action keep reporting progress.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetgrid_state::{
    Action, ActionStatus, ActionType, Clock, Rollout, StateStore, Target, TargetUpdateStatus,
};

use crate::error::{DeployError, DeployResult};

/// Status a device can report for one of its actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFeedback {
    /// Download or installation has begun.
    Running,
    /// Installation completed successfully.
    Finished,
    /// Installation failed.
    Error,
    /// Cancellation confirmed by the device.
    Canceled,
}

/// Manages update actions and their effect on targets.
#[derive(Clone)]
pub struct DeploymentManager {
    store: StateStore,
    clock: Arc<dyn Clock>,
}

impl DeploymentManager {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Build a `Scheduled` action for one target of a rollout group.
    /// The caller persists it (normally as part of a group activation).
    pub fn build_action(&self, rollout: &Rollout, ordinal: u32, target: &Target) -> Action {
        let now = self.clock.now_millis();
        Action {
            rollout_id: rollout.id.clone(),
            ordinal,
            controller_id: target.controller_id.clone(),
            distribution_set: rollout.distribution_set.clone(),
            status: ActionStatus::Scheduled,
            action_type: rollout.action_type,
            forced_time: rollout.forced_time,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply device feedback to an action.
    ///
    /// Legal transitions: `Scheduled`/`Running` accept `Running`, `Finished`
    /// and `Error`; `Canceling` accepts `Canceled`, `Finished` and `Error`
    /// (the device may complete an install despite the cancel request).
    /// Anything else, including any feedback on a terminal action and a
    /// `Canceled` report without a prior cancel request, is rejected.
    pub fn report_status(
        &self,
        rollout_id: &str,
        ordinal: u32,
        controller_id: &str,
        feedback: ActionFeedback,
    ) -> DeployResult<Action> {
        let key = format!("{rollout_id}:{ordinal}:{controller_id}");
        let mut action = self
            .store
            .get_action(rollout_id, ordinal, controller_id)?
            .ok_or_else(|| DeployError::ActionNotFound(key.clone()))?;

        let allowed = matches!(
            (action.status, feedback),
            (
                ActionStatus::Scheduled | ActionStatus::Running,
                ActionFeedback::Running | ActionFeedback::Finished | ActionFeedback::Error,
            ) | (
                ActionStatus::Canceling,
                ActionFeedback::Canceled | ActionFeedback::Finished | ActionFeedback::Error,
            )
        );
        if !allowed {
            return Err(DeployError::NotAllowed(format!(
                "{key}: {:?} does not accept {:?}",
                action.status, feedback
            )));
        }

        let next = match feedback {
            ActionFeedback::Running => ActionStatus::Running,
            ActionFeedback::Finished => ActionStatus::Finished,
            ActionFeedback::Error => ActionStatus::Error,
            ActionFeedback::Canceled => ActionStatus::Canceled,
        };
        let now = self.clock.now_millis();
        action.status = next;
        action.updated_at = now;
        self.store.put_action(&action)?;
        self.apply_to_target(&action, now)?;

        match next {
            ActionStatus::Finished => info!(action = %key, "action finished"),
            ActionStatus::Error => warn!(action = %key, "action failed"),
            ActionStatus::Canceled => info!(action = %key, "action canceled"),
            _ => debug!(action = %key, status = ?next, "action progressed"),
        }
        Ok(action)
    }

    /// Cancel every non-terminal action of a rollout. `Scheduled` actions
    /// were never picked up and cancel outright; `Running` ones move to
    /// `Canceling` until the device confirms. Returns the number affected.
    pub fn cancel_rollout_actions(&self, rollout_id: &str) -> DeployResult<u64> {
        let now = self.clock.now_millis();
        let mut affected = 0;
        for mut action in self.store.list_rollout_actions(rollout_id)? {
            let next = match action.status {
                ActionStatus::Scheduled => ActionStatus::Canceled,
                ActionStatus::Running => ActionStatus::Canceling,
                _ => continue,
            };
            action.status = next;
            action.updated_at = now;
            self.store.put_action(&action)?;
            if next == ActionStatus::Canceled {
                self.apply_to_target(&action, now)?;
            }
            affected += 1;
        }
        info!(%rollout_id, affected, "rollout actions canceled");
        Ok(affected)
    }

    /// Escalate time-forced actions whose deadline has passed to plain
    /// forced. Returns the number escalated; already-escalated actions are
    /// not touched again.
    pub fn force_overdue_actions(&self) -> DeployResult<u64> {
        let now = self.clock.now_millis();
        let mut escalated = 0;
        for mut action in self.store.list_actions()? {
            if action.action_type != ActionType::TimeForced {
                continue;
            }
            if !matches!(
                action.status,
                ActionStatus::Scheduled | ActionStatus::Running
            ) {
                continue;
            }
            let Some(deadline) = action.forced_time else {
                continue;
            };
            if now < deadline {
                continue;
            }
            action.action_type = ActionType::Forced;
            action.updated_at = now;
            self.store.put_action(&action)?;
            debug!(action = %action.table_key(), deadline, "time-forced action escalated");
            escalated += 1;
        }
        if escalated > 0 {
            info!(escalated, "overdue time-forced actions escalated to forced");
        }
        Ok(escalated)
    }

    /// The action type a device should see right now: `TimeForced` presents
    /// as `Forced` once its deadline has passed.
    pub fn effective_action_type(&self, action: &Action) -> ActionType {
        if action.action_type == ActionType::TimeForced
            && action
                .forced_time
                .is_some_and(|t| self.clock.now_millis() >= t)
        {
            ActionType::Forced
        } else {
            action.action_type
        }
    }

    /// Mirror an action's new status onto its target row. A target deleted
    /// mid-rollout is skipped; the action record stands on its own.
    fn apply_to_target(&self, action: &Action, now: u64) -> DeployResult<()> {
        let Some(mut target) = self.store.get_target(&action.controller_id)? else {
            debug!(
                controller_id = %action.controller_id,
                "feedback for deleted target, skipping target update"
            );
            return Ok(());
        };
        match action.status {
            ActionStatus::Running => {
                target.update_status = TargetUpdateStatus::Pending;
            }
            ActionStatus::Finished => {
                target.installed_ds = Some(action.distribution_set.clone());
                target.update_status = TargetUpdateStatus::InSync;
            }
            ActionStatus::Error => {
                target.update_status = TargetUpdateStatus::Error;
            }
            ActionStatus::Canceled => {
                // The assignment is revoked together with its action.
                if target.assigned_ds.as_deref() == Some(action.distribution_set.as_str()) {
                    target.assigned_ds = None;
                }
                target.update_status = if target.installed_ds.is_some() {
                    TargetUpdateStatus::InSync
                } else {
                    TargetUpdateStatus::Registered
                };
            }
            _ => return Ok(()),
        }
        target.updated_at = now;
        self.store.put_target(&target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::ManualClock;
    use std::collections::HashMap;

    fn test_target(controller_id: &str) -> Target {
        Target {
            controller_id: controller_id.to_string(),
            name: format!("device {controller_id}"),
            attributes: HashMap::new(),
            assigned_ds: Some("os:1.0".to_string()),
            installed_ds: None,
            update_status: TargetUpdateStatus::Pending,
            last_poll_at: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_rollout(id: &str) -> Rollout {
        Rollout {
            id: id.to_string(),
            distribution_set: "os:1.0".to_string(),
            target_filter: "controller_id==*".to_string(),
            total_targets: 5,
            status: fleetgrid_state::RolloutStatus::Running,
            action_type: ActionType::Forced,
            forced_time: None,
            running_actions: 0,
            on_hold: false,
            version: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn setup() -> (DeploymentManager, StateStore, Arc<ManualClock>) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(1_000);
        let manager = DeploymentManager::new(store.clone(), clock.clone());
        (manager, store, clock)
    }

    fn seed_action(
        manager: &DeploymentManager,
        store: &StateStore,
        rollout_id: &str,
        controller_id: &str,
    ) -> Action {
        let target = test_target(controller_id);
        store.put_target(&target).unwrap();
        let action = manager.build_action(&test_rollout(rollout_id), 0, &target);
        store.put_action(&action).unwrap();
        action
    }

    #[test]
    fn feedback_runs_through_to_finished() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");

        let action = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Running)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Running);

        let action = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Finished)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Finished);

        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.update_status, TargetUpdateStatus::InSync);
        assert_eq!(target.installed_ds, Some("os:1.0".to_string()));
    }

    #[test]
    fn feedback_can_finish_straight_from_scheduled() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");

        let action = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Finished)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Finished);
    }

    #[test]
    fn feedback_error_marks_target() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");

        manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Error)
            .unwrap();

        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.update_status, TargetUpdateStatus::Error);
    }

    #[test]
    fn feedback_on_terminal_action_is_rejected() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");
        manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Finished)
            .unwrap();

        let err = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Running)
            .unwrap_err();
        assert!(matches!(err, DeployError::NotAllowed(_)));
    }

    #[test]
    fn unsolicited_cancel_is_rejected() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");

        let err = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Canceled)
            .unwrap_err();
        assert!(matches!(err, DeployError::NotAllowed(_)));
    }

    #[test]
    fn feedback_for_unknown_action_is_not_found() {
        let (manager, _, _) = setup();
        let err = manager
            .report_status("r1", 0, "ghost", ActionFeedback::Running)
            .unwrap_err();
        assert!(matches!(err, DeployError::ActionNotFound(_)));
    }

    #[test]
    fn feedback_survives_target_deletion() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");
        store.delete_target("dev-1").unwrap();

        // The action record itself still progresses.
        let action = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Finished)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Finished);
    }

    #[test]
    fn cancel_splits_scheduled_and_running() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");
        seed_action(&manager, &store, "r1", "dev-2");
        seed_action(&manager, &store, "r1", "dev-3");
        manager
            .report_status("r1", 0, "dev-2", ActionFeedback::Running)
            .unwrap();
        manager
            .report_status("r1", 0, "dev-3", ActionFeedback::Finished)
            .unwrap();

        let affected = manager.cancel_rollout_actions("r1").unwrap();
        assert_eq!(affected, 2);

        let a1 = store.get_action("r1", 0, "dev-1").unwrap().unwrap();
        assert_eq!(a1.status, ActionStatus::Canceled);
        let a2 = store.get_action("r1", 0, "dev-2").unwrap().unwrap();
        assert_eq!(a2.status, ActionStatus::Canceling);
        // Finished actions stay finished.
        let a3 = store.get_action("r1", 0, "dev-3").unwrap().unwrap();
        assert_eq!(a3.status, ActionStatus::Finished);

        // The never-started target lost its assignment.
        let t1 = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(t1.assigned_ds, None);
        assert_eq!(t1.update_status, TargetUpdateStatus::Registered);
    }

    #[test]
    fn device_confirms_cancellation() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");
        manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Running)
            .unwrap();
        manager.cancel_rollout_actions("r1").unwrap();

        let action = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Canceled)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Canceled);
    }

    #[test]
    fn device_may_finish_despite_cancel_request() {
        let (manager, store, _) = setup();
        seed_action(&manager, &store, "r1", "dev-1");
        manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Running)
            .unwrap();
        manager.cancel_rollout_actions("r1").unwrap();

        let action = manager
            .report_status("r1", 0, "dev-1", ActionFeedback::Finished)
            .unwrap();
        assert_eq!(action.status, ActionStatus::Finished);

        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.update_status, TargetUpdateStatus::InSync);
    }

    #[test]
    fn overdue_time_forced_actions_escalate_once() {
        let (manager, store, clock) = setup();
        let target = test_target("dev-1");
        store.put_target(&target).unwrap();

        let mut rollout = test_rollout("r1");
        rollout.action_type = ActionType::TimeForced;
        rollout.forced_time = Some(5_000);
        let action = manager.build_action(&rollout, 0, &target);
        store.put_action(&action).unwrap();

        // Deadline not reached yet.
        assert_eq!(manager.force_overdue_actions().unwrap(), 0);
        assert_eq!(
            manager.effective_action_type(&action),
            ActionType::TimeForced
        );

        clock.set(5_000);
        assert_eq!(manager.effective_action_type(&action), ActionType::Forced);
        assert_eq!(manager.force_overdue_actions().unwrap(), 1);

        let stored = store.get_action("r1", 0, "dev-1").unwrap().unwrap();
        assert_eq!(stored.action_type, ActionType::Forced);

        // Already escalated, nothing left to do.
        assert_eq!(manager.force_overdue_actions().unwrap(), 0);
    }

    #[test]
    fn soft_and_forced_actions_never_escalate() {
        let (manager, store, clock) = setup();
        let target = test_target("dev-1");
        store.put_target(&target).unwrap();

        let mut rollout = test_rollout("r1");
        rollout.action_type = ActionType::Soft;
        store
            .put_action(&manager.build_action(&rollout, 0, &target))
            .unwrap();

        clock.set(u64::MAX / 2);
        assert_eq!(manager.force_overdue_actions().unwrap(), 0);
    }
}
