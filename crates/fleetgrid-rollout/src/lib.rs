//! fleetgrid-rollout — staged rollout engine for FleetGrid.
//!
//! A rollout distributes one distribution set to a filtered slice of the
//! fleet in ordered groups. Membership is frozen at creation; groups then
//! activate one after another, each gated by a success condition over the
//! aggregated action counts of the previous group. Progress is driven by a
//! periodic housekeeping pass rather than per-device callbacks, so a crash
//! or restart only ever delays evaluation.
//!
//! Modules:
//! - [`plan`] — splits the target set into group-sized slices
//! - [`condition`] — evaluates success/error conditions against counts
//! - [`status`] — aggregated progress views for groups and rollouts
//! - [`executor`] — the rollout state machine and housekeeping loop

pub mod condition;
pub mod error;
pub mod executor;
pub mod plan;
pub mod status;

pub use error::{RolloutError, RolloutResult};
pub use executor::{CreateRollout, ExecutorConfig, HousekeepingReport, RolloutExecutor};
pub use plan::{GroupQuota, GroupSpec};
pub use status::{StatusAggregator, TotalTargetCountStatus};
