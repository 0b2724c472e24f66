//! fleetgrid-deploy — action lifecycle management for FleetGrid.
//!
//! Sits between the rollout engine and the device-facing surface: builds
//! update actions for targets, applies device feedback to them, mirrors the
//! outcome onto the target rows, and handles cancellation and forced-time
//! escalation.

pub mod error;
pub mod manager;

pub use error::{DeployError, DeployResult};
pub use manager::{ActionFeedback, DeploymentManager};
