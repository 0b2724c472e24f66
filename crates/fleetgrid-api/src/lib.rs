//! fleetgrid-api — REST API for FleetGrid.
//!
//! Provides axum route handlers for target registration, distribution
//! sets, rollout management, and device feedback.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/targets` | List targets |
//! | POST | `/api/v1/targets` | Register or update a target |
//! | GET | `/api/v1/targets/{id}` | Get target details |
//! | DELETE | `/api/v1/targets/{id}` | Delete a target |
//! | POST | `/api/v1/targets/{id}/feedback` | Device feedback on an action |
//! | GET | `/api/v1/distribution-sets` | List distribution sets |
//! | POST | `/api/v1/distribution-sets` | Create a distribution set |
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create a rollout |
//! | GET | `/api/v1/rollouts/{id}` | Rollout with aggregated totals |
//! | DELETE | `/api/v1/rollouts/{id}` | Delete a settled rollout |
//! | POST | `/api/v1/rollouts/{id}/start` | Start the rollout |
//! | POST | `/api/v1/rollouts/{id}/pause` | Pause the rollout |
//! | POST | `/api/v1/rollouts/{id}/resume` | Resume a paused rollout |
//! | POST | `/api/v1/rollouts/{id}/stop` | Stop and cancel open actions |
//! | POST | `/api/v1/rollouts/{id}/release-hold` | Clear the hold flag |
//! | GET | `/api/v1/rollouts/{id}/groups` | Per-group status |

pub mod handlers;
pub mod rollout_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use fleetgrid_deploy::DeploymentManager;
use fleetgrid_rollout::RolloutExecutor;
use fleetgrid_state::{Clock, StateStore};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub deploy: DeploymentManager,
    pub executor: Arc<RolloutExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/targets",
            get(handlers::list_targets).post(handlers::register_target),
        )
        .route(
            "/targets/{id}",
            get(handlers::get_target).delete(handlers::delete_target),
        )
        .route("/targets/{id}/feedback", post(handlers::target_feedback))
        .route(
            "/distribution-sets",
            get(handlers::list_distribution_sets).post(handlers::create_distribution_set),
        )
        .route(
            "/rollouts",
            get(rollout_handlers::list_rollouts).post(rollout_handlers::create_rollout),
        )
        .route(
            "/rollouts/{id}",
            get(rollout_handlers::get_rollout).delete(rollout_handlers::delete_rollout),
        )
        .route("/rollouts/{id}/start", post(rollout_handlers::start_rollout))
        .route("/rollouts/{id}/pause", post(rollout_handlers::pause_rollout))
        .route(
            "/rollouts/{id}/resume",
            post(rollout_handlers::resume_rollout),
        )
        .route("/rollouts/{id}/stop", post(rollout_handlers::stop_rollout))
        .route(
            "/rollouts/{id}/release-hold",
            post(rollout_handlers::release_hold),
        )
        .route("/rollouts/{id}/groups", get(rollout_handlers::list_groups))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
