//! REST API handlers for rollout management.
//!
//! Lifecycle operations delegate to the `RolloutExecutor`; read endpoints
//! combine stored rows with live action counts from the status aggregator.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::error;

use fleetgrid_rollout::{CreateRollout, RolloutError, TotalTargetCountStatus};
use fleetgrid_state::{Rollout, RolloutGroup};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// Maps engine errors onto HTTP status codes. Client-caused failures are
/// only reported in the response body; internal ones get a log line too.
fn rollout_error_response(err: &RolloutError) -> axum::response::Response {
    let status = match err {
        RolloutError::RolloutNotFound(_) | RolloutError::DistributionSetNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RolloutError::DuplicateRollout(_)
        | RolloutError::NotAllowed { .. }
        | RolloutError::Conflict(_) => StatusCode::CONFLICT,
        RolloutError::InvalidName(_)
        | RolloutError::InvalidFilter(_)
        | RolloutError::NoMatchingTargets(_)
        | RolloutError::InvalidGroupDefinition(_)
        | RolloutError::TooManyGroups { .. } => StatusCode::BAD_REQUEST,
        RolloutError::GroupOrderCorrupted(_)
        | RolloutError::Deploy(_)
        | RolloutError::State(_) => {
            error!(%err, "rollout operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&err.to_string(), status).into_response()
}

/// Rollout row plus aggregated per-status target counts.
#[derive(Serialize)]
pub struct RolloutView {
    #[serde(flatten)]
    pub rollout: Rollout,
    pub totals: TotalTargetCountStatus,
}

/// Group row plus aggregated per-status target counts.
#[derive(Serialize)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: RolloutGroup,
    pub totals: TotalTargetCountStatus,
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_rollouts() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    Json(req): Json<CreateRollout>,
) -> impl IntoResponse {
    match state.executor.create_rollout(req) {
        Ok(rollout) => (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// GET /api/v1/rollouts/:id
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let rollout = match state.store.get_rollout(&id) {
        Ok(Some(rollout)) => rollout,
        Ok(None) => {
            return error_response("rollout not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    match state.executor.aggregator().rollout_status(&rollout) {
        Ok(totals) => ApiResponse::ok(RolloutView { rollout, totals }).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// DELETE /api/v1/rollouts/:id
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.delete(&id) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// POST /api/v1/rollouts/:id/start
pub async fn start_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.start(&id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// POST /api/v1/rollouts/:id/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.pause(&id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// POST /api/v1/rollouts/:id/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.resume(&id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// POST /api/v1/rollouts/:id/stop
pub async fn stop_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.stop(&id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// POST /api/v1/rollouts/:id/release-hold
pub async fn release_hold(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.release_hold(&id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

/// GET /api/v1/rollouts/:id/groups
pub async fn list_groups(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_rollout(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("rollout not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }
    let groups = match state.store.list_groups(&id) {
        Ok(groups) => groups,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    let mut views = Vec::with_capacity(groups.len());
    for group in groups {
        match state.executor.aggregator().group_status(&group) {
            Ok(totals) => views.push(GroupView { group, totals }),
            Err(e) => return rollout_error_response(&e),
        }
    }
    ApiResponse::ok(views).into_response()
}
