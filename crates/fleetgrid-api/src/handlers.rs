//! REST API handlers for targets, distribution sets, and device feedback.
//!
//! Each handler reads/writes via `StateStore` or `DeploymentManager` and
//! returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use fleetgrid_deploy::{ActionFeedback, DeployError};
use fleetgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    pub(crate) success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Identifiers end up embedded in storage keys, so the key separator and
/// anything outside a plain name charset is refused at the door.
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ── Targets ────────────────────────────────────────────────────

/// Registration request, as sent by a device on first contact and on every
/// later poll. Attributes replace the stored set.
#[derive(serde::Deserialize)]
pub struct RegisterTarget {
    pub controller_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: std::collections::HashMap<String, String>,
}

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_targets() {
        Ok(targets) => ApiResponse::ok(targets).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/targets
pub async fn register_target(
    State(state): State<ApiState>,
    Json(req): Json<RegisterTarget>,
) -> impl IntoResponse {
    if !valid_id(&req.controller_id) {
        return error_response(
            &format!("invalid controller ID {:?}", req.controller_id),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    let now = state.clock.now_millis();
    let (target, created) = match state.store.get_target(&req.controller_id) {
        Ok(Some(mut existing)) => {
            if let Some(name) = req.name {
                existing.name = name;
            }
            existing.attributes = req.attributes;
            existing.last_poll_at = Some(now);
            existing.updated_at = now;
            (existing, false)
        }
        Ok(None) => (
            Target {
                controller_id: req.controller_id.clone(),
                name: req.name.unwrap_or_else(|| req.controller_id.clone()),
                attributes: req.attributes,
                assigned_ds: None,
                installed_ds: None,
                update_status: TargetUpdateStatus::Registered,
                last_poll_at: Some(now),
                created_at: now,
                updated_at: now,
            },
            true,
        ),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    match state.store.put_target(&target) {
        Ok(()) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, ApiResponse::ok(target)).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/targets/:id
pub async fn get_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_target(&id) {
        Ok(Some(target)) => ApiResponse::ok(target).into_response(),
        Ok(None) => error_response("target not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// DELETE /api/v1/targets/:id
pub async fn delete_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_target(&id) {
        Ok(true) => ApiResponse::ok(serde_json::json!({ "deleted": id })).into_response(),
        Ok(false) => error_response("target not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Device feedback ────────────────────────────────────────────

/// Feedback body: which action (by rollout and group) and what happened.
#[derive(serde::Deserialize)]
pub struct FeedbackRequest {
    pub rollout: String,
    pub group: u32,
    pub status: ActionFeedback,
}

/// POST /api/v1/targets/:id/feedback
pub async fn target_feedback(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> impl IntoResponse {
    match state
        .deploy
        .report_status(&req.rollout, req.group, &id, req.status)
    {
        Ok(action) => ApiResponse::ok(action).into_response(),
        Err(DeployError::ActionNotFound(key)) => {
            error_response(&format!("action not found: {key}"), StatusCode::NOT_FOUND)
                .into_response()
        }
        Err(DeployError::NotAllowed(msg)) => {
            error_response(&msg, StatusCode::CONFLICT).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Distribution sets ──────────────────────────────────────────

/// Creation request for a distribution set.
#[derive(serde::Deserialize)]
pub struct CreateDistributionSet {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub required_migration_step: bool,
}

/// GET /api/v1/distribution-sets
pub async fn list_distribution_sets(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_distribution_sets() {
        Ok(sets) => ApiResponse::ok(sets).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/distribution-sets
pub async fn create_distribution_set(
    State(state): State<ApiState>,
    Json(req): Json<CreateDistributionSet>,
) -> impl IntoResponse {
    if !valid_id(&req.name) || !valid_id(&req.version) {
        return error_response(
            &format!("invalid distribution set name {:?}:{:?}", req.name, req.version),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    let key = format!("{}:{}", req.name, req.version);
    match state.store.get_distribution_set(&key) {
        Ok(Some(_)) => {
            return error_response(
                &format!("distribution set already exists: {key}"),
                StatusCode::CONFLICT,
            )
            .into_response();
        }
        Ok(None) => {}
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }
    let ds = DistributionSet {
        name: req.name,
        version: req.version,
        description: req.description,
        modules: req.modules,
        required_migration_step: req.required_migration_step,
        created_at: state.clock.now_millis(),
    };
    match state.store.put_distribution_set(&ds) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(ds)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use fleetgrid_deploy::DeploymentManager;
    use fleetgrid_rollout::{CreateRollout, ExecutorConfig, GroupSpec, RolloutExecutor};

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(1_000);
        let deploy = DeploymentManager::new(store.clone(), clock.clone());
        let executor = Arc::new(RolloutExecutor::new(
            store.clone(),
            deploy.clone(),
            clock.clone(),
            ExecutorConfig::default(),
        ));
        ApiState {
            store,
            deploy,
            executor,
            clock,
        }
    }

    fn register(id: &str) -> RegisterTarget {
        RegisterTarget {
            controller_id: id.to_string(),
            name: None,
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn register_creates_then_updates() {
        let state = test_state();

        let resp = register_target(State(state.clone()), Json(register("dev-1")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let mut update = register("dev-1");
        update.name = Some("gateway".to_string());
        update
            .attributes
            .insert("hw".to_string(), "rev2".to_string());
        let resp = register_target(State(state.clone()), Json(update))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let target = state.store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.name, "gateway");
        assert_eq!(target.attributes["hw"], "rev2");
        assert_eq!(target.last_poll_at, Some(1_000));
    }

    #[tokio::test]
    async fn register_rejects_unsafe_ids() {
        let state = test_state();
        for bad in ["", "has:colon", "has space"] {
            let resp = register_target(State(state.clone()), Json(register(bad)))
                .await
                .into_response();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{bad:?}");
        }
    }

    #[tokio::test]
    async fn get_and_delete_target() {
        let state = test_state();
        register_target(State(state.clone()), Json(register("dev-1"))).await;

        let resp = get_target(State(state.clone()), Path("dev-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = delete_target(State(state.clone()), Path("dev-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_target(State(state.clone()), Path("dev-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = delete_target(State(state), Path("dev-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn distribution_set_create_and_conflict() {
        let state = test_state();
        let req = || CreateDistributionSet {
            name: "app".to_string(),
            version: "1.0".to_string(),
            description: None,
            modules: vec![],
            required_migration_step: false,
        };

        let resp = create_distribution_set(State(state.clone()), Json(req()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = create_distribution_set(State(state.clone()), Json(req()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let mut bad = req();
        bad.version = "1:0".to_string();
        let resp = create_distribution_set(State(state), Json(bad))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn feedback_reaches_the_action() {
        let state = test_state();
        for i in 0..2 {
            register_target(State(state.clone()), Json(register(&format!("dev-{i}")))).await;
        }
        create_distribution_set(
            State(state.clone()),
            Json(CreateDistributionSet {
                name: "app".to_string(),
                version: "1.0".to_string(),
                description: None,
                modules: vec![],
                required_migration_step: false,
            }),
        )
        .await;
        state
            .executor
            .create_rollout(CreateRollout {
                id: "r1".to_string(),
                distribution_set: "app:1.0".to_string(),
                target_filter: "id==dev-*".to_string(),
                groups: GroupSpec::even(1, 100),
                action_type: None,
                forced_time: None,
            })
            .unwrap();
        state.executor.start("r1").unwrap();

        let resp = target_feedback(
            State(state.clone()),
            Path("dev-0".to_string()),
            Json(FeedbackRequest {
                rollout: "r1".to_string(),
                group: 0,
                status: ActionFeedback::Finished,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let action = state.store.get_action("r1", 0, "dev-0").unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Finished);

        // Finished is terminal; more feedback is refused.
        let resp = target_feedback(
            State(state.clone()),
            Path("dev-0".to_string()),
            Json(FeedbackRequest {
                rollout: "r1".to_string(),
                group: 0,
                status: ActionFeedback::Running,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // No such action.
        let resp = target_feedback(
            State(state),
            Path("dev-9".to_string()),
            Json(FeedbackRequest {
                rollout: "r1".to_string(),
                group: 0,
                status: ActionFeedback::Finished,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
