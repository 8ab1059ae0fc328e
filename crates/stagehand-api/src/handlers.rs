//! REST API handlers.
//!
//! Each handler calls into the `ReleaseOrchestrator` and returns the
//! `{success, data, error}` JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use stagehand_registry::RegistryError;
use stagehand_release::ReleaseError;
use stagehand_rollout::PromotionError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn release_error(e: &ReleaseError) -> Response {
    let status = status_for(e);
    if status.is_server_error() {
        warn!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

/// HTTP status for an orchestrator error.
pub fn status_for(e: &ReleaseError) -> StatusCode {
    match e {
        ReleaseError::UnknownService(_)
        | ReleaseError::UnknownEnvironment(_)
        | ReleaseError::UnknownApproval(_) => StatusCode::NOT_FOUND,
        ReleaseError::Configuration(_) => StatusCode::BAD_REQUEST,
        ReleaseError::Registry(RegistryError::InvalidReference(_)) => StatusCode::BAD_REQUEST,
        ReleaseError::Registry(RegistryError::UnknownImage(_)) => StatusCode::NOT_FOUND,
        ReleaseError::Promotion(PromotionError::UnknownDeployment(_)) => StatusCode::NOT_FOUND,
        ReleaseError::Promotion(
            PromotionError::Busy(_) | PromotionError::Configuration(_),
        ) => StatusCode::CONFLICT,
        ReleaseError::ApprovalTimeout { .. } => StatusCode::CONFLICT,
        ReleaseError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Images ─────────────────────────────────────────────────────

/// Body of a push notification from the build pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePushed {
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

/// POST /api/v1/images
pub async fn push_image(
    State(state): State<ApiState>,
    Json(pushed): Json<ImagePushed>,
) -> Response {
    match state
        .orchestrator
        .on_image_pushed(&pushed.repository, &pushed.tag, &pushed.digest)
        .await
    {
        Ok(request) => (StatusCode::ACCEPTED, ApiResponse::ok(request)).into_response(),
        Err(e) => release_error(&e),
    }
}

/// GET /api/v1/images/{repository}
pub async fn list_versions(
    State(state): State<ApiState>,
    Path(repository): Path<String>,
) -> Response {
    match state.orchestrator.registry().versions(&repository) {
        Ok(versions) => ApiResponse::ok(versions).into_response(),
        Err(e) => release_error(&ReleaseError::from(e)),
    }
}

// ── Approvals ──────────────────────────────────────────────────

/// GET /api/v1/approvals
pub async fn list_approvals(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.approvals().pending()).into_response()
}

/// Approve request body.
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approver: String,
}

/// Reject request body.
#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub approver: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/approvals/{id}/approve
pub async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Response {
    if req.approver.trim().is_empty() {
        return error_response("approver is required", StatusCode::BAD_REQUEST);
    }
    match state.orchestrator.approvals().approve(&id, &req.approver) {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "promotion": id,
            "decision": "approved",
            "approver": req.approver,
        }))
        .into_response(),
        Err(e) => release_error(&e),
    }
}

/// POST /api/v1/approvals/{id}/reject
pub async fn reject(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Response {
    if req.approver.trim().is_empty() {
        return error_response("approver is required", StatusCode::BAD_REQUEST);
    }
    match state
        .orchestrator
        .approvals()
        .reject(&id, &req.approver, req.reason.as_deref())
    {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "promotion": id,
            "decision": "rejected",
            "approver": req.approver,
            "reason": req.reason,
        }))
        .into_response(),
        Err(e) => release_error(&e),
    }
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> Response {
    let services: Vec<_> = state.orchestrator.services().into_iter().cloned().collect();
    ApiResponse::ok(services).into_response()
}

/// GET /api/v1/services/{service}/promotions
pub async fn list_promotions(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Response {
    if let Err(e) = state.orchestrator.service(&service) {
        return release_error(&e);
    }
    match state.orchestrator.list_promotions(&service) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => release_error(&e),
    }
}

/// POST /api/v1/services/{service}/cancel
pub async fn cancel_release(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Response {
    if let Err(e) = state.orchestrator.service(&service) {
        return release_error(&e);
    }
    if state.orchestrator.cancel(&service) {
        ApiResponse::ok(serde_json::json!({ "service": service, "status": "cancelling" }))
            .into_response()
    } else {
        error_response(
            &format!("no release of {service} is running"),
            StatusCode::NOT_FOUND,
        )
    }
}

/// GET /api/v1/promotions/{id}
pub async fn get_promotion(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_promotion(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("promotion not found", StatusCode::NOT_FOUND),
        Err(e) => release_error(&e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Response {
    match state.orchestrator.list_deployments() {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => release_error(&e),
    }
}

/// GET /api/v1/deployments/{env}/{service}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path((env, service)): Path<(String, String)>,
) -> Response {
    match state.orchestrator.get_deployment(&env, &service) {
        Ok(Some(deployment)) => ApiResponse::ok(deployment).into_response(),
        Ok(None) => error_response("deployment not found", StatusCode::NOT_FOUND),
        Err(e) => release_error(&e),
    }
}

/// POST /api/v1/deployments/{env}/{service}/resolve
pub async fn resolve_degraded(
    State(state): State<ApiState>,
    Path((env, service)): Path<(String, String)>,
) -> Response {
    match state.orchestrator.resolve_degraded(&env, &service).await {
        Ok(deployment) => ApiResponse::ok(deployment).into_response(),
        Err(e) => release_error(&e),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(
            status_for(&ReleaseError::UnknownApproval("p1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ReleaseError::Registry(RegistryError::InvalidReference(
                "digest".into()
            ))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ReleaseError::Promotion(PromotionError::Busy("dev/api".into()))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ReleaseError::QueueClosed),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = health().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
