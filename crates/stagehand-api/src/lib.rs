//! stagehand-api — REST API for the release orchestrator.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/images` | Report a pushed image (queues a release) |
//! | GET | `/api/v1/images/{repository}` | Known versions of a repository |
//! | GET | `/api/v1/approvals` | Open approval gates |
//! | POST | `/api/v1/approvals/{id}/approve` | Approve a gated promotion |
//! | POST | `/api/v1/approvals/{id}/reject` | Reject a gated promotion |
//! | GET | `/api/v1/services` | Configured services |
//! | GET | `/api/v1/services/{service}/promotions` | Promotion audit trail |
//! | POST | `/api/v1/services/{service}/cancel` | Cancel the running release |
//! | GET | `/api/v1/promotions/{id}` | One promotion record |
//! | GET | `/api/v1/deployments` | All deployments |
//! | GET | `/api/v1/deployments/{env}/{service}` | One deployment |
//! | POST | `/api/v1/deployments/{env}/{service}/resolve` | Retry a degraded rollback |
//! | GET | `/health` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use stagehand_release::ReleaseOrchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: ReleaseOrchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: ReleaseOrchestrator) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/images", post(handlers::push_image))
        .route("/images/{*repository}", get(handlers::list_versions))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approvals/{id}/approve", post(handlers::approve))
        .route("/approvals/{id}/reject", post(handlers::reject))
        .route("/services", get(handlers::list_services))
        .route("/services/{service}/promotions", get(handlers::list_promotions))
        .route("/services/{service}/cancel", post(handlers::cancel_release))
        .route("/promotions/{id}", get(handlers::get_promotion))
        .route("/deployments", get(handlers::list_deployments))
        .route("/deployments/{env}/{service}", get(handlers::get_deployment))
        .route(
            "/deployments/{env}/{service}/resolve",
            post(handlers::resolve_degraded),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health))
}
