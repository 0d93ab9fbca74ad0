//! Operator routes: system status, zombie cleanup, manual finalization and
//! consistency checks. Mounted behind the admin token middleware.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use reelgen_core::JobId;

use crate::app::dto::{CleanupQuery, ForceCompleteRequest, ForceFailRequest};
use crate::app::services::AppServices;

const FORCE_FAIL_MESSAGE: &str = "Failed by operator";

pub fn router() -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/zombies/cleanup", post(cleanup_zombies))
        .route("/jobs/:id/force-complete", post(force_complete))
        .route("/jobs/:id/force-fail", post(force_fail))
        .route("/recovery/validate", get(validate_recovery))
}

/// GET /admin/status - Active set, queue and reaper state
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.generation.scheduler().system_status())
}

/// POST /admin/zombies/cleanup - Per-user with `?user_id=`, otherwise system-wide
pub async fn cleanup_zombies(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<CleanupQuery>,
) -> impl IntoResponse {
    let reaper = services.generation.reaper();
    let body = match query.user_id {
        Some(user_id) => {
            let report = reaper.cleanup_user(user_id).await;
            json!({ "scope": "user", "report": report })
        }
        None => {
            let report = reaper.cleanup_system().await;
            json!({ "scope": "system", "report": report })
        }
    };
    services.generation.request_drain();
    tracing::info!(user_id = ?query.user_id, "operator zombie cleanup");
    Json(body)
}

/// POST /admin/jobs/:id/force-complete - Complete a job even without an artifact
pub async fn force_complete(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<JobId>,
    Json(body): Json<ForceCompleteRequest>,
) -> impl IntoResponse {
    tracing::warn!(%job_id, "operator force-complete");
    Json(
        services
            .generation
            .lifecycle()
            .force_complete(job_id, body.artifact_url)
            .await,
    )
}

/// POST /admin/jobs/:id/force-fail - Fail and refund a job
pub async fn force_fail(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<JobId>,
    Json(body): Json<ForceFailRequest>,
) -> impl IntoResponse {
    tracing::warn!(%job_id, "operator force-fail");
    let message = body.message.unwrap_or_else(|| FORCE_FAIL_MESSAGE.to_string());
    Json(
        services
            .generation
            .lifecycle()
            .force_fail(job_id, &message)
            .await,
    )
}

/// GET /admin/recovery/validate - Compare memory against stored records
pub async fn validate_recovery(
    Extension(services): Extension<Arc<AppServices>>,
) -> impl IntoResponse {
    Json(services.generation.recovery().validate().await)
}
