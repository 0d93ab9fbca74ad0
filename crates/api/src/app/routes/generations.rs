use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use reelgen_core::UserId;
use reelgen_infra::scheduler::SubmitRequest;

use crate::app::{errors, services::AppServices};

/// POST /generations - Submit a generation job
pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SubmitRequest>,
) -> axum::response::Response {
    match services.generation.scheduler().submit(body).await {
        Ok(result) => (StatusCode::ACCEPTED, Json(result)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /users/:user_id/queue - A user's active count and queued jobs
pub async fn user_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<UserId>,
) -> impl IntoResponse {
    Json(
        services
            .generation
            .scheduler()
            .get_user_queue_status(user_id)
            .await,
    )
}
