use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use reelgen_infra::render::RenderUpdate;

use crate::app::{dto::{RenderWebhook, WebhookAck}, services::AppServices};

/// POST /webhooks/render - Render provider push notifications
///
/// Finalization is idempotent, so a webhook racing the subscription stream
/// settles the job once.
pub async fn render(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<RenderWebhook>,
) -> impl IntoResponse {
    let lifecycle = services.generation.lifecycle();
    let outcome = match body.update {
        RenderUpdate::Progress { percent } => {
            tracing::debug!(job_id = %body.job_id, percent, "render progress");
            None
        }
        RenderUpdate::Complete { artifact_url } => {
            Some(lifecycle.complete(body.job_id, Some(artifact_url)).await)
        }
        RenderUpdate::Error { message } => Some(lifecycle.fail(body.job_id, &message).await),
    };

    (
        StatusCode::ACCEPTED,
        Json(WebhookAck {
            job_id: body.job_id,
            outcome,
        }),
    )
}
