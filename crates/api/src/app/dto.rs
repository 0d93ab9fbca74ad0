use serde::{Deserialize, Serialize};

use reelgen_core::{JobId, UserId};
use reelgen_infra::lifecycle::FinalizeOutcome;
use reelgen_infra::render::RenderUpdate;

// -------------------------
// Request DTOs
// -------------------------

/// Push notification from the render provider.
///
/// `{ "job_id": "...", "type": "complete", "artifact_url": "..." }`
#[derive(Debug, Deserialize)]
pub struct RenderWebhook {
    pub job_id: JobId,
    #[serde(flatten)]
    pub update: RenderUpdate,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub user_id: Option<UserId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ForceCompleteRequest {
    pub artifact_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ForceFailRequest {
    pub message: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub job_id: JobId,
    /// `None` for progress updates, which do not finalize anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<FinalizeOutcome>,
}
