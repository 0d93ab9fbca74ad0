use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use reelgen_ai::GeneratedMetadata;
use reelgen_core::{JobId, JobStatus, MetadataStatus, UserId, VideoJob};

/// Columns the scheduler needs beyond a bare job table.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "processing_started_at",
    "queue_position",
    "priority",
    "provider_job_id",
    "metadata_status",
];

/// Result of probing the durable schema at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "support", content = "missing_columns", rename_all = "snake_case")]
pub enum SchemaSupport {
    Full,
    Missing(Vec<String>),
}

impl SchemaSupport {
    pub fn is_full(&self) -> bool {
        matches!(self, SchemaSupport::Full)
    }

    /// Compare the columns present against `REQUIRED_COLUMNS`.
    pub fn from_present<S: AsRef<str>>(present: &[S]) -> Self {
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !present.iter().any(|p| p.as_ref() == **required))
            .map(|c| (*c).to_string())
            .collect();
        if missing.is_empty() {
            SchemaSupport::Full
        } else {
            SchemaSupport::Missing(missing)
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("job record already exists: {0}")]
    Duplicate(JobId),
    #[error("invalid record update: {0}")]
    InvalidUpdate(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("could not decode job record: {0}")]
    Decode(String),
}

/// Durable store of generation job records. Source of truth for job status.
///
/// Status writes are conditional: `mark_completed` applies only to a
/// `processing` record and `mark_failed` only to a non-terminal one. The
/// returned `bool` says whether this call performed the transition, which is
/// what callers use to claim the right to refund.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn probe_schema(&self) -> Result<SchemaSupport, RecordError>;

    async fn create(&self, job: &VideoJob) -> Result<(), RecordError>;

    async fn get(&self, job_id: JobId) -> Result<Option<VideoJob>, RecordError>;

    async fn count_by_status_for_user(
        &self,
        user_id: UserId,
        status: JobStatus,
    ) -> Result<usize, RecordError>;

    /// Oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoJob>, RecordError>;

    async fn list_for_user_by_status(
        &self,
        user_id: UserId,
        status: JobStatus,
    ) -> Result<Vec<VideoJob>, RecordError>;

    /// `processing` records whose processing start is before `cutoff`.
    async fn list_processing_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<VideoJob>, RecordError>;

    async fn mark_processing(&self, job_id: JobId, at: DateTime<Utc>) -> Result<bool, RecordError>;

    async fn mark_completed(
        &self,
        job_id: JobId,
        artifact_url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RecordError>;

    async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RecordError>;

    async fn set_provider_job_id(
        &self,
        job_id: JobId,
        provider_job_id: &str,
    ) -> Result<(), RecordError>;

    async fn set_queue_position(
        &self,
        job_id: JobId,
        position: Option<u32>,
    ) -> Result<(), RecordError>;

    /// Replace title/description only while the stored metadata status is still
    /// `expected`. Returns whether the write was applied.
    async fn update_metadata_if(
        &self,
        job_id: JobId,
        expected: MetadataStatus,
        metadata: &GeneratedMetadata,
        new_status: MetadataStatus,
    ) -> Result<bool, RecordError>;

    async fn metadata_status(&self, job_id: JobId) -> Result<Option<MetadataStatus>, RecordError>;
}

/// Metadata writes may only stay put or move towards `AiGenerated`.
pub(crate) fn check_metadata_transition(
    expected: MetadataStatus,
    new_status: MetadataStatus,
) -> Result<(), RecordError> {
    if expected == new_status || expected.can_upgrade_to(new_status) {
        Ok(())
    } else {
        Err(RecordError::InvalidUpdate(format!(
            "metadata status cannot move from {expected} to {new_status}"
        )))
    }
}
