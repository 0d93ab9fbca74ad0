//! Durable generation job record and its lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};

/// Lifecycle status of a generation job.
///
/// `Pending -> Processing -> Completed | Failed`. A pending job may also fail
/// directly (e.g. render kickoff failure). Terminal jobs are never reopened.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::unknown("job status", other)),
        }
    }
}

/// Provenance of a job's title/description.
///
/// Only `AiGenerated` is final; the other two may be upgraded to it, never
/// the other way around.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    AiGenerated,
    TimeoutDefault,
    ErrorFallback,
}

impl MetadataStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, MetadataStatus::AiGenerated)
    }

    pub fn can_upgrade_to(&self, next: MetadataStatus) -> bool {
        !self.is_final() && next == MetadataStatus::AiGenerated
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::AiGenerated => "ai_generated",
            MetadataStatus::TimeoutDefault => "timeout_default",
            MetadataStatus::ErrorFallback => "error_fallback",
        }
    }
}

impl core::fmt::Display for MetadataStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_generated" => Ok(MetadataStatus::AiGenerated),
            "timeout_default" => Ok(MetadataStatus::TimeoutDefault),
            "error_fallback" => Ok(MetadataStatus::ErrorFallback),
            other => Err(DomainError::unknown("metadata status", other)),
        }
    }
}

/// Durable job record, owned by the record store and mirrored partially in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJob {
    pub id: JobId,
    pub user_id: UserId,
    pub status: JobStatus,
    pub credits_charged: u32,
    pub provider_job_id: Option<String>,
    pub template_name: String,
    pub prompt: String,
    pub parameters: Map<String, JsonValue>,
    /// Higher runs first when queued.
    pub priority: i32,
    /// 1-based position while queued; `None` once admitted.
    pub queue_position: Option<u32>,
    pub locale: String,
    pub title: String,
    pub description: String,
    pub metadata_status: MetadataStatus,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
}

impl VideoJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent in `processing`, measured from `processing_started_at`
    /// (falling back to `created_at` for records that never stored it).
    pub fn processing_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status != JobStatus::Processing {
            return None;
        }
        let started = self.processing_started_at.unwrap_or(self.created_at);
        Some(now - started)
    }

    /// A zombie is a `processing` job older than `timeout`.
    pub fn is_zombie(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.processing_age(now).is_some_and(|age| age > timeout)
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_processing(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.processing_started_at = Some(at);
        self.queue_position = None;
        Ok(())
    }

    /// `artifact_url` of `None` keeps whatever URL was stored before.
    pub fn mark_completed(&mut self, artifact_url: Option<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        if artifact_url.is_some() {
            self.result_url = artifact_url;
        }
        self.processing_completed_at = Some(at);
        self.queue_position = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.processing_completed_at = Some(at);
        self.queue_position = None;
        Ok(())
    }
}

/// Input for creating a `pending` record.
#[derive(Debug, Clone)]
pub struct NewVideoJob {
    pub id: JobId,
    pub user_id: UserId,
    pub credits_charged: u32,
    pub template_name: String,
    pub prompt: String,
    pub parameters: Map<String, JsonValue>,
    pub priority: i32,
    pub locale: String,
    pub title: String,
    pub description: String,
    pub metadata_status: MetadataStatus,
}

impl NewVideoJob {
    pub fn into_record(self, created_at: DateTime<Utc>) -> VideoJob {
        VideoJob {
            id: self.id,
            user_id: self.user_id,
            status: JobStatus::Pending,
            credits_charged: self.credits_charged,
            provider_job_id: None,
            template_name: self.template_name,
            prompt: self.prompt,
            parameters: self.parameters,
            priority: self.priority,
            queue_position: None,
            locale: self.locale,
            title: self.title,
            description: self.description,
            metadata_status: self.metadata_status,
            result_url: None,
            error_message: None,
            created_at,
            processing_started_at: None,
            processing_completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pending_job() -> VideoJob {
        NewVideoJob {
            id: JobId::new(),
            user_id: UserId::new(),
            credits_charged: 10,
            template_name: "product-showcase".to_string(),
            prompt: "a red sneaker on a rotating pedestal".to_string(),
            parameters: Map::new(),
            priority: 0,
            locale: "en".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            metadata_status: MetadataStatus::TimeoutDefault,
        }
        .into_record(Utc::now())
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut job = pending_job();
        let start = Utc::now();
        job.mark_processing(start).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.processing_started_at, Some(start));

        job.mark_completed(Some("https://cdn.example/v.mp4".to_string()), Utc::now())
            .unwrap();
        assert!(job.is_terminal());
        assert_eq!(job.result_url.as_deref(), Some("https://cdn.example/v.mp4"));
    }

    #[test]
    fn terminal_jobs_are_never_reopened() {
        let mut job = pending_job();
        job.mark_processing(Utc::now()).unwrap();
        job.mark_failed("render error", Utc::now()).unwrap();

        assert!(job.mark_processing(Utc::now()).is_err());
        assert!(job.mark_completed(None, Utc::now()).is_err());
        assert!(job.mark_failed("again", Utc::now()).is_err());
        assert_eq!(job.error_message.as_deref(), Some("render error"));
    }

    #[test]
    fn zombie_detection_uses_processing_start() {
        let mut job = pending_job();
        let now = Utc::now();
        job.mark_processing(now - Duration::minutes(45)).unwrap();

        assert!(job.is_zombie(now, Duration::minutes(30)));
        assert!(!job.is_zombie(now, Duration::minutes(60)));
    }

    #[test]
    fn pending_jobs_are_never_zombies() {
        let job = pending_job();
        assert!(!job.is_zombie(Utc::now() + Duration::hours(5), Duration::minutes(30)));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ["pending", "processing", "completed", "failed"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    fn metadata_status() -> impl Strategy<Value = MetadataStatus> {
        prop_oneof![
            Just(MetadataStatus::AiGenerated),
            Just(MetadataStatus::TimeoutDefault),
            Just(MetadataStatus::ErrorFallback),
        ]
    }

    proptest! {
        #[test]
        fn metadata_upgrades_only_move_towards_ai_generated(from in metadata_status(), to in metadata_status()) {
            if from.can_upgrade_to(to) {
                prop_assert!(!from.is_final());
                prop_assert_eq!(to, MetadataStatus::AiGenerated);
            }
            if from.is_final() {
                prop_assert!(!from.can_upgrade_to(to));
            }
        }
    }
}
