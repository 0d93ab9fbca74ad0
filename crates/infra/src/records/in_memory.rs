use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use reelgen_ai::GeneratedMetadata;
use reelgen_core::{JobId, JobStatus, MetadataStatus, UserId, VideoJob};

use super::r#trait::{JobRepository, RecordError, SchemaSupport, check_metadata_transition};

/// In-memory job records for tests/dev.
///
/// Failure switches let tests simulate an unavailable store per operation class.
#[derive(Debug)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, VideoJob>>,
    schema: RwLock<SchemaSupport>,
    fail_creates: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            schema: RwLock::new(SchemaSupport::Full),
            fail_creates: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing `create` checks.
    pub fn insert(&self, job: VideoJob) {
        self.jobs_mut().insert(job.id, job);
    }

    pub fn snapshot(&self, job_id: JobId) -> Option<VideoJob> {
        self.jobs().get(&job_id).cloned()
    }

    pub fn all(&self) -> Vec<VideoJob> {
        let mut jobs: Vec<VideoJob> = self.jobs().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn set_schema(&self, support: SchemaSupport) {
        *self.schema.write().unwrap_or_else(PoisonError::into_inner) = support;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, VideoJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_mut(&self) -> RwLockWriteGuard<'_, HashMap<JobId, VideoJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> Result<(), RecordError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RecordError::Unavailable(format!("{operation}: injected failure")));
        }
        Ok(())
    }

    fn list_where(&self, predicate: impl Fn(&VideoJob) -> bool) -> Vec<VideoJob> {
        let mut jobs: Vec<VideoJob> = self.jobs().values().filter(|j| predicate(j)).cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn probe_schema(&self) -> Result<SchemaSupport, RecordError> {
        self.check(&self.fail_reads, "probe_schema")?;
        Ok(self.schema.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn create(&self, job: &VideoJob) -> Result<(), RecordError> {
        self.check(&self.fail_creates, "create")?;
        let mut jobs = self.jobs_mut();
        if jobs.contains_key(&job.id) {
            return Err(RecordError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<VideoJob>, RecordError> {
        self.check(&self.fail_reads, "get")?;
        Ok(self.jobs().get(&job_id).cloned())
    }

    async fn count_by_status_for_user(
        &self,
        user_id: UserId,
        status: JobStatus,
    ) -> Result<usize, RecordError> {
        self.check(&self.fail_reads, "count_by_status_for_user")?;
        Ok(self
            .jobs()
            .values()
            .filter(|j| j.user_id == user_id && j.status == status)
            .count())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoJob>, RecordError> {
        self.check(&self.fail_reads, "list_by_status")?;
        Ok(self.list_where(|j| j.status == status))
    }

    async fn list_for_user_by_status(
        &self,
        user_id: UserId,
        status: JobStatus,
    ) -> Result<Vec<VideoJob>, RecordError> {
        self.check(&self.fail_reads, "list_for_user_by_status")?;
        Ok(self.list_where(|j| j.user_id == user_id && j.status == status))
    }

    async fn list_processing_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<VideoJob>, RecordError> {
        self.check(&self.fail_reads, "list_processing_started_before")?;
        Ok(self.list_where(|j| {
            j.status == JobStatus::Processing
                && j.processing_started_at.unwrap_or(j.created_at) < cutoff
        }))
    }

    async fn mark_processing(&self, job_id: JobId, at: DateTime<Utc>) -> Result<bool, RecordError> {
        self.check(&self.fail_writes, "mark_processing")?;
        let mut jobs = self.jobs_mut();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.mark_processing(at)
                    .map_err(|e| RecordError::InvalidUpdate(e.to_string()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(
        &self,
        job_id: JobId,
        artifact_url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RecordError> {
        self.check(&self.fail_writes, "mark_completed")?;
        let mut jobs = self.jobs_mut();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.mark_completed(artifact_url.map(str::to_string), at)
                    .map_err(|e| RecordError::InvalidUpdate(e.to_string()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RecordError> {
        self.check(&self.fail_writes, "mark_failed")?;
        let mut jobs = self.jobs_mut();
        match jobs.get_mut(&job_id) {
            Some(job) if !job.is_terminal() => {
                job.mark_failed(message, at)
                    .map_err(|e| RecordError::InvalidUpdate(e.to_string()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_provider_job_id(
        &self,
        job_id: JobId,
        provider_job_id: &str,
    ) -> Result<(), RecordError> {
        self.check(&self.fail_writes, "set_provider_job_id")?;
        if let Some(job) = self.jobs_mut().get_mut(&job_id) {
            job.provider_job_id = Some(provider_job_id.to_string());
        }
        Ok(())
    }

    async fn set_queue_position(
        &self,
        job_id: JobId,
        position: Option<u32>,
    ) -> Result<(), RecordError> {
        self.check(&self.fail_writes, "set_queue_position")?;
        if let Some(job) = self.jobs_mut().get_mut(&job_id) {
            if job.status == JobStatus::Pending {
                job.queue_position = position;
            }
        }
        Ok(())
    }

    async fn update_metadata_if(
        &self,
        job_id: JobId,
        expected: MetadataStatus,
        metadata: &GeneratedMetadata,
        new_status: MetadataStatus,
    ) -> Result<bool, RecordError> {
        check_metadata_transition(expected, new_status)?;
        self.check(&self.fail_writes, "update_metadata_if")?;
        let mut jobs = self.jobs_mut();
        match jobs.get_mut(&job_id) {
            Some(job) if job.metadata_status == expected => {
                job.title = metadata.title.clone();
                job.description = metadata.description.clone();
                job.metadata_status = new_status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn metadata_status(&self, job_id: JobId) -> Result<Option<MetadataStatus>, RecordError> {
        self.check(&self.fail_reads, "metadata_status")?;
        Ok(self.jobs().get(&job_id).map(|j| j.metadata_status))
    }
}
