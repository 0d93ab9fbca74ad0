//! Submission and queue draining.
//!
//! `submit` is the only entry point that can be refused. Once credits are
//! debited every later failure ends in either a refund or a job that the
//! drain loop will pick up again.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use reelgen_ai::MetadataRequest;
use reelgen_core::{JobId, JobStatus, NewVideoJob, Tier, UserId, VideoJob};

use crate::guard::ConcurrencyGuard;
use crate::jobs::{estimate_wait_minutes, ActiveEntry, Admission, JobStore, QueueEntry};
use crate::ledger::{CreditLedger, CreditReason};
use crate::metadata::MetadataGenerator;
use crate::reaper::ReaperService;
use crate::records::JobRepository;
use crate::supervisor::RenderSupervisor;
use crate::tiers::TierPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub template_name: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    pub credits_cost: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub ui_locale: Option<String>,
}

impl SubmitRequest {
    fn validate(&self) -> Result<(), SubmitError> {
        if self.template_name.trim().is_empty() {
            return Err(SubmitError::InvalidRequest("template_name is required".to_string()));
        }
        if self.prompt.trim().is_empty() {
            return Err(SubmitError::InvalidRequest("prompt is required".to_string()));
        }
        if self.credits_cost == 0 {
            return Err(SubmitError::InvalidRequest("credits_cost must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Processing,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResult {
    pub status: SubmitStatus,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_minutes: Option<u32>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{reason}")]
    ConcurrencyLimit {
        reason: String,
        active_count: usize,
        max_allowed: u32,
    },
    #[error("insufficient credits: {required} required")]
    InsufficientCredits { required: u32 },
    #[error("credit ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("credit debit failed: {0}")]
    DebitFailed(String),
    #[error("job could not be created: {0}")]
    PersistenceFailed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub system_max_concurrent: usize,
    pub average_processing_minutes: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            system_max_concurrent: 5,
            average_processing_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another drain was already running.
    pub skipped: bool,
    pub promoted: Vec<JobId>,
    /// Entries left queued because their user is at the limit or the start failed.
    pub deferred: usize,
    /// Entries dropped because their record is gone or no longer pending.
    pub dropped: Vec<JobId>,
    pub remaining: usize,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedJobView {
    pub job_id: JobId,
    pub position: usize,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub estimated_wait_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserQueueStatus {
    pub user_id: UserId,
    pub tier: Tier,
    pub active_count: usize,
    pub max_allowed: u32,
    pub queued_jobs: Vec<QueuedJobView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub system_max_concurrent: usize,
    pub active_count: usize,
    pub queued_count: usize,
    pub available_slots: usize,
    pub active: Vec<ActiveEntry>,
    pub queued: Vec<QueueEntry>,
    pub last_reaper_scan: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOutcome {
    Started,
    /// The record left `pending` before it could be claimed.
    Gone,
    /// The durable transition failed; the job should be queued again.
    Deferred,
}

pub struct Scheduler {
    store: Arc<JobStore>,
    records: Arc<dyn JobRepository>,
    ledger: Arc<dyn CreditLedger>,
    tiers: Arc<TierPolicy>,
    guard: Arc<ConcurrencyGuard>,
    metadata: Arc<MetadataGenerator>,
    supervisor: Arc<RenderSupervisor>,
    reaper: Arc<ReaperService>,
    settings: SchedulerSettings,
    draining: tokio::sync::Mutex<()>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        records: Arc<dyn JobRepository>,
        ledger: Arc<dyn CreditLedger>,
        tiers: Arc<TierPolicy>,
        guard: Arc<ConcurrencyGuard>,
        metadata: Arc<MetadataGenerator>,
        supervisor: Arc<RenderSupervisor>,
        reaper: Arc<ReaperService>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            records,
            ledger,
            tiers,
            guard,
            metadata,
            supervisor,
            reaper,
            settings,
            draining: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.settings
    }

    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, template = %request.template_name),
        err
    )]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResult, SubmitError> {
        request.validate()?;
        let user_id = request.user_id;

        let check = self.guard.check_user(user_id).await;
        if !check.can_submit {
            return Err(SubmitError::ConcurrencyLimit {
                reason: check.reason.unwrap_or_default(),
                active_count: check.active_count,
                max_allowed: check.max_allowed,
            });
        }

        match self.ledger.has_enough(user_id, request.credits_cost).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(SubmitError::InsufficientCredits {
                    required: request.credits_cost,
                });
            }
            Err(e) => return Err(SubmitError::LedgerUnavailable(e.to_string())),
        }

        let job_id = JobId::new();
        let receipt = self
            .ledger
            .debit(
                user_id,
                request.credits_cost,
                CreditReason::VideoGeneration,
                Some(job_id),
            )
            .await
            .map_err(|e| SubmitError::DebitFailed(e.to_string()))?;
        if !receipt.success {
            return Err(SubmitError::InsufficientCredits {
                required: request.credits_cost,
            });
        }

        let locale = self
            .tiers
            .locale(user_id, request.ui_locale.as_deref())
            .await;
        let metadata_request = MetadataRequest::new(
            request.template_name.as_str(),
            request.prompt.as_str(),
            locale.as_str(),
        )
        .with_parameters(request.parameters.clone());
        let outcome = self.metadata.generate(&metadata_request).await;

        let job = NewVideoJob {
            id: job_id,
            user_id,
            credits_charged: request.credits_cost,
            template_name: request.template_name,
            prompt: request.prompt,
            parameters: request.parameters,
            priority: request.priority,
            locale,
            title: outcome.metadata.title.clone(),
            description: outcome.metadata.description.clone(),
            metadata_status: outcome.status,
        }
        .into_record(Utc::now());

        if let Err(e) = self.records.create(&job).await {
            error!(%job_id, error = %e, "job record creation failed; refunding");
            let cause = format!("Job creation failed: {e}");
            if let Err(refund) = self
                .ledger
                .credit(
                    user_id,
                    job.credits_charged,
                    CreditReason::JobCreationFailed,
                    Some(job_id),
                    &cause,
                )
                .await
            {
                error!(%job_id, error = %refund, "refund after failed creation did not go through");
            }
            return Err(SubmitError::PersistenceFailed(e.to_string()));
        }

        // Background metadata work is detached; it only writes conditionally.
        let _ = self.metadata.follow_up(job_id, outcome, metadata_request);

        Ok(self.admit_or_queue(job).await)
    }

    async fn admit_or_queue(&self, job: VideoJob) -> SubmitResult {
        let job_id = job.id;
        let (_, user_limit) = self.tiers.limit_for_user(job.user_id).await;
        let admission = self.store.try_admit(
            job_id,
            job.user_id,
            user_limit,
            self.settings.system_max_concurrent,
        );

        let entry = QueueEntry::new(job_id, job.user_id, job.priority, job.created_at);
        if admission == Admission::Admitted {
            // A job finalized before it could start is still reported as accepted.
            if self.start_processing(job).await != StartOutcome::Deferred {
                return SubmitResult {
                    status: SubmitStatus::Processing,
                    job_id,
                    queue_position: None,
                    estimated_wait_minutes: None,
                };
            }
        } else {
            debug!(%job_id, ?admission, "no capacity; queueing");
        }
        self.queue(entry).await
    }

    async fn queue(&self, entry: QueueEntry) -> SubmitResult {
        let job_id = entry.job_id;
        let position = self.store.enqueue(entry);
        self.persist_position(job_id, Some(position)).await;
        let estimated = estimate_wait_minutes(
            position,
            self.settings.average_processing_minutes,
            self.settings.system_max_concurrent,
        );
        info!(%job_id, position, estimated_wait_minutes = estimated, "job queued");
        SubmitResult {
            status: SubmitStatus::Queued,
            job_id,
            queue_position: Some(position),
            estimated_wait_minutes: Some(estimated),
        }
    }

    /// Move an admitted job to `processing` and hand it to the supervisor.
    ///
    /// The caller has already placed the job in the active set.
    async fn start_processing(&self, mut job: VideoJob) -> StartOutcome {
        let now = Utc::now();
        match self.records.mark_processing(job.id, now).await {
            Ok(true) => {
                job.status = JobStatus::Processing;
                job.processing_started_at = Some(now);
                job.queue_position = None;
                info!(job_id = %job.id, user_id = %job.user_id, "job processing");
                let _ = self.supervisor.launch(job);
                StartOutcome::Started
            }
            Ok(false) => {
                warn!(job_id = %job.id, "record no longer pending; releasing slot");
                self.store.remove_active(job.id);
                StartOutcome::Gone
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not mark job processing; requeueing");
                self.store.remove_active(job.id);
                StartOutcome::Deferred
            }
        }
    }

    /// Promote queued jobs while capacity remains.
    ///
    /// Single-flight: a call made while another drain runs returns a skipped
    /// report immediately.
    #[instrument(skip(self))]
    pub async fn process_queue(&self) -> DrainReport {
        let Ok(_draining) = self.draining.try_lock() else {
            return DrainReport::skipped();
        };
        let system_max = self.settings.system_max_concurrent;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<UserId> = HashSet::new();

        for candidate in self.store.sorted_queue() {
            if self.store.available_slots(system_max) == 0 {
                break;
            }
            if blocked.contains(&candidate.user_id) {
                report.deferred += 1;
                continue;
            }
            let check = self.guard.check_user(candidate.user_id).await;
            if !check.can_submit {
                blocked.insert(candidate.user_id);
                report.deferred += 1;
                continue;
            }

            let Some(entry) = self.store.dequeue(candidate.job_id) else {
                continue;
            };
            match self
                .store
                .try_admit(entry.job_id, entry.user_id, check.max_allowed, system_max)
            {
                Admission::Admitted => {}
                Admission::SystemFull => {
                    self.store.requeue(entry);
                    break;
                }
                Admission::UserAtLimit => {
                    blocked.insert(entry.user_id);
                    self.store.requeue(entry);
                    report.deferred += 1;
                    continue;
                }
            }

            match self.records.get(entry.job_id).await {
                Ok(Some(job)) if job.status == JobStatus::Pending => {
                    match self.start_processing(job).await {
                        StartOutcome::Started => report.promoted.push(entry.job_id),
                        StartOutcome::Gone => report.dropped.push(entry.job_id),
                        StartOutcome::Deferred => {
                            self.store.requeue(entry);
                            report.deferred += 1;
                        }
                    }
                }
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, status = %job.status, "queued job no longer pending");
                    self.store.remove_active(entry.job_id);
                    report.dropped.push(entry.job_id);
                }
                Ok(None) => {
                    warn!(job_id = %entry.job_id, "queued job has no record; dropping");
                    self.store.remove_active(entry.job_id);
                    report.dropped.push(entry.job_id);
                }
                Err(e) => {
                    warn!(job_id = %entry.job_id, error = %e, "could not load queued job");
                    self.store.remove_active(entry.job_id);
                    self.store.requeue(entry);
                    report.deferred += 1;
                }
            }
        }

        if !report.promoted.is_empty() || !report.dropped.is_empty() {
            self.persist_queue_positions().await;
        }
        report.remaining = self.store.queued_len();
        if !report.promoted.is_empty() {
            info!(
                promoted = report.promoted.len(),
                remaining = report.remaining,
                "queue drained"
            );
        }
        report
    }

    async fn persist_queue_positions(&self) {
        for (index, entry) in self.store.sorted_queue().into_iter().enumerate() {
            self.persist_position(entry.job_id, Some(index + 1)).await;
        }
    }

    async fn persist_position(&self, job_id: JobId, position: Option<usize>) {
        let position = position.map(|p| u32::try_from(p).unwrap_or(u32::MAX));
        if let Err(e) = self.records.set_queue_position(job_id, position).await {
            debug!(%job_id, error = %e, "queue position not persisted");
        }
    }

    pub async fn get_user_queue_status(&self, user_id: UserId) -> UserQueueStatus {
        let check = self.guard.check_user(user_id).await;
        let queued_jobs = self
            .store
            .queued_for_user(user_id)
            .into_iter()
            .map(|(position, entry)| QueuedJobView {
                job_id: entry.job_id,
                position,
                priority: entry.priority,
                enqueued_at: entry.enqueued_at,
                estimated_wait_minutes: estimate_wait_minutes(
                    position,
                    self.settings.average_processing_minutes,
                    self.settings.system_max_concurrent,
                ),
            })
            .collect();

        UserQueueStatus {
            user_id,
            tier: check.tier,
            active_count: check.active_count,
            max_allowed: check.max_allowed,
            queued_jobs,
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        let active = self.store.active_entries();
        let queued = self.store.sorted_queue();
        let system_max = self.settings.system_max_concurrent;
        SystemStatus {
            system_max_concurrent: system_max,
            active_count: active.len(),
            queued_count: queued.len(),
            available_slots: system_max.saturating_sub(active.len()),
            active,
            queued,
            last_reaper_scan: self.reaper.last_scan_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{DrainTrigger, LifecycleHandler};
    use crate::ledger::InMemoryCreditLedger;
    use crate::metadata::MetadataConfig;
    use crate::reaper::ReaperConfig;
    use crate::records::InMemoryJobRepository;
    use crate::render::InMemoryRenderProvider;
    use crate::tiers::{InMemoryTierCache, InMemoryTierDirectory};
    use reelgen_ai::InMemoryTextGenerator;
    use reelgen_core::TierLimits;
    use std::time::Duration;

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<JobStore>,
        records: Arc<InMemoryJobRepository>,
        ledger: Arc<InMemoryCreditLedger>,
        directory: Arc<InMemoryTierDirectory>,
        provider: Arc<InMemoryRenderProvider>,
        lifecycle: Arc<LifecycleHandler>,
    }

    fn fixture(system_max: usize) -> Fixture {
        let store = Arc::new(JobStore::new());
        let records = Arc::new(InMemoryJobRepository::new());
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let directory = Arc::new(InMemoryTierDirectory::new());
        let provider = Arc::new(InMemoryRenderProvider::new());
        let tiers = Arc::new(TierPolicy::new(
            directory.clone(),
            Arc::new(InMemoryTierCache::new()),
            TierLimits::default(),
            Duration::from_secs(300),
            "en",
        ));
        let (drain, _rx) = DrainTrigger::channel();
        let lifecycle = Arc::new(LifecycleHandler::new(
            store.clone(),
            records.clone(),
            ledger.clone(),
            tiers.clone(),
            drain,
            Duration::from_secs(1),
        ));
        let reaper = Arc::new(ReaperService::new(
            store.clone(),
            records.clone(),
            ledger.clone(),
            tiers.clone(),
            ReaperConfig::default(),
        ));
        let guard = Arc::new(ConcurrencyGuard::new(
            store.clone(),
            records.clone(),
            tiers.clone(),
        ));
        let metadata = Arc::new(MetadataGenerator::new(
            Arc::new(InMemoryTextGenerator::new()),
            records.clone(),
            MetadataConfig::default(),
        ));
        let supervisor = Arc::new(RenderSupervisor::new(
            provider.clone(),
            records.clone(),
            lifecycle.clone(),
            reaper.clone(),
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            records.clone(),
            ledger.clone(),
            tiers,
            guard,
            metadata,
            supervisor,
            reaper,
            SchedulerSettings {
                system_max_concurrent: system_max,
                average_processing_minutes: 5,
            },
        );
        Fixture {
            scheduler,
            store,
            records,
            ledger,
            directory,
            provider,
            lifecycle,
        }
    }

    fn request(user_id: UserId) -> SubmitRequest {
        SubmitRequest {
            user_id,
            template_name: "product-showcase".to_string(),
            prompt: "red sneaker on a marble pedestal".to_string(),
            parameters: Map::new(),
            credits_cost: 10,
            priority: 0,
            ui_locale: None,
        }
    }

    fn funded(f: &Fixture) -> UserId {
        let user = UserId::new();
        f.ledger.set_balance(user, 100);
        user
    }

    #[tokio::test]
    async fn first_job_processes_and_second_queues_at_system_cap() {
        let f = fixture(1);
        let (alice, bob) = (funded(&f), funded(&f));

        let first = f.scheduler.submit(request(alice)).await.unwrap();
        assert_eq!(first.status, SubmitStatus::Processing);

        let second = f.scheduler.submit(request(bob)).await.unwrap();
        assert_eq!(second.status, SubmitStatus::Queued);
        assert_eq!(second.queue_position, Some(1));
        assert_eq!(second.estimated_wait_minutes, Some(5));
        assert_eq!(
            f.records.snapshot(second.job_id).unwrap().queue_position,
            Some(1)
        );

        f.lifecycle
            .complete(first.job_id, Some("memory://a.mp4".to_string()))
            .await;
        let report = f.scheduler.process_queue().await;
        assert_eq!(report.promoted, vec![second.job_id]);
        assert_eq!(
            f.records.snapshot(second.job_id).unwrap().status,
            JobStatus::Processing
        );
        assert!(f.store.is_active(second.job_id));
    }

    #[tokio::test]
    async fn same_user_second_submission_is_refused() {
        let f = fixture(5);
        let user = funded(&f);

        f.scheduler.submit(request(user)).await.unwrap();
        let err = f.scheduler.submit(request(user)).await.unwrap_err();
        match err {
            SubmitError::ConcurrencyLimit {
                reason,
                active_count,
                max_allowed,
            } => {
                assert_eq!((active_count, max_allowed), (1, 1));
                assert!(reason.contains("Free plan"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.ledger.balance(user), 90);
    }

    #[tokio::test]
    async fn insufficient_credits_charges_nothing() {
        let f = fixture(5);
        let user = UserId::new();
        f.ledger.set_balance(user, 5);

        assert_eq!(
            f.scheduler.submit(request(user)).await.unwrap_err(),
            SubmitError::InsufficientCredits { required: 10 }
        );
        assert_eq!(f.ledger.balance(user), 5);
        assert!(f.records.all().is_empty());
    }

    #[tokio::test]
    async fn failed_creation_refunds_the_debit() {
        let f = fixture(5);
        let user = funded(&f);
        f.records.fail_creates(true);

        let err = f.scheduler.submit(request(user)).await.unwrap_err();
        assert!(matches!(err, SubmitError::PersistenceFailed(_)));
        assert_eq!(f.ledger.balance(user), 100);
        assert!(f
            .ledger
            .entries()
            .iter()
            .any(|e| e.reason == CreditReason::JobCreationFailed));
        assert_eq!(f.store.active_len(), 0);
    }

    #[tokio::test]
    async fn failed_debit_aborts_before_any_record() {
        let f = fixture(5);
        let user = funded(&f);
        f.ledger.fail_debits(true);

        assert!(matches!(
            f.scheduler.submit(request(user)).await.unwrap_err(),
            SubmitError::DebitFailed(_)
        ));
        assert!(f.records.all().is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_early() {
        let f = fixture(5);
        let mut bad = request(funded(&f));
        bad.prompt = "   ".to_string();
        assert!(matches!(
            f.scheduler.submit(bad).await.unwrap_err(),
            SubmitError::InvalidRequest(_)
        ));
    }

    fn pending_record(f: &Fixture, user_id: UserId, priority: i32) -> VideoJob {
        let job = NewVideoJob {
            id: JobId::new(),
            user_id,
            credits_charged: 10,
            template_name: "promo".to_string(),
            prompt: "restored from a previous run".to_string(),
            parameters: Map::new(),
            priority,
            locale: "en".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            metadata_status: reelgen_core::MetadataStatus::AiGenerated,
        }
        .into_record(Utc::now());
        f.records.insert(job.clone());
        job
    }

    #[tokio::test]
    async fn drain_skips_users_at_their_limit() {
        let f = fixture(2);
        let (busy, idle, waiting) = (funded(&f), funded(&f), funded(&f));

        f.scheduler.submit(request(busy)).await.unwrap();
        let blocked = pending_record(&f, busy, 10);
        f.store
            .enqueue(QueueEntry::new(blocked.id, busy, 10, blocked.created_at));
        let filler = f.scheduler.submit(request(idle)).await.unwrap();
        let queued = f.scheduler.submit(request(waiting)).await.unwrap();
        assert_eq!(queued.queue_position, Some(2));

        f.lifecycle
            .complete(filler.job_id, Some("memory://f.mp4".to_string()))
            .await;
        let report = f.scheduler.process_queue().await;
        assert_eq!(report.promoted, vec![queued.job_id]);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.store.position_of(blocked.id), Some(1));
        assert_eq!(f.records.snapshot(blocked.id).unwrap().queue_position, Some(1));
    }

    #[tokio::test]
    async fn drain_drops_entries_whose_record_moved_on() {
        let f = fixture(1);
        let (alice, bob) = (funded(&f), funded(&f));
        let first = f.scheduler.submit(request(alice)).await.unwrap();
        let queued = f.scheduler.submit(request(bob)).await.unwrap();

        f.records
            .mark_failed(queued.job_id, "failed elsewhere", Utc::now())
            .await
            .unwrap();
        f.lifecycle
            .complete(first.job_id, Some("memory://a.mp4".to_string()))
            .await;

        let report = f.scheduler.process_queue().await;
        assert!(report.promoted.is_empty());
        assert_eq!(report.dropped, vec![queued.job_id]);
        assert_eq!(report.remaining, 0);
        assert_eq!(f.store.active_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_drain_is_skipped() {
        let f = fixture(1);
        let _held = f.scheduler.draining.lock().await;
        assert!(f.scheduler.process_queue().await.skipped);
    }

    #[tokio::test]
    async fn queue_status_lists_positions() {
        let f = fixture(1);
        let (alice, bob) = (funded(&f), funded(&f));
        f.directory.set_tier(bob, Tier::Pro);
        f.scheduler.submit(request(alice)).await.unwrap();
        let a = f.scheduler.submit(request(bob)).await.unwrap();
        let b = f.scheduler.submit(request(bob)).await.unwrap();

        let status = f.scheduler.get_user_queue_status(bob).await;
        assert_eq!(status.tier, Tier::Pro);
        assert_eq!(status.max_allowed, 3);
        assert_eq!(status.active_count, 0);
        let ids: Vec<_> = status.queued_jobs.iter().map(|j| (j.job_id, j.position)).collect();
        assert_eq!(ids, vec![(a.job_id, 1), (b.job_id, 2)]);

        let system = f.scheduler.system_status();
        assert_eq!(system.active_count, 1);
        assert_eq!(system.queued_count, 2);
        assert_eq!(system.available_slots, 0);
    }

    #[tokio::test]
    async fn kickoff_failure_is_refunded() {
        let f = fixture(5);
        let user = funded(&f);
        f.provider.fail_submissions(true);

        let result = f.scheduler.submit(request(user)).await.unwrap();
        assert_eq!(result.status, SubmitStatus::Processing);

        for _ in 0..50 {
            if f.records.snapshot(result.job_id).unwrap().status == JobStatus::Failed {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            f.records.snapshot(result.job_id).unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(f.ledger.balance(user), 100);
        assert!(!f.store.is_active(result.job_id));
    }

    #[tokio::test]
    async fn admission_lost_after_the_guard_queues_instead() {
        let f = fixture(5);
        let user = funded(&f);
        let job = pending_record(&f, user, 0);
        // Another submission took the user's only slot after the guard ran.
        f.store.add_active(JobId::new(), user, Utc::now());

        let result = f.scheduler.admit_or_queue(job.clone()).await;
        assert_eq!(result.status, SubmitStatus::Queued);
        assert_eq!(result.queue_position, Some(1));
        assert_eq!(f.store.active_count_for_user(user), 1);
        assert!(!f.store.is_active(job.id));
        assert!(f.store.contains_queued(job.id));
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn start_failure_requeues_and_keeps_the_charge() {
        let f = fixture(5);
        let user = funded(&f);

        f.records.fail_writes(true);
        let result = f.scheduler.submit(request(user)).await.unwrap();
        assert_eq!(result.status, SubmitStatus::Queued);
        assert_eq!(f.ledger.balance(user), 90);
        assert!(f.store.contains_queued(result.job_id));
        assert!(!f.store.is_active(result.job_id));
        assert_eq!(
            f.records.snapshot(result.job_id).unwrap().status,
            JobStatus::Pending
        );

        f.records.fail_writes(false);
        let report = f.scheduler.process_queue().await;
        assert_eq!(report.promoted, vec![result.job_id]);
        assert_eq!(
            f.records.snapshot(result.job_id).unwrap().status,
            JobStatus::Processing
        );
        assert!(f.store.is_active(result.job_id));
        assert_eq!(f.ledger.balance(user), 90);
    }
}
