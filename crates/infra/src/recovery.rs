//! Startup restoration of in-memory state from durable records.
//!
//! Runs once before the drain loop starts. Processing jobs are either reaped,
//! reattached to their render, or parked behind a delayed re-check; pending
//! jobs that carried a queue position are queued again in that order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use reelgen_core::{JobId, JobStatus, VideoJob};

use crate::jobs::{JobStore, QueueEntry};
use crate::lifecycle::LifecycleHandler;
use crate::reaper::ReaperService;
use crate::records::{JobRepository, SchemaSupport};
use crate::supervisor::RenderSupervisor;

const LOST_AFTER_RESTART: &str = "Render status was lost after a restart";

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub recheck_delay: Duration,
    /// Measured from the start of recovery, not from the re-check.
    pub final_cleanup_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recheck_delay: Duration::from_secs(30),
            final_cleanup_delay: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RecoveryMode {
    Restored,
    /// Storage lacks the scheduler's columns; started with empty state.
    Fallback { missing: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub mode: RecoveryMode,
    pub restored_active: usize,
    pub reaped: usize,
    pub resubscribed: usize,
    pub deferred_rechecks: usize,
    pub restored_queued: usize,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    fn new(mode: RecoveryMode) -> Self {
        Self {
            mode,
            restored_active: 0,
            reaped: 0,
            resubscribed: 0,
            deferred_rechecks: 0,
            restored_queued: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecheckOutcome {
    /// The render finished while the process was down.
    Completed,
    /// The record was already failed or gone; memory released.
    Released,
    Resubscribed,
    FailedAfterRestart,
    /// Storage could not be read; left to the reaper.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    MissingRecord,
    TerminalButActive,
    NotProcessingButActive,
    NotPendingButQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inconsistency {
    pub job_id: JobId,
    pub kind: InconsistencyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub inconsistencies: Vec<Inconsistency>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

pub struct Recovery {
    store: Arc<JobStore>,
    records: Arc<dyn JobRepository>,
    reaper: Arc<ReaperService>,
    supervisor: Arc<RenderSupervisor>,
    lifecycle: Arc<LifecycleHandler>,
    config: RecoveryConfig,
    rechecks: Mutex<Vec<JoinHandle<RecheckOutcome>>>,
}

impl Recovery {
    pub fn new(
        store: Arc<JobStore>,
        records: Arc<dyn JobRepository>,
        reaper: Arc<ReaperService>,
        supervisor: Arc<RenderSupervisor>,
        lifecycle: Arc<LifecycleHandler>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            records,
            reaper,
            supervisor,
            lifecycle,
            config,
            rechecks: Mutex::new(Vec::new()),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(self: &Arc<Self>) -> RecoveryReport {
        match self.records.probe_schema().await {
            Ok(SchemaSupport::Full) => {}
            Ok(SchemaSupport::Missing(missing)) => {
                warn!(?missing, "job storage lacks scheduler columns; starting without restored state");
                return RecoveryReport::new(RecoveryMode::Fallback { missing });
            }
            Err(e) => {
                warn!(error = %e, "schema probe failed; starting without restored state");
                let mut report = RecoveryReport::new(RecoveryMode::Fallback { missing: Vec::new() });
                report.errors.push(e.to_string());
                return report;
            }
        }

        let mut report = RecoveryReport::new(RecoveryMode::Restored);
        self.restore_processing(&mut report).await;
        self.restore_queue(&mut report).await;

        info!(
            restored_active = report.restored_active,
            reaped = report.reaped,
            resubscribed = report.resubscribed,
            deferred_rechecks = report.deferred_rechecks,
            restored_queued = report.restored_queued,
            "recovery finished"
        );
        report
    }

    async fn restore_processing(self: &Arc<Self>, report: &mut RecoveryReport) {
        let processing = match self.records.list_by_status(JobStatus::Processing).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "could not load processing jobs");
                report.errors.push(e.to_string());
                return;
            }
        };

        let now = Utc::now();
        for job in processing {
            if self.reaper.is_zombie(&job, now) {
                self.reaper.handle_zombie(job.id, job.user_id).await;
                report.reaped += 1;
                continue;
            }

            let started_at = job.processing_started_at.unwrap_or(job.created_at);
            self.store.add_active(job.id, job.user_id, started_at);
            report.restored_active += 1;

            let elapsed = (now - started_at).to_std().unwrap_or_default();
            let remaining = self.reaper.zombie_timeout().saturating_sub(elapsed);
            let resumed = match job.provider_job_id.as_deref() {
                Some(provider_job_id) => {
                    self.supervisor
                        .resume(job.id, job.user_id, provider_job_id, remaining)
                        .await
                }
                None => false,
            };
            if resumed {
                report.resubscribed += 1;
            } else {
                debug!(job_id = %job.id, "render not reattached; scheduling re-check");
                self.schedule_recheck(job);
                report.deferred_rechecks += 1;
            }
        }
    }

    async fn restore_queue(&self, report: &mut RecoveryReport) {
        let mut pending: Vec<VideoJob> = match self.records.list_by_status(JobStatus::Pending).await {
            Ok(jobs) => jobs
                .into_iter()
                .filter(|j| j.queue_position.is_some())
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not load queued jobs");
                report.errors.push(e.to_string());
                return;
            }
        };
        pending.sort_by_key(|j| (j.queue_position, j.created_at));

        for job in pending {
            self.store
                .enqueue(QueueEntry::new(job.id, job.user_id, job.priority, job.created_at));
            report.restored_queued += 1;
        }
    }

    fn schedule_recheck(self: &Arc<Self>, job: VideoJob) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.recheck(job).await });
        self.rechecks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    async fn recheck(&self, job: VideoJob) -> RecheckOutcome {
        tokio::time::sleep(self.config.recheck_delay).await;
        match self.settle(&job).await {
            Some(outcome) => return outcome,
            None => {
                if let Some(provider_job_id) = job.provider_job_id.as_deref() {
                    let elapsed = Utc::now() - job.processing_started_at.unwrap_or(job.created_at);
                    let remaining = self
                        .reaper
                        .zombie_timeout()
                        .saturating_sub(elapsed.to_std().unwrap_or_default());
                    if self
                        .supervisor
                        .resume(job.id, job.user_id, provider_job_id, remaining)
                        .await
                    {
                        return RecheckOutcome::Resubscribed;
                    }
                }
            }
        }

        tokio::time::sleep(
            self.config
                .final_cleanup_delay
                .saturating_sub(self.config.recheck_delay),
        )
        .await;
        match self.settle(&job).await {
            Some(outcome) => outcome,
            None => {
                warn!(job_id = %job.id, "render never reported after restart; failing job");
                self.lifecycle.fail(job.id, LOST_AFTER_RESTART).await;
                RecheckOutcome::FailedAfterRestart
            }
        }
    }

    /// Resolve a re-checked job from its current record. `None` means it is
    /// still `processing`.
    async fn settle(&self, job: &VideoJob) -> Option<RecheckOutcome> {
        match self.records.get(job.id).await {
            Ok(Some(record)) => match record.status {
                JobStatus::Processing => None,
                JobStatus::Completed => {
                    self.lifecycle.complete(job.id, None).await;
                    Some(RecheckOutcome::Completed)
                }
                JobStatus::Failed => {
                    self.lifecycle.fail(job.id, LOST_AFTER_RESTART).await;
                    Some(RecheckOutcome::Released)
                }
                JobStatus::Pending => {
                    self.store.remove_active(job.id);
                    Some(RecheckOutcome::Released)
                }
            },
            Ok(None) => {
                self.store.remove_active(job.id);
                Some(RecheckOutcome::Released)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "re-check could not read job");
                Some(RecheckOutcome::Unresolved)
            }
        }
    }

    /// Await every re-check scheduled so far.
    pub async fn join_rechecks(&self) -> Vec<RecheckOutcome> {
        let handles: Vec<_> = self
            .rechecks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "re-check task did not finish"),
            }
        }
        outcomes
    }

    /// Compare in-memory state with storage. Reports only; changes nothing.
    pub async fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        for entry in self.store.active_entries() {
            report.checked += 1;
            match self.records.get(entry.job_id).await {
                Ok(Some(record)) if record.is_terminal() => report.inconsistencies.push(Inconsistency {
                    job_id: entry.job_id,
                    kind: InconsistencyKind::TerminalButActive,
                    status: Some(record.status),
                }),
                Ok(Some(record)) if record.status != JobStatus::Processing => {
                    report.inconsistencies.push(Inconsistency {
                        job_id: entry.job_id,
                        kind: InconsistencyKind::NotProcessingButActive,
                        status: Some(record.status),
                    })
                }
                Ok(Some(_)) => {}
                Ok(None) => report.inconsistencies.push(Inconsistency {
                    job_id: entry.job_id,
                    kind: InconsistencyKind::MissingRecord,
                    status: None,
                }),
                Err(e) => report.errors.push(format!("{}: {e}", entry.job_id)),
            }
        }

        for entry in self.store.sorted_queue() {
            report.checked += 1;
            match self.records.get(entry.job_id).await {
                Ok(Some(record)) if record.status != JobStatus::Pending => {
                    report.inconsistencies.push(Inconsistency {
                        job_id: entry.job_id,
                        kind: InconsistencyKind::NotPendingButQueued,
                        status: Some(record.status),
                    })
                }
                Ok(Some(_)) => {}
                Ok(None) => report.inconsistencies.push(Inconsistency {
                    job_id: entry.job_id,
                    kind: InconsistencyKind::MissingRecord,
                    status: None,
                }),
                Err(e) => report.errors.push(format!("{}: {e}", entry.job_id)),
            }
        }

        if !report.is_consistent() {
            warn!(count = report.inconsistencies.len(), "in-memory state disagrees with storage");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryCreditLedger;
    use crate::lifecycle::DrainTrigger;
    use crate::reaper::ReaperConfig;
    use crate::records::InMemoryJobRepository;
    use crate::render::{InMemoryRenderProvider, RenderUpdate};
    use crate::tiers::{InMemoryTierCache, InMemoryTierDirectory, TierPolicy};
    use reelgen_core::{MetadataStatus, NewVideoJob, TierLimits, UserId};
    use serde_json::Map;

    struct Fixture {
        recovery: Arc<Recovery>,
        store: Arc<JobStore>,
        records: Arc<InMemoryJobRepository>,
        ledger: Arc<InMemoryCreditLedger>,
        provider: Arc<InMemoryRenderProvider>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(JobStore::new());
        let records = Arc::new(InMemoryJobRepository::new());
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let provider = Arc::new(InMemoryRenderProvider::new());
        let tiers = Arc::new(TierPolicy::new(
            Arc::new(InMemoryTierDirectory::new()),
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
            tiers,
            ReaperConfig::default(),
        ));
        let supervisor = Arc::new(RenderSupervisor::new(
            provider.clone(),
            records.clone(),
            lifecycle.clone(),
            reaper.clone(),
        ));
        let recovery = Arc::new(Recovery::new(
            store.clone(),
            records.clone(),
            reaper,
            supervisor,
            lifecycle,
            RecoveryConfig::default(),
        ));
        Fixture {
            recovery,
            store,
            records,
            ledger,
            provider,
        }
    }

    fn record(f: &Fixture, status: JobStatus, minutes_ago: i64) -> VideoJob {
        let created = Utc::now() - chrono::Duration::minutes(minutes_ago);
        let mut job = NewVideoJob {
            id: JobId::new(),
            user_id: UserId::new(),
            credits_charged: 10,
            template_name: "promo".to_string(),
            prompt: "p".to_string(),
            parameters: Map::new(),
            priority: 0,
            locale: "en".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            metadata_status: MetadataStatus::AiGenerated,
        }
        .into_record(created);
        job.status = status;
        if status == JobStatus::Processing {
            job.processing_started_at = Some(created);
        }
        f.records.insert(job.clone());
        job
    }

    #[tokio::test]
    async fn missing_columns_start_empty() {
        let f = fixture();
        record(&f, JobStatus::Processing, 5);
        f.records
            .set_schema(SchemaSupport::Missing(vec!["queue_position".to_string()]));

        let report = f.recovery.run().await;
        assert_eq!(
            report.mode,
            RecoveryMode::Fallback {
                missing: vec!["queue_position".to_string()]
            }
        );
        assert_eq!(f.store.active_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restores_active_reaps_zombies_and_requeues() {
        let f = fixture();
        let mut live = record(&f, JobStatus::Processing, 5);
        live.provider_job_id = Some("render-live".to_string());
        f.records.insert(live.clone());
        f.provider.register_existing("render-live", live.id);

        let zombie = record(&f, JobStatus::Processing, 45);

        let mut second = record(&f, JobStatus::Pending, 3);
        second.queue_position = Some(2);
        f.records.insert(second.clone());
        let mut first = record(&f, JobStatus::Pending, 1);
        first.queue_position = Some(1);
        f.records.insert(first.clone());
        record(&f, JobStatus::Pending, 1);

        let report = f.recovery.run().await;
        assert_eq!(report.mode, RecoveryMode::Restored);
        assert_eq!(report.reaped, 1);
        assert_eq!(report.restored_active, 1);
        assert_eq!(report.resubscribed, 1);
        assert_eq!(report.restored_queued, 2);

        assert!(f.store.is_active(live.id));
        assert!(!f.store.is_active(zombie.id));
        assert_eq!(f.records.snapshot(zombie.id).unwrap().status, JobStatus::Failed);
        assert_eq!(f.ledger.refunded_for(zombie.id), 10);
        let order: Vec<_> = f.store.sorted_queue().iter().map(|e| e.job_id).collect();
        assert_eq!(order, vec![first.id, second.id]);

        // The reattached watcher still finalizes the job.
        f.provider.emit(
            "render-live",
            RenderUpdate::Complete {
                artifact_url: "memory://live.mp4".to_string(),
            },
        );
        for _ in 0..50 {
            if !f.store.is_active(live.id) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.records.snapshot(live.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_releases_jobs_completed_while_down() {
        let f = fixture();
        let job = record(&f, JobStatus::Processing, 2);

        let report = f.recovery.run().await;
        assert_eq!(report.deferred_rechecks, 1);
        assert!(f.store.is_active(job.id));

        f.records
            .mark_completed(job.id, Some("memory://done.mp4"), Utc::now())
            .await
            .unwrap();
        assert_eq!(f.recovery.join_rechecks().await, vec![RecheckOutcome::Completed]);
        assert!(!f.store.is_active(job.id));
        assert_eq!(f.ledger.refunded_for(job.id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_is_failed_after_final_cleanup_delay() {
        let f = fixture();
        let mut job = record(&f, JobStatus::Processing, 2);
        job.provider_job_id = Some("render-forgotten".to_string());
        f.records.insert(job.clone());

        let started = tokio::time::Instant::now();
        f.recovery.run().await;
        assert_eq!(
            f.recovery.join_rechecks().await,
            vec![RecheckOutcome::FailedAfterRestart]
        );
        assert!(started.elapsed() >= Duration::from_secs(5 * 60));

        let stored = f.records.snapshot(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(LOST_AFTER_RESTART));
        assert_eq!(f.ledger.refunded_for(job.id), 10);
        assert!(!f.store.is_active(job.id));
    }

    #[tokio::test]
    async fn validate_reports_without_correcting() {
        let f = fixture();
        let done = record(&f, JobStatus::Completed, 1);
        let finished = record(&f, JobStatus::Failed, 1);
        let pending = record(&f, JobStatus::Pending, 1);
        let running = record(&f, JobStatus::Processing, 1);
        let ghost = JobId::new();
        for (id, user) in [
            (done.id, done.user_id),
            (finished.id, finished.user_id),
            (pending.id, pending.user_id),
            (running.id, running.user_id),
            (ghost, UserId::new()),
        ] {
            f.store.add_active(id, user, Utc::now());
        }
        f.store
            .enqueue(QueueEntry::new(done.id, done.user_id, 0, Utc::now()));

        let report = f.recovery.validate().await;
        let kinds: Vec<_> = report.inconsistencies.iter().map(|i| (i.job_id, i.kind)).collect();
        assert!(kinds.contains(&(finished.id, InconsistencyKind::TerminalButActive)));
        assert!(kinds.contains(&(pending.id, InconsistencyKind::NotProcessingButActive)));
        assert!(kinds.contains(&(ghost, InconsistencyKind::MissingRecord)));
        assert!(kinds.contains(&(done.id, InconsistencyKind::NotPendingButQueued)));
        assert!(!kinds.iter().any(|(id, _)| *id == running.id));
        // `done` moved from active to queued when it was enqueued.
        assert_eq!(f.store.active_len(), 4);
    }
}
