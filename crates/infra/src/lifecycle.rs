//! Job finalization.
//!
//! Order is fixed: release the in-memory slot, then touch the durable record,
//! then the side effects (refund, cache, drain). Each step reports its own
//! outcome; none of them can keep the slot occupied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use reelgen_core::{JobId, JobStatus, UserId, VideoJob};

use crate::jobs::{JobStore, StepOutcome};
use crate::ledger::{CreditLedger, CreditReason};
use crate::records::{JobRepository, RecordError};
use crate::tiers::TierPolicy;

/// Coalescing wake-up for the queue drain loop.
///
/// The channel holds at most one pending signal, so a burst of completions
/// produces a single extra drain.
#[derive(Debug, Clone)]
pub struct DrainTrigger {
    tx: mpsc::Sender<()>,
}

impl DrainTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns `false` when a signal is already pending or nobody listens.
    pub fn fire(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    pub fn fire_after(&self, delay: Duration) {
        let trigger = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.fire();
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeOutcome {
    pub job_id: JobId,
    pub released_slot: bool,
    pub durable: StepOutcome,
    pub refund: StepOutcome,
    pub cache: StepOutcome,
    pub drain_scheduled: bool,
}

impl FinalizeOutcome {
    pub fn has_failures(&self) -> bool {
        self.durable.is_failed() || self.refund.is_failed() || self.cache.is_failed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Forced,
}

pub struct LifecycleHandler {
    store: Arc<JobStore>,
    records: Arc<dyn JobRepository>,
    ledger: Arc<dyn CreditLedger>,
    tiers: Arc<TierPolicy>,
    drain: DrainTrigger,
    drain_delay: Duration,
}

impl LifecycleHandler {
    pub fn new(
        store: Arc<JobStore>,
        records: Arc<dyn JobRepository>,
        ledger: Arc<dyn CreditLedger>,
        tiers: Arc<TierPolicy>,
        drain: DrainTrigger,
        drain_delay: Duration,
    ) -> Self {
        Self {
            store,
            records,
            ledger,
            tiers,
            drain,
            drain_delay,
        }
    }

    /// Finalize a successful render.
    ///
    /// The record is only moved to `completed` here when an artifact is known;
    /// without one a `processing` record is left for the reaper.
    #[instrument(skip(self))]
    pub async fn complete(&self, job_id: JobId, artifact_url: Option<String>) -> FinalizeOutcome {
        self.finish_success(job_id, artifact_url, Mode::Normal).await
    }

    /// Operator override: completes even without an artifact.
    #[instrument(skip(self))]
    pub async fn force_complete(
        &self,
        job_id: JobId,
        artifact_url: Option<String>,
    ) -> FinalizeOutcome {
        self.finish_success(job_id, artifact_url, Mode::Forced).await
    }

    #[instrument(skip(self))]
    pub async fn fail(&self, job_id: JobId, message: &str) -> FinalizeOutcome {
        self.finish_failure(job_id, message, CreditReason::VideoGenerationFailed, Mode::Normal)
            .await
    }

    /// Failure caused by the render provider refusing the job.
    #[instrument(skip(self))]
    pub async fn fail_kickoff(&self, job_id: JobId, message: &str) -> FinalizeOutcome {
        self.finish_failure(job_id, message, CreditReason::RenderKickoffFailed, Mode::Normal)
            .await
    }

    #[instrument(skip(self))]
    pub async fn force_fail(&self, job_id: JobId, message: &str) -> FinalizeOutcome {
        self.finish_failure(job_id, message, CreditReason::VideoGenerationFailed, Mode::Forced)
            .await
    }

    async fn finish_success(
        &self,
        job_id: JobId,
        artifact_url: Option<String>,
        mode: Mode,
    ) -> FinalizeOutcome {
        let released = self.store.take_active(job_id);
        let record = self.records.get(job_id).await;
        let user_id = owner(released.as_ref().map(|e| e.user_id), &record);

        let durable = match &record {
            Ok(Some(job)) => match job.status {
                JobStatus::Completed => StepOutcome::skipped("already completed"),
                JobStatus::Failed => StepOutcome::skipped("job already failed"),
                JobStatus::Pending => StepOutcome::skipped("job never started processing"),
                JobStatus::Processing => {
                    let artifact = artifact_url.or_else(|| job.result_url.clone());
                    if artifact.is_none() && mode == Mode::Normal {
                        StepOutcome::skipped("no result artifact")
                    } else {
                        match self
                            .records
                            .mark_completed(job_id, artifact.as_deref(), Utc::now())
                            .await
                        {
                            Ok(true) => StepOutcome::Done,
                            Ok(false) => StepOutcome::skipped("finalized concurrently"),
                            Err(e) => StepOutcome::failed(&e),
                        }
                    }
                }
            },
            Ok(None) => StepOutcome::skipped("record missing"),
            Err(e) => StepOutcome::failed(e),
        };

        let outcome = FinalizeOutcome {
            job_id,
            released_slot: released.is_some(),
            durable,
            refund: StepOutcome::skipped("not applicable"),
            cache: self.invalidate(user_id).await,
            drain_scheduled: self.schedule_drain(),
        };
        log_outcome("completed", &outcome);
        outcome
    }

    async fn finish_failure(
        &self,
        job_id: JobId,
        message: &str,
        reason: CreditReason,
        mode: Mode,
    ) -> FinalizeOutcome {
        let released = self.store.take_active(job_id);
        let mut dequeued = self.store.dequeue(job_id);
        let record = self.records.get(job_id).await;
        let user_id = owner(
            released
                .as_ref()
                .map(|e| e.user_id)
                .or(dequeued.as_ref().map(|e| e.user_id)),
            &record,
        );

        let (durable, refund) = match &record {
            Ok(Some(job)) if job.is_terminal() => (
                StepOutcome::skipped(format!("already {}", job.status)),
                StepOutcome::skipped("job already finalized"),
            ),
            Ok(Some(job)) => match self.records.mark_failed(job_id, message, Utc::now()).await {
                Ok(true) => (StepOutcome::Done, self.refund(job, reason, message).await),
                Ok(false) => (
                    StepOutcome::skipped("finalized concurrently"),
                    StepOutcome::skipped("job already finalized"),
                ),
                Err(e) => (StepOutcome::failed(&e), StepOutcome::skipped("record not claimed")),
            },
            Ok(None) => (
                StepOutcome::skipped("record missing"),
                StepOutcome::skipped("record missing"),
            ),
            Err(e) => (StepOutcome::failed(e), StepOutcome::skipped("record not claimed")),
        };

        // An unclaimed pending job keeps its charge, so it must stay
        // reachable by the drain or a later fail.
        if durable.is_failed() {
            if let Some(entry) = dequeued.take() {
                warn!(%job_id, "failure not recorded; job returned to the queue");
                self.store.requeue(entry);
            }
        }

        let outcome = FinalizeOutcome {
            job_id,
            released_slot: released.is_some() || dequeued.is_some(),
            durable,
            refund,
            cache: self.invalidate(user_id).await,
            drain_scheduled: self.schedule_drain(),
        };
        if mode == Mode::Forced {
            info!(?outcome, "job force-failed");
        } else {
            log_outcome("failed", &outcome);
        }
        outcome
    }

    async fn refund(&self, job: &VideoJob, reason: CreditReason, cause: &str) -> StepOutcome {
        if job.credits_charged == 0 {
            return StepOutcome::skipped("no credits charged");
        }
        match self
            .ledger
            .credit(job.user_id, job.credits_charged, reason, Some(job.id), cause)
            .await
        {
            Ok(_) => StepOutcome::Done,
            Err(e) => StepOutcome::failed(&e),
        }
    }

    async fn invalidate(&self, user_id: Option<UserId>) -> StepOutcome {
        let Some(user_id) = user_id else {
            return StepOutcome::skipped("owner unknown");
        };
        match self.tiers.invalidate(user_id).await {
            Ok(()) => StepOutcome::Done,
            Err(e) => StepOutcome::failed(&e),
        }
    }

    fn schedule_drain(&self) -> bool {
        self.drain.fire_after(self.drain_delay);
        true
    }
}

fn owner(
    from_memory: Option<UserId>,
    record: &Result<Option<VideoJob>, RecordError>,
) -> Option<UserId> {
    from_memory.or_else(|| match record {
        Ok(Some(job)) => Some(job.user_id),
        _ => None,
    })
}

fn log_outcome(action: &str, outcome: &FinalizeOutcome) {
    if outcome.has_failures() {
        warn!(action, ?outcome, "job finalized with failed steps");
    } else {
        info!(
            action,
            job_id = %outcome.job_id,
            released_slot = outcome.released_slot,
            durable = ?outcome.durable,
            refund = ?outcome.refund,
            "job finalized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryCreditLedger;
    use crate::records::InMemoryJobRepository;
    use crate::tiers::{InMemoryTierCache, InMemoryTierDirectory, TierCache};
    use reelgen_core::{MetadataStatus, NewVideoJob, Tier, TierLimits};
    use serde_json::Map;

    struct Fixture {
        lifecycle: LifecycleHandler,
        store: Arc<JobStore>,
        records: Arc<InMemoryJobRepository>,
        ledger: Arc<InMemoryCreditLedger>,
        cache: Arc<InMemoryTierCache>,
        drain_rx: mpsc::Receiver<()>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(JobStore::new());
        let records = Arc::new(InMemoryJobRepository::new());
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let cache = Arc::new(InMemoryTierCache::new());
        let tiers = Arc::new(TierPolicy::new(
            Arc::new(InMemoryTierDirectory::new()),
            cache.clone(),
            TierLimits::default(),
            Duration::from_secs(300),
            "en",
        ));
        let (drain, drain_rx) = DrainTrigger::channel();
        Fixture {
            lifecycle: LifecycleHandler::new(
                store.clone(),
                records.clone(),
                ledger.clone(),
                tiers,
                drain,
                Duration::from_secs(1),
            ),
            store,
            records,
            ledger,
            cache,
            drain_rx,
        }
    }

    fn running(f: &Fixture, user_id: UserId) -> VideoJob {
        let mut job = NewVideoJob {
            id: JobId::new(),
            user_id,
            credits_charged: 30,
            template_name: "promo".to_string(),
            prompt: "p".to_string(),
            parameters: Map::new(),
            priority: 0,
            locale: "en".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            metadata_status: MetadataStatus::AiGenerated,
        }
        .into_record(Utc::now());
        job.mark_processing(Utc::now()).unwrap();
        f.records.insert(job.clone());
        f.store.add_active(job.id, user_id, Utc::now());
        job
    }

    #[tokio::test(start_paused = true)]
    async fn complete_releases_slot_and_schedules_drain() {
        let mut f = fixture();
        let user = UserId::new();
        let job = running(&f, user);
        f.cache.put(user, Tier::Basic, Duration::from_secs(60)).await.unwrap();

        let outcome = f
            .lifecycle
            .complete(job.id, Some("https://cdn.example/out.mp4".to_string()))
            .await;

        assert!(outcome.released_slot);
        assert!(outcome.durable.is_done());
        assert!(outcome.drain_scheduled);
        assert!(!f.store.is_active(job.id));
        assert!(!f.cache.contains(user));
        let stored = f.records.snapshot(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_url.as_deref(), Some("https://cdn.example/out.mp4"));

        assert_eq!(f.drain_rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn complete_without_artifact_leaves_record_processing() {
        let f = fixture();
        let job = running(&f, UserId::new());

        let outcome = f.lifecycle.complete(job.id, None).await;
        assert!(outcome.released_slot);
        assert!(matches!(outcome.durable, StepOutcome::Skipped(_)));
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Processing);

        let forced = f.lifecycle.force_complete(job.id, None).await;
        assert!(forced.durable.is_done());
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn fail_refunds_once_even_when_called_twice() {
        let f = fixture();
        let user = UserId::new();
        f.ledger.set_balance(user, 0);
        let job = running(&f, user);

        let first = f.lifecycle.fail(job.id, "render error").await;
        let second = f.lifecycle.fail(job.id, "render error").await;

        assert!(first.refund.is_done());
        assert!(!second.released_slot);
        assert!(matches!(second.refund, StepOutcome::Skipped(_)));
        assert_eq!(f.ledger.balance(user), 30);
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn fail_after_completion_is_a_no_op() {
        let f = fixture();
        let user = UserId::new();
        let job = running(&f, user);
        f.lifecycle.complete(job.id, Some("u".to_string())).await;

        let outcome = f.lifecycle.force_fail(job.id, "operator").await;
        assert!(matches!(outcome.durable, StepOutcome::Skipped(_)));
        assert_eq!(f.ledger.refunded_for(job.id), 0);
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn slot_is_freed_when_storage_and_ledger_fail() {
        let f = fixture();
        let user = UserId::new();
        let job = running(&f, user);
        f.records.fail_reads(true);
        f.ledger.fail_credits(true);
        f.cache.set_unavailable(true);

        let outcome = f.lifecycle.fail(job.id, "render error").await;
        assert!(outcome.released_slot);
        assert!(outcome.durable.is_failed());
        assert!(outcome.cache.is_failed());
        assert!(outcome.has_failures());
        assert_eq!(f.store.active_len(), 0);
    }

    #[tokio::test]
    async fn failing_a_queued_job_dequeues_and_refunds() {
        let f = fixture();
        let user = UserId::new();
        let job = NewVideoJob {
            id: JobId::new(),
            user_id: user,
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
        .into_record(Utc::now());
        f.records.insert(job.clone());
        f.store.enqueue(crate::jobs::QueueEntry::new(job.id, user, 0, Utc::now()));

        let outcome = f.lifecycle.force_fail(job.id, "cancelled by operator").await;
        assert!(outcome.released_slot);
        assert!(outcome.refund.is_done());
        assert_eq!(f.store.queued_len(), 0);
        assert_eq!(f.ledger.refunded_for(job.id), 10);
    }

    #[tokio::test]
    async fn queued_job_stays_queued_when_failure_cannot_be_recorded() {
        let f = fixture();
        let user = UserId::new();
        let job = NewVideoJob {
            id: JobId::new(),
            user_id: user,
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
        .into_record(Utc::now());
        f.records.insert(job.clone());
        f.store.enqueue(crate::jobs::QueueEntry::new(job.id, user, 0, Utc::now()));

        f.records.fail_writes(true);
        let outcome = f.lifecycle.force_fail(job.id, "cancelled by operator").await;
        assert!(outcome.durable.is_failed());
        assert!(!outcome.refund.is_done());
        assert!(!outcome.released_slot);
        assert!(f.store.contains_queued(job.id));
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Pending);
        assert_eq!(f.ledger.refunded_for(job.id), 0);

        f.records.fail_writes(false);
        let retried = f.lifecycle.force_fail(job.id, "cancelled by operator").await;
        assert!(retried.released_slot);
        assert!(retried.refund.is_done());
        assert!(!f.store.contains_queued(job.id));
        assert_eq!(f.records.snapshot(job.id).unwrap().status, JobStatus::Failed);
        assert_eq!(f.ledger.refunded_for(job.id), 10);
    }

    #[tokio::test]
    async fn drain_trigger_coalesces() {
        let (trigger, mut rx) = DrainTrigger::channel();
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert_eq!(rx.recv().await, Some(()));
        assert!(trigger.fire());
    }
}
