//! Zombie detection and cleanup.
//!
//! A zombie is a `processing` record whose processing start is older than the
//! configured timeout. Cleanup claims the record by marking it `failed` first
//! and refunds only when that claim succeeded, so concurrent reapers and
//! finalizers never refund the same job twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use reelgen_core::{JobId, JobStatus, UserId, VideoJob};

use crate::jobs::{JobStore, StepOutcome};
use crate::ledger::{CreditLedger, CreditReason};
use crate::records::JobRepository;
use crate::tiers::TierPolicy;

const ZOMBIE_MESSAGE: &str = "Processing timed out; the render never reported back";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub zombie_timeout: Duration,
    /// Periodic sweeps closer together than this are skipped.
    pub min_scan_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            zombie_timeout: Duration::from_secs(30 * 60),
            min_scan_interval: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZombieOutcome {
    pub job_id: JobId,
    pub user_id: UserId,
    pub durable: StepOutcome,
    pub refund: StepOutcome,
    pub released_slot: bool,
    pub cache: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemCleanupReport {
    /// Active entries dropped because their record was a zombie, terminal or missing.
    pub cleaned_from_memory: usize,
    /// Zombies found in storage that memory did not know about.
    pub discovered_in_storage: usize,
    pub zombies: Vec<ZombieOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserCleanupReport {
    pub user_id: Option<UserId>,
    pub checked: usize,
    pub released_stale: usize,
    pub zombies: Vec<ZombieOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SweepReport {
    Skipped { last_scan_at: DateTime<Utc> },
    Completed(SystemCleanupReport),
}

pub struct ReaperService {
    store: Arc<JobStore>,
    records: Arc<dyn JobRepository>,
    ledger: Arc<dyn CreditLedger>,
    tiers: Arc<TierPolicy>,
    config: ReaperConfig,
    last_scan: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl ReaperService {
    pub fn new(
        store: Arc<JobStore>,
        records: Arc<dyn JobRepository>,
        ledger: Arc<dyn CreditLedger>,
        tiers: Arc<TierPolicy>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            records,
            ledger,
            tiers,
            config,
            last_scan: Mutex::new(None),
        }
    }

    pub fn zombie_timeout(&self) -> Duration {
        self.config.zombie_timeout
    }

    pub fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        let last = *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner);
        last.map(|(_, at)| at)
    }

    pub fn is_zombie(&self, record: &VideoJob, now: DateTime<Utc>) -> bool {
        record.is_zombie(now, self.chrono_timeout())
    }

    fn chrono_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.zombie_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
    }

    /// Fail, refund, release and invalidate a stuck job.
    ///
    /// Every step runs regardless of the ones before it. The active slot is
    /// always released.
    #[instrument(skip(self))]
    pub async fn handle_zombie(&self, job_id: JobId, user_id: UserId) -> ZombieOutcome {
        let (durable, refund) = match self.records.get(job_id).await {
            Ok(Some(record)) if record.is_terminal() => (
                StepOutcome::skipped(format!("already {}", record.status)),
                StepOutcome::skipped("job already finalized"),
            ),
            Ok(Some(record)) => match self.records.mark_failed(job_id, ZOMBIE_MESSAGE, Utc::now()).await {
                Ok(true) => (StepOutcome::Done, self.refund(&record).await),
                Ok(false) => (
                    StepOutcome::skipped("finalized concurrently"),
                    StepOutcome::skipped("job already finalized"),
                ),
                Err(e) => (
                    StepOutcome::failed(&e),
                    StepOutcome::skipped("record not claimed"),
                ),
            },
            Ok(None) => (
                StepOutcome::skipped("record missing"),
                StepOutcome::skipped("record missing"),
            ),
            Err(e) => (
                StepOutcome::failed(&e),
                StepOutcome::skipped("record not claimed"),
            ),
        };

        let released_slot = self.store.remove_active(job_id);
        let cache = match self.tiers.invalidate(user_id).await {
            Ok(()) => StepOutcome::Done,
            Err(e) => StepOutcome::failed(&e),
        };

        let outcome = ZombieOutcome {
            job_id,
            user_id,
            durable,
            refund,
            released_slot,
            cache,
        };
        if outcome.durable.is_failed() || outcome.refund.is_failed() {
            warn!(?outcome, "zombie cleanup incomplete");
        } else {
            info!(durable = ?outcome.durable, refund = ?outcome.refund, "zombie job reaped");
        }
        outcome
    }

    async fn refund(&self, record: &VideoJob) -> StepOutcome {
        if record.credits_charged == 0 {
            return StepOutcome::skipped("no credits charged");
        }
        match self
            .ledger
            .credit(
                record.user_id,
                record.credits_charged,
                CreditReason::ZombieTaskTimeout,
                Some(record.id),
                ZOMBIE_MESSAGE,
            )
            .await
        {
            Ok(_) => StepOutcome::Done,
            Err(e) => StepOutcome::failed(&e),
        }
    }

    /// Periodic entry point. Skipped when the previous scan is too recent.
    pub async fn sweep(&self) -> SweepReport {
        if let Some(last_scan_at) = self.begin_scan() {
            return SweepReport::Skipped { last_scan_at };
        }
        SweepReport::Completed(self.cleanup_system().await)
    }

    /// Returns the previous scan time if a new scan should not start yet.
    fn begin_scan(&self) -> Option<DateTime<Utc>> {
        let mut last = self.last_scan.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((at, wall)) = *last {
            if at.elapsed() < self.config.min_scan_interval {
                return Some(wall);
            }
        }
        *last = Some((Instant::now(), Utc::now()));
        None
    }

    /// Scan every active entry, then storage, and reap what has timed out.
    #[instrument(skip(self))]
    pub async fn cleanup_system(&self) -> SystemCleanupReport {
        let now = Utc::now();
        let mut report = SystemCleanupReport::default();
        let mut handled = HashSet::new();

        for entry in self.store.active_entries() {
            match self.records.get(entry.job_id).await {
                Ok(Some(record)) if self.is_zombie(&record, now) => {
                    handled.insert(entry.job_id);
                    report.zombies.push(self.handle_zombie(entry.job_id, entry.user_id).await);
                    report.cleaned_from_memory += 1;
                }
                Ok(Some(record)) if record.is_terminal() => {
                    if self.store.remove_active(entry.job_id) {
                        report.cleaned_from_memory += 1;
                    }
                }
                Ok(None) => {
                    if self.store.remove_active(entry.job_id) {
                        report.cleaned_from_memory += 1;
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => warn!(job_id = %entry.job_id, error = %e, "could not check active job"),
            }
        }

        let cutoff = now - self.chrono_timeout();
        match self.records.list_processing_started_before(cutoff).await {
            Ok(stale) => {
                for record in stale.into_iter().filter(|r| !handled.contains(&r.id)) {
                    report.zombies.push(self.handle_zombie(record.id, record.user_id).await);
                    report.discovered_in_storage += 1;
                }
            }
            Err(e) => warn!(error = %e, "durable zombie scan failed"),
        }

        if !report.zombies.is_empty() || report.cleaned_from_memory > 0 {
            info!(
                cleaned_from_memory = report.cleaned_from_memory,
                discovered_in_storage = report.discovered_in_storage,
                "zombie sweep finished"
            );
        }
        report
    }

    /// Operator-triggered cleanup for one user. Only jobs past the timeout are reaped.
    #[instrument(skip(self))]
    pub async fn cleanup_user(&self, user_id: UserId) -> UserCleanupReport {
        let now = Utc::now();
        let mut ids: Vec<JobId> = self.store.active_ids_for_user(user_id);
        match self
            .records
            .list_for_user_by_status(user_id, JobStatus::Processing)
            .await
        {
            Ok(records) => {
                for record in records {
                    if !ids.contains(&record.id) {
                        ids.push(record.id);
                    }
                }
            }
            Err(e) => warn!(%user_id, error = %e, "could not list processing jobs"),
        }

        let mut report = UserCleanupReport {
            user_id: Some(user_id),
            checked: ids.len(),
            ..Default::default()
        };
        for job_id in ids {
            match self.records.get(job_id).await {
                Ok(Some(record)) if self.is_zombie(&record, now) => {
                    report.zombies.push(self.handle_zombie(job_id, user_id).await);
                }
                Ok(Some(record)) if record.is_terminal() => {
                    if self.store.remove_active(job_id) {
                        report.released_stale += 1;
                    }
                }
                Ok(None) => {
                    if self.store.remove_active(job_id) {
                        report.released_stale += 1;
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => warn!(%job_id, error = %e, "could not check job"),
            }
        }
        report
    }
}
