//! Admission checks with a durable cross-check.
//!
//! Memory is treated as a cache that is verified on read: every user check
//! first prunes active entries whose records have already finished, then
//! compares the remaining count with the durable `processing` count.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use reelgen_core::{JobId, JobStatus, Tier, UserId};

use crate::jobs::JobStore;
use crate::records::JobRepository;
use crate::tiers::TierPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCheck {
    pub can_submit: bool,
    pub active_count: usize,
    pub max_allowed: u32,
    pub tier: Tier,
    pub memory_count: usize,
    /// `None` when the durable count could not be read.
    pub durable_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemCheck {
    pub can_start_processing: bool,
    pub available_slots: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub checked: usize,
    pub removed: Vec<JobId>,
}

/// Count used for admission when memory and storage disagree.
///
/// A gap of one is normal in-flight skew and memory is trusted; a larger gap
/// takes the higher of the two, which may under-admit until memory catches up.
pub fn reconcile_counts(memory: usize, durable: Option<usize>) -> usize {
    match durable {
        Some(durable) if memory.abs_diff(durable) > 1 => memory.max(durable),
        _ => memory,
    }
}

pub struct ConcurrencyGuard {
    store: Arc<JobStore>,
    records: Arc<dyn JobRepository>,
    tiers: Arc<TierPolicy>,
}

impl ConcurrencyGuard {
    pub fn new(
        store: Arc<JobStore>,
        records: Arc<dyn JobRepository>,
        tiers: Arc<TierPolicy>,
    ) -> Self {
        Self {
            store,
            records,
            tiers,
        }
    }

    pub async fn check_user(&self, user_id: UserId) -> UserCheck {
        self.cleanup_invalid(user_id).await;

        let memory_count = self.store.active_count_for_user(user_id);
        let durable_count = match self
            .records
            .count_by_status_for_user(user_id, JobStatus::Processing)
            .await
        {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(%user_id, error = %e, "durable processing count unavailable; using memory");
                None
            }
        };
        let active_count = reconcile_counts(memory_count, durable_count);
        if active_count != memory_count {
            info!(
                %user_id,
                memory_count,
                durable_count = ?durable_count,
                "active counts disagree; using the larger"
            );
        }

        let (tier, max_allowed) = self.tiers.limit_for_user(user_id).await;
        let can_submit = active_count < max_allowed as usize;
        let reason =
            (!can_submit).then(|| self.tiers.denial_reason(tier, max_allowed, active_count));

        UserCheck {
            can_submit,
            active_count,
            max_allowed,
            tier,
            memory_count,
            durable_count,
            reason,
        }
    }

    pub fn check_system(&self, system_max: usize) -> SystemCheck {
        let available_slots = self.store.available_slots(system_max);
        SystemCheck {
            can_start_processing: available_slots > 0,
            available_slots,
        }
    }

    /// Drop a user's active entries whose records are terminal or gone.
    ///
    /// A record that cannot be read is kept; the next check retries it.
    pub async fn cleanup_invalid(&self, user_id: UserId) -> CleanupReport {
        let ids = self.store.active_ids_for_user(user_id);
        let mut report = CleanupReport {
            checked: ids.len(),
            removed: Vec::new(),
        };

        for job_id in ids {
            let stale = match self.records.get(job_id).await {
                Ok(Some(record)) => record.is_terminal(),
                Ok(None) => true,
                Err(e) => {
                    debug!(%job_id, error = %e, "could not verify active entry");
                    false
                }
            };
            if stale && self.store.remove_active(job_id) {
                report.removed.push(job_id);
            }
        }

        if !report.removed.is_empty() {
            info!(%user_id, removed = report.removed.len(), "released stale active entries");
        }
        report
    }

    /// `cleanup_invalid` for every user with an active entry.
    pub async fn cleanup_all_invalid(&self) -> CleanupReport {
        let mut users: Vec<UserId> = self
            .store
            .active_entries()
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        users.sort_by_key(|u| *u.as_uuid());
        users.dedup();

        let mut total = CleanupReport::default();
        for user_id in users {
            let report = self.cleanup_invalid(user_id).await;
            total.checked += report.checked;
            total.removed.extend(report.removed);
        }
        total
    }
}
