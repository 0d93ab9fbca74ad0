//! Scheduler-side job types and policies.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reelgen_core::{JobId, UserId};

/// A job waiting for a processing slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub user_id: UserId,
    /// Higher runs first.
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion counter assigned by the store; breaks timestamp ties.
    pub sequence: u64,
}

impl QueueEntry {
    pub fn new(job_id: JobId, user_id: UserId, priority: i32, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            user_id,
            priority,
            enqueued_at,
            sequence: 0,
        }
    }

    /// Drain order: priority descending, then enqueue time, then insertion order.
    pub fn drain_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// A job currently holding a processing slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEntry {
    pub job_id: JobId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
}

/// Result of an atomic admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    SystemFull,
    UserAtLimit,
}

/// Result of one step of a multi-step cleanup.
///
/// Cleanup steps are independent; a failed step never stops the ones after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn failed(error: impl ToString) -> Self {
        Self::Failed(error.to_string())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StepOutcome::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry schedule for background follow-up work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(2), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait before `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Rough wait estimate for a queued job, in whole minutes.
///
/// `ceil(position * average_minutes / min(system_max, position))`.
pub fn estimate_wait_minutes(position: usize, average_minutes: u32, system_max: usize) -> u32 {
    if position == 0 {
        return 0;
    }
    let parallel = system_max.min(position).max(1) as u64;
    let total = position as u64 * u64::from(average_minutes);
    u32::try_from(total.div_ceil(parallel)).unwrap_or(u32::MAX)
}
