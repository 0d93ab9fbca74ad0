//! Credit ledger boundary.
//!
//! Debits and refunds carry a reason and the job they belong to. The in-memory
//! ledger ignores a second entry for the same `(job, reason)` pair, which
//! mirrors the unique key a durable ledger would carry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use reelgen_core::{JobId, UserId};

/// Why credits moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    VideoGeneration,
    VideoGenerationFailed,
    ZombieTaskTimeout,
    JobCreationFailed,
    RenderKickoffFailed,
}

impl CreditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditReason::VideoGeneration => "video_generation",
            CreditReason::VideoGenerationFailed => "video_generation_failed",
            CreditReason::ZombieTaskTimeout => "zombie_task_timeout",
            CreditReason::JobCreationFailed => "job_creation_failed",
            CreditReason::RenderKickoffFailed => "render_kickoff_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub success: bool,
    pub new_balance: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("credit amount must be positive")]
    InvalidAmount,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn has_enough(&self, user_id: UserId, amount: u32) -> Result<bool, LedgerError>;

    /// `success == false` means the balance was too low; nothing was charged.
    async fn debit(
        &self,
        user_id: UserId,
        amount: u32,
        reason: CreditReason,
        reference: Option<JobId>,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn credit(
        &self,
        user_id: UserId,
        amount: u32,
        reason: CreditReason,
        reference: Option<JobId>,
        cause: &str,
    ) -> Result<LedgerReceipt, LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub user_id: UserId,
    /// Negative for debits.
    pub delta: i64,
    pub reason: CreditReason,
    pub reference: Option<JobId>,
    pub cause: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<UserId, i64>,
    entries: Vec<LedgerEntry>,
    applied: HashSet<(JobId, CreditReason)>,
}

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    state: Mutex<LedgerState>,
    fail_debits: AtomicBool,
    fail_credits: AtomicBool,
    /// Balance assumed for users never seen before.
    starting_balance: i64,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_starting_balance(mut self, balance: i64) -> Self {
        self.starting_balance = balance;
        self
    }

    pub fn set_balance(&self, user_id: UserId, balance: i64) {
        self.lock().balances.insert(user_id, balance);
    }

    pub fn balance(&self, user_id: UserId) -> i64 {
        self.lock()
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(self.starting_balance)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock().entries.clone()
    }

    pub fn entries_for(&self, job_id: JobId) -> Vec<LedgerEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.reference == Some(job_id))
            .cloned()
            .collect()
    }

    /// Sum of refunds recorded against a job.
    pub fn refunded_for(&self, job_id: JobId) -> i64 {
        self.entries_for(job_id)
            .iter()
            .filter(|e| e.delta > 0)
            .map(|e| e.delta)
            .sum()
    }

    pub fn fail_debits(&self, fail: bool) {
        self.fail_debits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_credits(&self, fail: bool) {
        self.fail_credits.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(
        &self,
        user_id: UserId,
        delta: i64,
        reason: CreditReason,
        reference: Option<JobId>,
        cause: Option<&str>,
    ) -> LedgerReceipt {
        let mut state = self.lock();
        if let Some(job_id) = reference {
            if !state.applied.insert((job_id, reason)) {
                let balance = state
                    .balances
                    .get(&user_id)
                    .copied()
                    .unwrap_or(self.starting_balance);
                return LedgerReceipt {
                    success: true,
                    new_balance: balance,
                };
            }
        }
        let balance = state
            .balances
            .entry(user_id)
            .or_insert(self.starting_balance);
        *balance += delta;
        let new_balance = *balance;
        state.entries.push(LedgerEntry {
            user_id,
            delta,
            reason,
            reference,
            cause: cause.map(str::to_string),
            at: Utc::now(),
        });
        LedgerReceipt {
            success: true,
            new_balance,
        }
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn has_enough(&self, user_id: UserId, amount: u32) -> Result<bool, LedgerError> {
        Ok(self.balance(user_id) >= i64::from(amount))
    }

    async fn debit(
        &self,
        user_id: UserId,
        amount: u32,
        reason: CreditReason,
        reference: Option<JobId>,
    ) -> Result<LedgerReceipt, LedgerError> {
        if self.fail_debits.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("debit: injected failure".to_string()));
        }
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let balance = self.balance(user_id);
        if balance < i64::from(amount) {
            return Ok(LedgerReceipt {
                success: false,
                new_balance: balance,
            });
        }
        Ok(self.apply(user_id, -i64::from(amount), reason, reference, None))
    }

    async fn credit(
        &self,
        user_id: UserId,
        amount: u32,
        reason: CreditReason,
        reference: Option<JobId>,
        cause: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        if self.fail_credits.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("credit: injected failure".to_string()));
        }
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        Ok(self.apply(user_id, i64::from(amount), reason, reference, Some(cause)))
    }
}
