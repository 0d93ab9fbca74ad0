use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use reelgen_core::{Tier, UserId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// Durable source for a user's subscription tier and profile preferences.
#[async_trait]
pub trait TierDirectory: Send + Sync {
    /// `Ok(None)` means the user has no subscription on record.
    async fn subscription_tier(&self, user_id: UserId) -> Result<Option<Tier>, DirectoryError>;

    /// Tier stored on the user's profile row, read directly from storage.
    async fn profile_tier(&self, user_id: UserId) -> Result<Option<Tier>, DirectoryError>;

    async fn profile_locale(&self, user_id: UserId) -> Result<Option<String>, DirectoryError>;

    async fn set_profile_locale(&self, user_id: UserId, locale: &str) -> Result<(), DirectoryError>;
}

#[derive(Debug, Default)]
struct Profiles {
    tiers: HashMap<UserId, Tier>,
    profile_tiers: HashMap<UserId, Tier>,
    locales: HashMap<UserId, String>,
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTierDirectory {
    profiles: Mutex<Profiles>,
    unavailable: AtomicBool,
    subscriptions_unavailable: AtomicBool,
    tier_lookups: AtomicUsize,
}

impl InMemoryTierDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, user_id: UserId, tier: Tier) {
        self.lock().tiers.insert(user_id, tier);
    }

    pub fn set_profile_tier(&self, user_id: UserId, tier: Tier) {
        self.lock().profile_tiers.insert(user_id, tier);
    }

    pub fn locale(&self, user_id: UserId) -> Option<String> {
        self.lock().locales.get(&user_id).cloned()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only the subscription lookup; profile reads keep working.
    pub fn set_subscriptions_unavailable(&self, unavailable: bool) {
        self.subscriptions_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `subscription_tier` calls that reached the directory.
    pub fn tier_lookups(&self) -> usize {
        self.tier_lookups.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Profiles> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TierDirectory for InMemoryTierDirectory {
    async fn subscription_tier(&self, user_id: UserId) -> Result<Option<Tier>, DirectoryError> {
        self.tier_lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if self.subscriptions_unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("subscriptions: injected failure".to_string()));
        }
        Ok(self.lock().tiers.get(&user_id).copied())
    }

    async fn profile_tier(&self, user_id: UserId) -> Result<Option<Tier>, DirectoryError> {
        self.check()?;
        Ok(self.lock().profile_tiers.get(&user_id).copied())
    }

    async fn profile_locale(&self, user_id: UserId) -> Result<Option<String>, DirectoryError> {
        self.check()?;
        Ok(self.locale(user_id))
    }

    async fn set_profile_locale(&self, user_id: UserId, locale: &str) -> Result<(), DirectoryError> {
        self.check()?;
        self.lock().locales.insert(user_id, locale.to_string());
        Ok(())
    }
}
