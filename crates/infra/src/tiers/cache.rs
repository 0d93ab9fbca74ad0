use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use reelgen_core::{Tier, UserId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("tier cache unavailable: {0}")]
    Unavailable(String),
}

/// Short-lived tier cache in front of the directory.
#[async_trait]
pub trait TierCache: Send + Sync {
    async fn get(&self, user_id: UserId) -> Result<Option<Tier>, CacheError>;

    async fn put(&self, user_id: UserId, tier: Tier, ttl: Duration) -> Result<(), CacheError>;

    /// Drop the cached tier so the next read sees fresh data.
    async fn clear_user_tier_cache(&self, user_id: UserId) -> Result<(), CacheError>;
}

/// In-memory TTL cache for tests/dev. Expiry follows `tokio::time`.
#[derive(Debug, Default)]
pub struct InMemoryTierCache {
    entries: Mutex<HashMap<UserId, (Tier, Instant)>>,
    unavailable: AtomicBool,
}

impl InMemoryTierCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.lock()
            .get(&user_id)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, (Tier, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TierCache for InMemoryTierCache {
    async fn get(&self, user_id: UserId) -> Result<Option<Tier>, CacheError> {
        self.check()?;
        let mut entries = self.lock();
        match entries.get(&user_id) {
            Some((tier, expires)) if *expires > Instant::now() => Ok(Some(*tier)),
            Some(_) => {
                entries.remove(&user_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, user_id: UserId, tier: Tier, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.lock().insert(user_id, (tier, Instant::now() + ttl));
        Ok(())
    }

    async fn clear_user_tier_cache(&self, user_id: UserId) -> Result<(), CacheError> {
        self.check()?;
        self.lock().remove(&user_id);
        Ok(())
    }
}
