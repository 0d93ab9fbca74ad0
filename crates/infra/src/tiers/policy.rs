use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use reelgen_core::{Tier, TierLimits, UserId};

use super::cache::{CacheError, TierCache};
use super::directory::TierDirectory;

/// Resolves tier, concurrency allowance and locale for a user.
///
/// Lookups fail closed: when neither the cache nor the directory can answer,
/// the user is treated as the lowest tier. That fallback is never cached, so
/// the next call retries the directory.
pub struct TierPolicy {
    directory: Arc<dyn TierDirectory>,
    cache: Arc<dyn TierCache>,
    limits: TierLimits,
    cache_ttl: Duration,
    default_locale: String,
}

impl TierPolicy {
    pub fn new(
        directory: Arc<dyn TierDirectory>,
        cache: Arc<dyn TierCache>,
        limits: TierLimits,
        cache_ttl: Duration,
        default_locale: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            cache,
            limits,
            cache_ttl,
            default_locale: default_locale.into(),
        }
    }

    pub async fn tier(&self, user_id: UserId) -> Tier {
        match self.cache.get(user_id).await {
            Ok(Some(tier)) => return tier,
            Ok(None) => {}
            Err(e) => debug!(%user_id, error = %e, "tier cache read failed"),
        }

        let subscription = self.directory.subscription_tier(user_id).await;
        if let Ok(Some(tier)) = subscription {
            self.remember(user_id, tier).await;
            return tier;
        }
        if let Err(e) = &subscription {
            debug!(%user_id, error = %e, "subscription lookup failed; reading profile");
        }

        match self.directory.profile_tier(user_id).await {
            Ok(found) => {
                let tier = found.unwrap_or(Tier::lowest());
                self.remember(user_id, tier).await;
                tier
            }
            Err(e) => {
                warn!(%user_id, error = %e, "tier lookup failed; using lowest tier");
                Tier::lowest()
            }
        }
    }

    async fn remember(&self, user_id: UserId, tier: Tier) {
        if let Err(e) = self.cache.put(user_id, tier, self.cache_ttl).await {
            debug!(%user_id, error = %e, "tier cache write failed");
        }
    }

    pub fn concurrency_limit(&self, tier: Tier) -> u32 {
        self.limits.limit_for(tier)
    }

    pub async fn limit_for_user(&self, user_id: UserId) -> (Tier, u32) {
        let tier = self.tier(user_id).await;
        (tier, self.concurrency_limit(tier))
    }

    pub async fn invalidate(&self, user_id: UserId) -> Result<(), CacheError> {
        self.cache.clear_user_tier_cache(user_id).await
    }

    /// Locale for generated text.
    ///
    /// A non-empty UI locale wins and is written back to the profile when it
    /// differs; otherwise the stored profile value, then the default.
    pub async fn locale(&self, user_id: UserId, ui_locale: Option<&str>) -> String {
        let ui_locale = ui_locale.map(str::trim).filter(|l| !l.is_empty());
        let stored = match self.directory.profile_locale(user_id).await {
            Ok(stored) => stored,
            Err(e) => {
                debug!(%user_id, error = %e, "profile locale lookup failed");
                None
            }
        };

        match ui_locale {
            Some(ui) => {
                if stored.as_deref() != Some(ui) {
                    if let Err(e) = self.directory.set_profile_locale(user_id, ui).await {
                        debug!(%user_id, error = %e, "could not persist ui locale");
                    }
                }
                ui.to_string()
            }
            None => stored.unwrap_or_else(|| self.default_locale.clone()),
        }
    }

    /// Human-readable denial for a user at their concurrency limit.
    pub fn denial_reason(&self, tier: Tier, max_allowed: u32, active: usize) -> String {
        let plural = if max_allowed == 1 { "" } else { "s" };
        match tier.upgrade_target() {
            Some(next) => format!(
                "Your {} plan allows {max_allowed} concurrent video generation{plural} and you have {active} in progress. \
                 Wait for one to finish or upgrade to {} to run up to {} at once.",
                tier.display_name(),
                next.display_name(),
                self.limits.limit_for(next),
            ),
            None => format!(
                "Your {} plan allows {max_allowed} concurrent video generation{plural} and you have {active} in progress. \
                 Wait for one to finish before starting another.",
                tier.display_name(),
            ),
        }
    }
}
