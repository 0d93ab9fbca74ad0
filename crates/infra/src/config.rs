//! Scheduler tunables.
//!
//! Defaults are the production values. `from_env` overlays `REELGEN_*`
//! variables; durations are whole seconds unless the name says minutes.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use reelgen_core::TierLimits;

use crate::jobs::RetryPolicy;
use crate::metadata::MetadataConfig;
use crate::reaper::ReaperConfig;
use crate::recovery::RecoveryConfig;
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub system_max_concurrent: usize,
    pub average_processing_minutes: u32,
    pub drain_interval: Duration,
    /// Delay between a finalization and the drain it triggers.
    pub drain_delay: Duration,

    pub zombie_timeout: Duration,
    pub reaper_interval: Duration,
    pub reaper_min_scan_interval: Duration,

    pub metadata_sync_budget: Duration,
    pub metadata_upgrade_ceiling: Duration,
    pub metadata_call_timeout: Duration,
    pub metadata_retry: RetryPolicy,

    pub recovery_recheck_delay: Duration,
    pub recovery_final_cleanup_delay: Duration,

    pub tier_cache_ttl: Duration,
    pub tier_limits: TierLimits,
    pub default_locale: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            system_max_concurrent: 5,
            average_processing_minutes: 5,
            drain_interval: Duration::from_secs(10),
            drain_delay: Duration::from_secs(1),
            zombie_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(5 * 60),
            reaper_min_scan_interval: Duration::from_secs(2 * 60),
            metadata_sync_budget: Duration::from_secs(10),
            metadata_upgrade_ceiling: Duration::from_secs(5 * 60),
            metadata_call_timeout: Duration::from_secs(30),
            metadata_retry: RetryPolicy::default(),
            recovery_recheck_delay: Duration::from_secs(30),
            recovery_final_cleanup_delay: Duration::from_secs(5 * 60),
            tier_cache_ttl: Duration::from_secs(5 * 60),
            tier_limits: TierLimits::default(),
            default_locale: "en".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with `REELGEN_*` environment variables.
    ///
    /// Recognised variables:
    /// - `REELGEN_SYSTEM_MAX_CONCURRENT`, `REELGEN_AVERAGE_PROCESSING_MINUTES`
    /// - `REELGEN_DRAIN_INTERVAL_SECS`, `REELGEN_DRAIN_DELAY_SECS`
    /// - `REELGEN_ZOMBIE_TIMEOUT_MINUTES`, `REELGEN_REAPER_INTERVAL_SECS`,
    ///   `REELGEN_REAPER_MIN_SCAN_INTERVAL_SECS`
    /// - `REELGEN_METADATA_SYNC_BUDGET_SECS`, `REELGEN_METADATA_UPGRADE_CEILING_SECS`,
    ///   `REELGEN_METADATA_CALL_TIMEOUT_SECS`, `REELGEN_METADATA_RETRY_ATTEMPTS`
    /// - `REELGEN_RECOVERY_RECHECK_DELAY_SECS`, `REELGEN_RECOVERY_FINAL_CLEANUP_DELAY_SECS`
    /// - `REELGEN_TIER_CACHE_TTL_SECS`, `REELGEN_LIMIT_FREE`, `REELGEN_LIMIT_BASIC`,
    ///   `REELGEN_LIMIT_PRO`, `REELGEN_LIMIT_PREMIUM`, `REELGEN_DEFAULT_LOCALE`
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = Self::default();

        let mut retry = defaults.metadata_retry.clone();
        retry.max_attempts = vars.parse("REELGEN_METADATA_RETRY_ATTEMPTS", retry.max_attempts)?;

        let limits = TierLimits {
            free: vars.parse("REELGEN_LIMIT_FREE", defaults.tier_limits.free)?,
            basic: vars.parse("REELGEN_LIMIT_BASIC", defaults.tier_limits.basic)?,
            pro: vars.parse("REELGEN_LIMIT_PRO", defaults.tier_limits.pro)?,
            premium: vars.parse("REELGEN_LIMIT_PREMIUM", defaults.tier_limits.premium)?,
        };

        let config = Self {
            system_max_concurrent: vars
                .parse("REELGEN_SYSTEM_MAX_CONCURRENT", defaults.system_max_concurrent)?,
            average_processing_minutes: vars.parse(
                "REELGEN_AVERAGE_PROCESSING_MINUTES",
                defaults.average_processing_minutes,
            )?,
            drain_interval: vars.secs("REELGEN_DRAIN_INTERVAL_SECS", defaults.drain_interval)?,
            drain_delay: vars.secs("REELGEN_DRAIN_DELAY_SECS", defaults.drain_delay)?,
            zombie_timeout: vars.minutes("REELGEN_ZOMBIE_TIMEOUT_MINUTES", defaults.zombie_timeout)?,
            reaper_interval: vars.secs("REELGEN_REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
            reaper_min_scan_interval: vars.secs(
                "REELGEN_REAPER_MIN_SCAN_INTERVAL_SECS",
                defaults.reaper_min_scan_interval,
            )?,
            metadata_sync_budget: vars.secs(
                "REELGEN_METADATA_SYNC_BUDGET_SECS",
                defaults.metadata_sync_budget,
            )?,
            metadata_upgrade_ceiling: vars.secs(
                "REELGEN_METADATA_UPGRADE_CEILING_SECS",
                defaults.metadata_upgrade_ceiling,
            )?,
            metadata_call_timeout: vars.secs(
                "REELGEN_METADATA_CALL_TIMEOUT_SECS",
                defaults.metadata_call_timeout,
            )?,
            metadata_retry: retry,
            recovery_recheck_delay: vars.secs(
                "REELGEN_RECOVERY_RECHECK_DELAY_SECS",
                defaults.recovery_recheck_delay,
            )?,
            recovery_final_cleanup_delay: vars.secs(
                "REELGEN_RECOVERY_FINAL_CLEANUP_DELAY_SECS",
                defaults.recovery_final_cleanup_delay,
            )?,
            tier_cache_ttl: vars.secs("REELGEN_TIER_CACHE_TTL_SECS", defaults.tier_cache_ttl)?,
            tier_limits: limits,
            default_locale: lookup("REELGEN_DEFAULT_LOCALE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_locale),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.system_max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "system_max_concurrent must be at least 1".to_string(),
            ));
        }
        self.tier_limits
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.metadata_sync_budget >= self.metadata_upgrade_ceiling {
            return Err(ConfigError::Validation(
                "metadata_sync_budget must be shorter than metadata_upgrade_ceiling".to_string(),
            ));
        }
        if self.recovery_recheck_delay > self.recovery_final_cleanup_delay {
            return Err(ConfigError::Validation(
                "recovery_recheck_delay must not exceed recovery_final_cleanup_delay".to_string(),
            ));
        }
        if self.metadata_retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "metadata retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            system_max_concurrent: self.system_max_concurrent,
            average_processing_minutes: self.average_processing_minutes,
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            zombie_timeout: self.zombie_timeout,
            min_scan_interval: self.reaper_min_scan_interval,
        }
    }

    pub fn metadata(&self) -> MetadataConfig {
        MetadataConfig {
            sync_budget: self.metadata_sync_budget,
            upgrade_ceiling: self.metadata_upgrade_ceiling,
            call_timeout: self.metadata_call_timeout,
            retry: self.metadata_retry.clone(),
        }
    }

    pub fn recovery(&self) -> RecoveryConfig {
        RecoveryConfig {
            recheck_delay: self.recovery_recheck_delay,
            final_cleanup_delay: self.recovery_final_cleanup_delay,
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, var: &str, default: T) -> ConfigResult<T> {
        match (self.0)(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
            }),
        }
    }

    fn secs(&self, var: &str, default: Duration) -> ConfigResult<Duration> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }

    fn minutes(&self, var: &str, default: Duration) -> ConfigResult<Duration> {
        self.parse(var, default.as_secs() / 60)
            .map(|m| Duration::from_secs(m * 60))
    }
}
