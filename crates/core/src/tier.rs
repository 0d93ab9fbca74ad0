//! Subscription tiers and their concurrency allowances.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Subscription level of a user.
///
/// Annual variants alias to their monthly base tier for limit purposes only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Premium,
    BasicAnnual,
    ProAnnual,
    PremiumAnnual,
}

impl Tier {
    /// The lowest tier; used whenever a lookup cannot be resolved.
    pub const fn lowest() -> Self {
        Tier::Free
    }

    /// Monthly tier whose limits apply to this tier.
    pub fn base(&self) -> Tier {
        match self {
            Tier::BasicAnnual => Tier::Basic,
            Tier::ProAnnual => Tier::Pro,
            Tier::PremiumAnnual => Tier::Premium,
            other => *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
            Tier::BasicAnnual => "basic_annual",
            Tier::ProAnnual => "pro_annual",
            Tier::PremiumAnnual => "premium_annual",
        }
    }

    /// Human-readable plan name (annual variants share the base name).
    pub fn display_name(&self) -> &'static str {
        match self.base() {
            Tier::Free => "Free",
            Tier::Basic => "Basic",
            Tier::Pro => "Pro",
            _ => "Premium",
        }
    }

    /// Next monthly tier up, if any.
    pub fn upgrade_target(&self) -> Option<Tier> {
        match self.base() {
            Tier::Free => Some(Tier::Basic),
            Tier::Basic => Some(Tier::Pro),
            Tier::Pro => Some(Tier::Premium),
            _ => None,
        }
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "premium" => Ok(Tier::Premium),
            "basic_annual" | "basic-annual" => Ok(Tier::BasicAnnual),
            "pro_annual" | "pro-annual" => Ok(Tier::ProAnnual),
            "premium_annual" | "premium-annual" => Ok(Tier::PremiumAnnual),
            other => Err(DomainError::unknown("tier", other)),
        }
    }
}

/// Static per-tier concurrency allowances (monthly tiers only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub free: u32,
    pub basic: u32,
    pub pro: u32,
    pub premium: u32,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: 1,
            basic: 2,
            pro: 3,
            premium: 5,
        }
    }
}

impl TierLimits {
    pub fn limit_for(&self, tier: Tier) -> u32 {
        match tier.base() {
            Tier::Free => self.free,
            Tier::Basic => self.basic,
            Tier::Pro => self.pro,
            _ => self.premium,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        for (name, value) in [
            ("free", self.free),
            ("basic", self.basic),
            ("pro", self.pro),
            ("premium", self.premium),
        ] {
            if value == 0 {
                return Err(DomainError::validation(format!(
                    "tier limit for {name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annual_tiers_alias_to_base_limits() {
        let limits = TierLimits::default();
        assert_eq!(limits.limit_for(Tier::ProAnnual), limits.limit_for(Tier::Pro));
        assert_eq!(limits.limit_for(Tier::BasicAnnual), 2);
        assert_eq!(limits.limit_for(Tier::PremiumAnnual), 5);
        assert_eq!(limits.limit_for(Tier::lowest()), 1);
    }

    #[test]
    fn parse_accepts_both_separators() {
        assert_eq!("Pro-Annual".parse::<Tier>().unwrap(), Tier::ProAnnual);
        assert_eq!("premium_annual".parse::<Tier>().unwrap(), Tier::PremiumAnnual);
        assert!("enterprise".parse::<Tier>().is_err());
    }

    #[test]
    fn zero_limit_is_rejected() {
        let limits = TierLimits {
            basic: 0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn premium_has_no_upgrade_target() {
        assert_eq!(Tier::Free.upgrade_target(), Some(Tier::Basic));
        assert_eq!(Tier::PremiumAnnual.upgrade_target(), None);
    }
}
