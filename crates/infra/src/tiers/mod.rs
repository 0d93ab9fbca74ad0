//! Subscription tiers: directory lookup, short-lived cache, and the policy on top.

pub mod cache;
pub mod directory;
pub mod policy;

pub use cache::{CacheError, InMemoryTierCache, TierCache};
pub use directory::{DirectoryError, InMemoryTierDirectory, TierDirectory};
pub use policy::TierPolicy;
