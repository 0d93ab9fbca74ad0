//! `reelgen-core`: domain foundation for the generation job scheduler.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the durable job record and its lifecycle, and subscription tiers.

pub mod error;
pub mod id;
pub mod job;
pub mod tier;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId};
pub use job::{JobStatus, MetadataStatus, NewVideoJob, VideoJob};
pub use tier::{Tier, TierLimits};
