//! `reelgen-ai`
//!
//! **Responsibility:** AI text-generation boundary for job metadata.
//!
//! This crate is intentionally **not** part of the scheduler:
//! - It must not touch the record store or the in-memory job state.
//! - It produces titles/descriptions, never lifecycle decisions.
//! - Deterministic fallbacks live here so callers can degrade without the provider.

pub mod fallback;
pub mod generator;
pub mod request;
pub mod result;

pub use fallback::SmartDefaults;
pub use generator::{InMemoryTextGenerator, TextGenerator};
pub use request::MetadataRequest;
pub use result::{AiError, GeneratedMetadata};
