//! Infrastructure layer: admission state, record store, credits, render
//! provider, and the scheduler that ties them together.

pub mod config;
pub mod guard;
pub mod jobs;
pub mod ledger;
pub mod lifecycle;
pub mod metadata;
pub mod reaper;
pub mod records;
pub mod recovery;
pub mod render;
pub mod scheduler;
pub mod service;
pub mod supervisor;
pub mod tiers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, SchedulerConfig};
pub use service::{GenerationService, InMemoryPorts, Ports, ServiceError, ServiceHandle};
