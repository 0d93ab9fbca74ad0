//! Admission state for generation jobs.
//!
//! - `JobStore`: in-memory queue + active set, mirrored from the durable records
//! - `QueueEntry` / `ActiveEntry`: what the store holds
//! - `RetryPolicy`: backoff for background follow-up work

pub mod store;
pub mod types;

pub use store::{JobStore, StoreSnapshot};
pub use types::{
    ActiveEntry, Admission, BackoffStrategy, QueueEntry, RetryPolicy, StepOutcome,
    estimate_wait_minutes,
};
