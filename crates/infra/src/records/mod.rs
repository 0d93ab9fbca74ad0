//! Durable job records boundary.
//!
//! The record store is the source of truth for job status. The in-memory
//! scheduler state is reconciled against it; never the other way around.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;
pub use r#trait::{JobRepository, REQUIRED_COLUMNS, RecordError, SchemaSupport};
