//! Service wiring for the HTTP surface.
//!
//! Everything except the record store is in-memory. With `DATABASE_URL` set,
//! job records go to Postgres (schema in `crates/infra/migrations`).

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use thiserror::Error;

use reelgen_ai::InMemoryTextGenerator;
use reelgen_infra::ledger::InMemoryCreditLedger;
use reelgen_infra::records::PostgresJobRepository;
use reelgen_infra::render::InMemoryRenderProvider;
use reelgen_infra::{GenerationService, InMemoryPorts, SchedulerConfig, ServiceError};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Knobs for the in-memory adapters used outside production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevOptions {
    /// Balance granted to users the ledger has never seen.
    pub starting_credits: i64,
    /// How long the simulated renderer takes before reporting completion.
    pub render_duration: Duration,
}

impl Default for DevOptions {
    fn default() -> Self {
        Self {
            starting_credits: 1_000,
            render_duration: Duration::from_secs(30),
        }
    }
}

impl DevOptions {
    /// Reads `REELGEN_DEV_CREDITS` and `REELGEN_DEV_RENDER_SECS`; invalid values keep defaults.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(credits) = parse_env::<i64>("REELGEN_DEV_CREDITS") {
            options.starting_credits = credits;
        }
        if let Some(secs) = parse_env::<u64>("REELGEN_DEV_RENDER_SECS") {
            options.render_duration = Duration::from_secs(secs);
        }
        options
    }

    pub fn ports(&self) -> InMemoryPorts {
        InMemoryPorts::new(
            InMemoryRenderProvider::new().with_auto_complete(self.render_duration),
            InMemoryTextGenerator::new(),
        )
        .with_ledger(InMemoryCreditLedger::new().with_starting_balance(self.starting_credits))
    }
}

fn parse_env<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring invalid value");
            None
        }
    }
}

pub struct AppServices {
    pub generation: Arc<GenerationService>,
}

impl AppServices {
    pub fn new(generation: Arc<GenerationService>) -> Self {
        Self { generation }
    }

    /// Fully in-memory wiring over caller-owned adapters.
    pub fn in_memory(config: SchedulerConfig, ports: &InMemoryPorts) -> Result<Self, BuildError> {
        Ok(Self::new(GenerationService::new(config, ports.ports())?))
    }

    pub async fn build(
        config: SchedulerConfig,
        database_url: Option<&str>,
        dev: DevOptions,
    ) -> Result<Self, BuildError> {
        let in_memory = dev.ports();
        let Some(url) = database_url else {
            tracing::warn!("DATABASE_URL not set; job records are kept in memory");
            return Self::in_memory(config, &in_memory);
        };

        let pool = PgPool::connect(url).await?;
        let mut ports = in_memory.ports();
        ports.records = Arc::new(PostgresJobRepository::new(pool));
        tracing::info!("job records stored in Postgres");
        Ok(Self::new(GenerationService::new(config, ports)?))
    }
}
