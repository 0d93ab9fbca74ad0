//! Runtime wiring: builds every component from the ports and runs the
//! background loops.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use reelgen_ai::{InMemoryTextGenerator, TextGenerator};

use crate::config::{ConfigError, SchedulerConfig};
use crate::guard::ConcurrencyGuard;
use crate::jobs::JobStore;
use crate::ledger::{CreditLedger, InMemoryCreditLedger};
use crate::lifecycle::{DrainTrigger, LifecycleHandler};
use crate::metadata::MetadataGenerator;
use crate::reaper::{ReaperService, SweepReport};
use crate::records::{InMemoryJobRepository, JobRepository};
use crate::recovery::{Recovery, RecoveryReport};
use crate::render::{InMemoryRenderProvider, RenderProvider};
use crate::scheduler::Scheduler;
use crate::supervisor::RenderSupervisor;
use crate::tiers::{InMemoryTierCache, InMemoryTierDirectory, TierCache, TierDirectory, TierPolicy};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("service already started")]
    AlreadyStarted,
}

/// External collaborators the scheduler depends on.
#[derive(Clone)]
pub struct Ports {
    pub records: Arc<dyn JobRepository>,
    pub ledger: Arc<dyn CreditLedger>,
    pub provider: Arc<dyn RenderProvider>,
    pub text: Arc<dyn TextGenerator>,
    pub directory: Arc<dyn TierDirectory>,
    pub tier_cache: Arc<dyn TierCache>,
}

/// In-memory adapters with their concrete types kept, for dev and tests.
#[derive(Clone)]
pub struct InMemoryPorts {
    pub records: Arc<InMemoryJobRepository>,
    pub ledger: Arc<InMemoryCreditLedger>,
    pub provider: Arc<InMemoryRenderProvider>,
    pub text: Arc<InMemoryTextGenerator>,
    pub directory: Arc<InMemoryTierDirectory>,
    pub tier_cache: Arc<InMemoryTierCache>,
}

impl InMemoryPorts {
    pub fn new(provider: InMemoryRenderProvider, text: InMemoryTextGenerator) -> Self {
        Self {
            records: Arc::new(InMemoryJobRepository::new()),
            ledger: Arc::new(InMemoryCreditLedger::new()),
            provider: Arc::new(provider),
            text: Arc::new(text),
            directory: Arc::new(InMemoryTierDirectory::new()),
            tier_cache: Arc::new(InMemoryTierCache::new()),
        }
    }

    pub fn with_ledger(mut self, ledger: InMemoryCreditLedger) -> Self {
        self.ledger = Arc::new(ledger);
        self
    }

    pub fn ports(&self) -> Ports {
        Ports {
            records: self.records.clone(),
            ledger: self.ledger.clone(),
            provider: self.provider.clone(),
            text: self.text.clone(),
            directory: self.directory.clone(),
            tier_cache: self.tier_cache.clone(),
        }
    }
}

impl Default for InMemoryPorts {
    fn default() -> Self {
        Self::new(InMemoryRenderProvider::new(), InMemoryTextGenerator::new())
    }
}

pub struct GenerationService {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    guard: Arc<ConcurrencyGuard>,
    reaper: Arc<ReaperService>,
    lifecycle: Arc<LifecycleHandler>,
    scheduler: Arc<Scheduler>,
    recovery: Arc<Recovery>,
    drain: DrainTrigger,
    drain_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GenerationService {
    pub fn new(config: SchedulerConfig, ports: Ports) -> Result<Arc<Self>, ServiceError> {
        config.validate()?;

        let store = Arc::new(JobStore::new());
        let tiers = Arc::new(TierPolicy::new(
            ports.directory,
            ports.tier_cache,
            config.tier_limits,
            config.tier_cache_ttl,
            config.default_locale.clone(),
        ));
        let (drain, drain_rx) = DrainTrigger::channel();

        let guard = Arc::new(ConcurrencyGuard::new(
            store.clone(),
            ports.records.clone(),
            tiers.clone(),
        ));
        let reaper = Arc::new(ReaperService::new(
            store.clone(),
            ports.records.clone(),
            ports.ledger.clone(),
            tiers.clone(),
            config.reaper(),
        ));
        let lifecycle = Arc::new(LifecycleHandler::new(
            store.clone(),
            ports.records.clone(),
            ports.ledger.clone(),
            tiers.clone(),
            drain.clone(),
            config.drain_delay,
        ));
        let metadata = Arc::new(MetadataGenerator::new(
            ports.text,
            ports.records.clone(),
            config.metadata(),
        ));
        let supervisor = Arc::new(RenderSupervisor::new(
            ports.provider,
            ports.records.clone(),
            lifecycle.clone(),
            reaper.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            ports.records.clone(),
            ports.ledger,
            tiers,
            guard.clone(),
            metadata,
            supervisor.clone(),
            reaper.clone(),
            config.scheduler_settings(),
        ));
        let recovery = Arc::new(Recovery::new(
            store.clone(),
            ports.records,
            reaper.clone(),
            supervisor,
            lifecycle.clone(),
            config.recovery(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            guard,
            reaper,
            lifecycle,
            scheduler,
            recovery,
            drain,
            drain_rx: Mutex::new(Some(drain_rx)),
        }))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    pub fn reaper(&self) -> &Arc<ReaperService> {
        &self.reaper
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleHandler> {
        &self.lifecycle
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn recovery(&self) -> &Arc<Recovery> {
        &self.recovery
    }

    /// Wake the drain loop now. Coalesces with pending requests.
    pub fn request_drain(&self) -> bool {
        self.drain.fire()
    }

    /// Run recovery once, then spawn the drain and reaper loops.
    pub async fn start(self: &Arc<Self>) -> Result<ServiceHandle, ServiceError> {
        let drain_rx = self
            .drain_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;

        let recovery = self.recovery.run().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(Arc::clone(self).drain_loop(drain_rx, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).reaper_loop(shutdown_rx)),
        ];
        info!(
            system_max_concurrent = self.config.system_max_concurrent,
            recovered_active = recovery.restored_active,
            recovered_queued = recovery.restored_queued,
            "generation service started"
        );
        self.drain.fire();

        Ok(ServiceHandle {
            shutdown: shutdown_tx,
            tasks,
            recovery,
        })
    }

    async fn drain_loop(
        self: Arc<Self>,
        mut drain_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                signal = drain_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }
            let report = self.scheduler.process_queue().await;
            if !report.promoted.is_empty() {
                debug!(promoted = report.promoted.len(), "drain tick promoted jobs");
            }
        }
        debug!("drain loop stopped");
    }

    async fn reaper_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Recovery has just reconciled state; skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let swept = match self.reaper.sweep().await {
                SweepReport::Completed(report) => report.zombies.len(),
                SweepReport::Skipped { .. } => 0,
            };
            let released = self.guard.cleanup_all_invalid().await.removed.len();
            if swept + released > 0 {
                self.drain.fire();
            }
        }
        debug!("reaper loop stopped");
    }
}

/// Handle to stop the background loops.
#[derive(Debug)]
pub struct ServiceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl ServiceHandle {
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Signal the loops and wait for them to exit. In-flight renders keep
    /// running until the runtime shuts down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("generation service stopped");
    }
}
