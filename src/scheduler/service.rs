/// Supervisor around the scheduler: startup retries, instrument refresh and cleanup timers
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::feed::registry::InstrumentRegistry;
use crate::scheduler::cleaner::{CleanupReport, RetentionCleaner};
use crate::scheduler::ingestion::{IngestionScheduler, SchedulerState};
use crate::store::client::StoreClient;
use crate::types::SchedulerConfig;
use crate::utils::time::now_unix;

pub struct IngestionService {
    config: SchedulerConfig,
    scheduler: Arc<IngestionScheduler>,
    registry: Arc<dyn InstrumentRegistry>,
    cleaner: RetentionCleaner,
    store: Arc<StoreClient>,
}

impl IngestionService {
    pub fn new(
        config: SchedulerConfig,
        scheduler: Arc<IngestionScheduler>,
        registry: Arc<dyn InstrumentRegistry>,
        cleaner: RetentionCleaner,
        store: Arc<StoreClient>,
    ) -> Self {
        IngestionService {
            config,
            scheduler,
            registry,
            cleaner,
            store,
        }
    }

    pub fn scheduler(&self) -> &Arc<IngestionScheduler> {
        &self.scheduler
    }

    /// Run until `shutdown` flips to true, then stop the scheduler and flush the store
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.store.start();

        if !self.initialize(&mut shutdown).await && *shutdown.borrow() {
            return self.shutdown().await;
        }

        let refresh_every = self.config.refresh_interval();
        let cleanup_every = self.config.cleanup_interval();
        let mut refresh = tokio::time::interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval_at(Instant::now() + cleanup_every, cleanup_every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh.tick() => self.refresh().await,
                _ = cleanup.tick() => {
                    self.cleanup().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down ingestion service");
        self.scheduler.stop().await;
        self.store.shutdown().await;

        let stats = self.store.stats();
        info!(
            "Store totals: {} requests, {} failures, {} retries, {} dropped writes",
            stats.requests, stats.failures, stats.retries, stats.dropped_writes
        );
        Ok(())
    }

    /// Poll the registry until it yields instruments; false when attempts run out
    async fn initialize(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let attempts = self.config.init_max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.registry.active_instruments().await {
                Ok(instruments) if !instruments.is_empty() => {
                    match self.scheduler.start(instruments).await {
                        Ok(()) => return true,
                        Err(e) => warn!("Scheduler start failed: {}", e),
                    }
                }
                Ok(_) => warn!(
                    "No active instruments (attempt {}/{})",
                    attempt, attempts
                ),
                Err(e) if !e.is_recoverable() => {
                    error!("Instrument registry failed permanently: {} ({})", e, e.error_code());
                    return false;
                }
                Err(e) => warn!(
                    "Instrument registry unavailable (attempt {}/{}): {}",
                    attempt, attempts, e
                ),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.init_retry_delay()) => {}
                    _ = shutdown.changed() => return false,
                }
            }
        }

        error!(
            "Giving up initialization after {} attempts, waiting for instrument refresh",
            attempts
        );
        false
    }

    /// Reconcile the scheduler with the registry
    pub async fn refresh(&self) {
        let instruments = match self.registry.active_instruments().await {
            Ok(instruments) => instruments,
            Err(e) => {
                warn!("Instrument refresh failed, keeping current set: {}", e);
                return;
            }
        };

        if instruments.is_empty() {
            if self.scheduler.state() != SchedulerState::Stopped {
                warn!("No active instruments, stopping scheduler");
                self.scheduler.stop().await;
            }
            return;
        }

        if self.scheduler.state() == SchedulerState::Stopped {
            if let Err(e) = self.scheduler.start(instruments).await {
                error!("Scheduler restart failed: {}", e);
            }
            return;
        }

        let count = instruments.len();
        match self.scheduler.set_instruments(instruments).await {
            Ok(finalized) => info!(
                "Instrument set refreshed: {} active, {} bars finalized",
                count, finalized
            ),
            Err(e) => error!("Instrument refresh failed: {}", e),
        }
    }

    /// Retention pass over the active instruments, plus cache maintenance
    pub async fn cleanup(&self) -> CleanupReport {
        let instruments = self.scheduler.instruments();
        let report = if instruments.is_empty() {
            CleanupReport::default()
        } else {
            self.cleaner.run_pass(&instruments, now_unix()).await
        };
        self.store.purge_cache();
        report
    }
}
