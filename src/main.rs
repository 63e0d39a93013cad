/// Main entry point for the bar ingestion service
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use barfeed::{
    config::load_config,
    feed::{registry_from_config, HttpPriceSource, InstrumentRegistry, PriceSource},
    scheduler::{IngestionScheduler, IngestionService, RetentionCleaner},
    store::{backend_factory, StoreClient},
    utils::init_tracing,
    Config,
};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Application state
pub struct IngestApp {
    config: Arc<Config>,
    store: Arc<StoreClient>,
    service: IngestionService,
}

impl IngestApp {
    pub async fn new(config_path: &str) -> anyhow::Result<Self> {
        let config = load_config(config_path)
            .with_context(|| format!("loading configuration from {}", config_path))?;
        init_tracing(&config.logging)?;
        let config = Arc::new(config);

        info!("Starting bar ingestion service...");
        info!(
            "Configuration loaded: {} timeframes, store backend {:?}",
            config.timeframes.len(),
            config.store.backend
        );

        let factory = backend_factory(&config.store).await?;
        let store = StoreClient::new(factory, config.store.clone())
            .await
            .context("connecting to store")?;

        let source: Arc<dyn PriceSource> = Arc::new(HttpPriceSource::new(&config.price_source)?);
        let registry: Arc<dyn InstrumentRegistry> =
            registry_from_config(&config.registry, Arc::clone(&store));

        let scheduler = IngestionScheduler::new(
            config.scheduler.clone(),
            config.timeframes.clone(),
            source,
            Arc::clone(&store),
        );
        let cleaner = RetentionCleaner::new(
            Arc::clone(&store),
            config.timeframes.clone(),
            &config.cleanup,
        );
        let service = IngestionService::new(
            config.scheduler.clone(),
            scheduler,
            registry,
            cleaner,
            Arc::clone(&store),
        );

        Ok(IngestApp {
            config,
            store,
            service,
        })
    }

    /// Run until Ctrl-C
    pub async fn run(&self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                // keep the sender alive so the service is not stopped
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        info!(
            "Ticking every {:?}, cleanup every {:?}",
            self.config.scheduler.tick_interval(),
            self.config.scheduler.cleanup_interval()
        );
        self.service.run(shutdown_rx).await?;

        let stats = self.store.stats();
        info!(
            "Final store stats: {} successes, {} stale hits, {} reconnects",
            stats.successes, stats.stale_hits, stats.reconnects
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let app = IngestApp::new(&config_path).await?;
    app.run().await?;

    info!("Bar ingestion service stopped");
    Ok(())
}
