/// Standalone utility to run one retention cleanup pass over the active instruments
/// Usage: cargo run --bin retention_pass --release [-- --dry-run]

use std::sync::Arc;

use barfeed::config::load_config;
use barfeed::feed::registry_from_config;
use barfeed::scheduler::RetentionCleaner;
use barfeed::store::{backend_factory, StoreClient};
use barfeed::utils::{init_tracing, now_unix};
use barfeed::resolve_timeframes;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let dry_run = std::env::args().any(|arg| arg == "--dry-run");

    let config = load_config(&config_path)?;
    init_tracing(&config.logging)?;

    println!("🧹 Retention Cleanup Pass");
    println!("=========================\n");

    let factory = backend_factory(&config.store).await?;
    let store = StoreClient::new(factory, config.store.clone()).await?;
    let registry = registry_from_config(&config.registry, Arc::clone(&store));

    let instruments = registry.active_instruments().await?;
    if instruments.is_empty() {
        println!("⚠️  No active instruments");
        return Ok(());
    }

    let now = now_unix();

    if dry_run {
        println!("📋 Dry run, nothing will be deleted\n");
        for instrument in &instruments {
            for tf in resolve_timeframes(&config.timeframes, &instrument.timeframe_overrides) {
                let keys = store.list_keys(&instrument.timeframe_path(&tf.id)).await?;
                let cutoff = now - tf.retention_seconds;
                let expired = keys
                    .iter()
                    .filter_map(|k| k.parse::<i64>().ok())
                    .filter(|ts| *ts < cutoff)
                    .count();
                println!(
                    "   {:<12} {:<4} {:>6} stored, {:>6} expired",
                    instrument.id,
                    tf.id,
                    keys.len(),
                    expired
                );
            }
        }
        return Ok(());
    }

    let cleaner = RetentionCleaner::new(Arc::clone(&store), config.timeframes.clone(), &config.cleanup);
    let report = cleaner.run_pass(&instruments, now).await;
    store.shutdown().await;

    info!("Retention pass finished: {:?}", report);
    println!("📈 Summary:");
    println!("   Instrument/timeframe pairs: {}", report.pairs);
    println!("   Bars deleted: {}", report.deleted);
    println!("   Failed pairs: {}", report.failures);
    println!("   Failed deletes: {}", report.failed_deletes);

    if report.failures > 0 || report.failed_deletes > 0 {
        anyhow::bail!(
            "{} pairs and {} deletes failed, see log for details",
            report.failures,
            report.failed_deletes
        );
    }
    Ok(())
}
