/// Retention cleanup of stored bars
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::client::StoreClient;
use crate::types::{resolve_timeframes, CleanupConfig, Instrument, TimeframeDefinition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pairs: usize,
    pub deleted: usize,
    /// Pairs whose keys could not be listed
    pub failures: usize,
    /// Expired bars that stayed behind because their delete failed
    pub failed_deletes: usize,
}

/// Result of cleaning one instrument/timeframe pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairCleanup {
    pub deleted: usize,
    pub failed: usize,
}

pub struct RetentionCleaner {
    store: Arc<StoreClient>,
    timeframes: Vec<TimeframeDefinition>,
    batch_size: usize,
    concurrency: usize,
}

impl RetentionCleaner {
    pub fn new(
        store: Arc<StoreClient>,
        timeframes: Vec<TimeframeDefinition>,
        config: &CleanupConfig,
    ) -> Self {
        RetentionCleaner {
            store,
            timeframes,
            batch_size: config.delete_batch_size.max(1),
            concurrency: config.concurrency.max(1),
        }
    }

    /// Delete bars under `{base_path}/ohlc_{timeframe_id}` older than `now - retention_seconds`.
    /// Keys that are not unix timestamps are left alone.
    pub async fn clean(
        &self,
        base_path: &str,
        timeframe_id: &str,
        retention_seconds: i64,
        now: i64,
    ) -> Result<PairCleanup> {
        let path = format!("{}/ohlc_{}", base_path.trim_end_matches('/'), timeframe_id);
        let cutoff = now - retention_seconds;

        let mut expired: Vec<i64> = self
            .store
            .list_keys(&path)
            .await?
            .iter()
            .filter_map(|key| key.parse::<i64>().ok())
            .filter(|ts| *ts < cutoff)
            .collect();
        expired.sort_unstable();

        if expired.is_empty() {
            return Ok(PairCleanup::default());
        }

        let mut deleted = 0;
        let mut failed = 0;
        for chunk in expired.chunks(self.batch_size) {
            let results: Vec<Result<()>> = stream::iter(chunk.iter().copied())
                .map(|ts| {
                    let bar_path = format!("{}/{}", path, ts);
                    async move { self.store.delete(&bar_path).await }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        failed += 1;
                        debug!("Delete under {} failed: {}", path, e);
                    }
                }
            }
        }

        if failed > 0 {
            warn!("{}: {} of {} expired bars could not be deleted", path, failed, expired.len());
        }
        debug!("{}: deleted {} bars older than {}", path, deleted, cutoff);
        Ok(PairCleanup { deleted, failed })
    }

    /// Clean every instrument and timeframe; one failing pair does not stop the pass
    pub async fn run_pass(&self, instruments: &[Instrument], now: i64) -> CleanupReport {
        let mut report = CleanupReport::default();

        for instrument in instruments {
            let timeframes = resolve_timeframes(&self.timeframes, &instrument.timeframe_overrides);
            for tf in &timeframes {
                report.pairs += 1;
                match self
                    .clean(&instrument.base_path, &tf.id, tf.retention_seconds, now)
                    .await
                {
                    Ok(pair) => {
                        report.deleted += pair.deleted;
                        report.failed_deletes += pair.failed;
                    }
                    Err(e) => {
                        report.failures += 1;
                        warn!(
                            "Cleanup of {} {} failed: {} ({})",
                            instrument.id,
                            tf.id,
                            e,
                            e.error_code()
                        );
                    }
                }
            }
        }

        info!(
            "Cleanup pass: {} bars deleted across {} pairs ({} pairs failed, {} deletes failed)",
            report.deleted, report.pairs, report.failures, report.failed_deletes
        );
        report
    }
}
