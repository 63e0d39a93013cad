/// Tick loop: batched price fetch, per-instrument aggregation and persistence
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::data::bar_aggregator::AggregatorRegistry;
use crate::error::{IngestError, Result};
use crate::feed::price_source::{PriceSource, Quote};
use crate::store::client::StoreClient;
use crate::types::{resolve_timeframes, Bar, Instrument, PriceTick, SchedulerConfig, TimeframeDefinition};
use crate::utils::time::{format_unix, now_unix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
}

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub instruments: usize,
    pub updated: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub current_writes: usize,
    pub completed_writes: usize,
    pub write_failures: usize,
    pub elapsed: Duration,
}

enum Disposition {
    Updated,
    Skipped,
    Rejected,
}

struct InstrumentOutcome {
    disposition: Disposition,
    current_writes: usize,
    completed_writes: usize,
    write_failures: usize,
}

impl InstrumentOutcome {
    fn of(disposition: Disposition) -> Self {
        InstrumentOutcome {
            disposition,
            current_writes: 0,
            completed_writes: 0,
            write_failures: 0,
        }
    }
}

pub struct IngestionScheduler {
    config: SchedulerConfig,
    timeframes: Vec<TimeframeDefinition>,
    source: Arc<dyn PriceSource>,
    store: Arc<StoreClient>,
    aggregators: AggregatorRegistry,
    instruments: RwLock<Vec<Instrument>>,
    state: Mutex<SchedulerState>,
    stop_tx: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    tick_lock: tokio::sync::Mutex<()>,
    ticks: AtomicU64,
}

impl IngestionScheduler {
    pub fn new(
        config: SchedulerConfig,
        timeframes: Vec<TimeframeDefinition>,
        source: Arc<dyn PriceSource>,
        store: Arc<StoreClient>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(true);
        Arc::new(IngestionScheduler {
            aggregators: AggregatorRegistry::new(config.out_of_order_grace_secs),
            config,
            timeframes,
            source,
            store,
            instruments: RwLock::new(Vec::new()),
            state: Mutex::new(SchedulerState::Stopped),
            stop_tx,
            ticker: Mutex::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
            ticks: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.instruments.read().clone()
    }

    pub fn aggregators(&self) -> &AggregatorRegistry {
        &self.aggregators
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Run one tick immediately, then keep ticking on the configured interval.
    /// A scheduler that is not stopped is left as is.
    pub async fn start(self: &Arc<Self>, instruments: Vec<Instrument>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SchedulerState::Stopped {
                debug!("Scheduler already {:?}, start ignored", *state);
                return Ok(());
            }
            *state = SchedulerState::Starting;
        }

        if instruments.is_empty() {
            *self.state.lock() = SchedulerState::Stopped;
            return Err(IngestError::NoActiveInstruments(
                "scheduler started without instruments".to_string(),
            ));
        }

        info!("Starting scheduler with {} instruments", instruments.len());
        *self.instruments.write() = instruments;

        let report = self.tick().await;
        log_report(&report);

        let mut state = self.state.lock();
        if *state != SchedulerState::Starting {
            info!("Scheduler stopped during its first tick");
            return Ok(());
        }

        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let scheduler = Arc::clone(self);
        let period = self.config.tick_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = scheduler.tick().await;
                        log_report(&report);
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Scheduler ticker exited");
        });

        *self.ticker.lock() = Some(handle);
        *state = SchedulerState::Running;
        info!("Scheduler running every {:?}", period);
        Ok(())
    }

    /// Stop ticking; a tick already in progress runs to completion
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == SchedulerState::Stopped {
                return;
            }
            *state = SchedulerState::Stopped;
        }

        self.stop_tx.send_replace(true);
        let handle = self.ticker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler ticker task failed: {}", e);
            }
        }
        info!("Scheduler stopped after {} ticks", self.tick_count());
    }

    /// Replace the active instrument set; removed instruments have their open
    /// bars persisted as completed before their state is dropped
    pub async fn set_instruments(&self, instruments: Vec<Instrument>) -> Result<usize> {
        let keep: HashSet<String> = instruments.iter().map(|i| i.id.clone()).collect();
        let previous: HashMap<String, Instrument> = {
            let mut current = self.instruments.write();
            std::mem::replace(&mut *current, instruments)
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect()
        };

        let keep_ids: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let removed = self.aggregators.retain(&keep_ids).await;

        let mut finalized = 0;
        for (id, aggregator) in removed {
            let bars = aggregator.lock().await.finalize_all();
            let Some(instrument) = previous.get(&id) else {
                warn!("Dropping {} open bars of unknown instrument {}", bars.len(), id);
                continue;
            };
            info!("Instrument {} removed, finalizing {} open bars", id, bars.len());

            for bar in bars {
                match self.persist_completed(instrument, &bar).await {
                    Ok(()) => finalized += 1,
                    Err(e) => error!(
                        "Failed to persist final {} bar for {}: {}",
                        bar.timeframe_id, id, e
                    ),
                }
            }
        }
        Ok(finalized)
    }

    /// One pass over every active instrument; ticks never overlap
    pub async fn tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let started = Instant::now();
        let tick_time = now_unix();
        let instruments = self.instruments();

        let mut report = TickReport {
            instruments: instruments.len(),
            ..TickReport::default()
        };
        if instruments.is_empty() {
            return report;
        }

        let quotes = self.fetch_quotes(&instruments).await;
        let pending: Vec<BoxFuture<'_, InstrumentOutcome>> = instruments
            .iter()
            .map(|instrument| {
                self.process_instrument(instrument, quotes.get(&instrument.symbol), tick_time)
                    .boxed()
            })
            .collect();
        let outcomes = join_all(pending).await;

        for outcome in outcomes {
            match outcome.disposition {
                Disposition::Updated => report.updated += 1,
                Disposition::Skipped => report.skipped += 1,
                Disposition::Rejected => report.rejected += 1,
            }
            report.current_writes += outcome.current_writes;
            report.completed_writes += outcome.completed_writes;
            report.write_failures += outcome.write_failures;
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        report.elapsed = started.elapsed();
        report
    }

    /// Fetch quotes for the distinct symbols, batches in parallel
    async fn fetch_quotes(&self, instruments: &[Instrument]) -> HashMap<String, Result<Quote>> {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = instruments
            .iter()
            .filter(|i| seen.insert(i.symbol.as_str()))
            .map(|i| i.symbol.clone())
            .collect();

        let timeout = self.config.fetch_timeout();
        let batches: Vec<BoxFuture<'_, HashMap<String, Result<Quote>>>> = symbols
            .chunks(self.config.price_batch_size.max(1))
            .map(|batch| self.fetch_batch(batch, timeout).boxed())
            .collect();

        join_all(batches).await.into_iter().flatten().collect()
    }

    async fn fetch_batch(&self, batch: &[String], timeout: Duration) -> HashMap<String, Result<Quote>> {
        match tokio::time::timeout(timeout, self.source.fetch_batch(batch)).await {
            Ok(quotes) => quotes,
            Err(_) => {
                warn!("Quote batch of {} symbols timed out after {:?}", batch.len(), timeout);
                batch
                    .iter()
                    .map(|symbol| {
                        let err = IngestError::TransientNetwork(format!(
                            "quote fetch for {} timed out",
                            symbol
                        ));
                        (symbol.clone(), Err(err))
                    })
                    .collect()
            }
        }
    }

    async fn process_instrument(
        &self,
        instrument: &Instrument,
        quote: Option<&Result<Quote>>,
        tick_time: i64,
    ) -> InstrumentOutcome {
        let quote = match quote {
            Some(Ok(quote)) => quote,
            Some(Err(e)) => {
                warn!("No price for {} ({}): {}", instrument.id, instrument.symbol, e);
                return InstrumentOutcome::of(Disposition::Skipped);
            }
            None => {
                warn!("No price for {} ({})", instrument.id, instrument.symbol);
                return InstrumentOutcome::of(Disposition::Skipped);
            }
        };

        let tick = match quote.to_tick(&instrument.id, tick_time) {
            Ok(tick) => tick,
            Err(e) => {
                warn!("Rejected quote for {}: {}", instrument.id, e);
                return InstrumentOutcome::of(Disposition::Rejected);
            }
        };

        let timeframes = resolve_timeframes(&self.timeframes, &instrument.timeframe_overrides);
        let aggregator = self.aggregators.get_or_create(&instrument.id, &timeframes).await;
        let result = {
            let mut aggregator = aggregator.lock().await;
            aggregator.update(&tick)
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!("Rejected tick for {}: {}", instrument.id, e);
                return InstrumentOutcome::of(Disposition::Rejected);
            }
        };

        let mut outcome = InstrumentOutcome::of(Disposition::Updated);

        let current_price = current_price_record(&tick);
        match self
            .store
            .set(&instrument.current_price_path(), current_price, false)
            .await
        {
            Ok(()) => outcome.current_writes += 1,
            Err(e) => {
                debug!("Current price write for {} failed: {}", instrument.id, e);
                outcome.write_failures += 1;
            }
        }

        for bar in result.current.values() {
            let path = instrument.bar_path(&bar.timeframe_id, bar.period_start);
            match self.store.set(&path, bar.to_record(), false).await {
                Ok(()) => outcome.current_writes += 1,
                Err(e) => {
                    debug!("Current bar write to {} failed: {}", path, e);
                    outcome.write_failures += 1;
                }
            }
        }

        for bar in result.completed.values() {
            match self.persist_completed(instrument, bar).await {
                Ok(()) => outcome.completed_writes += 1,
                Err(e) => {
                    error!(
                        "Failed to persist completed {} bar {} for {}: {} ({})",
                        bar.timeframe_id,
                        bar.period_start,
                        instrument.id,
                        e,
                        e.error_code()
                    );
                    outcome.write_failures += 1;
                }
            }
        }

        outcome
    }

    async fn persist_completed(&self, instrument: &Instrument, bar: &Bar) -> Result<()> {
        let path = instrument.bar_path(&bar.timeframe_id, bar.period_start);
        self.store.set(&path, bar.to_record(), true).await
    }
}

fn current_price_record(tick: &PriceTick) -> serde_json::Value {
    json!({
        "price": tick.price,
        "volume": tick.volume,
        "timestamp": tick.timestamp,
        "datetime": format_unix(tick.timestamp),
    })
}

fn log_report(report: &TickReport) {
    if report.write_failures > 0 || report.skipped > 0 || report.rejected > 0 {
        warn!(
            "Tick: {}/{} updated, {} skipped, {} rejected, {} write failures in {:?}",
            report.updated,
            report.instruments,
            report.skipped,
            report.rejected,
            report.write_failures,
            report.elapsed
        );
    } else {
        debug!(
            "Tick: {} updated, {} current / {} completed writes in {:?}",
            report.updated, report.current_writes, report.completed_writes, report.elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryBackend, MemoryBackendFactory};
    use crate::types::StoreConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted price source
    #[derive(Default)]
    struct FakeSource {
        quotes: parking_lot::Mutex<HashMap<String, Quote>>,
        failing: parking_lot::Mutex<HashSet<String>>,
        batches: parking_lot::Mutex<Vec<Vec<String>>>,
        calls: AtomicUsize,
        delay: parking_lot::Mutex<Option<Duration>>,
    }

    impl FakeSource {
        fn quote(&self, symbol: &str, price: f64, timestamp: i64) {
            self.quotes.lock().insert(
                symbol.to_string(),
                Quote {
                    price: Some(price),
                    volume: Some(100.0),
                    timestamp: Some(timestamp as f64),
                    ..Quote::default()
                },
            );
        }

        fn fail(&self, symbol: &str) {
            self.failing.lock().insert(symbol.to_string());
        }
    }

    #[async_trait]
    impl PriceSource for FakeSource {
        async fn fetch_batch(&self, symbols: &[String]) -> HashMap<String, Result<Quote>> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(symbols.to_vec());
            let quotes = self.quotes.lock();
            let failing = self.failing.lock();
            symbols
                .iter()
                .map(|symbol| {
                    let result = match quotes.get(symbol) {
                        Some(q) if !failing.contains(symbol) => Ok(q.clone()),
                        _ => Err(IngestError::InstrumentFetchFailed {
                            instrument: symbol.clone(),
                            reason: "scripted failure".to_string(),
                        }),
                    };
                    (symbol.clone(), result)
                })
                .collect()
        }
    }

    fn instrument(id: &str, symbol: &str) -> Instrument {
        Instrument {
            id: id.to_string(),
            symbol: symbol.to_string(),
            base_path: format!("{}_stc", id),
            timeframe_overrides: Vec::new(),
            active: true,
        }
    }

    async fn setup(
        batch_size: usize,
    ) -> (Arc<IngestionScheduler>, Arc<FakeSource>, Arc<MemoryBackend>, Arc<StoreClient>) {
        let backend = Arc::new(MemoryBackend::new());
        let factory = Arc::new(MemoryBackendFactory::new(Arc::clone(&backend)));
        let store = StoreClient::new(
            factory,
            StoreConfig {
                pool_size: 1,
                ..StoreConfig::default()
            },
        )
        .await
        .unwrap();
        let source = Arc::new(FakeSource::default());
        let config = SchedulerConfig {
            price_batch_size: batch_size,
            ..SchedulerConfig::default()
        };
        let timeframes = vec![
            TimeframeDefinition::new("1s", 1, 3600),
            TimeframeDefinition::new("1m", 60, 86_400),
        ];
        let scheduler = IngestionScheduler::new(
            config,
            timeframes,
            Arc::clone(&source) as Arc<dyn PriceSource>,
            Arc::clone(&store),
        );
        (scheduler, source, backend, store)
    }

    #[tokio::test]
    async fn test_completed_bar_is_written_durably() {
        let (scheduler, source, backend, store) = setup(25).await;
        *scheduler.instruments.write() = vec![instrument("gold", "XAU")];

        source.quote("XAU", 10.0, 60);
        let first = scheduler.tick().await;
        assert_eq!(first.updated, 1);
        assert_eq!(first.completed_writes, 0);
        assert_eq!(first.current_writes, 3);

        source.quote("XAU", 11.0, 61);
        let second = scheduler.tick().await;
        assert_eq!(second.completed_writes, 1);

        let bar = backend.peek("gold_stc/ohlc_1s/60").unwrap();
        assert_eq!(bar["isCompleted"], true);
        assert_eq!(bar["close"], 10.0);
        assert_eq!(bar["datetime"], "1970-01-01T00:01:00Z");

        store.shutdown().await;
        let minute = backend.peek("gold_stc/ohlc_1m/60").unwrap();
        assert_eq!(minute["high"], 11.0);
        assert_eq!(minute["isCompleted"], false);
        let price = backend.peek("gold_stc/current_price").unwrap();
        assert_eq!(price["price"], 11.0);
        assert_eq!(price["timestamp"], 61);
    }

    #[tokio::test]
    async fn test_failing_instrument_does_not_block_others() {
        let (scheduler, source, _, _) = setup(25).await;
        *scheduler.instruments.write() = vec![instrument("gold", "XAU"), instrument("oil", "WTI")];
        source.quote("XAU", 10.0, 60);
        source.quote("WTI", 70.0, 60);
        source.fail("WTI");

        let report = scheduler.tick().await;
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);
        assert!(scheduler.aggregators().get("oil").await.is_none());

        let gold = scheduler.aggregators().get("gold").await.unwrap();
        assert_eq!(gold.lock().await.open_bar("1m").unwrap().close, 10.0);
    }

    #[tokio::test]
    async fn test_symbols_are_deduplicated_and_batched() {
        let (scheduler, source, _, _) = setup(1).await;
        *scheduler.instruments.write() = vec![
            instrument("gold", "XAU"),
            instrument("gold_mini", "XAU"),
            instrument("oil", "WTI"),
        ];
        source.quote("XAU", 10.0, 60);
        source.quote("WTI", 70.0, 60);

        let report = scheduler.tick().await;
        assert_eq!(report.updated, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(source.batches.lock().iter().all(|batch| batch.len() == 1));
    }

    #[tokio::test]
    async fn test_out_of_order_and_invalid_quotes_rejected() {
        let (scheduler, source, _, _) = setup(25).await;
        *scheduler.instruments.write() = vec![instrument("gold", "XAU")];

        source.quote("XAU", 10.0, 100);
        scheduler.tick().await;

        source.quote("XAU", 9.0, 50);
        let report = scheduler.tick().await;
        assert_eq!(report.rejected, 1);

        source.quote("XAU", -1.0, 101);
        let report = scheduler.tick().await;
        assert_eq!(report.rejected, 1);

        let gold = scheduler.aggregators().get("gold").await.unwrap();
        assert_eq!(gold.lock().await.open_bar("1m").unwrap().low, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions() {
        let (scheduler, source, _, _) = setup(25).await;
        source.quote("XAU", 10.0, 60);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        assert!(matches!(
            scheduler.start(Vec::new()).await,
            Err(IngestError::NoActiveInstruments(_))
        ));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        scheduler.start(vec![instrument("gold", "XAU")]).await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(scheduler.tick_count(), 1);

        // no-op while running
        scheduler.start(vec![instrument("oil", "WTI")]).await.unwrap();
        assert_eq!(scheduler.instruments()[0].id, "gold");

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(scheduler.tick_count() >= 4);

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        let ticks = scheduler.tick_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.tick_count(), ticks);

        scheduler.start(vec![instrument("gold", "XAU")]).await.unwrap();
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_first_tick_is_not_lost() {
        let (scheduler, source, _, _) = setup(25).await;
        source.quote("XAU", 10.0, 60);
        *source.delay.lock() = Some(Duration::from_millis(500));

        let starter = Arc::clone(&scheduler);
        let start = tokio::spawn(async move { starter.start(vec![instrument("gold", "XAU")]).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.state(), SchedulerState::Starting);

        scheduler.stop().await;
        start.await.unwrap().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        let ticks = scheduler.tick_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.tick_count(), ticks);
    }

    #[tokio::test]
    async fn test_removed_instrument_bars_are_finalized() {
        let (scheduler, source, backend, _) = setup(25).await;
        *scheduler.instruments.write() = vec![instrument("gold", "XAU"), instrument("oil", "WTI")];
        source.quote("XAU", 10.0, 60);
        source.quote("WTI", 70.0, 60);
        scheduler.tick().await;

        let finalized = scheduler
            .set_instruments(vec![instrument("oil", "WTI")])
            .await
            .unwrap();
        assert_eq!(finalized, 2);
        assert_eq!(backend.peek("gold_stc/ohlc_1s/60").unwrap()["isCompleted"], true);
        assert_eq!(backend.peek("gold_stc/ohlc_1m/60").unwrap()["isCompleted"], true);
        assert!(scheduler.aggregators().get("gold").await.is_none());
        assert!(scheduler.aggregators().get("oil").await.is_some());
        assert_eq!(scheduler.instruments().len(), 1);
    }
}
