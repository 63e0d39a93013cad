/// Multi-timeframe bar aggregation from live ticks
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::types::{Bar, PriceTick, TimeframeDefinition};
use crate::utils::time::period_start;

/// Bars produced by one tick, keyed by timeframe id
#[derive(Debug, Clone, Default)]
pub struct AggregationResult {
    pub completed: HashMap<String, Bar>,
    pub current: HashMap<String, Bar>,
}

/// Open bars of every timeframe for a single instrument
pub struct TimeframeAggregator {
    instrument_id: String,
    timeframes: Vec<TimeframeDefinition>,
    open_bars: HashMap<String, Bar>,
    last_timestamp: Option<i64>,
    grace_seconds: i64,
}

impl TimeframeAggregator {
    pub fn new(instrument_id: &str, timeframes: Vec<TimeframeDefinition>, grace_seconds: i64) -> Self {
        TimeframeAggregator {
            instrument_id: instrument_id.to_string(),
            timeframes,
            open_bars: HashMap::new(),
            last_timestamp: None,
            grace_seconds,
        }
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn timeframes(&self) -> &[TimeframeDefinition] {
        &self.timeframes
    }

    /// Fold a tick into every timeframe
    pub fn update(&mut self, tick: &PriceTick) -> Result<AggregationResult> {
        validate_tick(tick)?;

        if let Some(last) = self.last_timestamp {
            if tick.timestamp < last - self.grace_seconds {
                return Err(IngestError::OutOfOrderTick(format!(
                    "{} tick at {} is {}s behind {}",
                    self.instrument_id,
                    tick.timestamp,
                    last - tick.timestamp,
                    last
                )));
            }
        }

        let late = self.last_timestamp.is_some_and(|last| tick.timestamp < last);
        let mut result = AggregationResult::default();

        for tf in &self.timeframes {
            let start = period_start(tick.timestamp, tf.duration_seconds);

            match self.open_bars.get_mut(&tf.id) {
                Some(bar) if bar.period_start == start => {
                    if late {
                        bar.widen(tick.price);
                    } else {
                        bar.apply(tick.price, tick.volume);
                    }
                }
                // Late tick for a period already rolled past
                Some(bar) if bar.period_start > start => {}
                Some(bar) => {
                    let completed = bar.completed();
                    debug!(
                        "Bar completed: {} {} @ {} - O:{:.4} H:{:.4} L:{:.4} C:{:.4} V:{}",
                        self.instrument_id,
                        tf.id,
                        completed.period_start,
                        completed.open,
                        completed.high,
                        completed.low,
                        completed.close,
                        completed.volume
                    );
                    result.completed.insert(tf.id.clone(), completed);
                    *bar = Bar::open_at(&tf.id, start, tick.price, tick.volume);
                }
                None => {
                    self.open_bars
                        .insert(tf.id.clone(), Bar::open_at(&tf.id, start, tick.price, tick.volume));
                }
            }

            if let Some(bar) = self.open_bars.get(&tf.id) {
                result.current.insert(tf.id.clone(), bar.clone());
            }
        }

        self.last_timestamp = Some(self.last_timestamp.map_or(tick.timestamp, |last| last.max(tick.timestamp)));

        Ok(result)
    }

    pub fn open_bar(&self, timeframe_id: &str) -> Option<&Bar> {
        self.open_bars.get(timeframe_id)
    }

    pub fn open_bars(&self) -> Vec<Bar> {
        self.timeframes
            .iter()
            .filter_map(|tf| self.open_bars.get(&tf.id).cloned())
            .collect()
    }

    /// Force-complete every open bar (instrument deactivated)
    pub fn finalize_all(&mut self) -> Vec<Bar> {
        let finalized: Vec<Bar> = self
            .timeframes
            .iter()
            .filter_map(|tf| self.open_bars.remove(&tf.id))
            .map(|bar| bar.completed())
            .collect();
        self.last_timestamp = None;
        finalized
    }

    /// Drop all open bars
    pub fn reset(&mut self) {
        self.open_bars.clear();
        self.last_timestamp = None;
    }
}

fn validate_tick(tick: &PriceTick) -> Result<()> {
    if !tick.price.is_finite() || tick.price <= 0.0 {
        return Err(IngestError::Validation(format!(
            "{} price {} is not a positive number",
            tick.instrument_id, tick.price
        )));
    }
    if !tick.volume.is_finite() || tick.volume < 0.0 {
        return Err(IngestError::Validation(format!(
            "{} volume {} is invalid",
            tick.instrument_id, tick.volume
        )));
    }
    Ok(())
}

/// Per-instrument aggregators, each behind its own lock
pub struct AggregatorRegistry {
    aggregators: RwLock<HashMap<String, Arc<Mutex<TimeframeAggregator>>>>,
    grace_seconds: i64,
}

impl AggregatorRegistry {
    pub fn new(grace_seconds: i64) -> Self {
        AggregatorRegistry {
            aggregators: RwLock::new(HashMap::new()),
            grace_seconds,
        }
    }

    /// Aggregator for an instrument, created on first use
    pub async fn get_or_create(
        &self,
        instrument_id: &str,
        timeframes: &[TimeframeDefinition],
    ) -> Arc<Mutex<TimeframeAggregator>> {
        {
            let aggregators = self.aggregators.read().await;
            if let Some(existing) = aggregators.get(instrument_id) {
                return Arc::clone(existing);
            }
        }

        let mut aggregators = self.aggregators.write().await;
        let entry = aggregators.entry(instrument_id.to_string()).or_insert_with(|| {
            info!("Added aggregator: {} ({} timeframes)", instrument_id, timeframes.len());
            Arc::new(Mutex::new(TimeframeAggregator::new(
                instrument_id,
                timeframes.to_vec(),
                self.grace_seconds,
            )))
        });
        Arc::clone(entry)
    }

    pub async fn get(&self, instrument_id: &str) -> Option<Arc<Mutex<TimeframeAggregator>>> {
        let aggregators = self.aggregators.read().await;
        aggregators.get(instrument_id).cloned()
    }

    /// Remove an instrument's aggregator, returning it so open bars can be finalized
    pub async fn remove(&self, instrument_id: &str) -> Option<Arc<Mutex<TimeframeAggregator>>> {
        let mut aggregators = self.aggregators.write().await;
        aggregators.remove(instrument_id)
    }

    /// Keep only aggregators of `active` instruments; the dropped ones are returned
    pub async fn retain(
        &self,
        active: &HashSet<&str>,
    ) -> Vec<(String, Arc<Mutex<TimeframeAggregator>>)> {
        let mut aggregators = self.aggregators.write().await;
        let stale: Vec<String> = aggregators
            .keys()
            .filter(|id| !active.contains(id.as_str()))
            .cloned()
            .collect();
        stale
            .into_iter()
            .filter_map(|id| aggregators.remove(&id).map(|aggregator| (id, aggregator)))
            .collect()
    }

    /// Drop all open bars for an instrument
    pub async fn reset(&self, instrument_id: &str) {
        if let Some(aggregator) = self.get(instrument_id).await {
            aggregator.lock().await.reset();
            info!("Reset aggregator: {}", instrument_id);
        }
    }

    pub async fn instrument_ids(&self) -> Vec<String> {
        let aggregators = self.aggregators.read().await;
        aggregators.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.aggregators.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::default_timeframes;
    use quickcheck_macros::quickcheck;

    fn tick(timestamp: i64, price: f64, volume: f64) -> PriceTick {
        PriceTick {
            instrument_id: "stc".to_string(),
            price,
            volume,
            timestamp,
        }
    }

    fn one_minute() -> Vec<TimeframeDefinition> {
        vec![TimeframeDefinition::new("1m", 60, 86_400)]
    }

    #[test]
    fn test_one_minute_rollover() {
        let mut agg = TimeframeAggregator::new("stc", one_minute(), 2);

        assert!(agg.update(&tick(0, 100.0, 1.0)).unwrap().completed.is_empty());
        assert!(agg.update(&tick(30, 110.0, 2.0)).unwrap().completed.is_empty());
        let before = agg.update(&tick(59, 90.0, 3.0)).unwrap();
        assert!(before.completed.is_empty());
        assert!(!before.current["1m"].is_completed);

        let result = agg.update(&tick(60, 120.0, 4.0)).unwrap();
        let done = &result.completed["1m"];
        assert_eq!(done.period_start, 0);
        assert_eq!((done.open, done.high, done.low, done.close), (100.0, 110.0, 90.0, 90.0));
        assert!(done.is_completed);

        let current = &result.current["1m"];
        assert_eq!(current.period_start, 60);
        assert_eq!((current.open, current.high, current.low, current.close), (120.0, 120.0, 120.0, 120.0));
        assert!(!current.is_completed);
    }

    #[test]
    fn test_volume_is_latest_reading() {
        let mut agg = TimeframeAggregator::new("stc", one_minute(), 2);
        agg.update(&tick(0, 100.0, 500.0)).unwrap();
        let result = agg.update(&tick(10, 101.0, 800.0)).unwrap();

        assert_eq!(result.current["1m"].volume, 800.0);
    }

    #[test]
    fn test_every_timeframe_reported_each_tick() {
        let mut agg = TimeframeAggregator::new("stc", default_timeframes(), 2);
        agg.update(&tick(1_700_000_000, 10.0, 1.0)).unwrap();
        let result = agg.update(&tick(1_700_000_001, 11.0, 1.0)).unwrap();

        assert_eq!(result.current.len(), 8);
        // only the 1s bucket rolls over
        assert_eq!(result.completed.len(), 1);
        assert!(result.completed.contains_key("1s"));
    }

    #[test]
    fn test_out_of_order_beyond_grace_rejected() {
        let mut agg = TimeframeAggregator::new("stc", one_minute(), 2);
        agg.update(&tick(120, 100.0, 1.0)).unwrap();

        let err = agg.update(&tick(100, 50.0, 1.0)).unwrap_err();
        assert!(matches!(err, IngestError::OutOfOrderTick(_)));
        assert_eq!(agg.open_bar("1m").unwrap().low, 100.0);
    }

    #[test]
    fn test_late_tick_within_grace_never_rolls_back() {
        let mut agg = TimeframeAggregator::new("stc", one_minute(), 2);
        agg.update(&tick(59, 100.0, 1.0)).unwrap();
        agg.update(&tick(60, 101.0, 1.0)).unwrap();

        let result = agg.update(&tick(59, 80.0, 1.0)).unwrap();
        assert!(result.completed.is_empty());
        assert_eq!(result.current["1m"].period_start, 60);
        assert_eq!(result.current["1m"].low, 101.0);
    }

    #[test]
    fn test_late_tick_widens_range_but_keeps_close() {
        let timeframes = vec![
            TimeframeDefinition::new("1s", 1, 600),
            TimeframeDefinition::new("1m", 60, 86_400),
        ];
        let mut agg = TimeframeAggregator::new("stc", timeframes, 2);
        agg.update(&tick(1_700_000_041, 105.0, 7.0)).unwrap();

        let result = agg.update(&tick(1_700_000_040, 80.0, 3.0)).unwrap();
        let minute = &result.current["1m"];
        assert_eq!(minute.close, 105.0);
        assert_eq!(minute.low, 80.0);
        assert_eq!(minute.volume, 7.0);
        assert_eq!(result.current["1s"].close, minute.close);
    }

    #[test]
    fn test_invalid_price_rejected() {
        let mut agg = TimeframeAggregator::new("stc", one_minute(), 2);
        assert!(matches!(
            agg.update(&tick(0, f64::NAN, 1.0)),
            Err(IngestError::Validation(_))
        ));
        assert!(agg.update(&tick(0, 0.0, 1.0)).is_err());
        assert!(agg.update(&tick(0, 1.0, -1.0)).is_err());
        assert!(agg.open_bars().is_empty());
    }

    #[test]
    fn test_finalize_and_reset() {
        let mut agg = TimeframeAggregator::new("stc", default_timeframes(), 2);
        agg.update(&tick(1_700_000_000, 10.0, 1.0)).unwrap();

        let finalized = agg.finalize_all();
        assert_eq!(finalized.len(), 8);
        assert!(finalized.iter().all(|b| b.is_completed));
        assert!(agg.open_bars().is_empty());

        agg.update(&tick(1_700_000_100, 10.0, 1.0)).unwrap();
        agg.reset();
        assert!(agg.open_bar("1m").is_none());
    }

    #[tokio::test]
    async fn test_registry_lazily_creates_and_resets() {
        let registry = AggregatorRegistry::new(2);
        let first = registry.get_or_create("stc", &one_minute()).await;
        let again = registry.get_or_create("stc", &one_minute()).await;
        assert!(Arc::ptr_eq(&first, &again));

        first.lock().await.update(&tick(0, 1.0, 0.0)).unwrap();
        registry.reset("stc").await;
        assert!(first.lock().await.open_bar("1m").is_none());

        assert!(registry.remove("stc").await.is_some());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_registry_retain_returns_dropped() {
        let registry = AggregatorRegistry::new(2);
        registry.get_or_create("gold", &one_minute()).await;
        registry.get_or_create("oil", &one_minute()).await;

        let active: HashSet<&str> = ["oil"].into_iter().collect();
        let dropped = registry.retain(&active).await;

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, "gold");
        assert_eq!(registry.instrument_ids().await, vec!["oil".to_string()]);
    }

    /// Monotone tick sequences keep OHLC ordering and strictly increasing completed periods
    #[quickcheck]
    fn prop_bars_stay_consistent(steps: Vec<(u8, u16)>) -> bool {
        let mut agg = TimeframeAggregator::new("stc", default_timeframes(), 0);
        let mut timestamp = 1_700_000_000i64;
        let mut last_completed: HashMap<String, i64> = HashMap::new();

        for (gap, raw_price) in steps {
            timestamp += gap as i64;
            let price = 1.0 + raw_price as f64;
            let result = match agg.update(&tick(timestamp, price, 1.0)) {
                Ok(result) => result,
                Err(_) => return false,
            };

            for bar in result.completed.values().chain(result.current.values()) {
                if bar.low > bar.open.min(bar.close) || bar.high < bar.open.max(bar.close) {
                    return false;
                }
            }
            for (tf, bar) in &result.completed {
                if !bar.is_completed {
                    return false;
                }
                if let Some(prev) = last_completed.insert(tf.clone(), bar.period_start) {
                    if prev >= bar.period_start {
                        return false;
                    }
                }
            }
            if result.current.values().any(|b| b.is_completed) {
                return false;
            }
        }
        true
    }
}
