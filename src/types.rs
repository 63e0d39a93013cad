/// Core type definitions for the ingestion pipeline
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::time::format_unix;

/// One price observation for an instrument
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub instrument_id: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: i64,
}

/// OHLC bar for one timeframe period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    #[serde(rename = "timeframe")]
    pub timeframe_id: String,
    #[serde(rename = "timestamp")]
    pub period_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_completed: bool,
}

impl Bar {
    pub fn open_at(timeframe_id: &str, period_start: i64, price: f64, volume: f64) -> Self {
        Bar {
            timeframe_id: timeframe_id.to_string(),
            period_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            is_completed: false,
        }
    }

    /// Fold another sample from the same period into the bar
    pub fn apply(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        // Upstream reports cumulative volume, the latest reading replaces it
        self.volume = volume;
    }

    /// Fold in a sample older than the newest one seen: range only
    pub fn widen(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
    }

    /// Copy of the bar marked completed
    pub fn completed(&self) -> Bar {
        Bar {
            is_completed: true,
            ..self.clone()
        }
    }

    /// JSON record written to the store, with a readable datetime alongside
    pub fn to_record(&self) -> serde_json::Value {
        let mut record = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = record.as_object_mut() {
            map.insert(
                "datetime".to_string(),
                serde_json::Value::String(format_unix(self.period_start)),
            );
        }
        record
    }
}

/// Fixed bar duration and how long its bars are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeDefinition {
    pub id: String,
    pub duration_seconds: i64,
    pub retention_seconds: i64,
}

impl TimeframeDefinition {
    pub fn new(id: &str, duration_seconds: i64, retention_seconds: i64) -> Self {
        TimeframeDefinition {
            id: id.to_string(),
            duration_seconds,
            retention_seconds,
        }
    }
}

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// The eight buckets maintained for every instrument unless overridden
pub fn default_timeframes() -> Vec<TimeframeDefinition> {
    vec![
        TimeframeDefinition::new("1s", 1, HOUR),
        TimeframeDefinition::new("1m", 60, DAY),
        TimeframeDefinition::new("5m", 300, 3 * DAY),
        TimeframeDefinition::new("15m", 900, 7 * DAY),
        TimeframeDefinition::new("30m", 1800, 14 * DAY),
        TimeframeDefinition::new("1h", HOUR, 30 * DAY),
        TimeframeDefinition::new("4h", 4 * HOUR, 90 * DAY),
        TimeframeDefinition::new("1d", DAY, 365 * DAY),
    ]
}

/// Apply per-instrument overrides: same id replaces, new id appends
pub fn resolve_timeframes(
    defaults: &[TimeframeDefinition],
    overrides: &[TimeframeDefinition],
) -> Vec<TimeframeDefinition> {
    let mut resolved = defaults.to_vec();
    for tf in overrides {
        match resolved.iter_mut().find(|d| d.id == tf.id) {
            Some(existing) => *existing = tf.clone(),
            None => resolved.push(tf.clone()),
        }
    }
    resolved
}

/// Tradable instrument as provided by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub symbol: String,
    pub base_path: String,
    #[serde(default)]
    pub timeframe_overrides: Vec<TimeframeDefinition>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Instrument {
    pub fn bar_path(&self, timeframe_id: &str, period_start: i64) -> String {
        format!("{}/{}", self.timeframe_path(timeframe_id), period_start)
    }

    pub fn timeframe_path(&self, timeframe_id: &str) -> String {
        format!("{}/ohlc_{}", self.base_path.trim_end_matches('/'), timeframe_id)
    }

    pub fn current_price_path(&self) -> String {
        format!("{}/current_price", self.base_path.trim_end_matches('/'))
    }
}

fn default_true() -> bool {
    true
}

/// Configuration for the ingestion service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub price_source: PriceSourceConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<TimeframeDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            price_source: PriceSourceConfig::default(),
            cleanup: CleanupConfig::default(),
            registry: RegistryConfig::default(),
            logging: LoggingConfig::default(),
            timeframes: default_timeframes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub price_batch_size: usize,
    pub out_of_order_grace_secs: i64,
    pub init_max_attempts: u32,
    pub init_retry_delay_secs: u64,
    pub refresh_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval_ms: 1000,
            fetch_timeout_ms: 3000,
            price_batch_size: 25,
            out_of_order_grace_secs: 2,
            init_max_attempts: 10,
            init_retry_delay_secs: 30,
            refresh_interval_secs: 600,
            cleanup_interval_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_secs(self.init_retry_delay_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Which key-path backend the store client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Http,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub base_url: String,
    pub credentials_file: Option<String>,
    pub pool_size: usize,
    pub request_timeout_ms: u64,

    // Retry
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub rate_limit_cooldown_secs: u64,
    pub consecutive_failure_threshold: u32,

    // Cache
    pub fresh_ttl_ms: u64,
    pub stale_ttl_secs: u64,

    // Health scoring
    pub health_base_score: f64,
    pub failure_penalty: f64,
    pub degraded_failure_threshold: u32,
    pub degraded_after_secs: u64,

    // Write queue
    pub write_queue_capacity: usize,
    pub write_batch_size: usize,
    pub drain_interval_ms: u64,
    pub max_write_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: BackendKind::Http,
            base_url: "http://127.0.0.1:9000".to_string(),
            credentials_file: None,
            pool_size: 4,
            request_timeout_ms: 5000,
            max_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 3000,
            rate_limit_cooldown_secs: 10,
            consecutive_failure_threshold: 5,
            fresh_ttl_ms: 1000,
            stale_ttl_secs: 300,
            health_base_score: 100.0,
            failure_penalty: 10.0,
            degraded_failure_threshold: 3,
            degraded_after_secs: 30,
            write_queue_capacity: 5000,
            write_batch_size: 10,
            drain_interval_ms: 100,
            max_write_attempts: 3,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fresh_ttl(&self) -> Duration {
        Duration::from_millis(self.fresh_ttl_ms)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn degraded_after(&self) -> Duration {
        Duration::from_secs(self.degraded_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceSourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub requests_per_second: u32,
    pub request_timeout_ms: u64,
}

impl Default for PriceSourceConfig {
    fn default() -> Self {
        PriceSourceConfig {
            base_url: "http://127.0.0.1:9100/quotes".to_string(),
            api_key: None,
            requests_per_second: 5,
            request_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub delete_batch_size: usize,
    pub concurrency: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            delete_batch_size: 50,
            concurrency: 4,
        }
    }
}

/// Where active instruments come from: a store path, or the static list
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub store_path: Option<String>,
    pub instruments: Vec<Instrument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_record_shape() {
        let bar = Bar::open_at("1m", 60, 120.0, 5.0);
        let record = bar.to_record();

        assert_eq!(record["timeframe"], "1m");
        assert_eq!(record["timestamp"], 60);
        assert_eq!(record["isCompleted"], false);
        assert_eq!(record["datetime"], "1970-01-01T00:01:00Z");

        let parsed: Bar = serde_json::from_value(record).unwrap();
        assert_eq!(parsed, bar);
    }

    #[test]
    fn test_resolve_timeframes() {
        let overrides = vec![
            TimeframeDefinition::new("1s", 1, 600),
            TimeframeDefinition::new("1w", 7 * DAY, 730 * DAY),
        ];
        let resolved = resolve_timeframes(&default_timeframes(), &overrides);

        assert_eq!(resolved.len(), 9);
        assert_eq!(resolved[0].retention_seconds, 600);
        assert_eq!(resolved.last().unwrap().id, "1w");
    }

    #[test]
    fn test_instrument_paths() {
        let instrument = Instrument {
            id: "stc".into(),
            symbol: "STC".into(),
            base_path: "idx_stc/".into(),
            timeframe_overrides: vec![],
            active: true,
        };

        assert_eq!(instrument.bar_path("5m", 300), "idx_stc/ohlc_5m/300");
        assert_eq!(instrument.current_price_path(), "idx_stc/current_price");
    }
}
