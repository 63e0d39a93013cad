/// Configuration loading from TOML file with environment overrides
use std::collections::HashSet;
use std::path::Path;

use crate::error::{IngestError, Result};
use crate::types::Config;

/// Prefix for overrides such as `BARFEED__STORE__BASE_URL`
const ENV_PREFIX: &str = "BARFEED";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let config: Config = ::config::Config::builder()
        .add_source(::config::File::from(path).required(true))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|layered| layered.try_deserialize())
        .map_err(|e| {
            IngestError::ConfigError(format!("Failed to load {}: {}", path.display(), e))
        })?;

    validate_config(&config)?;

    Ok(config)
}

/// Parse a TOML document without touching the environment
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| IngestError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Scheduler cadence
    let scheduler = &config.scheduler;
    if scheduler.tick_interval_ms == 0 {
        return Err(IngestError::ConfigError("tick_interval_ms must be > 0".to_string()));
    }
    if scheduler.price_batch_size == 0 {
        return Err(IngestError::ConfigError("price_batch_size must be > 0".to_string()));
    }
    if scheduler.out_of_order_grace_secs < 0 {
        return Err(IngestError::ConfigError(
            "out_of_order_grace_secs must be >= 0".to_string(),
        ));
    }
    if scheduler.cleanup_interval_secs * 1000 < scheduler.tick_interval_ms {
        return Err(IngestError::ConfigError(
            "cleanup_interval_secs must be slower than the tick interval".to_string(),
        ));
    }

    // Store client
    let store = &config.store;
    if store.pool_size == 0 {
        return Err(IngestError::ConfigError("store.pool_size must be >= 1".to_string()));
    }
    if store.request_timeout_ms == 0 {
        return Err(IngestError::ConfigError("store.request_timeout_ms must be > 0".to_string()));
    }
    if store.stale_ttl() < store.fresh_ttl() {
        return Err(IngestError::ConfigError(format!(
            "stale TTL ({:?}) must not be shorter than fresh TTL ({:?})",
            store.stale_ttl(),
            store.fresh_ttl()
        )));
    }
    if store.retry_max_delay_ms < store.retry_base_delay_ms {
        return Err(IngestError::ConfigError(
            "retry_max_delay_ms must be >= retry_base_delay_ms".to_string(),
        ));
    }
    if store.write_queue_capacity == 0 || store.write_batch_size == 0 {
        return Err(IngestError::ConfigError(
            "write queue capacity and batch size must be > 0".to_string(),
        ));
    }
    if store.failure_penalty <= 0.0 {
        return Err(IngestError::ConfigError(format!(
            "Invalid failure_penalty: {}",
            store.failure_penalty
        )));
    }

    // Cleanup
    if config.cleanup.delete_batch_size == 0 || config.cleanup.concurrency == 0 {
        return Err(IngestError::ConfigError(
            "cleanup batch size and concurrency must be > 0".to_string(),
        ));
    }

    // Timeframes
    if config.timeframes.is_empty() {
        return Err(IngestError::ConfigError("at least one timeframe is required".to_string()));
    }
    let mut seen = HashSet::new();
    for tf in &config.timeframes {
        if tf.duration_seconds <= 0 || tf.retention_seconds <= 0 {
            return Err(IngestError::ConfigError(format!(
                "Timeframe {} needs positive duration and retention",
                tf.id
            )));
        }
        if !seen.insert(tf.id.as_str()) {
            return Err(IngestError::ConfigError(format!("Duplicate timeframe id: {}", tf.id)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;

    #[test]
    fn test_defaults_from_minimal_document() {
        let config = parse_config("").unwrap();

        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.scheduler.init_max_attempts, 10);
        assert_eq!(config.store.consecutive_failure_threshold, 5);
        assert_eq!(config.timeframes.len(), 8);
        assert_eq!(config.store.backend, BackendKind::Http);
    }

    #[test]
    fn test_sections_and_instruments() {
        let config = parse_config(
            r#"
            [scheduler]
            tick_interval_ms = 500

            [store]
            backend = "memory"
            pool_size = 2

            [[registry.instruments]]
            id = "stc"
            symbol = "STC"
            base_path = "idx_stc"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.tick_interval_ms, 500);
        assert_eq!(config.store.backend, BackendKind::Memory);
        assert_eq!(config.store.pool_size, 2);
        assert_eq!(config.registry.instruments.len(), 1);
        assert!(config.registry.instruments[0].active);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse_config("[store]\npool_size = 0").is_err());
        assert!(parse_config("[store]\nfresh_ttl_ms = 600000\nstale_ttl_secs = 1").is_err());
        assert!(parse_config(
            r#"
            [[timeframes]]
            id = "1m"
            duration_seconds = 60
            retention_seconds = 60
            [[timeframes]]
            id = "1m"
            duration_seconds = 60
            retention_seconds = 60
            "#
        )
        .is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let path = std::env::temp_dir().join("barfeed_loader_test.toml");
        std::fs::write(&path, "[cleanup]\ndelete_batch_size = 20\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.cleanup.delete_batch_size, 20);

        let _ = std::fs::remove_file(path);
    }
}
