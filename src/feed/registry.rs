/// Sources of the active instrument set
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::store::client::StoreClient;
use crate::types::{Instrument, RegistryConfig};

#[async_trait]
pub trait InstrumentRegistry: Send + Sync {
    async fn active_instruments(&self) -> Result<Vec<Instrument>>;
}

/// Fixed instrument list from configuration
pub struct StaticRegistry {
    instruments: Vec<Instrument>,
}

impl StaticRegistry {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        StaticRegistry { instruments }
    }
}

#[async_trait]
impl InstrumentRegistry for StaticRegistry {
    async fn active_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self
            .instruments
            .iter()
            .filter(|i| i.active)
            .cloned()
            .collect())
    }
}

/// Instruments kept as a map under one store path, keyed by instrument id
pub struct StoreRegistry {
    client: Arc<StoreClient>,
    path: String,
}

impl StoreRegistry {
    pub fn new(client: Arc<StoreClient>, path: &str) -> Self {
        StoreRegistry {
            client,
            path: path.to_string(),
        }
    }
}

/// Decode registry entries; the map key fills in a missing id, bad entries are skipped
pub fn parse_instruments(value: Value) -> Result<Vec<Instrument>> {
    let Value::Object(entries) = value else {
        return Err(IngestError::Validation(
            "instrument registry is not a map".to_string(),
        ));
    };

    let mut instruments = Vec::with_capacity(entries.len());
    for (key, mut entry) in entries {
        if let Some(fields) = entry.as_object_mut() {
            fields
                .entry("id")
                .or_insert_with(|| Value::String(key.clone()));
        }
        match serde_json::from_value::<Instrument>(entry) {
            Ok(instrument) => instruments.push(instrument),
            Err(e) => warn!("Skipping malformed registry entry {}: {}", key, e),
        }
    }
    instruments.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(instruments)
}

/// Store-backed registry when a store path is configured, else the static list
pub fn registry_from_config(
    config: &RegistryConfig,
    client: Arc<StoreClient>,
) -> Arc<dyn InstrumentRegistry> {
    let registry: Arc<dyn InstrumentRegistry> = match &config.store_path {
        Some(path) => Arc::new(StoreRegistry::new(client, path)),
        None => Arc::new(StaticRegistry::new(config.instruments.clone())),
    };
    registry
}

#[async_trait]
impl InstrumentRegistry for StoreRegistry {
    async fn active_instruments(&self) -> Result<Vec<Instrument>> {
        let Some(value) = self.client.get(&self.path, true).await? else {
            debug!("Instrument registry at {} is empty", self.path);
            return Ok(Vec::new());
        };

        Ok(parse_instruments(value)?
            .into_iter()
            .filter(|i| i.active)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryBackend, MemoryBackendFactory};
    use crate::store::StoreBackend;
    use crate::types::StoreConfig;
    use serde_json::json;

    fn instrument(id: &str, active: bool) -> Instrument {
        Instrument {
            id: id.to_string(),
            symbol: id.to_uppercase(),
            base_path: format!("{}_stc", id),
            timeframe_overrides: Vec::new(),
            active,
        }
    }

    #[tokio::test]
    async fn test_static_registry_filters_inactive() {
        let registry = StaticRegistry::new(vec![instrument("a", true), instrument("b", false)]);
        let active = registry.active_instruments().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn test_parse_fills_id_and_skips_garbage() {
        let parsed = parse_instruments(json!({
            "gold": {"symbol": "XAU", "base_path": "gold_stc"},
            "broken": {"symbol": 5},
            "oil": {"id": "oil", "symbol": "WTI", "base_path": "oil_stc", "active": false}
        }))
        .unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "gold");
        assert!(parsed[0].active);
        assert!(!parsed[1].active);

        assert!(parse_instruments(json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_store_registry_reads_active_map() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(
                "registry/instruments",
                &json!({
                    "gold": {"symbol": "XAU", "base_path": "gold_stc"},
                    "oil": {"symbol": "WTI", "base_path": "oil_stc", "active": false}
                }),
            )
            .await
            .unwrap();
        let factory = Arc::new(MemoryBackendFactory::new(Arc::clone(&backend)));
        let client = StoreClient::new(factory, StoreConfig::default()).await.unwrap();

        let registry = StoreRegistry::new(Arc::clone(&client), "registry/instruments");
        let active = registry.active_instruments().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "XAU");

        let empty = StoreRegistry::new(client, "registry/none");
        assert!(empty.active_instruments().await.unwrap().is_empty());
    }
}
