pub mod backend;
pub mod cache;
pub mod client;
pub mod credentials;
pub mod memory;
pub mod pool;
pub mod write_queue;

use std::sync::Arc;

pub use backend::{BackendFactory, HttpBackendFactory, HttpStoreBackend, StoreBackend};
pub use cache::ResponseCache;
pub use client::{StoreClient, StoreStats};
pub use credentials::CredentialManager;
pub use memory::{MemoryBackend, MemoryBackendFactory};
pub use pool::{ConnectionHealth, ConnectionPool, HealthPolicy};
pub use write_queue::{PendingWrite, WriteQueue};

use crate::error::Result;
use crate::types::{BackendKind, StoreConfig};

/// Connection factory for the configured backend kind
pub async fn backend_factory(config: &StoreConfig) -> Result<Arc<dyn BackendFactory>> {
    let factory: Arc<dyn BackendFactory> = match config.backend {
        BackendKind::Http => {
            let credentials = Arc::new(CredentialManager::new(config.credentials_file.clone()));
            if credentials.is_configured() {
                credentials.refresh().await?;
            }
            Arc::new(HttpBackendFactory::new(
                &config.base_url,
                credentials,
                config.request_timeout(),
            ))
        }
        BackendKind::Memory => {
            tracing::warn!("Using in-memory store backend, nothing will be persisted");
            Arc::new(MemoryBackendFactory::new(Arc::new(MemoryBackend::new())))
        }
    };
    Ok(factory)
}
