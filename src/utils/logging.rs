/// Tracing subscriber setup shared by the binaries
use tracing_subscriber::EnvFilter;

use crate::error::{IngestError, Result};
use crate::types::LoggingConfig;

/// `RUST_LOG` wins over the configured level when set
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    installed.map_err(|e| IngestError::InternalError(format!("tracing init failed: {}", e)))
}
