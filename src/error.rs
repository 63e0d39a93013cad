/// Centralized error types for the ingestion pipeline
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    // Network Errors
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    // Store Errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store rejected request: {0}")]
    StoreRejected(String),

    // Feed Errors
    #[error("Instrument fetch failed: {instrument} - {reason}")]
    InstrumentFetchFailed { instrument: String, reason: String },

    #[error("No active instruments: {0}")]
    NoActiveInstruments(String),

    // Data Errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Out-of-order tick: {0}")]
    OutOfOrderTick(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // System Errors
    #[error("System shutdown: {0}")]
    SystemShutdown(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Whether another attempt against the store or feed may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::TransientNetwork(_)
                | IngestError::RateLimited(_)
                | IngestError::AuthExpired(_)
                | IngestError::HttpError(_)
        )
    }

    /// Check if the pipeline can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            IngestError::ConfigError(_) | IngestError::SystemShutdown(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            IngestError::TransientNetwork(_) => "NET_001",
            IngestError::RateLimited(_) => "NET_002",
            IngestError::AuthExpired(_) => "NET_003",
            IngestError::HttpError(_) => "NET_004",
            IngestError::StoreUnavailable(_) => "STORE_001",
            IngestError::StoreRejected(_) => "STORE_002",
            IngestError::InstrumentFetchFailed { .. } => "FEED_001",
            IngestError::NoActiveInstruments(_) => "FEED_002",
            IngestError::Validation(_) => "DATA_001",
            IngestError::OutOfOrderTick(_) => "DATA_002",
            IngestError::DeserializationError(_) => "DATA_003",
            IngestError::ConfigError(_) => "CFG_001",
            IngestError::FileError(_) => "FILE_001",
            IngestError::SystemShutdown(_) => "SYS_001",
            IngestError::InternalError(_) => "INT_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(IngestError::TransientNetwork("reset".into()).is_retryable());
        assert!(IngestError::RateLimited("429".into()).is_retryable());
        assert!(IngestError::AuthExpired("401".into()).is_retryable());
        assert!(!IngestError::StoreRejected("400".into()).is_retryable());
        assert!(!IngestError::Validation("nan".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(IngestError::StoreUnavailable("x".into()).error_code(), "STORE_001");
        assert_eq!(
            IngestError::InstrumentFetchFailed {
                instrument: "BTC".into(),
                reason: "timeout".into()
            }
            .error_code(),
            "FEED_001"
        );
        assert!(!IngestError::ConfigError("bad".into()).is_recoverable());
    }
}
