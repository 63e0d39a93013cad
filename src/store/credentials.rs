/// Credential management for the authenticated store backend
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub auth_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |expiry| Utc::now() >= expiry)
    }
}

/// Holds the current store token; an external process rotates the file
pub struct CredentialManager {
    credentials: Arc<RwLock<Option<Credentials>>>,
    credentials_file: Option<String>,
}

impl CredentialManager {
    pub fn new(credentials_file: Option<String>) -> Self {
        CredentialManager {
            credentials: Arc::new(RwLock::new(None)),
            credentials_file,
        }
    }

    /// Manager with a fixed token and no backing file
    pub fn with_token(auth_token: &str) -> Self {
        CredentialManager {
            credentials: Arc::new(RwLock::new(Some(Credentials {
                auth_token: auth_token.to_string(),
                expires_at: None,
            }))),
            credentials_file: None,
        }
    }

    /// Current token, if any is loaded and unexpired
    pub async fn token(&self) -> Option<String> {
        let credentials = self.credentials.read().await;
        credentials
            .as_ref()
            .filter(|c| !c.is_expired())
            .map(|c| c.auth_token.clone())
    }

    pub fn is_configured(&self) -> bool {
        self.credentials_file.is_some()
    }

    /// Re-read credentials from file
    pub async fn refresh(&self) -> Result<()> {
        let Some(path) = &self.credentials_file else {
            warn!("Credential refresh requested but no credentials file is configured");
            return Ok(());
        };

        let content = tokio::fs::read_to_string(path).await?;
        let loaded: Credentials = serde_json::from_str(&content)?;

        if loaded.is_expired() {
            return Err(IngestError::AuthExpired(format!(
                "Credentials in {} expired at {:?}",
                path, loaded.expires_at
            )));
        }

        let mut credentials = self.credentials.write().await;
        *credentials = Some(loaded);

        debug!("Store credentials reloaded from {}", path);
        Ok(())
    }

    /// Clear credentials held in memory
    pub async fn clear(&self) {
        let mut credentials = self.credentials.write().await;
        *credentials = None;
        warn!("Store credentials cleared");
    }
}
