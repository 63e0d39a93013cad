/// Key-path store backends addressed by slash-delimited paths
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::store::credentials::CredentialManager;

/// One logical connection to the key-path store
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Value at `path`, `None` when nothing is stored there
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    async fn put(&self, path: &str, value: &Value) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Immediate child keys of `path` without fetching their values
    async fn list_keys(&self, path: &str) -> Result<Vec<String>>;

    /// Called after an auth failure before the request is retried
    async fn refresh_credentials(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens connections for the pool, also used for full reconnects
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn connect(&self, slot: usize) -> Result<Arc<dyn StoreBackend>>;
}

/// Map a non-success status to the error taxonomy
pub fn classify_status(status: StatusCode, context: &str) -> IngestError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => IngestError::RateLimited(context.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IngestError::AuthExpired(format!("{} ({})", context, status))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            IngestError::TransientNetwork(format!("{} ({})", context, status))
        }
        s => IngestError::StoreRejected(format!("{} ({})", context, s)),
    }
}

fn transport_error(e: reqwest::Error, context: &str) -> IngestError {
    IngestError::TransientNetwork(format!("{}: {}", context, e))
}

/// REST backend: `{base_url}/{path}.json`, `?shallow=true` for key listing
pub struct HttpStoreBackend {
    client: Client,
    base_url: String,
    credentials: Arc<CredentialManager>,
    slot: usize,
}

impl HttpStoreBackend {
    pub fn new(
        base_url: &str,
        credentials: Arc<CredentialManager>,
        timeout: Duration,
        slot: usize,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()?;

        Ok(HttpStoreBackend {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            slot,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.token().await {
            Some(token) => request.query(&[("auth", token)]),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Option<Value>> {
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status, context));
        }

        let body = response.text().await.map_err(|e| transport_error(e, context))?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<Value>(&body)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }
}

#[async_trait]
impl StoreBackend for HttpStoreBackend {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        debug!("[conn {}] GET {}", self.slot, path);
        let context = format!("GET {}", path);
        self.send(self.client.get(self.url(path)), &context).await
    }

    async fn put(&self, path: &str, value: &Value) -> Result<()> {
        debug!("[conn {}] PUT {}", self.slot, path);
        let context = format!("PUT {}", path);
        self.send(self.client.put(self.url(path)).json(value), &context)
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        debug!("[conn {}] DELETE {}", self.slot, path);
        let context = format!("DELETE {}", path);
        self.send(self.client.delete(self.url(path)), &context)
            .await
            .map(|_| ())
    }

    async fn list_keys(&self, path: &str) -> Result<Vec<String>> {
        let context = format!("LIST {}", path);
        let request = self.client.get(self.url(path)).query(&[("shallow", "true")]);

        match self.send(request, &context).await? {
            Some(Value::Object(map)) => Ok(map.keys().cloned().collect()),
            Some(other) => Err(IngestError::StoreRejected(format!(
                "{}: expected an object, got {}",
                context, other
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn refresh_credentials(&self) -> Result<()> {
        self.credentials.refresh().await
    }
}

/// Builds one HTTP client per pool slot, sharing credentials
pub struct HttpBackendFactory {
    base_url: String,
    credentials: Arc<CredentialManager>,
    timeout: Duration,
}

impl HttpBackendFactory {
    pub fn new(base_url: &str, credentials: Arc<CredentialManager>, timeout: Duration) -> Self {
        HttpBackendFactory {
            base_url: base_url.to_string(),
            credentials,
            timeout,
        }
    }
}

#[async_trait]
impl BackendFactory for HttpBackendFactory {
    async fn connect(&self, slot: usize) -> Result<Arc<dyn StoreBackend>> {
        let backend = HttpStoreBackend::new(
            &self.base_url,
            Arc::clone(&self.credentials),
            self.timeout,
            slot,
        )?;
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "GET a"),
            IngestError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "GET a"),
            IngestError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "GET a"),
            IngestError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "GET a"),
            IngestError::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "PUT a"),
            IngestError::StoreRejected(_)
        ));
    }

    #[tokio::test]
    async fn test_url_layout() {
        let backend = HttpStoreBackend::new(
            "https://db.example.com/",
            Arc::new(CredentialManager::new(None)),
            Duration::from_secs(2),
            0,
        )
        .unwrap();

        assert_eq!(
            backend.url("/idx_stc/ohlc_1m/60"),
            "https://db.example.com/idx_stc/ohlc_1m/60.json"
        );
    }
}
