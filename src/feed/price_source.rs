/// Batched upstream price quotes
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::types::{PriceSourceConfig, PriceTick};
use crate::utils::rate_limiter::RateLimiter;
use crate::utils::time::normalize_unix_seconds;

/// Quote as reported by the upstream API; every field may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub change_percent: Option<f64>,
    pub timestamp: Option<f64>,
}

impl Quote {
    /// Validate and coerce into a tick; `tick_time` stands in for a missing timestamp
    pub fn to_tick(&self, instrument_id: &str, tick_time: i64) -> Result<PriceTick> {
        let price = self.price.ok_or_else(|| {
            IngestError::Validation(format!("{}: quote has no price", instrument_id))
        })?;
        if !price.is_finite() || price <= 0.0 {
            return Err(IngestError::Validation(format!(
                "{}: invalid price {}",
                instrument_id, price
            )));
        }

        let volume = self.volume.unwrap_or(0.0);
        if !volume.is_finite() || volume < 0.0 {
            return Err(IngestError::Validation(format!(
                "{}: invalid volume {}",
                instrument_id, volume
            )));
        }

        let timestamp = match self.timestamp {
            Some(ts) if ts.is_finite() && ts > 0.0 => normalize_unix_seconds(ts as i64),
            _ => tick_time,
        };

        Ok(PriceTick {
            instrument_id: instrument_id.to_string(),
            price,
            volume,
            timestamp,
        })
    }
}

/// Upstream quote provider
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Quotes for `symbols`; one entry per requested symbol
    async fn fetch_batch(&self, symbols: &[String]) -> HashMap<String, Result<Quote>>;
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    data: HashMap<String, Quote>,
}

/// Spread a single batch failure over every requested symbol
fn fail_all(symbols: &[String], err: &IngestError) -> HashMap<String, Result<Quote>> {
    symbols
        .iter()
        .map(|symbol| {
            let failure = match err {
                IngestError::RateLimited(reason) => IngestError::RateLimited(reason.clone()),
                other => IngestError::InstrumentFetchFailed {
                    instrument: symbol.clone(),
                    reason: other.to_string(),
                },
            };
            (symbol.clone(), Err(failure))
        })
        .collect()
}

/// Match a response body to the requested symbols
fn parse_batch(symbols: &[String], body: &str) -> Result<HashMap<String, Result<Quote>>> {
    let mut response: BatchResponse = serde_json::from_str(body)?;

    Ok(symbols
        .iter()
        .map(|symbol| {
            let quote = response.data.remove(symbol).ok_or_else(|| {
                IngestError::InstrumentFetchFailed {
                    instrument: symbol.clone(),
                    reason: "no quote in response".to_string(),
                }
            });
            (symbol.clone(), quote)
        })
        .collect())
}

/// HTTP quote API: `GET {base_url}?symbols=A,B`
pub struct HttpPriceSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: RateLimiter,
}

impl HttpPriceSource {
    pub fn new(config: &PriceSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(HttpPriceSource {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            rate_limiter: RateLimiter::new(config.requests_per_second),
        })
    }

    async fn request(&self, symbols: &[String]) -> Result<String> {
        self.rate_limiter.acquire().await;

        let mut request = self
            .client
            .get(&self.base_url)
            .query(&[("symbols", symbols.join(","))])
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::TransientNetwork(format!("quote request: {}", e)))?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(response.text().await?),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(IngestError::RateLimited("quote API returned 429".to_string()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(IngestError::AuthExpired(
                format!("quote API rejected key ({})", status),
            )),
            s if s.is_server_error() => Err(IngestError::TransientNetwork(format!(
                "quote API returned {}",
                s
            ))),
            s => Err(IngestError::Validation(format!("quote API returned {}", s))),
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_batch(&self, symbols: &[String]) -> HashMap<String, Result<Quote>> {
        if symbols.is_empty() {
            return HashMap::new();
        }

        debug!("Fetching quotes for {} symbols", symbols.len());
        let parsed = self
            .request(symbols)
            .await
            .and_then(|body| parse_batch(symbols, &body));

        match parsed {
            Ok(quotes) => quotes,
            Err(e) => {
                warn!("Quote batch of {} symbols failed: {}", symbols.len(), e);
                fail_all(symbols, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quote_coercion() {
        let quote = Quote {
            price: Some(101.5),
            volume: None,
            timestamp: Some(1_700_000_000_123.0),
            ..Quote::default()
        };
        let tick = quote.to_tick("idx", 42).unwrap();
        assert_eq!(tick.price, 101.5);
        assert_eq!(tick.volume, 0.0);
        assert_eq!(tick.timestamp, 1_700_000_000);

        let untimed = Quote {
            price: Some(1.0),
            ..Quote::default()
        };
        assert_eq!(untimed.to_tick("idx", 42).unwrap().timestamp, 42);
    }

    #[test]
    fn test_invalid_quotes_rejected() {
        let cases = [
            Quote::default(),
            Quote { price: Some(0.0), ..Quote::default() },
            Quote { price: Some(f64::NAN), ..Quote::default() },
            Quote { price: Some(1.0), volume: Some(-5.0), ..Quote::default() },
        ];
        for quote in cases {
            assert!(matches!(quote.to_tick("idx", 1), Err(IngestError::Validation(_))));
        }
    }

    #[test]
    fn test_parse_batch_marks_missing_symbols() {
        let body = r#"{"data": {"AAA": {"price": 10.0, "changePercent": 1.2}, "ZZZ": {"price": 3.0}}}"#;
        let quotes = parse_batch(&symbols(&["AAA", "BBB"]), body).unwrap();

        assert_eq!(quotes.len(), 2);
        let aaa = quotes["AAA"].as_ref().unwrap();
        assert_eq!(aaa.price, Some(10.0));
        assert_eq!(aaa.change_percent, Some(1.2));
        assert!(matches!(
            quotes["BBB"],
            Err(IngestError::InstrumentFetchFailed { .. })
        ));
    }

    #[test]
    fn test_batch_failure_spreads_to_symbols() {
        let failed = fail_all(
            &symbols(&["AAA", "BBB"]),
            &IngestError::RateLimited("429".to_string()),
        );
        assert!(failed.values().all(|r| matches!(r, Err(IngestError::RateLimited(_)))));

        let failed = fail_all(
            &symbols(&["AAA"]),
            &IngestError::TransientNetwork("reset".to_string()),
        );
        assert!(matches!(
            &failed["AAA"],
            Err(IngestError::InstrumentFetchFailed { instrument, .. }) if instrument == "AAA"
        ));
    }
}
