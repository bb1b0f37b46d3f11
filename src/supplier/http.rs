// reqwest client for the supplier API. Every call goes through a concurrency
// limit and is retried with exponential backoff while the failure is transient.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::{
    xml, DumpKind, DumpLocation, SearchQuery, SearchResults, SupplierClient, SupplierError,
    SupplierRate,
};
use crate::model::HotelSummary;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub max_concurrent_requests: u32,
    pub timeout_ms: u64,
    pub retry_config: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            api_key: String::new(),
            max_concurrent_requests: 32,
            timeout_ms: 10_000,
            retry_config: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub requests_retried: usize,
    pub requests_throttled: usize,
}

#[derive(Debug, Default)]
struct ClientCounters {
    requests_sent: AtomicUsize,
    requests_succeeded: AtomicUsize,
    requests_failed: AtomicUsize,
    requests_retried: AtomicUsize,
    requests_throttled: AtomicUsize,
}

// Search response as the supplier sends it
#[derive(Debug, Deserialize)]
struct WireSearchResponse {
    hotels: Vec<WireHotel>,
    #[serde(default)]
    total: Option<usize>,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct WireHotel {
    hotel_id: String,
    #[serde(default)]
    name: String,
    min_rate: Decimal,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    rating: Option<f32>,
    #[serde(default)]
    thumbnail: Option<String>,
}

impl WireSearchResponse {
    fn into_results(self) -> SearchResults {
        let currency = self.currency.to_ascii_uppercase();
        let hits = self
            .hotels
            .into_iter()
            .map(|h| HotelSummary {
                supplier_hotel_id: h.hotel_id,
                name: h.name,
                raw_net_price: h.min_rate,
                currency: h
                    .currency
                    .map(|c| c.to_ascii_uppercase())
                    .unwrap_or_else(|| currency.clone()),
                supplier_rating: h.rating,
                thumbnail_url: h.thumbnail,
            })
            .collect();

        SearchResults {
            hits,
            total: self.total,
        }
    }
}

pub struct HttpSupplierClient {
    http: reqwest::Client,
    config: ClientConfig,
    permits: Arc<Semaphore>,
    counters: ClientCounters,
}

impl HttpSupplierClient {
    pub fn new(config: ClientConfig) -> Result<Self, SupplierError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SupplierError::NetworkError(e.to_string()))?;

        Ok(Self {
            http,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1) as usize)),
            config,
            counters: ClientCounters::default(),
        })
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            requests_sent: self.counters.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: self.counters.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.counters.requests_failed.load(Ordering::SeqCst),
            requests_retried: self.counters.requests_retried.load(Ordering::SeqCst),
            requests_throttled: self.counters.requests_throttled.load(Ordering::SeqCst),
        }
    }

    // Helper to calculate exponential backoff with jitter
    pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
        let base_backoff_ms = (config.initial_backoff_ms as f64
            * config.backoff_multiplier.powf(retry_attempt as f64))
        .min(config.max_backoff_ms as f64);

        // Jitter spreads retries of concurrent callers apart
        let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms as u64)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn map_transport_error(&self, e: reqwest::Error) -> SupplierError {
        if e.is_timeout() {
            SupplierError::Timeout(self.config.timeout_ms)
        } else {
            SupplierError::NetworkError(e.to_string())
        }
    }

    async fn checked(&self, response: reqwest::Response) -> Result<reqwest::Response, SupplierError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SupplierError::from_status(status.as_u16(), body))
    }

    async fn get(&self, url: &str, params: &[(&str, String)]) -> Result<reqwest::Response, SupplierError> {
        let response = self
            .http
            .get(url)
            .header("X-Api-Key", &self.config.api_key)
            .query(params)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        self.checked(response).await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, SupplierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SupplierError>>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| SupplierError::NetworkError(e.to_string()))?;
                self.counters.requests_sent.fetch_add(1, Ordering::SeqCst);
                call().await
            };

            match result {
                Ok(value) => {
                    self.counters.requests_succeeded.fetch_add(1, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(e) => {
                    if matches!(e, SupplierError::RateLimitExceeded(_)) {
                        self.counters.requests_throttled.fetch_add(1, Ordering::SeqCst);
                    }
                    if !e.is_retryable() || attempt >= self.config.retry_config.max_retries {
                        self.counters.requests_failed.fetch_add(1, Ordering::SeqCst);
                        return Err(e);
                    }

                    let backoff = Self::calculate_backoff(attempt, &self.config.retry_config);
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient supplier failure, retrying"
                    );
                    self.counters.requests_retried.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub fn search_params(query: &SearchQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("destination", query.destination.clone()),
        ("checkin", query.checkin.format("%Y-%m-%d").to_string()),
        ("checkout", query.checkout.format("%Y-%m-%d").to_string()),
        ("adults", query.occupancy.adults.to_string()),
        ("currency", query.currency.clone()),
        ("limit", query.result_limit.to_string()),
    ];
    if !query.occupancy.children_ages.is_empty() {
        let ages = query
            .occupancy
            .children_ages
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");
        params.push(("children", ages));
    }
    params
}

#[async_trait]
impl SupplierClient for HttpSupplierClient {
    #[instrument(skip(self, query), fields(destination = %query.destination, limit = query.result_limit))]
    async fn search(&self, query: SearchQuery) -> Result<SearchResults, SupplierError> {
        let url = self.url("hotels/search");
        let params = search_params(&query);

        let (url, params) = (&url, &params);
        let results = self
            .with_retry("search", move || async move {
                let response = self.get(url, params).await?;
                response
                    .json::<WireSearchResponse>()
                    .await
                    .map_err(|e| SupplierError::InvalidResponse(e.to_string()))
            })
            .await?
            .into_results();

        debug!(hits = results.hits.len(), total = ?results.total, "supplier search done");
        Ok(results)
    }

    async fn details(
        &self,
        hotel_id: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
    ) -> Result<Vec<SupplierRate>, SupplierError> {
        let url = self.url(&format!("hotels/{}/availability", hotel_id));
        let params = [
            ("checkin", checkin.format("%Y-%m-%d").to_string()),
            ("checkout", checkout.format("%Y-%m-%d").to_string()),
        ];

        let (url, params) = (&url, &params);
        let body = self
            .with_retry("details", move || async move {
                let response = self.get(url, params).await?;
                response
                    .text()
                    .await
                    .map_err(|e| self.map_transport_error(e))
            })
            .await?;

        xml::parse_rates(&body, hotel_id)
    }

    async fn bulk_dump(
        &self,
        kind: DumpKind,
        language: &str,
    ) -> Result<DumpLocation, SupplierError> {
        let url = self.url(&format!("dumps/{}", kind.as_str()));
        let params = [("language", language.to_string())];

        let (url, params) = (&url, &params);
        self.with_retry("bulk_dump", move || async move {
            let response = self.get(url, params).await?;
            response
                .json::<DumpLocation>()
                .await
                .map_err(|e| SupplierError::InvalidResponse(e.to_string()))
        })
        .await
    }

    // Not retried: a half-written file would have to be truncated first, and
    // the dump job simply runs again on its next tick.
    async fn download(&self, url: &str, destination: &Path) -> Result<u64, SupplierError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| SupplierError::NetworkError(e.to_string()))?;

        let response = self
            .http
            .get(url)
            .header("X-Api-Key", &self.config.api_key)
            .timeout(Duration::from_secs(3600))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let mut response = self.checked(response).await?;

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| SupplierError::Io(e.to_string()))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.map_transport_error(e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| SupplierError::Io(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| SupplierError::Io(e.to_string()))?;

        debug!(url, bytes = written, "dump downloaded");
        Ok(written)
    }
}
