// Deterministic in-process supplier for tests: fixed hit counts per
// destination, partial last batches, injected failures and call counting.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    DumpKind, DumpLocation, SearchQuery, SearchResults, SupplierClient, SupplierError,
    SupplierRate,
};
use crate::model::HotelSummary;

pub struct FakeSupplier {
    inventory: Mutex<HashMap<String, usize>>,
    prices: Mutex<HashMap<String, Decimal>>,
    report_total: AtomicBool,
    search_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    limits: Mutex<Vec<usize>>,
    fail_next_requests: AtomicUsize,
    fail_all: AtomicBool,
    delay_ms: AtomicU64,
    rates: Mutex<Vec<SupplierRate>>,
    dumps: Mutex<HashMap<DumpKind, (DumpLocation, Vec<u8>)>>,
}

impl Default for FakeSupplier {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSupplier {
    pub fn new() -> Self {
        Self {
            inventory: Mutex::new(HashMap::new()),
            prices: Mutex::new(HashMap::new()),
            report_total: AtomicBool::new(true),
            search_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
            limits: Mutex::new(Vec::new()),
            fail_next_requests: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            rates: Mutex::new(Vec::new()),
            dumps: Mutex::new(HashMap::new()),
        }
    }

    // `destination` is matched against the normalized destination key
    pub fn with_destination(self, destination: &str, hotel_count: usize) -> Self {
        self.inventory
            .lock()
            .insert(destination.to_lowercase(), hotel_count);
        self
    }

    pub fn set_price(&self, hotel_id: &str, price: Decimal) {
        self.prices.lock().insert(hotel_id.to_string(), price);
    }

    pub fn set_report_total(&self, report: bool) {
        self.report_total.store(report, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_requests(&self, count: usize) {
        self.fail_next_requests.store(count, Ordering::SeqCst);
    }

    pub fn set_outage(&self, down: bool) {
        self.fail_all.store(down, Ordering::SeqCst);
    }

    pub fn set_rates(&self, rates: Vec<SupplierRate>) {
        *self.rates.lock() = rates;
    }

    pub fn set_dump(&self, kind: DumpKind, last_update: DateTime<Utc>, body: Vec<u8>) {
        let location = DumpLocation {
            url: format!("https://dumps.example.com/{}.jsonl.gz", kind),
            last_update,
        };
        self.dumps.lock().insert(kind, (location, body));
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn requested_limits(&self) -> Vec<usize> {
        self.limits.lock().clone()
    }

    pub fn hotel_id(destination: &str, index: usize) -> String {
        format!("{}-{:04}", destination.to_lowercase(), index)
    }

    async fn simulate(&self) -> Result<(), SupplierError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(SupplierError::NetworkError("Service unavailable".to_string()));
        }

        let fail_count = self.fail_next_requests.load(Ordering::SeqCst);
        if fail_count > 0 {
            self.fail_next_requests
                .store(fail_count - 1, Ordering::SeqCst);
            return Err(SupplierError::ApiResponseError {
                status_code: 500,
                message: "Internal Server Error".to_string(),
                is_retryable: true,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SupplierClient for FakeSupplier {
    async fn search(&self, query: SearchQuery) -> Result<SearchResults, SupplierError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.limits.lock().push(query.result_limit);
        self.simulate().await?;

        let available = self
            .inventory
            .lock()
            .get(&query.destination)
            .copied()
            .unwrap_or(0);
        let prices = self.prices.lock().clone();

        let hits = (0..available.min(query.result_limit))
            .map(|i| {
                let id = Self::hotel_id(&query.destination, i);
                let price = prices
                    .get(&id)
                    .copied()
                    .unwrap_or_else(|| Decimal::new(10_000 + i as i64 * 100, 2));
                HotelSummary {
                    supplier_hotel_id: id.clone(),
                    name: format!("Supplier Hotel {}", i),
                    raw_net_price: price,
                    currency: query.currency.clone(),
                    supplier_rating: Some(4.0),
                    thumbnail_url: None,
                }
            })
            .collect();

        let total = if self.report_total.load(Ordering::SeqCst) {
            Some(available)
        } else {
            None
        };
        Ok(SearchResults { hits, total })
    }

    async fn details(
        &self,
        _hotel_id: &str,
        _checkin: NaiveDate,
        _checkout: NaiveDate,
    ) -> Result<Vec<SupplierRate>, SupplierError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(self.rates.lock().clone())
    }

    async fn bulk_dump(
        &self,
        kind: DumpKind,
        _language: &str,
    ) -> Result<DumpLocation, SupplierError> {
        self.simulate().await?;
        self.dumps
            .lock()
            .get(&kind)
            .map(|(location, _)| location.clone())
            .ok_or_else(|| SupplierError::from_status(404, format!("no {} dump", kind)))
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<u64, SupplierError> {
        let body = self
            .dumps
            .lock()
            .values()
            .find(|(location, _)| location.url == url)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| SupplierError::from_status(404, url.to_string()))?;
        tokio::fs::write(destination, &body)
            .await
            .map_err(|e| SupplierError::Io(e.to_string()))?;
        Ok(body.len() as u64)
    }
}
