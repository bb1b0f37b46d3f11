// Operations exposed to the booking and UI side. Responses are plain serde
// types; transport is up to the caller.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::alerts::{AlertCriteria, AlertError, AlertStore, PriceAlert};
use crate::clock::Clock;
use crate::logger::warn_if_slow;
use crate::margin::PricedRate;
use crate::model::{parse_stay_date, CityStats, Occupancy, SearchSignature, SignatureError};
use crate::pagination::{Page, PaginationCoordinator};
use crate::stats::CityStatsAggregator;
use crate::store::{ContentStore, StoreError};
use crate::supplier::SupplierError;

const SLOW_SEARCH: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] SignatureError),

    #[error(transparent)]
    Watch(#[from] AlertError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supplier(#[from] SupplierError),
}

fn first_page() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub destination: String,
    pub checkin: String,
    pub checkout: String,
    pub adults: u8,
    #[serde(default)]
    pub children_ages: Vec<u8>,
    pub currency: String,
    #[serde(default = "first_page")]
    pub page: u32,
}

impl SearchRequest {
    pub fn signature(&self) -> Result<SearchSignature, SignatureError> {
        SearchSignature::new(
            &self.destination,
            &self.checkin,
            &self.checkout,
            Occupancy::new(self.adults, self.children_ages.clone()),
            &self.currency,
        )
    }
}

// An outage must never look like "no hotels", so failures get their own shape
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchPageResponse {
    Ok(Page),
    Error { retryable: bool, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRequest {
    #[serde(flatten)]
    pub search: SearchRequest,
    #[serde(default)]
    pub hotel_id: Option<String>,
    pub threshold_percent: Decimal,
    #[serde(default)]
    pub cooldown_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotelRates {
    pub hotel_id: String,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub rates: Vec<PricedRate>,
}

pub struct InventoryService {
    coordinator: Arc<PaginationCoordinator>,
    content: Arc<dyn ContentStore>,
    city_stats: Arc<CityStatsAggregator>,
    watches: Arc<dyn AlertStore>,
    clock: Arc<dyn Clock>,
    default_cooldown_seconds: i64,
}

impl InventoryService {
    pub fn new(
        coordinator: Arc<PaginationCoordinator>,
        content: Arc<dyn ContentStore>,
        city_stats: Arc<CityStatsAggregator>,
        watches: Arc<dyn AlertStore>,
        clock: Arc<dyn Clock>,
        default_cooldown_seconds: i64,
    ) -> Self {
        Self {
            coordinator,
            content,
            city_stats,
            watches,
            clock,
            default_cooldown_seconds,
        }
    }

    pub fn coordinator(&self) -> &Arc<PaginationCoordinator> {
        &self.coordinator
    }

    #[instrument(skip(self, request), fields(destination = %request.destination, page = request.page))]
    pub async fn search_page(&self, request: &SearchRequest) -> SearchPageResponse {
        let signature = match request.signature() {
            Ok(signature) => signature,
            Err(e) => {
                return SearchPageResponse::Error {
                    retryable: false,
                    message: e.to_string(),
                }
            }
        };

        let lookup = self.coordinator.get_page(&signature, request.page);
        match warn_if_slow("search_page", SLOW_SEARCH, lookup).await {
            Ok(page) => SearchPageResponse::Ok(page),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "search page failed");
                SearchPageResponse::Error {
                    retryable: e.is_retryable(),
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn destination_overview(&self, city: &str) -> Result<Option<CityStats>, ServiceError> {
        Ok(self.city_stats.destination_overview(city).await?)
    }

    pub async fn register_watch(
        &self,
        owner_id: &str,
        request: WatchRequest,
    ) -> Result<PriceAlert, ServiceError> {
        let criteria = AlertCriteria {
            signature: request.search.signature()?,
            hotel_id: request.hotel_id,
        };
        let alert = PriceAlert::new(
            owner_id,
            criteria,
            request.threshold_percent,
            request
                .cooldown_seconds
                .unwrap_or(self.default_cooldown_seconds),
            self.clock.now(),
        )?;
        self.watches.register(alert.clone()).await?;
        info!(alert_id = %alert.id, owner_id, "price watch registered");
        Ok(alert)
    }

    pub async fn delete_watch(&self, owner_id: &str, alert_id: Uuid) -> Result<(), ServiceError> {
        self.watches.delete(owner_id, alert_id).await?;
        info!(%alert_id, owner_id, "price watch deleted");
        Ok(())
    }

    // Live rates for one hotel, priced with the same rules as search results
    #[instrument(skip(self))]
    pub async fn hotel_rates(
        &self,
        hotel_id: &str,
        checkin: &str,
        checkout: &str,
    ) -> Result<HotelRates, ServiceError> {
        let checkin = parse_stay_date(checkin)?;
        let checkout = parse_stay_date(checkout)?;
        if checkout <= checkin {
            return Err(SignatureError::EmptyStay { checkin, checkout }.into());
        }

        let pipeline = self.coordinator.pipeline();
        let rates = pipeline
            .supplier()
            .details(hotel_id, checkin, checkout)
            .await?;

        let content = match self.content.hotels_by_ids(&[hotel_id.to_string()]).await {
            Ok(mut found) => found.remove(hotel_id),
            Err(e) => {
                warn!(error = %e, "content lookup failed, pricing without location");
                None
            }
        };
        let city = content.as_ref().map(|c| c.city_normalized.as_str());
        let country = content
            .as_ref()
            .map(|c| c.country_code.as_str())
            .filter(|c| !c.is_empty());

        Ok(HotelRates {
            hotel_id: hotel_id.to_string(),
            checkin,
            checkout,
            rates: pipeline.margin().price_rates(hotel_id, city, country, rates),
        })
    }
}
