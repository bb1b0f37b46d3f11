// Supplier boundary: the external inventory API the core searches, prices and
// pulls bulk dumps from

pub mod http;
#[cfg(test)]
pub mod mock;
pub mod xml;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::model::{HotelSummary, Occupancy, SearchSignature};

pub use http::HttpSupplierClient;

#[derive(Error, Debug, Clone)]
pub enum SupplierError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("API error: {status_code} - {message}")]
    ApiResponseError {
        status_code: u16,
        message: String,
        is_retryable: bool,
    },

    #[error("Malformed supplier response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SupplierError {
    // Transient failures are worth retrying and worth a stale fallback
    pub fn is_retryable(&self) -> bool {
        match self {
            SupplierError::NetworkError(_)
            | SupplierError::RateLimitExceeded(_)
            | SupplierError::Timeout(_) => true,
            SupplierError::ApiResponseError { is_retryable, .. } => *is_retryable,
            SupplierError::InvalidResponse(_) | SupplierError::Io(_) => false,
        }
    }

    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status_code {
            429 => SupplierError::RateLimitExceeded(message),
            _ => SupplierError::ApiResponseError {
                status_code,
                message,
                is_retryable: status_code == 408 || status_code >= 500,
            },
        }
    }
}

// A search as sent to the supplier. The supplier has no offset parameter, so
// batch N is obtained by asking for N * batch_size results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    pub destination: String,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub occupancy: Occupancy,
    pub currency: String,
    pub result_limit: usize,
}

impl SearchQuery {
    pub fn new(signature: &SearchSignature, result_limit: usize) -> Self {
        Self {
            destination: signature.destination_key().to_string(),
            checkin: signature.checkin(),
            checkout: signature.checkout(),
            occupancy: signature.occupancy().clone(),
            currency: signature.currency().to_string(),
            result_limit,
        }
    }
}

// Hits in supplier ranking order. `total` is what the supplier reports as
// available for the destination, when it reports it at all.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<HotelSummary>,
    #[serde(default)]
    pub total: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierRate {
    pub rate_key: String,
    pub room_code: String,
    pub room_name: String,
    pub board_type: String,
    pub net_price: Decimal,
    pub currency: String,
    pub refundable: bool,
    pub cancellation_deadlines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpKind {
    HotelContent,
    PointsOfInterest,
    Reviews,
}

impl DumpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::HotelContent => "hotel_content",
            DumpKind::PointsOfInterest => "poi",
            DumpKind::Reviews => "reviews",
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DumpLocation {
    pub url: String,
    pub last_update: DateTime<Utc>,
}

#[async_trait]
pub trait SupplierClient: Send + Sync + 'static {
    // Ranked availability search for a destination
    async fn search(&self, query: SearchQuery) -> Result<SearchResults, SupplierError>;

    // All bookable rates of one hotel for the stay
    async fn details(
        &self,
        hotel_id: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
    ) -> Result<Vec<SupplierRate>, SupplierError>;

    // Where the latest bulk export of the given kind lives
    async fn bulk_dump(
        &self,
        kind: DumpKind,
        language: &str,
    ) -> Result<DumpLocation, SupplierError>;

    // Stream a dump to disk, returns bytes written
    async fn download(&self, url: &str, destination: &Path) -> Result<u64, SupplierError>;
}
