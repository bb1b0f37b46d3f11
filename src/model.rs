// Shared data model for the search, enrichment and pricing path

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid date '{0}', expected YYYY-MM-DD or DD/MM/YYYY")]
    InvalidDate(String),

    #[error("Checkout {checkout} must be after checkin {checkin}")]
    EmptyStay {
        checkin: NaiveDate,
        checkout: NaiveDate,
    },

    #[error("Occupancy needs at least one adult")]
    NoAdults,

    #[error("Invalid currency code '{0}'")]
    InvalidCurrency(String),
}

// Guests for one room. Child ages are kept sorted so equal rooms hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Occupancy {
    pub adults: u8,
    pub children_ages: Vec<u8>,
}

impl Occupancy {
    pub fn new(adults: u8, mut children_ages: Vec<u8>) -> Self {
        children_ages.sort_unstable();
        Self {
            adults,
            children_ages,
        }
    }

    pub fn adults(adults: u8) -> Self {
        Self::new(adults, Vec::new())
    }

    pub fn guests(&self) -> usize {
        self.adults as usize + self.children_ages.len()
    }
}

impl fmt::Display for Occupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}A", self.adults)?;
        for age in &self.children_ages {
            write!(f, "-C{}", age)?;
        }
        Ok(())
    }
}

/// Normalized search criteria. This is the cache namespace: two requests that
/// normalize to the same fields produce equal signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchSignature {
    destination_key: String,
    checkin: NaiveDate,
    checkout: NaiveDate,
    occupancy: Occupancy,
    currency: String,
}

impl SearchSignature {
    pub fn new(
        destination: &str,
        checkin: &str,
        checkout: &str,
        occupancy: Occupancy,
        currency: &str,
    ) -> Result<Self, SignatureError> {
        let destination_key = normalize_key(destination);
        if destination_key.is_empty() {
            return Err(SignatureError::MissingField("destination"));
        }

        let checkin = parse_stay_date(checkin)?;
        let checkout = parse_stay_date(checkout)?;
        if checkout <= checkin {
            return Err(SignatureError::EmptyStay { checkin, checkout });
        }

        if occupancy.adults == 0 {
            return Err(SignatureError::NoAdults);
        }

        let currency = currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SignatureError::InvalidCurrency(currency));
        }

        Ok(Self {
            destination_key,
            checkin,
            checkout,
            occupancy: Occupancy::new(occupancy.adults, occupancy.children_ages),
            currency,
        })
    }

    pub fn destination_key(&self) -> &str {
        &self.destination_key
    }

    pub fn checkin(&self) -> NaiveDate {
        self.checkin
    }

    pub fn checkout(&self) -> NaiveDate {
        self.checkout
    }

    pub fn occupancy(&self) -> &Occupancy {
        &self.occupancy
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn nights(&self) -> i64 {
        (self.checkout - self.checkin).num_days()
    }
}

impl fmt::Display for SearchSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.destination_key,
            self.checkin.format("%Y-%m-%d"),
            self.checkout.format("%Y-%m-%d"),
            self.occupancy,
            self.currency
        )
    }
}

// Lowercased, trimmed, inner whitespace collapsed
pub fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn parse_stay_date(raw: &str) -> Result<NaiveDate, SignatureError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .map_err(|_| SignatureError::InvalidDate(raw.to_string()))
}

// One cached batch of a search: `batch_number` is 1-based
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub signature: SearchSignature,
    pub batch_number: u32,
}

impl BatchKey {
    pub fn new(signature: SearchSignature, batch_number: u32) -> Self {
        Self {
            signature,
            batch_number,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.signature, self.batch_number)
    }
}

// Raw supplier search hit, before enrichment and margin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelSummary {
    pub supplier_hotel_id: String,
    #[serde(default)]
    pub name: String,
    pub raw_net_price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub supplier_rating: Option<f32>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotelPolicy {
    #[serde(default)]
    pub check_in_from: Option<String>,
    #[serde(default)]
    pub check_out_until: Option<String>,
    #[serde(default)]
    pub cancellation: Option<String>,
    #[serde(default)]
    pub pets_allowed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelContent {
    pub hotel_id: String,
    pub canonical_name: String,
    #[serde(default)]
    pub translated_names: BTreeMap<String, String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub policy: HotelPolicy,
    pub city_normalized: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub star_rating: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointOfInterest {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub distance_m: Option<u32>,
}

// All points of interest of one hotel in one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiRecord {
    pub hotel_id: String,
    pub language: String,
    #[serde(default)]
    pub points: Vec<PointOfInterest>,
}

// Review aggregate of one hotel in one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub hotel_id: String,
    pub language: String,
    pub rating: f32,
    pub review_count: u32,
    #[serde(default)]
    pub detailed_ratings: BTreeMap<String, f32>,
    #[serde(default)]
    pub highlights: Vec<String>,
}

// Precomputed per-city aggregate; star_histogram[0] counts unrated hotels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityStats {
    pub city: String,
    pub total_hotels: u64,
    pub rated_hotels: u64,
    pub star_histogram: [u64; 6],
    pub refreshed_at: DateTime<Utc>,
}

// Supplier hit joined with local content. `has_content` is false when the
// store had no record for the hotel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedHotel {
    pub summary: HotelSummary,
    pub name: String,
    pub translated_names: BTreeMap<String, String>,
    pub images: Vec<String>,
    pub amenities: Vec<String>,
    pub policy: Option<HotelPolicy>,
    pub city_normalized: Option<String>,
    pub country_code: Option<String>,
    pub star_rating: Option<u8>,
    pub review_rating: Option<f32>,
    pub review_count: u32,
    pub points_of_interest: Vec<PointOfInterest>,
    pub has_content: bool,
}

// What a user sees in a result list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedHotel {
    #[serde(flatten)]
    pub hotel: EnrichedHotel,
    pub displayed_price: Decimal,
    pub applied_rule_id: Option<String>,
}

impl PricedHotel {
    pub fn hotel_id(&self) -> &str {
        &self.hotel.summary.supplier_hotel_id
    }
}
