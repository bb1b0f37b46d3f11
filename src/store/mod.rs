// Local hotel content: supplier-id keyed content, POIs and reviews per
// language, and the precomputed per-city stats. Written by the dump
// ingestion jobs, read by the enricher and the destination overview.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::model::{CityStats, HotelContent, PoiRecord, ReviewRecord};

pub mod memory;
pub mod sql;

pub use memory::MemoryContentStore;
pub use sql::SqlContentStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub hotels: usize,
    pub poi_records: usize,
    pub review_records: usize,
    pub cities: usize,
}

#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    // Upserts return how many records were written. Writing the same record
    // twice leaves a single row.
    async fn upsert_hotels(&self, hotels: &[HotelContent]) -> Result<usize, StoreError>;

    async fn upsert_pois(&self, records: &[PoiRecord]) -> Result<usize, StoreError>;

    async fn upsert_reviews(&self, records: &[ReviewRecord]) -> Result<usize, StoreError>;

    async fn hotels_by_ids(
        &self,
        hotel_ids: &[String],
    ) -> Result<HashMap<String, HotelContent>, StoreError>;

    async fn pois_for(
        &self,
        hotel_ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, PoiRecord>, StoreError>;

    async fn reviews_for(
        &self,
        hotel_ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, ReviewRecord>, StoreError>;

    // Hotels that have at least one review in any language
    async fn reviewed_hotels(&self, hotel_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    // Stable order by hotel id, for full scans
    async fn hotel_page(&self, offset: usize, limit: usize)
        -> Result<Vec<HotelContent>, StoreError>;

    // Swaps the whole stats table
    async fn replace_city_stats(&self, stats: &[CityStats]) -> Result<(), StoreError>;

    async fn city_stats(&self, city_normalized: &str) -> Result<Option<CityStats>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::model::{HotelContent, HotelPolicy, PoiRecord, PointOfInterest, ReviewRecord};
    use std::collections::BTreeMap;

    pub fn hotel(id: &str, city: &str, stars: Option<u8>) -> HotelContent {
        HotelContent {
            hotel_id: id.to_string(),
            canonical_name: format!("Hotel {}", id),
            translated_names: BTreeMap::from([("fr".to_string(), format!("Hôtel {}", id))]),
            images: vec![format!("https://img.example.com/{}/1.jpg", id)],
            amenities: vec!["wifi".to_string()],
            policy: HotelPolicy {
                check_in_from: Some("14:00".to_string()),
                ..HotelPolicy::default()
            },
            city_normalized: city.to_string(),
            country_code: "AE".to_string(),
            star_rating: stars,
        }
    }

    pub fn poi(id: &str, language: &str) -> PoiRecord {
        PoiRecord {
            hotel_id: id.to_string(),
            language: language.to_string(),
            points: vec![PointOfInterest {
                name: "Dubai Mall".to_string(),
                kind: "shopping".to_string(),
                distance_m: Some(850),
            }],
        }
    }

    pub fn review(id: &str, language: &str, count: u32) -> ReviewRecord {
        ReviewRecord {
            hotel_id: id.to_string(),
            language: language.to_string(),
            rating: 8.6,
            review_count: count,
            detailed_ratings: BTreeMap::from([("cleanliness".to_string(), 9.1)]),
            highlights: vec!["great location".to_string()],
        }
    }
}
