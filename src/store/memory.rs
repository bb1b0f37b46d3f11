// In-process content store, used by tests and as a fallback when no
// database is configured.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ContentStore, StoreCounts, StoreError};
use crate::model::{CityStats, HotelContent, PoiRecord, ReviewRecord};

#[derive(Default)]
pub struct MemoryContentStore {
    hotels: RwLock<BTreeMap<String, HotelContent>>,
    pois: DashMap<(String, String), PoiRecord>,
    reviews: DashMap<(String, String), ReviewRecord>,
    city_stats: RwLock<HashMap<String, CityStats>>,
    reads_fail: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_reads_fail(&self, fail: bool) {
        self.reads_fail.store(fail, Ordering::SeqCst);
    }

    fn check_readable(&self) -> Result<(), StoreError> {
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn upsert_hotels(&self, hotels: &[HotelContent]) -> Result<usize, StoreError> {
        let mut map = self.hotels.write();
        for hotel in hotels {
            map.insert(hotel.hotel_id.clone(), hotel.clone());
        }
        Ok(hotels.len())
    }

    async fn upsert_pois(&self, records: &[PoiRecord]) -> Result<usize, StoreError> {
        for record in records {
            self.pois.insert(
                (record.hotel_id.clone(), record.language.clone()),
                record.clone(),
            );
        }
        Ok(records.len())
    }

    async fn upsert_reviews(&self, records: &[ReviewRecord]) -> Result<usize, StoreError> {
        for record in records {
            self.reviews.insert(
                (record.hotel_id.clone(), record.language.clone()),
                record.clone(),
            );
        }
        Ok(records.len())
    }

    async fn hotels_by_ids(
        &self,
        hotel_ids: &[String],
    ) -> Result<HashMap<String, HotelContent>, StoreError> {
        self.check_readable()?;
        let map = self.hotels.read();
        Ok(hotel_ids
            .iter()
            .filter_map(|id| map.get(id).map(|h| (id.clone(), h.clone())))
            .collect())
    }

    async fn pois_for(
        &self,
        hotel_ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, PoiRecord>, StoreError> {
        self.check_readable()?;
        Ok(hotel_ids
            .iter()
            .filter_map(|id| {
                self.pois
                    .get(&(id.clone(), language.to_string()))
                    .map(|r| (id.clone(), r.clone()))
            })
            .collect())
    }

    async fn reviews_for(
        &self,
        hotel_ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, ReviewRecord>, StoreError> {
        self.check_readable()?;
        Ok(hotel_ids
            .iter()
            .filter_map(|id| {
                self.reviews
                    .get(&(id.clone(), language.to_string()))
                    .map(|r| (id.clone(), r.clone()))
            })
            .collect())
    }

    async fn reviewed_hotels(&self, hotel_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        self.check_readable()?;
        let wanted: HashSet<&String> = hotel_ids.iter().collect();
        Ok(self
            .reviews
            .iter()
            .filter(|r| r.review_count > 0 && wanted.contains(&r.key().0))
            .map(|r| r.key().0.clone())
            .collect())
    }

    async fn hotel_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HotelContent>, StoreError> {
        self.check_readable()?;
        Ok(self
            .hotels
            .read()
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replace_city_stats(&self, stats: &[CityStats]) -> Result<(), StoreError> {
        let fresh = stats
            .iter()
            .map(|s| (s.city.clone(), s.clone()))
            .collect::<HashMap<_, _>>();
        *self.city_stats.write() = fresh;
        Ok(())
    }

    async fn city_stats(&self, city_normalized: &str) -> Result<Option<CityStats>, StoreError> {
        self.check_readable()?;
        Ok(self.city_stats.read().get(city_normalized).cloned())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        Ok(StoreCounts {
            hotels: self.hotels.read().len(),
            poi_records: self.pois.len(),
            review_records: self.reviews.len(),
            cities: self.city_stats.read().len(),
        })
    }
}
