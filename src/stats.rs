// Per-city aggregates for the destination overview. Rebuilt by a full pass
// over the content store, then read with a single keyed lookup.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::model::{normalize_key, CityStats};
use crate::store::{ContentStore, StoreError};

pub struct CityStatsAggregator {
    store: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    scan_page_size: usize,
}

impl CityStatsAggregator {
    pub fn new(store: Arc<dyn ContentStore>, clock: Arc<dyn Clock>, scan_page_size: usize) -> Self {
        Self {
            store,
            clock,
            scan_page_size: scan_page_size.max(1),
        }
    }

    // Returns the number of cities written
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let refreshed_at = self.clock.now();
        let mut cities: BTreeMap<String, CityStats> = BTreeMap::new();
        let mut offset = 0;

        loop {
            let page = self.store.hotel_page(offset, self.scan_page_size).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            let ids: Vec<String> = page.iter().map(|h| h.hotel_id.clone()).collect();
            let reviewed: HashSet<String> = self.store.reviewed_hotels(&ids).await?;

            for hotel in page.iter().filter(|h| !h.city_normalized.is_empty()) {
                let stats = cities
                    .entry(hotel.city_normalized.clone())
                    .or_insert_with(|| CityStats {
                        city: hotel.city_normalized.clone(),
                        total_hotels: 0,
                        rated_hotels: 0,
                        star_histogram: [0; 6],
                        refreshed_at,
                    });
                stats.total_hotels += 1;
                if reviewed.contains(&hotel.hotel_id) {
                    stats.rated_hotels += 1;
                }
                let stars = hotel.star_rating.unwrap_or(0).min(5) as usize;
                stats.star_histogram[stars] += 1;
            }
            debug!(scanned = offset, cities = cities.len(), "city stats scan progress");
        }

        let stats: Vec<CityStats> = cities.into_values().collect();
        self.store.replace_city_stats(&stats).await?;
        info!(cities = stats.len(), hotels = offset, "city stats refreshed");
        Ok(stats.len())
    }

    pub async fn destination_overview(&self, city: &str) -> Result<Option<CityStats>, StoreError> {
        self.store.city_stats(&normalize_key(city)).await
    }
}
