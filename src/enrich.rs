// Left join of supplier hits with local content. Every hit comes out, in the
// order the supplier ranked it, whether or not the store knows the hotel.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::{EnrichedHotel, HotelContent, HotelSummary, PoiRecord, ReviewRecord};
use crate::store::{ContentStore, StoreError};

pub struct ContentEnricher {
    store: Arc<dyn ContentStore>,
    language: String,
}

#[derive(Default)]
struct ContentSet {
    hotels: HashMap<String, HotelContent>,
    pois: HashMap<String, PoiRecord>,
    reviews: HashMap<String, ReviewRecord>,
}

impl ContentEnricher {
    pub fn new(store: Arc<dyn ContentStore>, language: impl Into<String>) -> Self {
        Self {
            store,
            language: language.into(),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub async fn enrich(&self, hits: &[HotelSummary]) -> Vec<EnrichedHotel> {
        if hits.is_empty() {
            return Vec::new();
        }

        let ids: Vec<String> = hits.iter().map(|h| h.supplier_hotel_id.clone()).collect();
        let content = match self.load(&ids).await {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, hits = hits.len(), "content store read failed, serving supplier data only");
                ContentSet::default()
            }
        };

        let enriched: Vec<EnrichedHotel> = hits.iter().map(|hit| join(hit, &content)).collect();
        debug!(
            hits = hits.len(),
            with_content = enriched.iter().filter(|h| h.has_content).count(),
            "batch enriched"
        );
        enriched
    }

    async fn load(&self, ids: &[String]) -> Result<ContentSet, StoreError> {
        let (hotels, pois, reviews) = tokio::try_join!(
            self.store.hotels_by_ids(ids),
            self.store.pois_for(ids, &self.language),
            self.store.reviews_for(ids, &self.language),
        )?;
        Ok(ContentSet {
            hotels,
            pois,
            reviews,
        })
    }
}

fn join(hit: &HotelSummary, content: &ContentSet) -> EnrichedHotel {
    let id = &hit.supplier_hotel_id;
    let review = content.reviews.get(id);
    let points = content
        .pois
        .get(id)
        .map(|r| r.points.clone())
        .unwrap_or_default();

    match content.hotels.get(id) {
        Some(hotel) => EnrichedHotel {
            summary: hit.clone(),
            name: hotel.canonical_name.clone(),
            translated_names: hotel.translated_names.clone(),
            images: hotel.images.clone(),
            amenities: hotel.amenities.clone(),
            policy: Some(hotel.policy.clone()),
            city_normalized: Some(hotel.city_normalized.clone()),
            country_code: Some(hotel.country_code.clone()).filter(|c| !c.is_empty()),
            star_rating: hotel.star_rating,
            review_rating: review.map(|r| r.rating),
            review_count: review.map(|r| r.review_count).unwrap_or(0),
            points_of_interest: points,
            has_content: true,
        },
        None => EnrichedHotel {
            summary: hit.clone(),
            name: hit.name.clone(),
            translated_names: Default::default(),
            images: hit.thumbnail_url.iter().cloned().collect(),
            amenities: Vec::new(),
            policy: None,
            city_normalized: None,
            country_code: None,
            star_rating: None,
            review_rating: review.map(|r| r.rating),
            review_count: review.map(|r| r.review_count).unwrap_or(0),
            points_of_interest: points,
            has_content: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{hotel, poi, review};
    use crate::store::MemoryContentStore;
    use rust_decimal::Decimal;

    fn hit(id: &str) -> HotelSummary {
        HotelSummary {
            supplier_hotel_id: id.to_string(),
            name: format!("SUPPLIER {}", id),
            raw_net_price: Decimal::new(10000, 2),
            currency: "USD".to_string(),
            supplier_rating: Some(3.5),
            thumbnail_url: None,
        }
    }

    async fn seeded_store() -> Arc<MemoryContentStore> {
        let store = Arc::new(MemoryContentStore::new());
        store
            .upsert_hotels(&[hotel("1", "dubai", Some(5)), hotel("3", "dubai", Some(3))])
            .await
            .unwrap();
        store.upsert_pois(&[poi("1", "en"), poi("3", "fr")]).await.unwrap();
        store.upsert_reviews(&[review("1", "en", 120)]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_left_join_keeps_every_hit_in_order() {
        let store = seeded_store().await;
        let enricher = ContentEnricher::new(store, "en");

        let enriched = enricher.enrich(&[hit("3"), hit("2"), hit("1")]).await;
        let ids: Vec<_> = enriched
            .iter()
            .map(|h| h.summary.supplier_hotel_id.as_str())
            .collect();
        assert_eq!(ids, vec!["3", "2", "1"]);

        let full = &enriched[2];
        assert!(full.has_content);
        assert_eq!(full.name, "Hotel 1");
        assert_eq!(full.city_normalized.as_deref(), Some("dubai"));
        assert_eq!(full.review_count, 120);
        assert_eq!(full.points_of_interest.len(), 1);

        // POIs exist only in French for hotel 3
        assert!(enriched[0].points_of_interest.is_empty());
    }

    #[tokio::test]
    async fn test_missing_content_falls_back_to_supplier_fields() {
        let store = seeded_store().await;
        let enricher = ContentEnricher::new(store, "en");

        let mut unknown = hit("2");
        unknown.thumbnail_url = Some("https://cdn.example.com/2.jpg".to_string());
        let enriched = enricher.enrich(&[unknown]).await;

        assert!(!enriched[0].has_content);
        assert_eq!(enriched[0].name, "SUPPLIER 2");
        assert_eq!(enriched[0].images, vec!["https://cdn.example.com/2.jpg"]);
        assert!(enriched[0].policy.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_fatal() {
        let store = seeded_store().await;
        store.set_reads_fail(true);
        let enricher = ContentEnricher::new(store, "en");

        let enriched = enricher.enrich(&[hit("1"), hit("3")]).await;
        assert_eq!(enriched.len(), 2);
        assert!(enriched.iter().all(|h| !h.has_content));
    }
}
