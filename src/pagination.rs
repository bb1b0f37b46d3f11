// Page requests to cached batches. A page maps to exactly one batch; a cold
// batch is fetched on its own, without fetching the batches before it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::{BatchCache, CacheError, FetchedBatch};
use crate::enrich::ContentEnricher;
use crate::margin::MarginEngine;
use crate::model::{BatchKey, PricedHotel, SearchSignature};
use crate::supplier::{SearchQuery, SupplierClient, SupplierError};

#[derive(Error, Debug, Clone)]
pub enum SearchError {
    #[error("Page must be 1 or greater, got {0}")]
    InvalidPage(u32),

    #[error("Invalid paging configuration: {0}")]
    InvalidPaging(String),

    #[error("Search results unavailable: {0}")]
    Unavailable(#[from] CacheError),
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::Unavailable(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingConfig {
    pub batch_size: usize,
    pub page_size: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            page_size: 20,
        }
    }
}

impl PagingConfig {
    pub fn new(batch_size: usize, page_size: usize) -> Result<Self, SearchError> {
        let config = Self {
            batch_size,
            page_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.page_size == 0 || self.batch_size == 0 {
            return Err(SearchError::InvalidPaging(
                "batch and page size must be positive".to_string(),
            ));
        }
        if self.batch_size % self.page_size != 0 {
            return Err(SearchError::InvalidPaging(format!(
                "batch size {} is not a multiple of page size {}",
                self.batch_size, self.page_size
            )));
        }
        Ok(())
    }

    pub fn pages_per_batch(&self) -> u32 {
        (self.batch_size / self.page_size) as u32
    }

    // 1-based
    pub fn batch_number(&self, page: u32) -> u32 {
        (page - 1) / self.pages_per_batch() + 1
    }

    // Page position inside its batch, 0-based
    pub fn offset_in_batch(&self, page: u32) -> usize {
        ((page - 1) % self.pages_per_batch()) as usize
    }

    pub fn batch_start(&self, batch_number: u32) -> usize {
        (batch_number as usize - 1) * self.batch_size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub hotels: Vec<PricedHotel>,
    pub page: u32,
    pub total_pages: u32,
    pub has_more: bool,
    pub batch_number: u32,
    pub total_available: usize,
    pub from_cache: bool,
    pub stale: bool,
}

// Miss path of the cache: supplier search, content join, margin
pub struct BatchPipeline {
    supplier: Arc<dyn SupplierClient>,
    enricher: Arc<ContentEnricher>,
    margin: Arc<MarginEngine>,
    paging: PagingConfig,
}

impl BatchPipeline {
    pub fn new(
        supplier: Arc<dyn SupplierClient>,
        enricher: Arc<ContentEnricher>,
        margin: Arc<MarginEngine>,
        paging: PagingConfig,
    ) -> Self {
        Self {
            supplier,
            enricher,
            margin,
            paging,
        }
    }

    pub fn margin(&self) -> &Arc<MarginEngine> {
        &self.margin
    }

    pub fn supplier(&self) -> &Arc<dyn SupplierClient> {
        &self.supplier
    }

    // The supplier only ranks from the top, so batch B asks for the first
    // B * batch_size hits and keeps the last batch_size of them.
    pub async fn fetch_batch(
        &self,
        key: &BatchKey,
    ) -> Result<FetchedBatch<PricedHotel>, SupplierError> {
        let limit = key.batch_number as usize * self.paging.batch_size;
        let results = self
            .supplier
            .search(SearchQuery::new(&key.signature, limit))
            .await?;

        let returned = results.hits.len();
        let total_available = match results.total {
            Some(total) => total.max(returned),
            None if returned < limit => returned,
            None => limit + 1,
        };

        let hits: Vec<_> = results
            .hits
            .into_iter()
            .skip(self.paging.batch_start(key.batch_number))
            .take(self.paging.batch_size)
            .collect();

        let enriched = self.enricher.enrich(&hits).await;
        let items = self.margin.price_hotels(enriched);

        debug!(key = %key, hits = items.len(), total_available, "batch assembled");
        Ok(FetchedBatch {
            items,
            total_available,
        })
    }
}

pub struct PaginationCoordinator {
    paging: PagingConfig,
    cache: Arc<BatchCache<PricedHotel>>,
    pipeline: Arc<BatchPipeline>,
}

impl PaginationCoordinator {
    pub fn new(
        paging: PagingConfig,
        cache: Arc<BatchCache<PricedHotel>>,
        pipeline: Arc<BatchPipeline>,
    ) -> Result<Self, SearchError> {
        paging.validate()?;
        Ok(Self {
            paging,
            cache,
            pipeline,
        })
    }

    pub fn paging(&self) -> &PagingConfig {
        &self.paging
    }

    pub fn cache(&self) -> &Arc<BatchCache<PricedHotel>> {
        &self.cache
    }

    pub fn pipeline(&self) -> &Arc<BatchPipeline> {
        &self.pipeline
    }

    // Total reported by a live earlier batch of the same search. The batch
    // right before is checked first, then the first batch.
    fn known_total(&self, signature: &SearchSignature, batch_number: u32) -> Option<usize> {
        let previous = batch_number.checked_sub(1).filter(|b| *b >= 1)?;
        [previous, 1]
            .into_iter()
            .find_map(|b| self.cache.peek(&BatchKey::new(signature.clone(), b)))
            .map(|entry| entry.total_available)
    }

    fn total_pages(&self, total_available: usize) -> u32 {
        total_available.div_ceil(self.paging.page_size) as u32
    }

    #[instrument(skip(self, signature), fields(signature = %signature))]
    pub async fn get_page(
        &self,
        signature: &SearchSignature,
        page: u32,
    ) -> Result<Page, SearchError> {
        if page == 0 {
            return Err(SearchError::InvalidPage(page));
        }

        let batch_number = self.paging.batch_number(page);

        // Past the end of a destination we already know the size of
        if let Some(total) = self.known_total(signature, batch_number) {
            if self.paging.batch_start(batch_number) >= total {
                debug!(page, batch_number, total, "page beyond known total");
                return Ok(Page {
                    hotels: Vec::new(),
                    page,
                    total_pages: self.total_pages(total),
                    has_more: false,
                    batch_number,
                    total_available: total,
                    from_cache: true,
                    stale: false,
                });
            }
        }

        let key = BatchKey::new(signature.clone(), batch_number);
        let pipeline = Arc::clone(&self.pipeline);
        let fetch_key = key.clone();
        let lookup = self
            .cache
            .get_or_fetch(key, move || async move {
                pipeline.fetch_batch(&fetch_key).await
            })
            .await?;

        let entry = &lookup.entry;

        let start = self.paging.offset_in_batch(page) * self.paging.page_size;
        let hotels: Vec<PricedHotel> = entry
            .items
            .iter()
            .skip(start)
            .take(self.paging.page_size)
            .cloned()
            .collect();

        Ok(Page {
            hotels,
            page,
            total_pages: self.total_pages(entry.total_available),
            has_more: (page as usize) * self.paging.page_size < entry.total_available,
            batch_number,
            total_available: entry.total_available,
            from_cache: lookup.from_cache(),
            stale: lookup.is_stale(),
        })
    }
}

// Coordinator over a fake supplier and an empty content store, 600s TTL
#[cfg(test)]
pub(crate) fn test_coordinator(
    supplier: Arc<crate::supplier::mock::FakeSupplier>,
    margin: Arc<MarginEngine>,
    clock: Arc<dyn crate::clock::Clock>,
) -> Arc<PaginationCoordinator> {
    use crate::cache::CacheConfig;
    use crate::store::MemoryContentStore;

    let store = Arc::new(MemoryContentStore::new());
    let enricher = Arc::new(ContentEnricher::new(store, "en"));
    let paging = PagingConfig::default();
    let pipeline = Arc::new(BatchPipeline::new(supplier, enricher, margin, paging));
    let cache = Arc::new(BatchCache::new(
        CacheConfig {
            ttl_seconds: 600,
            ..CacheConfig::default()
        },
        clock.clone(),
    ));
    Arc::new(PaginationCoordinator::new(paging, cache, pipeline).expect("default paging is valid"))
}
