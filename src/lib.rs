// Hotel inventory aggregation and caching engine: batched supplier search
// behind a single-flight TTL cache, content enrichment, margin pricing, bulk
// dump ingestion and price watch scanning.

pub mod alerts;
pub mod cache;
pub mod clock;
pub mod config;
pub mod enrich;
pub mod ingest;
pub mod jobs;
pub mod logger;
pub mod margin;
pub mod model;
pub mod pagination;
pub mod service;
pub mod stats;
pub mod store;
pub mod supplier;

// Re-export key types for convenience
pub use cache::{BatchCache, CacheConfig, CacheError, CacheLookup, EvictionPolicy};
pub use config::AppConfig;
pub use enrich::ContentEnricher;
pub use ingest::{DumpIngestor, DumpSource, IngestReport};
pub use margin::{MarginEngine, MarginRule};
pub use model::{BatchKey, HotelSummary, Occupancy, PricedHotel, SearchSignature};
pub use pagination::{Page, PagingConfig, PaginationCoordinator, SearchError};
pub use service::{InventoryService, SearchPageResponse, SearchRequest};
pub use store::{ContentStore, MemoryContentStore, SqlContentStore};
pub use supplier::{HttpSupplierClient, SupplierClient, SupplierError};
