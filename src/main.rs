use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use hotel_inventory::alerts::{ChannelNotifier, MemoryAlertStore, PriceAlertScanner};
use hotel_inventory::cache::BatchCache;
use hotel_inventory::clock::{Clock, SystemClock};
use hotel_inventory::config::AppConfig;
use hotel_inventory::enrich::ContentEnricher;
use hotel_inventory::ingest::DumpIngestor;
use hotel_inventory::jobs::spawn_periodic;
use hotel_inventory::logger::init_tracing;
use hotel_inventory::margin::{MarginEngine, MarginRule};
use hotel_inventory::pagination::{BatchPipeline, PaginationCoordinator};
use hotel_inventory::service::InventoryService;
use hotel_inventory::stats::CityStatsAggregator;
use hotel_inventory::store::{ContentStore, SqlContentStore};
use hotel_inventory::supplier::{DumpKind, HttpSupplierClient, SupplierClient};

const CITY_SCAN_PAGE_SIZE: usize = 1_000;

async fn load_margin_rules(config: &AppConfig) -> anyhow::Result<MarginEngine> {
    let Some(path) = &config.margin_rules_path else {
        warn!("no margin rules configured, serving net prices");
        return Ok(MarginEngine::empty());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading margin rules from {}", path.display()))?;
    let rules: Vec<MarginRule> = serde_json::from_str(&raw).context("parsing margin rules")?;
    info!(rules = rules.len(), "margin rules loaded");
    Ok(MarginEngine::new(rules)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(config.log_json);
    info!("starting hotel inventory");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sql = SqlContentStore::connect(&config.database_url, config.database_max_connections).await?;
    sql.migrate().await?;
    let content: Arc<dyn ContentStore> = Arc::new(sql);

    let supplier: Arc<dyn SupplierClient> = Arc::new(HttpSupplierClient::new(config.supplier.clone())?);
    let margin = Arc::new(load_margin_rules(&config).await?);

    let enricher = Arc::new(ContentEnricher::new(content.clone(), config.content_language.clone()));
    let pipeline = Arc::new(BatchPipeline::new(
        supplier.clone(),
        enricher,
        margin,
        config.paging,
    ));
    let cache = Arc::new(BatchCache::new(config.cache.clone(), clock.clone()));
    let coordinator = Arc::new(PaginationCoordinator::new(
        config.paging,
        cache.clone(),
        pipeline,
    )?);

    let city_stats = Arc::new(CityStatsAggregator::new(
        content.clone(),
        clock.clone(),
        CITY_SCAN_PAGE_SIZE,
    ));
    let watches = Arc::new(MemoryAlertStore::new());
    let (notifier, mut drops) = ChannelNotifier::new(256);
    let scanner = Arc::new(PriceAlertScanner::new(
        coordinator.clone(),
        watches.clone(),
        Arc::new(notifier),
        clock.clone(),
        config.alerts.clone(),
    ));

    // Request handling lives in the API layer that embeds the service
    let _service = Arc::new(InventoryService::new(
        coordinator,
        content.clone(),
        city_stats.clone(),
        watches,
        clock,
        config.alerts.default_cooldown_seconds,
    ));

    tokio::spawn(async move {
        while let Some(event) = drops.recv().await {
            info!(
                alert_id = %event.alert_id,
                owner = %event.owner_id,
                hotel_id = %event.hotel_id,
                previous = %event.previous_price,
                current = %event.current_price,
                "price drop detected"
            );
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut jobs = Vec::new();

    let ingestor = Arc::new(
        DumpIngestor::new(content, config.ingest.batch_size)
            .with_max_line_bytes(config.ingest.max_line_bytes),
    );
    let dump_dir = Arc::new(config.ingest.dump_dir.clone());
    let languages = Arc::new(config.ingest.languages.clone());
    jobs.push(spawn_periodic(
        "dump_refresh",
        Duration::from_secs(config.ingest.refresh_interval_seconds.max(1)),
        shutdown_rx.clone(),
        move || {
            let ingestor = ingestor.clone();
            let supplier = supplier.clone();
            let dump_dir = dump_dir.clone();
            let languages = languages.clone();
            async move {
                // Hotel content is fetched once, POIs and reviews once per language
                let primary = languages.first().map(String::as_str).unwrap_or("en");
                ingestor
                    .refresh(supplier.as_ref(), DumpKind::HotelContent, primary, &dump_dir)
                    .await?;
                for language in languages.iter() {
                    for kind in [DumpKind::PointsOfInterest, DumpKind::Reviews] {
                        if let Err(e) = ingestor
                            .refresh(supplier.as_ref(), kind, language, &dump_dir)
                            .await
                        {
                            warn!(%kind, language = %language, error = %e, "dump refresh failed");
                        }
                    }
                }
                Ok(())
            }
        },
    ));

    let stats_job = city_stats.clone();
    jobs.push(spawn_periodic(
        "city_stats",
        Duration::from_secs(config.city_stats_interval_seconds.max(1)),
        shutdown_rx.clone(),
        move || {
            let stats = stats_job.clone();
            async move {
                let cities = stats.refresh().await?;
                info!(cities, "city stats refreshed");
                Ok(())
            }
        },
    ));

    jobs.push(spawn_periodic(
        "price_alert_sweep",
        Duration::from_secs(config.alerts.sweep_interval_seconds.max(1)),
        shutdown_rx.clone(),
        move || {
            let scanner = scanner.clone();
            async move {
                let report = scanner.sweep().await?;
                info!(?report, "price alert sweep finished");
                Ok(())
            }
        },
    ));

    jobs.push(spawn_periodic(
        "cache_purge",
        Duration::from_secs(config.cache.cleanup_interval_seconds.max(1)),
        shutdown_rx,
        move || {
            let cache = cache.clone();
            async move {
                let purged = cache.purge_expired();
                if purged > 0 {
                    info!(purged, entries = cache.len(), "expired batches purged");
                }
                Ok(())
            }
        },
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for job in jobs {
        let _ = job.await;
    }
    info!("stopped");
    Ok(())
}
