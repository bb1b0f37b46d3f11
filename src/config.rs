use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::alerts::AlertConfig;
use crate::cache::{CacheConfig, EvictionPolicy};
use crate::ingest::IngestConfig;
use crate::pagination::{PagingConfig, SearchError};
use crate::supplier::http::{ClientConfig, RetryConfig};

const PREFIX: &str = "HOTEL_INVENTORY_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key}={value} is invalid: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Paging(#[from] SearchError),
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// sqlx connection string for the content store.
    pub database_url: String,
    pub database_max_connections: u32,

    pub supplier: ClientConfig,
    pub cache: CacheConfig,
    pub paging: PagingConfig,
    pub ingest: IngestConfig,
    pub alerts: AlertConfig,

    /// Language used for POIs and reviews in search results.
    pub content_language: String,
    /// Optional JSON file with the margin rules to load at startup.
    pub margin_rules_path: Option<PathBuf>,
    pub city_stats_interval_seconds: u64,

    /// JSON log lines instead of the pretty format.
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://hotel_inventory.db?mode=rwc".to_string(),
            database_max_connections: 8,
            supplier: ClientConfig::default(),
            cache: CacheConfig::default(),
            paging: PagingConfig::default(),
            ingest: IngestConfig::default(),
            alerts: AlertConfig::default(),
            content_language: "en".to_string(),
            margin_rules_path: None,
            city_stats_interval_seconds: 3600,
            log_json: false,
        }
    }
}

// Typed reads over a key lookup, so tests do not need the process env
struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", PREFIX, key)).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: format!("{}{}", PREFIX, key),
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::Invalid {
                key: format!("{}{}", PREFIX, key),
                value: v,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}

fn parse_eviction_policy(value: &str) -> Result<EvictionPolicy, String> {
    match value.to_ascii_lowercase().as_str() {
        "lru" => Ok(EvictionPolicy::LeastRecentlyUsed),
        "lfu" => Ok(EvictionPolicy::LeastFrequentlyUsed),
        "oldest" | "fifo" => Ok(EvictionPolicy::OldestFetch),
        other => Err(format!("unknown eviction policy '{}'", other)),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source { lookup };
        let d = Self::default();

        let retry_defaults = RetryConfig::default();
        let supplier = ClientConfig {
            base_url: src.string("SUPPLIER_URL", d.supplier.base_url),
            api_key: src.string("SUPPLIER_API_KEY", d.supplier.api_key),
            max_concurrent_requests: src
                .parse("SUPPLIER_MAX_CONCURRENT", d.supplier.max_concurrent_requests)?,
            timeout_ms: src.parse("SUPPLIER_TIMEOUT_MS", d.supplier.timeout_ms)?,
            retry_config: RetryConfig {
                max_retries: src.parse("SUPPLIER_MAX_RETRIES", retry_defaults.max_retries)?,
                initial_backoff_ms: src
                    .parse("SUPPLIER_INITIAL_BACKOFF_MS", retry_defaults.initial_backoff_ms)?,
                max_backoff_ms: src.parse("SUPPLIER_MAX_BACKOFF_MS", retry_defaults.max_backoff_ms)?,
                ..retry_defaults
            },
        };

        let eviction_policy = match src.raw("CACHE_EVICTION") {
            None => d.cache.eviction_policy,
            Some(value) => parse_eviction_policy(&value).map_err(|reason| ConfigError::Invalid {
                key: format!("{}CACHE_EVICTION", PREFIX),
                value,
                reason,
            })?,
        };
        let cache = CacheConfig {
            ttl_seconds: src.parse("CACHE_TTL_SECONDS", d.cache.ttl_seconds)?,
            stale_retention_seconds: src
                .parse("CACHE_STALE_RETENTION_SECONDS", d.cache.stale_retention_seconds)?,
            max_entries: src.parse("CACHE_MAX_ENTRIES", d.cache.max_entries)?,
            wait_timeout_ms: src.parse("CACHE_WAIT_TIMEOUT_MS", d.cache.wait_timeout_ms)?,
            cleanup_interval_seconds: src
                .parse("CACHE_CLEANUP_INTERVAL_SECONDS", d.cache.cleanup_interval_seconds)?,
            eviction_policy,
        };

        let paging = PagingConfig::new(
            src.parse("BATCH_SIZE", d.paging.batch_size)?,
            src.parse("PAGE_SIZE", d.paging.page_size)?,
        )?;

        let ingest = IngestConfig {
            batch_size: src.parse("INGEST_BATCH_SIZE", d.ingest.batch_size)?,
            dump_dir: src
                .raw("DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.ingest.dump_dir),
            languages: src
                .raw("DUMP_LANGUAGES")
                .map(|v| {
                    v.split(',')
                        .map(|l| l.trim().to_ascii_lowercase())
                        .filter(|l| !l.is_empty())
                        .collect()
                })
                .unwrap_or(d.ingest.languages),
            refresh_interval_seconds: src
                .parse("DUMP_REFRESH_INTERVAL_SECONDS", d.ingest.refresh_interval_seconds)?,
            max_line_bytes: src.parse("DUMP_MAX_LINE_BYTES", d.ingest.max_line_bytes)?,
        };

        let alerts = AlertConfig {
            workers: src.parse("ALERT_WORKERS", d.alerts.workers)?,
            per_alert_timeout_ms: src.parse("ALERT_TIMEOUT_MS", d.alerts.per_alert_timeout_ms)?,
            max_pages: src.parse("ALERT_MAX_PAGES", d.alerts.max_pages)?,
            default_cooldown_seconds: src
                .parse("ALERT_COOLDOWN_SECONDS", d.alerts.default_cooldown_seconds)?,
            sweep_interval_seconds: src
                .parse("ALERT_INTERVAL_SECONDS", d.alerts.sweep_interval_seconds)?,
        };

        Ok(Self {
            database_url: src.string("DATABASE_URL", d.database_url),
            database_max_connections: src
                .parse("DATABASE_MAX_CONNECTIONS", d.database_max_connections)?,
            supplier,
            cache,
            paging,
            ingest,
            alerts,
            content_language: src
                .string("CONTENT_LANGUAGE", d.content_language)
                .to_ascii_lowercase(),
            margin_rules_path: src.raw("MARGIN_RULES").map(PathBuf::from),
            city_stats_interval_seconds: src
                .parse("CITY_STATS_INTERVAL_SECONDS", d.city_stats_interval_seconds)?,
            log_json: src.flag("LOG_JSON", d.log_json)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{}{}", PREFIX, k), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config.paging, PagingConfig::default());
        assert_eq!(config.cache.ttl_seconds, 900);
        assert_eq!(config.ingest.batch_size, 500);
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CACHE_TTL_SECONDS", "60"),
            ("CACHE_EVICTION", "lfu"),
            ("BATCH_SIZE", "150"),
            ("PAGE_SIZE", "25"),
            ("DUMP_LANGUAGES", "en, FR,,de"),
            ("LOG_JSON", "true"),
            ("SUPPLIER_MAX_RETRIES", "5"),
        ])
        .unwrap();

        assert_eq!(config.cache.ttl_seconds, 60);
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::LeastFrequentlyUsed);
        assert_eq!(config.paging.pages_per_batch(), 6);
        assert_eq!(config.ingest.languages, vec!["en", "fr", "de"]);
        assert!(config.log_json);
        assert_eq!(config.supplier.retry_config.max_retries, 5);
        assert_eq!(config.supplier.retry_config.jitter_factor, 0.1);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        assert!(matches!(
            load(&[("CACHE_MAX_ENTRIES", "lots")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[("BATCH_SIZE", "100"), ("PAGE_SIZE", "30")]),
            Err(ConfigError::Paging(_))
        ));
        assert!(matches!(
            load(&[("LOG_JSON", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
