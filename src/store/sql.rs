// sqlx-backed content store. Records are stored as JSON payloads next to
// the columns used for lookups, so schema changes to the content model do
// not need migrations.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use super::{ContentStore, StoreCounts, StoreError};
use crate::model::{CityStats, HotelContent, PoiRecord, ReviewRecord};

// Keeps IN lists under SQLite's bound-parameter limit
const LOOKUP_CHUNK: usize = 500;

pub struct SqlContentStore {
    pool: AnyPool,
}

impl SqlContentStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hotels (
  hotel_id TEXT PRIMARY KEY,
  city_normalized TEXT NOT NULL,
  country_code TEXT NOT NULL,
  payload TEXT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hotel_pois (
  hotel_id TEXT NOT NULL,
  language TEXT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (hotel_id, language)
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hotel_reviews (
  hotel_id TEXT NOT NULL,
  language TEXT NOT NULL,
  review_count BIGINT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (hotel_id, language)
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS city_stats (
  city TEXT PRIMARY KEY,
  payload TEXT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_hotels_city ON hotels(city_normalized);"#)
            .execute(&self.pool)
            .await?;

        info!("content store schema ready");
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {};", table))
            .fetch_one(&self.pool)
            .await?;
        i64_to_usize(row.get::<i64, _>("n"))
    }

    // Runs `sql_prefix (?, ?, ...) sql_suffix` per chunk of ids, the suffix
    // binds come after the ids
    async fn fetch_by_ids(
        &self,
        sql_prefix: &str,
        sql_suffix: &str,
        ids: &[String],
        suffix_binds: &[&str],
    ) -> Result<Vec<AnyRow>, StoreError> {
        let mut rows = Vec::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let sql = format!("{} ({}) {}", sql_prefix, placeholders(chunk.len()), sql_suffix);
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id.clone());
            }
            for value in suffix_binds {
                query = query.bind(value.to_string());
            }
            rows.extend(query.fetch_all(&self.pool).await?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl ContentStore for SqlContentStore {
    async fn upsert_hotels(&self, hotels: &[HotelContent]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for hotel in hotels {
            sqlx::query(
                r#"
INSERT INTO hotels (hotel_id, city_normalized, country_code, payload)
VALUES (?, ?, ?, ?)
ON CONFLICT(hotel_id) DO UPDATE SET
  city_normalized = excluded.city_normalized,
  country_code = excluded.country_code,
  payload = excluded.payload;
"#,
            )
            .bind(hotel.hotel_id.clone())
            .bind(hotel.city_normalized.clone())
            .bind(hotel.country_code.clone())
            .bind(serde_json::to_string(hotel)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(hotels.len())
    }

    async fn upsert_pois(&self, records: &[PoiRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
INSERT INTO hotel_pois (hotel_id, language, payload)
VALUES (?, ?, ?)
ON CONFLICT(hotel_id, language) DO UPDATE SET payload = excluded.payload;
"#,
            )
            .bind(record.hotel_id.clone())
            .bind(record.language.clone())
            .bind(serde_json::to_string(record)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn upsert_reviews(&self, records: &[ReviewRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
INSERT INTO hotel_reviews (hotel_id, language, review_count, payload)
VALUES (?, ?, ?, ?)
ON CONFLICT(hotel_id, language) DO UPDATE SET
  review_count = excluded.review_count,
  payload = excluded.payload;
"#,
            )
            .bind(record.hotel_id.clone())
            .bind(record.language.clone())
            .bind(record.review_count as i64)
            .bind(serde_json::to_string(record)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn hotels_by_ids(
        &self,
        hotel_ids: &[String],
    ) -> Result<HashMap<String, HotelContent>, StoreError> {
        let rows = self
            .fetch_by_ids("SELECT payload FROM hotels WHERE hotel_id IN", "", hotel_ids, &[])
            .await?;
        Ok(decode_rows::<HotelContent>(&rows)
            .into_iter()
            .map(|h| (h.hotel_id.clone(), h))
            .collect())
    }

    async fn pois_for(
        &self,
        hotel_ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, PoiRecord>, StoreError> {
        let rows = self
            .fetch_by_ids(
                "SELECT payload FROM hotel_pois WHERE hotel_id IN",
                "AND language = ?",
                hotel_ids,
                &[language],
            )
            .await?;
        Ok(decode_rows::<PoiRecord>(&rows)
            .into_iter()
            .map(|r| (r.hotel_id.clone(), r))
            .collect())
    }

    async fn reviews_for(
        &self,
        hotel_ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, ReviewRecord>, StoreError> {
        let rows = self
            .fetch_by_ids(
                "SELECT payload FROM hotel_reviews WHERE hotel_id IN",
                "AND language = ?",
                hotel_ids,
                &[language],
            )
            .await?;
        Ok(decode_rows::<ReviewRecord>(&rows)
            .into_iter()
            .map(|r| (r.hotel_id.clone(), r))
            .collect())
    }

    async fn reviewed_hotels(&self, hotel_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let rows = self
            .fetch_by_ids(
                "SELECT DISTINCT hotel_id FROM hotel_reviews WHERE hotel_id IN",
                "AND review_count > 0",
                hotel_ids,
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("hotel_id"))
            .collect())
    }

    async fn hotel_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HotelContent>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT payload FROM hotels
ORDER BY hotel_id
LIMIT ? OFFSET ?;
"#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    async fn replace_city_stats(&self, stats: &[CityStats]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM city_stats;")
            .execute(&mut *tx)
            .await?;
        for city in stats {
            sqlx::query("INSERT INTO city_stats (city, payload) VALUES (?, ?);")
                .bind(city.city.clone())
                .bind(serde_json::to_string(city)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn city_stats(&self, city_normalized: &str) -> Result<Option<CityStats>, StoreError> {
        let row = sqlx::query("SELECT payload FROM city_stats WHERE city = ?;")
            .bind(city_normalized.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(decode_payload(&r)?)),
            None => Ok(None),
        }
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        Ok(StoreCounts {
            hotels: self.count("hotels").await?,
            poi_records: self.count("hotel_pois").await?,
            review_records: self.count("hotel_reviews").await?,
            cities: self.count("city_stats").await?,
        })
    }
}

/* =========================
Row mapping
========================= */

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn decode_payload<T: DeserializeOwned>(row: &AnyRow) -> Result<T, StoreError> {
    let payload: String = row.try_get("payload")?;
    Ok(serde_json::from_str(&payload)?)
}

// Malformed rows are skipped so one bad record does not hide the rest
fn decode_rows<T: DeserializeOwned>(rows: &[AnyRow]) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode_payload(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "skipping malformed content row");
                None
            }
        })
        .collect()
}

fn i64_to_usize(v: i64) -> Result<usize, StoreError> {
    usize::try_from(v).map_err(|_| StoreError::InvalidRow(format!("negative count: {v}")))
}
