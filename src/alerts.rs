// Price watches. A sweep re-prices every active watch through the same
// pagination path a user's search takes and emits an event when the price
// has dropped past the watch's threshold.

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::SearchSignature;
use crate::pagination::{PaginationCoordinator, SearchError};

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Invalid watch: {0}")]
    Invalid(String),

    #[error("Watch {0} not found")]
    NotFound(Uuid),

    #[error("Watch {0} belongs to another owner")]
    NotOwner(Uuid),

    #[error("Price lookup failed: {0}")]
    Search(#[from] SearchError),

    #[error("Price lookup timed out after {0}ms")]
    Timeout(u64),

    #[error("No priced results for {0}")]
    NoResults(String),

    #[error("Hotel {hotel_id} not listed in the first {pages} pages")]
    HotelNotListed { hotel_id: String, pages: u32 },

    #[error("Notification failed: {0}")]
    Notify(String),
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub workers: usize,
    pub per_alert_timeout_ms: u64,
    // How deep to look for a watched hotel
    pub max_pages: u32,
    pub default_cooldown_seconds: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            per_alert_timeout_ms: 20_000,
            max_pages: 3,
            default_cooldown_seconds: 6 * 3600,
            sweep_interval_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCriteria {
    pub signature: SearchSignature,
    // Watch one hotel instead of the cheapest result
    #[serde(default)]
    pub hotel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: Uuid,
    pub owner_id: String,
    pub criteria: AlertCriteria,
    pub threshold_percent: Decimal,
    pub cooldown_seconds: i64,
    pub last_known_price: Option<Decimal>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    // First price seen for the watch
    Baseline,
    Notify,
    Unchanged,
}

impl PriceAlert {
    pub fn new(
        owner_id: impl Into<String>,
        criteria: AlertCriteria,
        threshold_percent: Decimal,
        cooldown_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, AlertError> {
        let owner_id = owner_id.into();
        if owner_id.trim().is_empty() {
            return Err(AlertError::Invalid("owner is required".to_string()));
        }
        if threshold_percent <= Decimal::ZERO || threshold_percent >= Decimal::ONE_HUNDRED {
            return Err(AlertError::Invalid(format!(
                "threshold {}% must be between 0 and 100",
                threshold_percent
            )));
        }
        if cooldown_seconds < 0 {
            return Err(AlertError::Invalid("cooldown cannot be negative".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            owner_id,
            criteria,
            threshold_percent,
            cooldown_seconds,
            last_known_price: None,
            last_notified_at: None,
            created_at: now,
        })
    }

    pub fn cooldown(&self) -> TimeDelta {
        TimeDelta::seconds(self.cooldown_seconds)
    }

    // Price at or below which a drop is worth telling the owner about
    pub fn trigger_price(&self) -> Option<Decimal> {
        self.last_known_price
            .map(|p| p * (Decimal::ONE - self.threshold_percent / Decimal::ONE_HUNDRED))
    }

    pub fn evaluate(&self, current: Decimal, now: DateTime<Utc>) -> AlertDecision {
        let Some(trigger) = self.trigger_price() else {
            return AlertDecision::Baseline;
        };
        let cooled_down = self
            .last_notified_at
            .map_or(true, |at| now - at > self.cooldown());

        if current < trigger && cooled_down {
            AlertDecision::Notify
        } else {
            AlertDecision::Unchanged
        }
    }
}

#[async_trait]
pub trait AlertStore: Send + Sync + 'static {
    async fn register(&self, alert: PriceAlert) -> Result<(), AlertError>;

    async fn delete(&self, owner_id: &str, alert_id: Uuid) -> Result<(), AlertError>;

    async fn get(&self, alert_id: Uuid) -> Result<Option<PriceAlert>, AlertError>;

    async fn active(&self) -> Result<Vec<PriceAlert>, AlertError>;

    async fn record_baseline(&self, alert_id: Uuid, price: Decimal) -> Result<(), AlertError>;

    async fn record_notification(
        &self,
        alert_id: Uuid,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), AlertError>;
}

#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: DashMap<Uuid, PriceAlert>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn register(&self, alert: PriceAlert) -> Result<(), AlertError> {
        self.alerts.insert(alert.id, alert);
        Ok(())
    }

    async fn delete(&self, owner_id: &str, alert_id: Uuid) -> Result<(), AlertError> {
        let owner = self
            .alerts
            .get(&alert_id)
            .map(|a| a.owner_id.clone())
            .ok_or(AlertError::NotFound(alert_id))?;
        if owner != owner_id {
            return Err(AlertError::NotOwner(alert_id));
        }
        self.alerts.remove(&alert_id);
        Ok(())
    }

    async fn get(&self, alert_id: Uuid) -> Result<Option<PriceAlert>, AlertError> {
        Ok(self.alerts.get(&alert_id).map(|a| a.clone()))
    }

    async fn active(&self) -> Result<Vec<PriceAlert>, AlertError> {
        Ok(self.alerts.iter().map(|a| a.value().clone()).collect())
    }

    async fn record_baseline(&self, alert_id: Uuid, price: Decimal) -> Result<(), AlertError> {
        let mut alert = self
            .alerts
            .get_mut(&alert_id)
            .ok_or(AlertError::NotFound(alert_id))?;
        alert.last_known_price = Some(price);
        Ok(())
    }

    async fn record_notification(
        &self,
        alert_id: Uuid,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), AlertError> {
        let mut alert = self
            .alerts
            .get_mut(&alert_id)
            .ok_or(AlertError::NotFound(alert_id))?;
        alert.last_known_price = Some(price);
        alert.last_notified_at = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceDropEvent {
    pub alert_id: Uuid,
    pub owner_id: String,
    pub criteria: AlertCriteria,
    pub hotel_id: String,
    pub previous_price: Decimal,
    pub current_price: Decimal,
    pub currency: String,
    pub detected_at: DateTime<Utc>,
}

// Delivery belongs to the messaging side; the scanner only hands events over
#[async_trait]
pub trait PriceAlertNotifier: Send + Sync + 'static {
    async fn notify(&self, event: PriceDropEvent) -> Result<(), AlertError>;
}

pub struct ChannelNotifier {
    tx: mpsc::Sender<PriceDropEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PriceDropEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PriceAlertNotifier for ChannelNotifier {
    async fn notify(&self, event: PriceDropEvent) -> Result<(), AlertError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AlertError::Notify("event receiver closed".to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub notified: usize,
    pub baselined: usize,
    pub failed: usize,
}

pub struct PriceAlertScanner {
    coordinator: Arc<PaginationCoordinator>,
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn PriceAlertNotifier>,
    clock: Arc<dyn Clock>,
    config: AlertConfig,
}

impl PriceAlertScanner {
    pub fn new(
        coordinator: Arc<PaginationCoordinator>,
        store: Arc<dyn AlertStore>,
        notifier: Arc<dyn PriceAlertNotifier>,
        clock: Arc<dyn Clock>,
        config: AlertConfig,
    ) -> Self {
        Self {
            coordinator,
            store,
            notifier,
            clock,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, AlertError> {
        let alerts = self.store.active().await?;
        let workers = self.config.workers.max(1);

        let outcomes: Vec<(Uuid, Result<AlertDecision, AlertError>)> = stream::iter(alerts)
            .map(|alert| async move {
                let id = alert.id;
                (id, self.check(alert).await)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (alert_id, outcome) in outcomes {
            report.checked += 1;
            match outcome {
                Ok(AlertDecision::Baseline) => report.baselined += 1,
                Ok(AlertDecision::Notify) => report.notified += 1,
                Ok(AlertDecision::Unchanged) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(%alert_id, error = %e, "price watch check failed");
                }
            }
        }

        info!(?report, "price watch sweep finished");
        Ok(report)
    }

    async fn check(&self, alert: PriceAlert) -> Result<AlertDecision, AlertError> {
        let timeout_ms = self.config.per_alert_timeout_ms;
        let (hotel_id, current) = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.current_price(&alert.criteria),
        )
        .await
        .map_err(|_| AlertError::Timeout(timeout_ms))??;

        let now = self.clock.now();
        let decision = alert.evaluate(current, now);
        debug!(alert_id = %alert.id, %current, ?decision, "price watch evaluated");

        match decision {
            AlertDecision::Baseline => self.store.record_baseline(alert.id, current).await?,
            AlertDecision::Notify => {
                let event = PriceDropEvent {
                    alert_id: alert.id,
                    owner_id: alert.owner_id.clone(),
                    criteria: alert.criteria.clone(),
                    hotel_id,
                    previous_price: alert.last_known_price.unwrap_or(current),
                    current_price: current,
                    currency: alert.criteria.signature.currency().to_string(),
                    detected_at: now,
                };
                self.notifier.notify(event).await?;
                self.store
                    .record_notification(alert.id, current, now)
                    .await?;
            }
            AlertDecision::Unchanged => {}
        }
        Ok(decision)
    }

    // Cheapest displayed price on the first page, or the watched hotel's
    // price within the first `max_pages` pages
    async fn current_price(
        &self,
        criteria: &AlertCriteria,
    ) -> Result<(String, Decimal), AlertError> {
        let signature = &criteria.signature;

        let Some(hotel_id) = &criteria.hotel_id else {
            let page = self.coordinator.get_page(signature, 1).await?;
            return page
                .hotels
                .iter()
                .min_by(|a, b| a.displayed_price.cmp(&b.displayed_price))
                .map(|h| (h.hotel_id().to_string(), h.displayed_price))
                .ok_or_else(|| AlertError::NoResults(signature.to_string()));
        };

        for page_number in 1..=self.config.max_pages {
            let page = self.coordinator.get_page(signature, page_number).await?;
            if let Some(hotel) = page.hotels.iter().find(|h| h.hotel_id() == hotel_id) {
                return Ok((hotel_id.clone(), hotel.displayed_price));
            }
            if !page.has_more {
                break;
            }
        }
        Err(AlertError::HotelNotListed {
            hotel_id: hotel_id.clone(),
            pages: self.config.max_pages,
        })
    }
}
