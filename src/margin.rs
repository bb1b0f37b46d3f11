// Margin engine: turns a supplier net price into the displayed price.
//
// Rules are resolved hotel > city > country > global. Within one scope the
// higher priority wins, then the most recently created rule, then the greater
// id, so any rule set has exactly one winner for a given hotel.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{normalize_key, EnrichedHotel, PricedHotel};
use crate::supplier::SupplierRate;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarginError {
    #[error("Fixed rule {rule_id} is in {rule_currency}, rate is in {rate_currency}")]
    CurrencyMismatch {
        rule_id: String,
        rule_currency: String,
        rate_currency: String,
    },

    #[error("Invalid margin rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Hotel,
    City,
    Country,
    Global,
}

impl RuleScope {
    fn rank(&self) -> u8 {
        match self {
            RuleScope::Hotel => 3,
            RuleScope::City => 2,
            RuleScope::Country => 1,
            RuleScope::Global => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarginKind {
    Percentage,
    // Flat amount, only valid for rates in `currency`
    Fixed { currency: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRule {
    pub id: String,
    pub scope: RuleScope,
    #[serde(default)]
    pub scope_key: String,
    #[serde(flatten)]
    pub kind: MarginKind,
    pub value: Decimal,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl MarginRule {
    fn validate(&self) -> Result<(), MarginError> {
        let invalid = |reason: &str| MarginError::InvalidRule {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.scope != RuleScope::Global && self.scope_key.trim().is_empty() {
            return Err(invalid("scoped rule without scope key"));
        }
        match &self.kind {
            MarginKind::Percentage if self.value <= -Decimal::ONE_HUNDRED => {
                Err(invalid("percentage would make the price zero or negative"))
            }
            MarginKind::Fixed { currency } if currency.trim().len() != 3 => {
                Err(invalid("fixed rule needs a 3-letter currency"))
            }
            _ => Ok(()),
        }
    }

    // Keys are compared the same way the content store normalizes them
    fn normalized(mut self) -> Self {
        self.scope_key = match self.scope {
            RuleScope::Hotel => self.scope_key.trim().to_string(),
            RuleScope::City => normalize_key(&self.scope_key),
            RuleScope::Country => self.scope_key.trim().to_ascii_uppercase(),
            RuleScope::Global => String::new(),
        };
        if let MarginKind::Fixed { currency } = &mut self.kind {
            *currency = currency.trim().to_ascii_uppercase();
        }
        self
    }

    fn matches(&self, hotel_id: &str, city: Option<&str>, country: Option<&str>) -> bool {
        match self.scope {
            RuleScope::Hotel => self.scope_key == hotel_id,
            RuleScope::City => city.is_some_and(|c| normalize_key(c) == self.scope_key),
            RuleScope::Country => {
                country.is_some_and(|c| c.trim().eq_ignore_ascii_case(&self.scope_key))
            }
            RuleScope::Global => true,
        }
    }

    fn apply(&self, net_price: Decimal, currency: &str) -> Result<Decimal, MarginError> {
        let marked_up = match &self.kind {
            MarginKind::Percentage => {
                net_price * (Decimal::ONE + self.value / Decimal::ONE_HUNDRED)
            }
            MarginKind::Fixed {
                currency: rule_currency,
            } => {
                if !rule_currency.eq_ignore_ascii_case(currency.trim()) {
                    return Err(MarginError::CurrencyMismatch {
                        rule_id: self.id.clone(),
                        rule_currency: rule_currency.clone(),
                        rate_currency: currency.to_string(),
                    });
                }
                net_price + self.value
            }
        };
        Ok(round_price(marked_up))
    }
}

// Precedence order: the first rule in this order that matches wins
fn precedence(a: &MarginRule, b: &MarginRule) -> Ordering {
    b.scope
        .rank()
        .cmp(&a.scope.rank())
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.id.cmp(&a.id))
}

// Two decimals, halves rounded up
pub fn round_price(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Priced {
    pub displayed_price: Decimal,
    pub applied_rule: Option<MarginRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedRate {
    #[serde(flatten)]
    pub rate: SupplierRate,
    pub displayed_price: Decimal,
    pub applied_rule_id: Option<String>,
}

pub struct MarginEngine {
    // Sorted by precedence, swapped as a whole on rule edits
    rules: RwLock<Arc<[MarginRule]>>,
}

impl MarginEngine {
    pub fn new(rules: Vec<MarginRule>) -> Result<Self, MarginError> {
        Ok(Self {
            rules: RwLock::new(Self::prepare(rules)?),
        })
    }

    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(Arc::from(Vec::new())),
        }
    }

    fn prepare(rules: Vec<MarginRule>) -> Result<Arc<[MarginRule]>, MarginError> {
        let mut rules = rules
            .into_iter()
            .map(|rule| rule.validate().map(|_| rule.normalized()))
            .collect::<Result<Vec<_>, _>>()?;
        rules.sort_by(precedence);
        Ok(Arc::from(rules))
    }

    // Takes effect for batches fetched from now on; cached batches keep the
    // prices they were fetched with until their TTL runs out.
    pub fn replace_rules(&self, rules: Vec<MarginRule>) -> Result<(), MarginError> {
        let prepared = Self::prepare(rules)?;
        let count = prepared.len();
        *self.rules.write() = prepared;
        info!(rules = count, "margin rules replaced");
        Ok(())
    }

    pub fn rules(&self) -> Arc<[MarginRule]> {
        Arc::clone(&self.rules.read())
    }

    pub fn resolve(
        &self,
        hotel_id: &str,
        city_normalized: Option<&str>,
        country_code: Option<&str>,
    ) -> Option<MarginRule> {
        self.rules()
            .iter()
            .find(|rule| rule.matches(hotel_id, city_normalized, country_code))
            .cloned()
    }

    pub fn price(
        &self,
        hotel_id: &str,
        city_normalized: Option<&str>,
        country_code: Option<&str>,
        net_price: Decimal,
        currency: &str,
    ) -> Result<Priced, MarginError> {
        match self.resolve(hotel_id, city_normalized, country_code) {
            Some(rule) => Ok(Priced {
                displayed_price: rule.apply(net_price, currency)?,
                applied_rule: Some(rule),
            }),
            None => Ok(Priced {
                displayed_price: net_price,
                applied_rule: None,
            }),
        }
    }

    // Batch pricing for the search path. A rejected rule leaves the hotel at
    // its net price instead of dropping it from the batch.
    pub fn price_hotels(&self, hotels: Vec<EnrichedHotel>) -> Vec<PricedHotel> {
        hotels
            .into_iter()
            .map(|hotel| {
                let summary = &hotel.summary;
                let priced = self
                    .price(
                        &summary.supplier_hotel_id,
                        hotel.city_normalized.as_deref(),
                        hotel.country_code.as_deref(),
                        summary.raw_net_price,
                        &summary.currency,
                    )
                    .unwrap_or_else(|e| {
                        warn!(hotel_id = %summary.supplier_hotel_id, error = %e, "margin rule rejected, showing net price");
                        Priced {
                            displayed_price: summary.raw_net_price,
                            applied_rule: None,
                        }
                    });

                PricedHotel {
                    hotel,
                    displayed_price: priced.displayed_price,
                    applied_rule_id: priced.applied_rule.map(|r| r.id),
                }
            })
            .collect()
    }

    // Same fallback as `price_hotels`, per rate
    pub fn price_rates(
        &self,
        hotel_id: &str,
        city_normalized: Option<&str>,
        country_code: Option<&str>,
        rates: Vec<SupplierRate>,
    ) -> Vec<PricedRate> {
        rates
            .into_iter()
            .map(|rate| {
                let priced = self
                    .price(hotel_id, city_normalized, country_code, rate.net_price, &rate.currency)
                    .unwrap_or_else(|e| {
                        warn!(hotel_id, rate_key = %rate.rate_key, error = %e, "margin rule rejected, showing net price");
                        Priced {
                            displayed_price: rate.net_price,
                            applied_rule: None,
                        }
                    });
                PricedRate {
                    displayed_price: priced.displayed_price,
                    applied_rule_id: priced.applied_rule.map(|r| r.id),
                    rate,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;
    use test_case::test_case;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap()
    }

    fn percentage(id: &str, scope: RuleScope, key: &str, value: &str, priority: i32) -> MarginRule {
        MarginRule {
            id: id.to_string(),
            scope,
            scope_key: key.to_string(),
            kind: MarginKind::Percentage,
            value: dec(value),
            priority,
            created_at: at(0),
        }
    }

    fn fixed(id: &str, currency: &str, value: &str) -> MarginRule {
        MarginRule {
            id: id.to_string(),
            scope: RuleScope::Global,
            scope_key: String::new(),
            kind: MarginKind::Fixed {
                currency: currency.to_string(),
            },
            value: dec(value),
            priority: 0,
            created_at: at(0),
        }
    }

    fn hierarchy() -> MarginEngine {
        MarginEngine::new(vec![
            percentage("global", RuleScope::Global, "", "5", 100),
            percentage("country-ae", RuleScope::Country, "ae", "8", 0),
            percentage("city-dubai", RuleScope::City, " Dubai ", "10", 0),
            percentage("hotel-42", RuleScope::Hotel, "42", "12", 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_percentage_rule() {
        let engine = MarginEngine::new(vec![percentage("p", RuleScope::Global, "", "12", 0)]).unwrap();
        let priced = engine.price("1", None, None, dec("100.00"), "USD").unwrap();
        assert_eq!(priced.displayed_price, dec("112.00"));
        assert_eq!(priced.applied_rule.unwrap().id, "p");
    }

    #[test]
    fn test_fixed_rule_in_rate_currency() {
        let engine = MarginEngine::new(vec![fixed("f", "usd", "15")]).unwrap();
        let priced = engine.price("1", None, None, dec("100.00"), "USD").unwrap();
        assert_eq!(priced.displayed_price, dec("115.00"));
    }

    #[test]
    fn test_fixed_rule_currency_mismatch_is_rejected() {
        let engine = MarginEngine::new(vec![fixed("f", "USD", "15")]).unwrap();
        let err = engine.price("1", None, None, dec("100.00"), "EUR").unwrap_err();
        assert_eq!(
            err,
            MarginError::CurrencyMismatch {
                rule_id: "f".to_string(),
                rule_currency: "USD".to_string(),
                rate_currency: "EUR".to_string(),
            }
        );
    }

    #[test]
    fn test_no_matching_rule_keeps_net_price() {
        let engine = MarginEngine::new(vec![percentage("c", RuleScope::City, "paris", "10", 0)]).unwrap();
        let priced = engine
            .price("1", Some("rome"), Some("IT"), dec("87.65"), "EUR")
            .unwrap();
        assert_eq!(priced.displayed_price, dec("87.65"));
        assert!(priced.applied_rule.is_none());
    }

    #[test_case("10.05", "10", "11.06"; "half rounds up")]
    #[test_case("10.04", "10", "11.04"; "below half rounds down")]
    #[test_case("33.33", "7.5", "35.83"; "fractional percentage")]
    fn test_rounding(net: &str, pct: &str, expected: &str) {
        let engine = MarginEngine::new(vec![percentage("p", RuleScope::Global, "", pct, 0)]).unwrap();
        let priced = engine.price("1", None, None, dec(net), "USD").unwrap();
        assert_eq!(priced.displayed_price, dec(expected));
    }

    #[test_case("42", Some("dubai"), Some("AE"), "hotel-42"; "hotel beats everything")]
    #[test_case("7", Some("DUBAI"), Some("AE"), "city-dubai"; "city beats country")]
    #[test_case("7", Some("abu dhabi"), Some("ae"), "country-ae"; "country beats global")]
    #[test_case("7", Some("rome"), Some("IT"), "global"; "global fallback despite low scope")]
    #[test_case("7", None, None, "global"; "no content still gets global")]
    fn test_scope_precedence(hotel: &str, city: Option<&str>, country: Option<&str>, expected: &str) {
        let rule = hierarchy().resolve(hotel, city, country).unwrap();
        assert_eq!(rule.id, expected);
    }

    #[test]
    fn test_equal_scope_priority_then_newest() {
        let mut older_high = percentage("older-high", RuleScope::City, "dubai", "3", 5);
        older_high.created_at = at(1);
        let mut newer_low = percentage("newer-low", RuleScope::City, "dubai", "4", 1);
        newer_low.created_at = at(30);
        let mut newer_high = percentage("newer-high", RuleScope::City, "dubai", "6", 5);
        newer_high.created_at = at(2);

        let engine = MarginEngine::new(vec![older_high, newer_low, newer_high]).unwrap();
        assert_eq!(engine.resolve("1", Some("dubai"), None).unwrap().id, "newer-high");
    }

    #[test]
    fn test_pricing_is_pure_and_deterministic() {
        let engine = hierarchy();
        let first = engine.price("42", Some("dubai"), Some("AE"), dec("199.99"), "AED");
        let second = engine.price("42", Some("dubai"), Some("AE"), dec("199.99"), "AED");
        assert_eq!(first, second);
        assert_eq!(first.unwrap().displayed_price, dec("223.99"));
    }

    #[test]
    fn test_replace_rules_applies_to_next_call() {
        let engine = hierarchy();
        engine
            .replace_rules(vec![percentage("flat", RuleScope::Global, "", "20", 0)])
            .unwrap();
        let priced = engine.price("42", Some("dubai"), None, dec("10"), "USD").unwrap();
        assert_eq!(priced.displayed_price, dec("12.00"));
    }

    #[test]
    fn test_invalid_rules_are_refused() {
        assert!(matches!(
            MarginEngine::new(vec![percentage("neg", RuleScope::Global, "", "-100", 0)]),
            Err(MarginError::InvalidRule { .. })
        ));
        assert!(matches!(
            MarginEngine::new(vec![percentage("city", RuleScope::City, "  ", "5", 0)]),
            Err(MarginError::InvalidRule { .. })
        ));
        assert!(matches!(
            MarginEngine::new(vec![fixed("f", "DOLLARS", "5")]),
            Err(MarginError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_rules_deserialize_from_admin_json() {
        let json = r#"[
            {"id": "r1", "scope": "city", "scope_key": "Dubai", "kind": "percentage", "value": "12", "priority": 1, "created_at": "2025-01-01T00:00:00Z"},
            {"id": "r2", "scope": "global", "kind": "fixed", "currency": "usd", "value": 15, "created_at": "2025-01-02T00:00:00Z"}
        ]"#;
        let rules: Vec<MarginRule> = serde_json::from_str(json).unwrap();
        let engine = MarginEngine::new(rules).unwrap();

        let rules = engine.rules();
        assert_eq!(rules[0].id, "r1");
        assert_eq!(rules[0].scope_key, "dubai");
        assert_eq!(
            rules[1].kind,
            MarginKind::Fixed {
                currency: "USD".to_string()
            }
        );
        assert_eq!(rules[1].created_at - rules[0].created_at, Duration::days(1));
    }
}
