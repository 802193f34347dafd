//! Price catalog boundary.
//!
//! Prices are looked up by resource, pricing plan, metric and country, and are
//! versioned by their `effective` date like plans are.

use crate::error::{Error, Result};
use crate::formula::linux_container;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Price lookup used during aggregation.
pub trait PriceCatalog {
    /// Price per unit of `metric` in effect at `effective`.
    ///
    /// A missing entry is a configuration error (`Error::NotFound`), never a
    /// zero price.
    fn price(
        &self,
        resource_id: &str,
        plan_id: &str,
        metric: &str,
        country: &str,
        effective: i64,
    ) -> Result<Decimal>;
}

/// Identity of a price list entry.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceKey {
    pub resource_id: String,
    pub plan_id: String,
    pub metric: String,
    pub country: String,
}

impl PriceKey {
    pub fn new(resource_id: &str, plan_id: &str, metric: &str, country: &str) -> Self {
        PriceKey {
            resource_id: resource_id.to_string(),
            plan_id: plan_id.to_string(),
            metric: metric.to_string(),
            country: country.to_string(),
        }
    }
}

/// In-memory price list: `(effective, price)` versions per key, oldest first.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceCatalog {
    prices: HashMap<PriceKey, Vec<(i64, Decimal)>>,
}

impl StaticPriceCatalog {
    pub fn new() -> Self {
        StaticPriceCatalog::default()
    }

    /// Price list of the linux-container resource.
    pub fn linux_container() -> Self {
        let mut catalog = StaticPriceCatalog::new();
        for plan in ["basic", "standard"] {
            for country in ["USA", "EUR", "CAN"] {
                catalog.insert(
                    PriceKey::new(linux_container::RESOURCE_ID, plan, "memory", country),
                    linux_container::EFFECTIVE,
                    dec!(0.1375),
                );
            }
        }
        catalog
    }

    /// Add a price version; a version with the same effective date is replaced.
    pub fn insert(&mut self, key: PriceKey, effective: i64, price: Decimal) {
        let versions = self.prices.entry(key).or_default();
        versions.retain(|(e, _)| *e != effective);
        versions.push((effective, price));
        versions.sort_by_key(|(e, _)| *e);
    }
}

impl PriceCatalog for StaticPriceCatalog {
    fn price(
        &self,
        resource_id: &str,
        plan_id: &str,
        metric: &str,
        country: &str,
        effective: i64,
    ) -> Result<Decimal> {
        let key = PriceKey::new(resource_id, plan_id, metric, country);
        self.prices
            .get(&key)
            .and_then(|versions| versions.iter().rev().find(|(e, _)| *e <= effective))
            .map(|(_, price)| *price)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No price for {}/{}/{} in {} at {}",
                    resource_id, plan_id, metric, country, effective
                ))
            })
    }
}
