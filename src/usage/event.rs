use crate::error::{Error, Result};
use crate::formula::metering_plan_id;
use crate::sha256_digest;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNKNOWN_CONSUMER: &str = "UNKNOWN";

fn default_consumer() -> String {
    UNKNOWN_CONSUMER.to_string()
}

/// One raw reading of a measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub value: Decimal,
}

impl Measure {
    pub fn new(name: &str, value: Decimal) -> Self {
        Measure {
            name: name.to_string(),
            value,
        }
    }
}

/// Raw usage as submitted at the usage boundary.
///
/// `start`/`end` are ms since epoch; `end` decides which window slots the
/// usage lands in, `start` which plan version meters it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub resource_id: String,
    pub plan_id: String,
    pub organization_id: String,
    pub space_id: String,
    #[serde(default = "default_consumer")]
    pub consumer_id: String,
    pub resource_instance_id: String,
    pub measures: Vec<Measure>,
    pub start: i64,
    pub end: i64,
}

impl UsageEvent {
    /// Metering plan used for this usage (see [`metering_plan_id`]).
    pub fn metering_plan_id(&self) -> String {
        metering_plan_id(&self.resource_id, &self.plan_id)
    }

    /// Measures by name. Validation guarantees names are unique.
    pub fn measure_map(&self) -> BTreeMap<String, Decimal> {
        self.measures
            .iter()
            .map(|m| (m.name.clone(), m.value))
            .collect()
    }

    /// Idempotency key of the submission: SHA-256 (lowercase hex) over the
    /// event identity with measures in name order and values normalized, so
    /// `0.50` and `0.5` identify the same usage.
    pub fn event_id(&self) -> Result<String> {
        let mut measures: Vec<(String, String)> = self
            .measures
            .iter()
            .map(|m| (m.name.clone(), m.value.normalize().to_string()))
            .collect();
        measures.sort();
        let canonical = (
            &self.organization_id,
            &self.space_id,
            &self.consumer_id,
            &self.resource_id,
            &self.plan_id,
            &self.resource_instance_id,
            self.start,
            self.end,
            measures,
        );
        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| Error::MalformedInput(format!("Failed to encode usage identity: {}", e)))?;
        Ok(hex::encode(sha256_digest(&bytes)))
    }
}
