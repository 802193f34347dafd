//! Per-plan formula contract: meter, accumulate, aggregate, summarize.
//!
//! Formulas are plain `fn` pointers selected by `(plan_id, effective, metric)`.
//! They hold no state; every accumulator they need is passed in and a new
//! value is returned.

pub mod linux_container;
pub mod registry;

pub use registry::FormulaRegistry;

use crate::error::{Error, Result};
use crate::state::{AccumulatedValue, MeteredQuantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw usage handed to a metric's `meter` function.
#[derive(Debug, Clone, Copy)]
pub struct Measurement<'a> {
    pub start: i64,
    pub end: i64,
    pub measures: &'a BTreeMap<String, Decimal>,
}

impl<'a> Measurement<'a> {
    pub fn new(start: i64, end: i64, measures: &'a BTreeMap<String, Decimal>) -> Self {
        Measurement {
            start,
            end,
            measures,
        }
    }

    /// Value of a named measure; a missing measure makes the usage malformed.
    pub fn measure(&self, name: &str) -> Result<Decimal> {
        self.measures
            .get(name)
            .copied()
            .ok_or_else(|| Error::MalformedInput(format!("Missing measure {}", name)))
    }
}

pub type MeterFn = fn(&Measurement) -> Result<MeteredQuantity>;

/// `(previous, quantity, start, end, from, to)`; `None` means the usage does
/// not affect the slot `[from, to)`.
pub type AccumulateFn = fn(
    Option<&AccumulatedValue>,
    &MeteredQuantity,
    i64,
    i64,
    i64,
    i64,
) -> Result<Option<AccumulatedValue>>;

/// `(previous aggregate, instance value before, instance value after)`.
pub type AggregateFn = fn(
    Option<&AccumulatedValue>,
    Option<&AccumulatedValue>,
    &AccumulatedValue,
) -> Result<AccumulatedValue>;

/// `(as-of time, value, from, to)` -> consumed quantity in the metric's unit.
pub type SummarizeFn = fn(i64, Option<&AccumulatedValue>, i64, i64) -> Result<Decimal>;

/// Arithmetic overflow inside a formula. The usage that caused it is
/// rejected as malformed; nothing is folded.
pub fn overflow(what: &str) -> Error {
    Error::MalformedInput(format!("Quantity out of range in {}", what))
}

/// The four functions of a metric.
#[derive(Debug, Clone, Copy)]
pub struct Formulas {
    pub meter: MeterFn,
    pub accumulate: AccumulateFn,
    pub aggregate: AggregateFn,
    pub summarize: SummarizeFn,
}

/// A raw measure a plan expects on submitted usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    pub unit: String,
}

impl MeasureSpec {
    pub fn new(name: &str, unit: &str) -> Self {
        MeasureSpec {
            name: name.to_string(),
            unit: unit.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub unit: String,
    pub formulas: Formulas,
}

impl Metric {
    pub fn new(name: &str, unit: &str, formulas: Formulas) -> Self {
        Metric {
            name: name.to_string(),
            unit: unit.to_string(),
            formulas,
        }
    }
}

/// A published metering plan version. Never mutated after registration;
/// a new `effective` date publishes a new version instead.
#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: String,
    pub effective: i64,
    pub measures: Vec<MeasureSpec>,
    pub metrics: Vec<Metric>,
}

impl Plan {
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Metering plan id for a resource's pricing plan, e.g.
/// `("linux-container", "basic")` -> `basic-linux-container`.
pub fn metering_plan_id(resource_id: &str, plan_id: &str) -> String {
    format!("{}-{}", plan_id, resource_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metering_plan_id() {
        assert_eq!(
            metering_plan_id("linux-container", "basic"),
            "basic-linux-container"
        );
    }

    #[test]
    fn test_missing_measure_is_malformed() {
        let mut measures = BTreeMap::new();
        measures.insert("instance_memory".to_string(), dec!(1));
        let m = Measurement::new(0, 0, &measures);
        assert_eq!(m.measure("instance_memory").unwrap(), dec!(1));
        assert!(matches!(
            m.measure("running_instances"),
            Err(Error::MalformedInput(_))
        ));
    }
}
