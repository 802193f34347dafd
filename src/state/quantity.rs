use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Instantaneous consumption rate produced by a metric's `meter` function.
///
/// `since` is the time (ms since epoch) the rate became effective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteredQuantity {
    pub consuming: Decimal,
    pub since: i64,
}

impl MeteredQuantity {
    pub fn new(consuming: Decimal, since: i64) -> Self {
        MeteredQuantity { consuming, since }
    }
}

/// Running integral of a rate over time.
///
/// Invariants:
/// - `consumed` is the integral of past rates up to `since`
/// - `consuming` is the rate in effect from `since` on
///
/// Values are replaced, never mutated: every fold produces a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatedValue {
    pub consumed: Decimal,
    pub consuming: Decimal,
    pub since: i64,
}

impl AccumulatedValue {
    pub fn new(consumed: Decimal, consuming: Decimal, since: i64) -> Self {
        AccumulatedValue {
            consumed,
            consuming,
            since,
        }
    }

    /// Value with nothing consumed yet, consuming `consuming` from `since`.
    pub fn starting(consuming: Decimal, since: i64) -> Self {
        AccumulatedValue::new(Decimal::ZERO, consuming, since)
    }
}
