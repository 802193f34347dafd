//! Container service metered by memory consumption over time.
//!
//! `memory` is tracked in GB-milliseconds internally and reported in GB-hours.

use crate::error::{Error, Result};
use crate::formula::{overflow, Formulas, MeasureSpec, Measurement, Metric, Plan};
use crate::state::{AccumulatedValue, MeteredQuantity};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const RESOURCE_ID: &str = "linux-container";

/// 2015-01-01T00:00:00Z
pub const EFFECTIVE: i64 = 1_420_070_400_000;

const BYTES_PER_GIGABYTE: Decimal = dec!(1073741824);
const MS_PER_HOUR: Decimal = dec!(3600000);

pub fn basic_plan() -> Plan {
    container_plan("basic-linux-container")
}

pub fn standard_plan() -> Plan {
    container_plan("standard-linux-container")
}

fn container_plan(plan_id: &str) -> Plan {
    Plan {
        plan_id: plan_id.to_string(),
        effective: EFFECTIVE,
        measures: vec![
            MeasureSpec::new("instance_memory", "GIGABYTE"),
            MeasureSpec::new("running_instances", "NUMBER"),
        ],
        metrics: vec![Metric::new("memory", "GIGABYTE", memory_formulas())],
    }
}

pub fn memory_formulas() -> Formulas {
    Formulas {
        meter: meter_memory,
        accumulate: accumulate_memory,
        aggregate: aggregate_memory,
        summarize: summarize_memory,
    }
}

fn meter_memory(m: &Measurement) -> Result<MeteredQuantity> {
    let memory = m.measure("instance_memory")?;
    let instances = m.measure("running_instances")?;
    if memory.is_sign_negative() || instances.is_sign_negative() {
        return Err(Error::MalformedInput(format!(
            "Negative memory measure: instance_memory={} running_instances={}",
            memory, instances
        )));
    }
    let consuming = (memory / BYTES_PER_GIGABYTE)
        .checked_mul(instances)
        .ok_or_else(|| overflow("memory meter"))?;
    Ok(MeteredQuantity::new(consuming, m.start))
}

/// `rate × (to - from) + base`, checked.
fn integrate(rate: Decimal, from: i64, to: i64, base: Decimal, what: &str) -> Result<Decimal> {
    rate.checked_mul(Decimal::from(to - from))
        .and_then(|area| area.checked_add(base))
        .ok_or_else(|| overflow(what))
}

fn accumulate_memory(
    a: Option<&AccumulatedValue>,
    qty: &MeteredQuantity,
    _start: i64,
    end: i64,
    from: i64,
    to: i64,
) -> Result<Option<AccumulatedValue>> {
    if end < from || end >= to {
        return Ok(None);
    }
    let consumed = match a {
        Some(a) => integrate(a.consuming, a.since, qty.since, a.consumed, "memory accumulator")?,
        None => Decimal::ZERO,
    };
    Ok(Some(AccumulatedValue::new(consumed, qty.consuming, qty.since)))
}

fn aggregate_memory(
    a: Option<&AccumulatedValue>,
    prev: Option<&AccumulatedValue>,
    curr: &AccumulatedValue,
) -> Result<AccumulatedValue> {
    let delta = curr
        .consuming
        .checked_sub(prev.map(|p| p.consuming).unwrap_or(Decimal::ZERO))
        .ok_or_else(|| overflow("memory aggregator"))?;
    let Some(a) = a else {
        return Ok(AccumulatedValue::starting(delta, curr.since));
    };
    // Whichever side started later pays for the gap at the other's rate
    let consumed = integrate(delta, curr.since, curr.since.max(a.since), a.consumed, "memory aggregator")?;
    let consumed = integrate(a.consuming, a.since, a.since.max(curr.since), consumed, "memory aggregator")?;
    let consuming = a
        .consuming
        .checked_add(delta)
        .ok_or_else(|| overflow("memory aggregator"))?;
    Ok(AccumulatedValue::new(consumed, consuming, a.since.max(curr.since)))
}

fn summarize_memory(t: i64, qty: Option<&AccumulatedValue>, _from: i64, to: i64) -> Result<Decimal> {
    let Some(q) = qty else {
        return Ok(Decimal::ZERO);
    };
    let until = t.min(to).max(q.since);
    let consumed = integrate(q.consuming, q.since, until, q.consumed, "memory summary")?;
    Ok(consumed / MS_PER_HOUR)
}
