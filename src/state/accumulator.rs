//! Accumulation stage: per resource instance and metric running totals.
//!
//! Each instance keeps five slot ladders. A slot stores the readings that
//! landed in it keyed by `since` (the idempotency key) and the history of
//! accumulated values obtained by folding those readings in `since` order.
//! Refolding from the stored readings makes the final value independent of
//! the order in which readings were delivered.

use crate::error::{Error, Result};
use crate::formula::{metering_plan_id, FormulaRegistry};
use crate::state::quantity::{AccumulatedValue, MeteredQuantity};
use crate::state::window::{Resolution, SlotBounds, RESOLUTION_COUNT};
use crate::usage::UsageEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of one accumulation stream within an organization.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub space_id: String,
    pub consumer_id: String,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,
    pub metric: String,
}

impl InstanceKey {
    pub fn from_event(event: &UsageEvent, metric: &str) -> Self {
        InstanceKey {
            space_id: event.space_id.clone(),
            consumer_id: event.consumer_id.clone(),
            resource_id: event.resource_id.clone(),
            plan_id: event.plan_id.clone(),
            resource_instance_id: event.resource_instance_id.clone(),
            metric: metric.to_string(),
        }
    }

    /// Stable key for storage and ordering.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            self.space_id,
            self.consumer_id,
            self.resource_id,
            self.plan_id,
            self.resource_instance_id,
            self.metric
        )
    }

    pub fn metering_plan_id(&self) -> String {
        metering_plan_id(&self.resource_id, &self.plan_id)
    }
}

/// A metered quantity together with the usage span and the plan version
/// that metered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub quantity: MeteredQuantity,
    pub start: i64,
    pub end: i64,
    pub plan_effective: i64,
}

/// One accumulated value in a slot's history and the plan version it was
/// produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub value: AccumulatedValue,
    pub plan_effective: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSlot {
    pub bounds: SlotBounds,
    pub readings: BTreeMap<i64, Reading>,
    pub history: Vec<Step>,
    pub sealed: bool,
}

impl InstanceSlot {
    pub fn new(bounds: SlotBounds) -> Self {
        InstanceSlot {
            bounds,
            readings: BTreeMap::new(),
            history: Vec::new(),
            sealed: false,
        }
    }

    /// Current accumulated value, `None` if no reading affected the slot.
    pub fn value(&self) -> Option<&AccumulatedValue> {
        self.history.last().map(|s| &s.value)
    }

    /// `(prior, current)` pairs of the instance's state transitions in the
    /// slot, oldest first. These are the inputs of `aggregate`.
    pub fn transitions(&self) -> impl Iterator<Item = (Option<&Step>, &Step)> {
        self.history
            .iter()
            .enumerate()
            .map(move |(i, step)| (i.checked_sub(1).map(|p| &self.history[p]), step))
    }

    fn refold(&mut self, plan_id: &str, metric: &str, registry: &FormulaRegistry) -> Result<()> {
        let mut history: Vec<Step> = Vec::with_capacity(self.readings.len());
        for reading in self.readings.values() {
            let prior = history.last().map(|s| &s.value);
            if let Some(step) = fold(self.bounds, prior, reading, plan_id, metric, registry)? {
                history.push(step);
            }
        }
        self.history = history;
        Ok(())
    }

    /// Fold only the newest reading onto the existing history. Valid when no
    /// stored reading is newer than it.
    fn fold_latest(&mut self, plan_id: &str, metric: &str, registry: &FormulaRegistry) -> Result<()> {
        let Some(reading) = self.readings.values().next_back() else {
            return Ok(());
        };
        let prior = self.history.last().map(|s| &s.value);
        if let Some(step) = fold(self.bounds, prior, reading, plan_id, metric, registry)? {
            self.history.push(step);
        }
        Ok(())
    }
}

fn fold(
    bounds: SlotBounds,
    prior: Option<&AccumulatedValue>,
    reading: &Reading,
    plan_id: &str,
    metric: &str,
    registry: &FormulaRegistry,
) -> Result<Option<Step>> {
    let formulas = registry
        .lookup(plan_id, reading.plan_effective, metric)?
        .formulas;
    let next = (formulas.accumulate)(
        prior,
        &reading.quantity,
        reading.start,
        reading.end,
        bounds.from,
        bounds.to,
    )?;
    Ok(next.map(|value| Step {
        value,
        plan_effective: reading.plan_effective,
    }))
}

/// Result of offering a reading to an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    Duplicate,
}

/// Accumulation state of one `(instance, metric)` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAccumulator {
    pub key: InstanceKey,
    pub windows: [BTreeMap<i64, InstanceSlot>; RESOLUTION_COUNT],
}

impl InstanceAccumulator {
    pub fn new(key: InstanceKey) -> Self {
        InstanceAccumulator {
            key,
            windows: Default::default(),
        }
    }

    pub fn slots(&self, resolution: Resolution) -> &BTreeMap<i64, InstanceSlot> {
        &self.windows[resolution.index()]
    }

    /// Latest slot of a resolution.
    pub fn latest(&self, resolution: Resolution) -> Option<&InstanceSlot> {
        self.slots(resolution).values().next_back()
    }

    /// Fold a reading into every slot containing its `end`.
    ///
    /// A reading whose `since` is already present is a duplicate and leaves
    /// the accumulator untouched. A reading targeting a sealed slot is stale.
    pub fn ingest(&mut self, reading: Reading, registry: &FormulaRegistry) -> Result<Ingest> {
        let mut targets = Vec::with_capacity(RESOLUTION_COUNT);
        for resolution in Resolution::ALL {
            let bounds = resolution.bounds(reading.end)?;
            if let Some(slot) = self.slots(resolution).get(&bounds.from) {
                if slot.sealed {
                    return Err(Error::Stale(format!(
                        "{} slot [{}, {}) of {} is sealed",
                        resolution,
                        bounds.from,
                        bounds.to,
                        self.key.key()
                    )));
                }
                if slot.readings.contains_key(&reading.quantity.since) {
                    return Ok(Ingest::Duplicate);
                }
            }
            targets.push((resolution, bounds));
        }

        let plan_id = self.key.metering_plan_id();
        let metric = self.key.metric.clone();
        for (resolution, bounds) in targets {
            let slot = self.windows[resolution.index()]
                .entry(bounds.from)
                .or_insert_with(|| InstanceSlot::new(bounds));
            // In-order readings extend the history; late ones refold the slot
            let appended = slot
                .readings
                .keys()
                .next_back()
                .map_or(true, |last| *last < reading.quantity.since);
            slot.readings.insert(reading.quantity.since, reading);
            if appended {
                slot.fold_latest(&plan_id, &metric, registry)?;
            } else {
                slot.refold(&plan_id, &metric, registry)?;
            }
        }
        Ok(Ingest::Accepted)
    }

    /// Seal slots processing time has moved past (beyond the slack) and drop
    /// sealed slots beyond the `retained` most recent ones per resolution.
    ///
    /// Returns the number of slots newly sealed.
    pub fn seal(&mut self, now: i64, slack_ms: i64, retained: usize) -> usize {
        let mut sealed = 0;
        for slots in self.windows.iter_mut() {
            for slot in slots.values_mut() {
                if !slot.sealed && slot.bounds.is_sealed(now, slack_ms) {
                    slot.sealed = true;
                    sealed += 1;
                }
            }
            let sealed_starts: Vec<i64> = slots
                .iter()
                .filter(|(_, s)| s.sealed)
                .map(|(from, _)| *from)
                .collect();
            let excess = sealed_starts.len().saturating_sub(retained);
            for from in sealed_starts.into_iter().take(excess) {
                slots.remove(&from);
            }
        }
        sealed
    }

    pub fn is_empty(&self) -> bool {
        self.windows.iter().all(|w| w.is_empty())
    }
}
