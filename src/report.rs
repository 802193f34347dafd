//! Reporting view: the usage tree of an organization as a plain document.
//!
//! Quantities and charges are converted to `f64` here and only here. Charges
//! are recomputed as of the report time, so an open slot keeps growing while
//! it is queried.

use crate::error::Result;
use crate::formula::FormulaRegistry;
use crate::state::{
    price_tree, summarize_slot, AccumulatedValue, MetricUsage, OrganizationUsage, PlanUsage,
    Resolution, ResourceUsage, RESOLUTION_COUNT,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityReport {
    pub consumed: f64,
    pub consuming: f64,
    pub since: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub from: i64,
    pub to: i64,
    pub quantity: Option<QuantityReport>,
    pub summary: f64,
    pub charge: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric: String,
    /// One list per resolution (second to month), newest slot first.
    pub windows: Vec<Vec<SlotReport>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub metering_plan_id: String,
    pub aggregated_usage: Vec<MetricReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub resource_id: String,
    pub aggregated_usage: Vec<MetricReport>,
    pub plans: Vec<PlanReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerReport {
    pub consumer_id: String,
    pub resources: Vec<ResourceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceReport {
    pub space_id: String,
    pub resources: Vec<ResourceReport>,
    pub consumers: Vec<ConsumerReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub organization_id: String,
    pub time: i64,
    pub resources: Vec<ResourceReport>,
    pub spaces: Vec<SpaceReport>,
    pub aggregated_usage: Vec<MetricReport>,
}

impl UsageReport {
    pub fn empty(organization_id: &str, time: i64) -> Self {
        UsageReport {
            organization_id: organization_id.to_string(),
            time,
            resources: Vec::new(),
            spaces: Vec::new(),
            aggregated_usage: Vec::new(),
        }
    }

    pub fn metric(&self, metric: &str) -> Option<&MetricReport> {
        self.aggregated_usage.iter().find(|m| m.metric == metric)
    }
}

impl MetricReport {
    /// Slot of `resolution` starting at `from`.
    pub fn slot(&self, resolution: Resolution, from: i64) -> Option<&SlotReport> {
        self.windows
            .get(resolution.index())?
            .iter()
            .find(|s| s.from == from)
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

struct ReportView<'a> {
    registry: &'a FormulaRegistry,
    time: i64,
    resolution: Option<Resolution>,
}

impl ReportView<'_> {
    fn metric(&self, usage: &MetricUsage) -> Result<MetricReport> {
        let mut windows = vec![Vec::new(); RESOLUTION_COUNT];
        for (resolution, slots) in usage.windows.iter() {
            if self.resolution.is_some_and(|r| r != resolution) {
                continue;
            }
            let window = &mut windows[resolution.index()];
            for slot in slots.iter().filter(|s| s.bounds.from <= self.time) {
                window.push(SlotReport {
                    from: slot.bounds.from,
                    to: slot.bounds.to,
                    quantity: slot.quantity.as_ref().map(quantity),
                    summary: to_f64(summarize_slot(self.registry, usage, slot, self.time)?),
                    charge: to_f64(slot.charge),
                });
            }
        }
        Ok(MetricReport {
            metric: usage.metric.clone(),
            windows,
        })
    }

    fn metrics(&self, usage: &[MetricUsage]) -> Result<Vec<MetricReport>> {
        usage.iter().map(|m| self.metric(m)).collect()
    }

    fn plan(&self, plan: &PlanUsage) -> Result<PlanReport> {
        Ok(PlanReport {
            plan_id: plan.plan_id.clone(),
            metering_plan_id: plan.metering_plan_id.clone(),
            aggregated_usage: self.metrics(&plan.aggregated_usage)?,
        })
    }

    fn resources(&self, resources: &[ResourceUsage]) -> Result<Vec<ResourceReport>> {
        resources
            .iter()
            .map(|r| {
                Ok(ResourceReport {
                    resource_id: r.resource_id.clone(),
                    aggregated_usage: self.metrics(&r.aggregated_usage)?,
                    plans: r.plans.iter().map(|p| self.plan(p)).collect::<Result<_>>()?,
                })
            })
            .collect()
    }
}

fn quantity(value: &AccumulatedValue) -> QuantityReport {
    QuantityReport {
        consumed: to_f64(value.consumed),
        consuming: to_f64(value.consuming),
        since: value.since,
    }
}

/// Report on an organization's usage as of `time`.
///
/// `usage` is `None` for an organization that never submitted usage; the
/// report is then empty. With `resolution` set only that window is filled.
pub fn organization_report(
    organization_id: &str,
    usage: Option<&OrganizationUsage>,
    registry: &FormulaRegistry,
    time: i64,
    resolution: Option<Resolution>,
) -> Result<UsageReport> {
    let Some(usage) = usage else {
        return Ok(UsageReport::empty(organization_id, time));
    };

    let mut priced = usage.clone();
    price_tree(&mut priced, registry, time)?;

    let view = ReportView {
        registry,
        time,
        resolution,
    };
    let mut spaces = Vec::new();
    for space in &priced.spaces {
        let mut consumers = Vec::new();
        for consumer in &space.consumers {
            consumers.push(ConsumerReport {
                consumer_id: consumer.consumer_id.clone(),
                resources: view.resources(&consumer.resources)?,
            });
        }
        spaces.push(SpaceReport {
            space_id: space.space_id.clone(),
            resources: view.resources(&space.resources)?,
            consumers,
        });
    }

    Ok(UsageReport {
        organization_id: priced.organization_id.clone(),
        time,
        resources: view.resources(&priced.resources)?,
        spaces,
        aggregated_usage: view.metrics(&priced.aggregated_usage)?,
    })
}
