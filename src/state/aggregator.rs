//! Aggregation stage: rebuilds an organization's usage tree from the
//! accumulation state and prices it.
//!
//! A node's value for a metric and slot is the `aggregate` fold of every
//! instance state transition of its subtree in that slot, ordered by
//! `(since, instance key)`. Each transition contributes the delta between the
//! instance's prior and current value, so the fold never double counts an
//! instance. Rebuilding from transitions on every pass keeps aggregation
//! idempotent: the same accumulation state always yields the same tree.

use crate::error::{Error, Result};
use crate::formula::{overflow, FormulaRegistry};
use crate::pricing::PriceCatalog;
use crate::state::accumulator::{InstanceAccumulator, InstanceKey};
use crate::state::hierarchy::{
    ConsumerUsage, FormulaRef, MetricUsage, OrganizationUsage, PlanUsage, ResourceUsage,
    SpaceUsage,
};
use crate::state::quantity::AccumulatedValue;
use crate::state::window::{Resolution, SlotBounds, WindowSlot, Windows};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

/// Collaborators and clock of one aggregation pass.
pub struct Aggregation<'a> {
    pub registry: &'a FormulaRegistry,
    pub prices: &'a dyn PriceCatalog,
    pub country: &'a str,
    pub as_of: i64,
}

type Members<'a> = Vec<&'a InstanceAccumulator>;

struct Transition<'a> {
    since: i64,
    instance: String,
    step: usize,
    plan_id: String,
    effective: i64,
    prior: Option<&'a AccumulatedValue>,
    current: &'a AccumulatedValue,
}

impl<'a> Aggregation<'a> {
    /// Build and price the usage tree of `organization_id`.
    pub fn organization<I>(&self, organization_id: &str, accumulators: I) -> Result<OrganizationUsage>
    where
        I: IntoIterator<Item = &'a InstanceAccumulator>,
    {
        let members: Members = accumulators.into_iter().collect();

        let resources = self.resources(&members)?;
        let mut spaces = Vec::new();
        for (space_id, space_members) in group_by(&members, |k| &k.space_id) {
            let mut consumers = Vec::new();
            for (consumer_id, consumer_members) in group_by(&space_members, |k| &k.consumer_id) {
                consumers.push(ConsumerUsage {
                    consumer_id,
                    resources: self.resources(&consumer_members)?,
                });
            }
            spaces.push(SpaceUsage {
                space_id,
                resources: self.resources(&space_members)?,
                consumers,
            });
        }
        let aggregated_usage = self.metrics(&members)?;

        let mut usage = OrganizationUsage {
            organization_id: organization_id.to_string(),
            as_of: self.as_of,
            resources,
            spaces,
            aggregated_usage,
        };
        price_tree(&mut usage, self.registry, self.as_of)?;
        debug!(
            organization_id,
            instances = members.len(),
            resources = usage.resources.len(),
            "aggregated organization usage"
        );
        Ok(usage)
    }

    fn resources(&self, members: &Members<'a>) -> Result<Vec<ResourceUsage>> {
        let mut resources = Vec::new();
        for (resource_id, resource_members) in group_by(members, |k| &k.resource_id) {
            let mut plans = Vec::new();
            for (plan_id, plan_members) in group_by(&resource_members, |k| &k.plan_id) {
                plans.push(self.plan(&resource_id, plan_id, &plan_members)?);
            }
            resources.push(ResourceUsage {
                aggregated_usage: self.metrics(&resource_members)?,
                resource_id,
                plans,
            });
        }
        Ok(resources)
    }

    fn plan(&self, resource_id: &str, plan_id: String, members: &Members<'a>) -> Result<PlanUsage> {
        let aggregated_usage = self.metrics(members)?;
        let effective = latest_usage(members).unwrap_or(self.as_of);
        let mut prices = BTreeMap::new();
        for metric in &aggregated_usage {
            let price = self.prices.price(
                resource_id,
                &plan_id,
                &metric.metric,
                self.country,
                effective,
            )?;
            prices.insert(metric.metric.clone(), price);
        }
        Ok(PlanUsage {
            metering_plan_id: crate::formula::metering_plan_id(resource_id, &plan_id),
            plan_id,
            prices,
            aggregated_usage,
        })
    }

    fn metrics(&self, members: &Members<'a>) -> Result<Vec<MetricUsage>> {
        let mut metrics = Vec::new();
        for (metric, metric_members) in group_by(members, |k| &k.metric) {
            if let Some(usage) = self.metric(metric, &metric_members)? {
                metrics.push(usage);
            }
        }
        Ok(metrics)
    }

    fn metric(&self, metric: String, members: &Members<'a>) -> Result<Option<MetricUsage>> {
        let formula = match formula_ref(members) {
            Some(f) => f,
            None => return Ok(None),
        };

        let mut windows = Windows::new();
        for resolution in Resolution::ALL {
            let mut slots: BTreeMap<i64, (SlotBounds, Vec<Transition>)> = BTreeMap::new();
            for member in members.iter().copied() {
                let plan_id = member.key.metering_plan_id();
                let instance = member.key.key();
                for (from, slot) in member.slots(resolution) {
                    let entry = slots
                        .entry(*from)
                        .or_insert_with(|| (slot.bounds, Vec::new()));
                    for (step, (prior, current)) in slot.transitions().enumerate() {
                        entry.1.push(Transition {
                            since: current.value.since,
                            instance: instance.clone(),
                            step,
                            plan_id: plan_id.clone(),
                            effective: current.plan_effective,
                            prior: prior.map(|p| &p.value),
                            current: &current.value,
                        });
                    }
                }
            }

            for (bounds, mut transitions) in slots.into_values() {
                transitions.sort_by(|a, b| {
                    (a.since, &a.instance, a.step).cmp(&(b.since, &b.instance, b.step))
                });
                let mut value: Option<AccumulatedValue> = None;
                for t in &transitions {
                    let formulas = self.registry.lookup(&t.plan_id, t.effective, &metric)?.formulas;
                    value = Some((formulas.aggregate)(value.as_ref(), t.prior, t.current)?);
                }
                windows.insert(resolution, WindowSlot::new(bounds, value));
            }
        }

        Ok(Some(MetricUsage {
            metric,
            formula,
            windows,
        }))
    }
}

fn group_by<'a, F>(members: &Members<'a>, field: F) -> BTreeMap<String, Members<'a>>
where
    F: Fn(&InstanceKey) -> &String,
{
    let mut groups: BTreeMap<String, Members<'a>> = BTreeMap::new();
    for member in members {
        groups
            .entry(field(&member.key).clone())
            .or_default()
            .push(*member);
    }
    groups
}

/// End of the most recent usage among `members`.
fn latest_usage(members: &Members) -> Option<i64> {
    members
        .iter()
        .copied()
        .flat_map(|m| m.slots(Resolution::Month).values())
        .flat_map(|slot| slot.readings.values())
        .map(|r| r.end)
        .max()
}

/// Newest plan version among the readings; ties go to the smallest plan id.
fn formula_ref(members: &Members) -> Option<FormulaRef> {
    members
        .iter()
        .copied()
        .flat_map(|m| {
            let plan_id = m.key.metering_plan_id();
            m.slots(Resolution::Month)
                .values()
                .flat_map(|slot| slot.readings.values())
                .map(move |r| (r.plan_effective, plan_id.clone()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(effective, metering_plan_id)| FormulaRef {
            metering_plan_id,
            effective,
        })
}

/// Summarized quantity of a slot as of `t`.
pub fn summarize_slot(
    registry: &FormulaRegistry,
    metric: &MetricUsage,
    slot: &WindowSlot,
    t: i64,
) -> Result<Decimal> {
    let formulas = registry
        .lookup(
            &metric.formula.metering_plan_id,
            metric.formula.effective,
            &metric.metric,
        )?
        .formulas;
    (formulas.summarize)(t, slot.quantity.as_ref(), slot.bounds.from, slot.bounds.to)
}

/// Recompute every charge of the tree as of `as_of`.
///
/// Plan-level charges are `price × summarize`; every coarser node charges
/// the sum of its plans' charges for the same metric and slot.
pub fn price_tree(usage: &mut OrganizationUsage, registry: &FormulaRegistry, as_of: i64) -> Result<()> {
    for resource in usage.resources.iter_mut() {
        price_resource(resource, registry, as_of)?;
    }
    for space in usage.spaces.iter_mut() {
        for resource in space.resources.iter_mut() {
            price_resource(resource, registry, as_of)?;
        }
        for consumer in space.consumers.iter_mut() {
            for resource in consumer.resources.iter_mut() {
                price_resource(resource, registry, as_of)?;
            }
        }
    }

    let OrganizationUsage {
        resources,
        aggregated_usage,
        ..
    } = usage;
    for metric in aggregated_usage.iter_mut() {
        let sources: Vec<&MetricUsage> = resources
            .iter()
            .filter_map(|r| r.metric(&metric.metric))
            .collect();
        roll_up_charges(metric, &sources)?;
    }
    usage.as_of = as_of;
    Ok(())
}

fn price_resource(resource: &mut ResourceUsage, registry: &FormulaRegistry, as_of: i64) -> Result<()> {
    for plan in resource.plans.iter_mut() {
        for metric in plan.aggregated_usage.iter_mut() {
            let price = *plan.prices.get(&metric.metric).ok_or_else(|| {
                Error::NotFound(format!(
                    "No price for metric {} of plan {}",
                    metric.metric, plan.plan_id
                ))
            })?;
            for resolution in Resolution::ALL {
                let mut charges = Vec::new();
                for slot in metric.windows.get(resolution) {
                    let summary = summarize_slot(registry, metric, slot, as_of)?;
                    charges.push(
                        price
                            .checked_mul(summary)
                            .ok_or_else(|| overflow("charge"))?,
                    );
                }
                for (slot, charge) in metric.windows.get_mut(resolution).iter_mut().zip(charges) {
                    slot.charge = charge;
                }
            }
        }
    }

    let ResourceUsage {
        aggregated_usage,
        plans,
        ..
    } = resource;
    for metric in aggregated_usage.iter_mut() {
        let sources: Vec<&MetricUsage> = plans.iter().filter_map(|p| p.metric(&metric.metric)).collect();
        roll_up_charges(metric, &sources)?;
    }
    Ok(())
}

fn roll_up_charges(target: &mut MetricUsage, sources: &[&MetricUsage]) -> Result<()> {
    for resolution in Resolution::ALL {
        for slot in target.windows.get_mut(resolution).iter_mut() {
            slot.charge = sources
                .iter()
                .filter_map(|s| s.windows.slot(resolution, slot.bounds.from))
                .try_fold(Decimal::ZERO, |total, s| total.checked_add(s.charge))
                .ok_or_else(|| overflow("charge roll-up"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::linux_container::EFFECTIVE;
    use crate::pricing::StaticPriceCatalog;
    use crate::state::accumulator::Reading;
    use crate::state::MeteredQuantity;
    use rust_decimal_macros::dec;

    // 2016-03-01T10:00:00Z
    const T0: i64 = 1_456_826_400_000;
    const HOUR: i64 = 3_600_000;

    fn key(space: &str, plan: &str, instance: &str) -> InstanceKey {
        InstanceKey {
            space_id: space.to_string(),
            consumer_id: "app".to_string(),
            resource_id: "linux-container".to_string(),
            plan_id: plan.to_string(),
            resource_instance_id: instance.to_string(),
            metric: "memory".to_string(),
        }
    }

    fn accumulator(key: InstanceKey, readings: &[(Decimal, i64)]) -> InstanceAccumulator {
        let registry = FormulaRegistry::with_defaults();
        let mut acc = InstanceAccumulator::new(key);
        for (consuming, at) in readings {
            acc.ingest(
                Reading {
                    quantity: MeteredQuantity::new(*consuming, *at),
                    start: *at,
                    end: *at,
                    plan_effective: EFFECTIVE,
                },
                &registry,
            )
            .unwrap();
        }
        acc
    }

    fn aggregate(accs: &[InstanceAccumulator], as_of: i64) -> Result<OrganizationUsage> {
        let registry = FormulaRegistry::with_defaults();
        let prices = StaticPriceCatalog::linux_container();
        let pass = Aggregation {
            registry: &registry,
            prices: &prices,
            country: "USA",
            as_of,
        };
        pass.organization("org", accs.iter())
    }

    fn hour_slot(metric: &MetricUsage) -> &WindowSlot {
        metric.windows.slot(Resolution::Hour, T0).unwrap()
    }

    #[test]
    fn test_two_instances_roll_up_to_organization() {
        let accs = vec![
            accumulator(key("space", "basic", "i-1"), &[(dec!(0.5), T0)]),
            accumulator(key("space", "basic", "i-2"), &[(dec!(0.5), T0)]),
        ];
        let usage = aggregate(&accs, T0 + HOUR).unwrap();
        let registry = FormulaRegistry::with_defaults();

        let org_memory = usage.metric("memory").unwrap();
        let slot = hour_slot(org_memory);
        assert_eq!(slot.quantity.unwrap().consuming, dec!(1.0));
        assert_eq!(
            summarize_slot(&registry, org_memory, slot, T0 + HOUR).unwrap(),
            dec!(1.0)
        );
        assert_eq!(slot.charge, dec!(0.1375));

        let resource = usage.resource("linux-container").unwrap();
        let plan = resource.plan("basic").unwrap();
        assert_eq!(plan.metering_plan_id, "basic-linux-container");
        assert_eq!(hour_slot(plan.metric("memory").unwrap()).charge, dec!(0.1375));
    }

    #[test]
    fn test_spaces_and_consumers() {
        let accs = vec![
            accumulator(key("space-a", "basic", "i-1"), &[(dec!(0.5), T0)]),
            accumulator(key("space-b", "standard", "i-2"), &[(dec!(1.5), T0)]),
        ];
        let usage = aggregate(&accs, T0 + HOUR).unwrap();

        assert_eq!(usage.spaces.len(), 2);
        let space_a = usage.space("space-a").unwrap();
        let memory = space_a
            .consumer("app")
            .unwrap()
            .resource("linux-container")
            .unwrap()
            .metric("memory")
            .unwrap();
        assert_eq!(hour_slot(memory).quantity.unwrap().consuming, dec!(0.5));

        let resource = usage.resource("linux-container").unwrap();
        assert_eq!(resource.plans.len(), 2);
        // Both plans charge 0.1375 per GB-hour: 2 GB-hours in total
        assert_eq!(hour_slot(resource.metric("memory").unwrap()).charge, dec!(0.275));
        assert_eq!(hour_slot(usage.metric("memory").unwrap()).charge, dec!(0.275));
    }

    #[test]
    fn test_instance_update_counts_delta_only() {
        let accs = vec![
            accumulator(
                key("space", "basic", "i-1"),
                &[(dec!(0.5), T0), (dec!(1.0), T0 + HOUR / 2)],
            ),
            accumulator(key("space", "basic", "i-2"), &[(dec!(0.5), T0)]),
        ];
        let usage = aggregate(&accs, T0 + HOUR).unwrap();
        let slot = hour_slot(usage.metric("memory").unwrap());
        let value = slot.quantity.as_ref().unwrap();
        assert_eq!(value.consuming, dec!(1.5));
        assert_eq!(value.since, T0 + HOUR / 2);
        // 1.0 GB for the first half hour
        assert_eq!(value.consumed, dec!(1.0) * Decimal::from(HOUR / 2));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let accs = vec![
            accumulator(key("space", "basic", "i-1"), &[(dec!(0.5), T0), (dec!(2), T0 + 5_000)]),
            accumulator(key("space", "basic", "i-2"), &[(dec!(0.25), T0 + 1_000)]),
        ];
        assert_eq!(
            aggregate(&accs, T0 + HOUR).unwrap(),
            aggregate(&accs, T0 + HOUR).unwrap()
        );
    }

    #[test]
    fn test_missing_price_aborts_pass() {
        let accs = vec![accumulator(key("space", "basic", "i-1"), &[(dec!(0.5), T0)])];
        let registry = FormulaRegistry::with_defaults();
        let prices = StaticPriceCatalog::linux_container();
        let pass = Aggregation {
            registry: &registry,
            prices: &prices,
            country: "JPN",
            as_of: T0,
        };
        assert!(matches!(
            pass.organization("org", accs.iter()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_hourly_readings_roll_up_to_month() {
        // One reading at every hour start for a day
        let readings: Vec<(Decimal, i64)> = (0..24).map(|h| (dec!(0.5), T0 + h * HOUR)).collect();
        let accs = vec![accumulator(key("space", "basic", "i-1"), &readings)];
        let end = T0 + 24 * HOUR;
        let usage = aggregate(&accs, end).unwrap();
        let registry = FormulaRegistry::with_defaults();
        let memory = usage.metric("memory").unwrap();

        let hourly: Decimal = memory
            .windows
            .get(Resolution::Hour)
            .iter()
            .map(|slot| summarize_slot(&registry, memory, slot, end).unwrap())
            .sum();
        let month = &memory.windows.get(Resolution::Month)[0];
        let monthly = summarize_slot(&registry, memory, month, end).unwrap();
        assert_eq!(hourly, dec!(12));
        assert_eq!(monthly, hourly);
    }
}
