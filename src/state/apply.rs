use crate::config::DEFAULT_RETAINED_SLOTS;
use crate::error::{Error, Result};
use crate::formula::{FormulaRegistry, Measurement};
use crate::pricing::PriceCatalog;
use crate::state::accumulator::{Ingest, InstanceAccumulator, InstanceKey, Reading};
use crate::state::aggregator::Aggregation;
use crate::state::hook::{Hook, NoOpHook};
use crate::state::OrgState;
use crate::usage::{validate, UsageEvent, ValidationContext};
use tracing::debug;

/// Read-only collaborators of a state transition.
#[derive(Clone, Copy)]
pub struct ApplyEnv<'a> {
    pub registry: &'a FormulaRegistry,
    pub prices: &'a dyn PriceCatalog,
    pub country: &'a str,
    pub retained_slots: usize,
    pub hook: &'a dyn Hook,
}

impl<'a> ApplyEnv<'a> {
    pub fn new(registry: &'a FormulaRegistry, prices: &'a dyn PriceCatalog) -> Self {
        ApplyEnv {
            registry,
            prices,
            country: "USA",
            retained_slots: DEFAULT_RETAINED_SLOTS,
            hook: &NoOpHook,
        }
    }

    pub fn with_country(mut self, country: &'a str) -> Self {
        self.country = country;
        self
    }

    pub fn with_retained_slots(mut self, retained_slots: usize) -> Self {
        self.retained_slots = retained_slots;
        self
    }

    pub fn with_hook(mut self, hook: &'a dyn Hook) -> Self {
        self.hook = hook;
        self
    }
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The event changed the state; `state` is the next committed state.
    Accepted { event_id: String, state: OrgState },
    /// Already applied. The state is unchanged.
    Duplicate { event_id: String },
}

impl Applied {
    pub fn event_id(&self) -> &str {
        match self {
            Applied::Accepted { event_id, .. } | Applied::Duplicate { event_id } => event_id,
        }
    }
}

/// Apply one usage event to an organization's state.
///
/// Pure: `state` is never touched, the next state is built on a clone and
/// returned only if every stage succeeded. `ctx` must be
/// `ValidationContext::replay_at` when replaying from the log and
/// `ValidationContext::live` for new submissions.
pub fn apply(
    state: &OrgState,
    event: &UsageEvent,
    ctx: &ValidationContext,
    env: &ApplyEnv,
) -> Result<Applied> {
    let result = apply_event(state, event, ctx, env);
    if let Err(e) = &result {
        env.hook.on_rejected(event, e);
    }
    result
}

fn apply_event(
    state: &OrgState,
    event: &UsageEvent,
    ctx: &ValidationContext,
    env: &ApplyEnv,
) -> Result<Applied> {
    validate(event, ctx)?;
    if event.organization_id != state.organization_id {
        return Err(Error::MalformedInput(format!(
            "Usage of organization {} applied to {}",
            event.organization_id, state.organization_id
        )));
    }

    let event_id = event.event_id()?;
    if state.has_seen(&event_id) {
        return Ok(Applied::Duplicate { event_id });
    }
    env.hook.before_accumulate(event, &event_id)?;

    // Usage is metered by the plan version in effect when it started
    let plan = env.registry.plan(&event.metering_plan_id(), event.start)?;
    let measures = event.measure_map();
    let measurement = Measurement::new(event.start, event.end, &measures);

    let mut next = state.clone();
    let mut accepted = false;
    for metric in &plan.metrics {
        let quantity = (metric.formulas.meter)(&measurement)?;
        let key = InstanceKey::from_event(event, &metric.name);
        let reading = Reading {
            quantity,
            start: event.start,
            end: event.end,
            plan_effective: plan.effective,
        };
        let accumulator = next
            .accumulators
            .entry(key.key())
            .or_insert_with(|| InstanceAccumulator::new(key.clone()));
        if accumulator.ingest(reading, env.registry)? == Ingest::Accepted {
            env.hook.on_accumulated(&key, &reading)?;
            accepted = true;
        }
    }
    if !accepted {
        // Every reading was already folded in under another submission
        return Ok(Applied::Duplicate { event_id });
    }

    let now = ctx.now.max(state.processed_at);
    let mut sealed = 0;
    for accumulator in next.accumulators.values_mut() {
        sealed += accumulator.seal(now, ctx.slack_ms, env.retained_slots);
    }
    next.accumulators.retain(|_, a| !a.is_empty());

    next.seen_events.insert(event_id.clone(), event.end);
    let horizon = now.saturating_sub(ctx.slack_ms);
    next.seen_events.retain(|_, end| *end >= horizon);

    let aggregation = Aggregation {
        registry: env.registry,
        prices: env.prices,
        country: env.country,
        as_of: now,
    };
    next.usage = aggregation.organization(&state.organization_id, next.accumulators.values())?;
    env.hook.on_aggregated(&next.usage)?;

    next.processed_at = now;
    next.version = state.version + 1;
    debug!(
        organization_id = %state.organization_id,
        event_id = %event_id,
        version = next.version,
        sealed,
        "applied usage"
    );

    Ok(Applied::Accepted {
        event_id,
        state: next,
    })
}
