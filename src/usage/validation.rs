use crate::error::{Error, Result};
use crate::usage::UsageEvent;
use std::collections::HashSet;

/// Live = enforce the slack window against `now`. Replay = usage was already
/// accepted once, only the recorded processing time is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Live,
    Replay,
}

/// Processing clock and slack used to validate and apply usage.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    pub mode: ValidationMode,
    /// Processing time in ms since epoch.
    pub now: i64,
    pub slack_ms: i64,
}

impl ValidationContext {
    pub fn live(now: i64, slack_ms: i64) -> Self {
        ValidationContext {
            mode: ValidationMode::Live,
            now,
            slack_ms,
        }
    }

    /// Context for re-applying logged usage at its recorded processing time.
    pub fn replay_at(processed_at: i64, slack_ms: i64) -> Self {
        ValidationContext {
            mode: ValidationMode::Replay,
            now: processed_at,
            slack_ms,
        }
    }
}

fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::MalformedInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Structural checks that do not depend on the clock or on any plan.
pub fn validate_shape(event: &UsageEvent) -> Result<()> {
    require_id("resource_id", &event.resource_id)?;
    require_id("plan_id", &event.plan_id)?;
    require_id("organization_id", &event.organization_id)?;
    require_id("space_id", &event.space_id)?;
    require_id("consumer_id", &event.consumer_id)?;
    require_id("resource_instance_id", &event.resource_instance_id)?;

    if event.start < 0 {
        return Err(Error::MalformedInput(format!(
            "Usage start {} is before the epoch",
            event.start
        )));
    }
    if event.end < event.start {
        return Err(Error::MalformedInput(format!(
            "Usage end {} is before start {}",
            event.end, event.start
        )));
    }

    if event.measures.is_empty() {
        return Err(Error::MalformedInput("Usage has no measures".to_string()));
    }
    let mut names = HashSet::new();
    for measure in &event.measures {
        require_id("measure name", &measure.name)?;
        if !names.insert(measure.name.as_str()) {
            return Err(Error::MalformedInput(format!(
                "Duplicate measure {}",
                measure.name
            )));
        }
        if measure.value.is_sign_negative() && !measure.value.is_zero() {
            return Err(Error::MalformedInput(format!(
                "Measure {} is negative: {}",
                measure.name, measure.value
            )));
        }
    }

    Ok(())
}

/// Slack-window check, skipped on replay.
///
/// Usage is metered from `start`, so a `start` further back than the slack
/// is stale even when `end` is fresh. `end` may lead the processing clock by
/// at most the slack.
pub fn validate_timing(event: &UsageEvent, ctx: &ValidationContext) -> Result<()> {
    if ctx.mode == ValidationMode::Replay {
        return Ok(());
    }
    let oldest = ctx.now.saturating_sub(ctx.slack_ms);
    if event.start < oldest {
        return Err(Error::Stale(format!(
            "Usage started at {}, {} ms behind processing time {} (slack {} ms)",
            event.start,
            ctx.now - event.start,
            ctx.now,
            ctx.slack_ms
        )));
    }
    if event.end > ctx.now.saturating_add(ctx.slack_ms) {
        return Err(Error::Stale(format!(
            "Usage ends at {}, ahead of processing time {} by more than {} ms",
            event.end, ctx.now, ctx.slack_ms
        )));
    }
    Ok(())
}

pub fn validate(event: &UsageEvent, ctx: &ValidationContext) -> Result<()> {
    validate_shape(event)?;
    validate_timing(event, ctx)
}
