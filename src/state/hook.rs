//! Hook: injectable observer of the metering pipeline.
//!
//! `apply` calls the hook at each stage of an event. Pre-hooks can block the
//! event; post-hooks are for recording (audit trails, metrics exporters).

use crate::error::{Error, Result};
use crate::state::accumulator::{InstanceKey, Reading};
use crate::state::hierarchy::OrganizationUsage;
use crate::usage::UsageEvent;

/// Pipeline hook. Shared between writer threads, hence `&self`.
pub trait Hook: Send + Sync {
    /// Called after validation, before any accumulator is touched. Return Err
    /// to reject the event.
    fn before_accumulate(&self, _event: &UsageEvent, _event_id: &str) -> Result<()> {
        Ok(())
    }

    /// Called for every reading folded into an accumulator.
    fn on_accumulated(&self, _key: &InstanceKey, _reading: &Reading) -> Result<()> {
        Ok(())
    }

    /// Called once the organization tree has been rebuilt.
    fn on_aggregated(&self, _usage: &OrganizationUsage) -> Result<()> {
        Ok(())
    }

    /// Called when an event is rejected. The state is unchanged.
    fn on_rejected(&self, _event: &UsageEvent, _error: &Error) {}
}

/// No-op hook: the default.
#[derive(Debug, Clone, Default)]
pub struct NoOpHook;

impl Hook for NoOpHook {}
