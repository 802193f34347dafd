//! Replay service: rebuild organization states from snapshots and the usage
//! log.

use crate::config::Config;
use crate::error::Result;
use crate::formula::FormulaRegistry;
use crate::pricing::PriceCatalog;
use crate::state::{apply, Applied, ApplyEnv, OrgState};
use crate::storage::Storage;
use crate::usage::ValidationContext;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// States rebuilt by a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replayed {
    pub states: BTreeMap<String, OrgState>,
    /// Log entries applied on top of the snapshots.
    pub applied: usize,
    /// Snapshot versions the states were loaded at (0 without snapshot).
    pub base_versions: BTreeMap<String, u64>,
}

/// Replay the usage log from storage to its tip.
///
/// - Every organization with a snapshot starts from it and only applies log
///   entries from its `log_index` on.
/// - Organizations without a snapshot start empty.
/// - Entries are applied in replay mode at their recorded processing time,
///   so sealing and pruning match the live run.
/// - Revoked entries (their snapshot write failed and the caller saw a
///   rejection) are skipped, as are duplicates and entries that no longer
///   apply. A bad entry never blocks the rest of the log.
pub fn replay_to_tip<S: Storage>(
    storage: &S,
    registry: &FormulaRegistry,
    prices: &dyn PriceCatalog,
    config: &Config,
) -> Result<Replayed> {
    let mut states = BTreeMap::new();
    let mut base_versions = BTreeMap::new();
    for organization_id in storage.organizations()? {
        if let Some(state) = storage.load_snapshot(&organization_id)? {
            base_versions.insert(organization_id.clone(), state.version);
            states.insert(organization_id, state);
        }
    }

    let env = ApplyEnv::new(registry, prices)
        .with_country(&config.country)
        .with_retained_slots(config.retained_slots);

    let log = storage.load_usage_from(0)?;
    let revoked: HashSet<u64> = log.iter().filter_map(|logged| logged.revokes).collect();

    let mut applied = 0;
    for (index, logged) in (0u64..).zip(log) {
        let organization_id = &logged.event.organization_id;
        let state = states
            .entry(organization_id.clone())
            .or_insert_with(|| OrgState::new(organization_id));
        base_versions.entry(organization_id.clone()).or_insert(0);
        if index < state.log_index {
            continue;
        }

        if logged.revokes.is_some() || revoked.contains(&index) {
            debug!(index, "skipping revoked log entry");
        } else {
            let ctx = ValidationContext::replay_at(logged.processed_at, config.slack_ms);
            match apply(state, &logged.event, &ctx, &env) {
                Ok(Applied::Accepted { state: next, .. }) => {
                    *state = next;
                    applied += 1;
                }
                Ok(Applied::Duplicate { event_id }) => {
                    debug!(index, event_id = %event_id, "skipping duplicate log entry");
                }
                Err(e) => {
                    warn!(
                        index,
                        organization_id = %organization_id,
                        error = %e,
                        "skipping log entry that no longer applies"
                    );
                }
            }
        }
        state.log_index = index + 1;
    }

    info!(organizations = states.len(), applied, "replayed usage log");
    Ok(Replayed {
        states,
        applied,
        base_versions,
    })
}

/// Replay and write back every state that moved past its snapshot.
pub fn replay_and_persist<S: Storage>(
    storage: &S,
    registry: &FormulaRegistry,
    prices: &dyn PriceCatalog,
    config: &Config,
) -> Result<Replayed> {
    let replayed = replay_to_tip(storage, registry, prices, config)?;
    for (organization_id, state) in &replayed.states {
        let base = replayed.base_versions.get(organization_id).copied().unwrap_or(0);
        if state.version != base {
            storage.persist_snapshot(state, base)?;
        }
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::pricing::StaticPriceCatalog;
    use crate::storage::{LoggedUsage, MemoryStorage};
    use crate::usage::{Measure, UsageEvent};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    // 2016-03-01T10:00:00Z
    const T0: i64 = 1_456_826_400_000;

    fn create_test_event(org: &str, instance: &str, at: i64) -> UsageEvent {
        UsageEvent {
            resource_id: "linux-container".to_string(),
            plan_id: "basic".to_string(),
            organization_id: org.to_string(),
            space_id: "space".to_string(),
            consumer_id: "app".to_string(),
            resource_instance_id: instance.to_string(),
            measures: vec![
                Measure::new("instance_memory", dec!(536870912)),
                Measure::new("running_instances", dec!(1)),
            ],
            start: at,
            end: at,
        }
    }

    #[test]
    fn test_replay_matches_live_state() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = Engine::new(
            storage.clone(),
            FormulaRegistry::with_defaults(),
            Box::new(StaticPriceCatalog::linux_container()),
            Config::new(),
        )
        .with_clock(|| T0);
        engine.submit(&create_test_event("org-a", "i-1", T0)).unwrap();
        engine.submit(&create_test_event("org-b", "i-1", T0)).unwrap();
        engine.submit(&create_test_event("org-a", "i-2", T0 + 1_000)).unwrap();

        // Start from nothing but the log
        let log_only = MemoryStorage::new();
        for logged in storage.load_usage_from(0).unwrap() {
            log_only.append_usage(&logged).unwrap();
        }
        let replayed = replay_to_tip(
            &log_only,
            &FormulaRegistry::with_defaults(),
            &StaticPriceCatalog::linux_container(),
            &Config::new(),
        )
        .unwrap();

        assert_eq!(replayed.applied, 3);
        let live_a = engine.snapshot("org-a").unwrap().unwrap();
        assert_eq!(replayed.states["org-a"], *live_a);
        assert_eq!(replayed.states["org-b"].version, 1);
    }

    #[test]
    fn test_replay_resumes_from_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = Engine::new(
            storage.clone(),
            FormulaRegistry::with_defaults(),
            Box::new(StaticPriceCatalog::linux_container()),
            Config::new(),
        )
        .with_clock(|| T0);
        engine.submit(&create_test_event("org", "i-1", T0)).unwrap();

        // Logged but never snapshotted (crash between append and persist)
        storage
            .append_usage(&LoggedUsage::accepted(create_test_event("org", "i-2", T0), T0))
            .unwrap();

        let replayed = replay_and_persist(
            &storage,
            &FormulaRegistry::with_defaults(),
            &StaticPriceCatalog::linux_container(),
            &Config::new(),
        )
        .unwrap();
        assert_eq!(replayed.applied, 1);
        let state = storage.load_snapshot("org").unwrap().unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.log_index, 2);
        assert_eq!(state.accumulators.len(), 2);
    }

    #[test]
    fn test_replay_skips_revoked_and_inapplicable_entries() {
        let storage = MemoryStorage::new();
        let mut unknown_plan = create_test_event("org", "i-1", T0);
        unknown_plan.plan_id = "premium".to_string();
        storage.append_usage(&LoggedUsage::accepted(unknown_plan, T0)).unwrap();

        let rejected = LoggedUsage::accepted(create_test_event("org", "i-2", T0), T0);
        let index = storage.append_usage(&rejected).unwrap();
        storage.append_usage(&rejected.revocation(index)).unwrap();

        storage
            .append_usage(&LoggedUsage::accepted(create_test_event("org", "i-3", T0), T0))
            .unwrap();

        let replayed = replay_to_tip(
            &storage,
            &FormulaRegistry::with_defaults(),
            &StaticPriceCatalog::linux_container(),
            &Config::new(),
        )
        .unwrap();
        assert_eq!(replayed.applied, 1);
        let state = &replayed.states["org"];
        assert_eq!(state.version, 1);
        assert_eq!(state.log_index, 4);
        assert_eq!(state.accumulators.len(), 1);
    }
}
