//! Concurrent front of the pipeline.
//!
//! One cell per organization: a writer mutex serializes that organization's
//! state transitions while readers clone the committed `Arc<OrgState>` and
//! never wait on a writer. Distinct organizations never share a lock beyond
//! the short lookup of their cell.

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::formula::FormulaRegistry;
use crate::pricing::PriceCatalog;
use crate::report::{organization_report, UsageReport};
use crate::state::{apply, Applied, ApplyEnv, Hook, NoOpHook, OrgState, Resolution};
use crate::storage::{LoggedUsage, Storage};
use crate::usage::{validate_shape, UsageEvent, ValidationContext};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Successful outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    Accepted { event_id: String, version: u64 },
    /// Already applied; nothing changed.
    Duplicate { event_id: String },
}

impl Submission {
    pub fn event_id(&self) -> &str {
        match self {
            Submission::Accepted { event_id, .. } | Submission::Duplicate { event_id } => event_id,
        }
    }
}

/// A submission the engine refused. The organization's state is unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?} ({event_id}): {message}")]
pub struct Rejection {
    pub kind: ErrorKind,
    pub event_id: String,
    pub message: String,
}

impl Rejection {
    fn new(event_id: &str, error: &Error) -> Self {
        Rejection {
            kind: error.kind(),
            event_id: event_id.to_string(),
            message: error.to_string(),
        }
    }
}

struct OrgCell {
    writer: Mutex<()>,
    snapshot: RwLock<Arc<OrgState>>,
}

impl OrgCell {
    fn new(state: OrgState) -> Self {
        OrgCell {
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(state)),
        }
    }

    fn current(&self) -> Arc<OrgState> {
        self.snapshot.read().clone()
    }
}

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

pub struct Engine<S: Storage, H: Hook = NoOpHook> {
    storage: S,
    registry: FormulaRegistry,
    prices: Box<dyn PriceCatalog + Send + Sync>,
    config: Config,
    hook: H,
    clock: Clock,
    cells: RwLock<HashMap<String, Arc<OrgCell>>>,
}

impl<S: Storage> Engine<S, NoOpHook> {
    pub fn new(
        storage: S,
        registry: FormulaRegistry,
        prices: Box<dyn PriceCatalog + Send + Sync>,
        config: Config,
    ) -> Self {
        Engine {
            storage,
            registry,
            prices,
            config,
            hook: NoOpHook,
            clock: Box::new(crate::current_timestamp),
            cells: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Storage, H: Hook> Engine<S, H> {
    pub fn with_hook<H2: Hook>(self, hook: H2) -> Engine<S, H2> {
        Engine {
            storage: self.storage,
            registry: self.registry,
            prices: self.prices,
            config: self.config,
            hook,
            clock: self.clock,
            cells: self.cells,
        }
    }

    /// Replace the processing clock (ms since epoch).
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn registry(&self) -> &FormulaRegistry {
        &self.registry
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    fn env(&self) -> ApplyEnv<'_> {
        ApplyEnv::new(&self.registry, self.prices.as_ref())
            .with_country(&self.config.country)
            .with_retained_slots(self.config.retained_slots)
            .with_hook(&self.hook)
    }

    /// Run a storage operation, retrying `StorageUnavailable` with exponential
    /// backoff. Conflicts are left to the caller: they need a reload first.
    fn with_retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(e @ Error::StorageUnavailable(_)) if attempt < attempts => {
                    let delay = self
                        .config
                        .retry_base_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    debug!(what, attempt, delay_ms = delay, error = %e, "retrying storage operation");
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Cell of an organization, loading its snapshot on first use.
    fn cell(&self, organization_id: &str) -> Result<Arc<OrgCell>> {
        if let Some(cell) = self.cells.read().get(organization_id) {
            return Ok(cell.clone());
        }
        let loaded = self.with_retry("load snapshot", || {
            self.storage.load_snapshot(organization_id)
        })?;
        let mut cells = self.cells.write();
        // Another thread may have won the race while we were loading
        let cell = cells.entry(organization_id.to_string()).or_insert_with(|| {
            Arc::new(OrgCell::new(
                loaded.unwrap_or_else(|| OrgState::new(organization_id)),
            ))
        });
        Ok(cell.clone())
    }

    /// Submit one usage event.
    ///
    /// `Duplicate` is a success: the event was already applied. A rejection
    /// carries the error kind and the event id; the state is unchanged.
    pub fn submit(&self, event: &UsageEvent) -> std::result::Result<Submission, Rejection> {
        let event_id = event
            .event_id()
            .map_err(|e| Rejection::new("", &e))?;
        match self.try_submit(event, &event_id) {
            Ok(submission) => Ok(submission),
            Err(e) => {
                warn!(
                    organization_id = %event.organization_id,
                    event_id = %event_id,
                    kind = ?e.kind(),
                    error = %e,
                    "usage rejected"
                );
                Err(Rejection::new(&event_id, &e))
            }
        }
    }

    fn try_submit(&self, event: &UsageEvent, event_id: &str) -> Result<Submission> {
        validate_shape(event)?;
        let cell = self.cell(&event.organization_id)?;
        let _writer = cell.writer.lock();

        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.commit(&cell, event) {
                Err(Error::Conflict(msg)) if attempt < attempts => {
                    // Someone else advanced the snapshot: reload and re-apply
                    debug!(event_id, attempt, conflict = %msg, "reloading organization snapshot");
                    let reloaded = self.with_retry("load snapshot", || {
                        self.storage.load_snapshot(&event.organization_id)
                    })?;
                    if let Some(state) = reloaded {
                        *cell.snapshot.write() = Arc::new(state);
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Apply against the committed snapshot, log, persist and publish.
    fn commit(&self, cell: &OrgCell, event: &UsageEvent) -> Result<Submission> {
        let current = cell.current();
        let now = (self.clock)();
        let ctx = ValidationContext::live(now, self.config.slack_ms);

        let (event_id, mut next) = match apply(&current, event, &ctx, &self.env())? {
            Applied::Duplicate { event_id } => {
                debug!(event_id = %event_id, "duplicate usage");
                return Ok(Submission::Duplicate { event_id });
            }
            Applied::Accepted { event_id, state } => (event_id, state),
        };

        let logged = LoggedUsage::accepted(event.clone(), next.processed_at);
        let index = self.with_retry("append usage", || self.storage.append_usage(&logged))?;
        next.log_index = index + 1;
        if let Err(e) = self.with_retry("persist snapshot", || {
            self.storage.persist_snapshot(&next, current.version)
        }) {
            self.revoke(&logged, index);
            return Err(e);
        }

        let version = next.version;
        *cell.snapshot.write() = Arc::new(next);
        info!(
            organization_id = %event.organization_id,
            event_id = %event_id,
            version,
            "usage accepted"
        );
        Ok(Submission::Accepted { event_id, version })
    }

    /// Mark the log entry at `index` as never committed so replay skips it.
    fn revoke(&self, logged: &LoggedUsage, index: u64) {
        let revocation = logged.revocation(index);
        if let Err(e) = self.with_retry("revoke usage", || self.storage.append_usage(&revocation)) {
            error!(
                organization_id = %logged.event.organization_id,
                index,
                error = %e,
                "failed to revoke uncommitted usage log entry"
            );
        }
    }

    /// Committed state of an organization, `None` if it never had usage.
    pub fn snapshot(&self, organization_id: &str) -> Result<Option<Arc<OrgState>>> {
        if let Some(cell) = self.cells.read().get(organization_id) {
            return Ok(Some(cell.current()));
        }
        Ok(self
            .with_retry("load snapshot", || {
                self.storage.load_snapshot(organization_id)
            })?
            .map(Arc::new))
    }

    /// Usage report of an organization as of `time`.
    pub fn report(
        &self,
        organization_id: &str,
        time: i64,
        resolution: Option<Resolution>,
    ) -> Result<UsageReport> {
        let snapshot = self.snapshot(organization_id)?;
        organization_report(
            organization_id,
            snapshot.as_ref().map(|s| &s.usage),
            &self.registry,
            time,
            resolution,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::StaticPriceCatalog;
    use crate::replay::replay_to_tip;
    use crate::storage::MemoryStorage;
    use crate::usage::Measure;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 2016-03-01T10:00:00Z
    const T0: i64 = 1_456_826_400_000;
    const HOUR: i64 = 3_600_000;

    fn create_test_engine<S: Storage>(storage: S) -> Engine<S> {
        let mut config = Config::new();
        config.retry_base_ms = 1;
        Engine::new(
            storage,
            FormulaRegistry::with_defaults(),
            Box::new(StaticPriceCatalog::linux_container()),
            config,
        )
        .with_clock(|| T0)
    }

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

    fn hour_consuming<S: Storage, H: Hook>(engine: &Engine<S, H>, org: &str) -> Decimal {
        engine
            .snapshot(org)
            .unwrap()
            .unwrap()
            .usage
            .metric("memory")
            .unwrap()
            .windows
            .slot(Resolution::Hour, T0)
            .unwrap()
            .quantity
            .unwrap()
            .consuming
    }

    #[test]
    fn test_submit_accept_then_duplicate() {
        let engine = create_test_engine(MemoryStorage::new());
        let event = create_test_event("org", "i-1", T0);

        let first = engine.submit(&event).unwrap();
        assert!(matches!(first, Submission::Accepted { version: 1, .. }));
        let second = engine.submit(&event).unwrap();
        assert_eq!(
            second,
            Submission::Duplicate {
                event_id: first.event_id().to_string()
            }
        );
        assert_eq!(engine.storage().log_len(), 1);
        assert_eq!(engine.snapshot("org").unwrap().unwrap().log_index, 1);
    }

    #[test]
    fn test_submit_stale_is_rejected() {
        let engine = create_test_engine(MemoryStorage::new());
        engine.submit(&create_test_event("org", "i-1", T0)).unwrap();
        let before = engine.snapshot("org").unwrap().unwrap();

        let late = create_test_event("org", "i-2", T0 - 10 * 60 * 1000);
        let rejection = engine.submit(&late).unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::Stale);
        assert_eq!(rejection.event_id, late.event_id().unwrap());
        assert_eq!(engine.snapshot("org").unwrap().unwrap(), before);
        assert_eq!(engine.storage().log_len(), 1);
    }

    #[test]
    fn test_submit_malformed_is_rejected() {
        let engine = create_test_engine(MemoryStorage::new());
        let mut event = create_test_event("org", "i-1", T0);
        event.measures.clear();
        let rejection = engine.submit(&event).unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::MalformedInput);
        assert!(engine.snapshot("org").unwrap().is_none());
    }

    #[test]
    fn test_report_unknown_organization() {
        let engine = create_test_engine(MemoryStorage::new());
        let report = engine.report("nobody", T0, None).unwrap();
        assert!(report.aggregated_usage.is_empty());
        assert_eq!(report.organization_id, "nobody");
    }

    #[test]
    fn test_concurrent_submissions() {
        let engine = create_test_engine(MemoryStorage::new());
        let orgs = ["org-a", "org-b", "org-c", "org-d"];
        let accepted = AtomicUsize::new(0);

        thread::scope(|scope| {
            for org in orgs {
                // Two submitters per organization racing on the same events
                for _ in 0..2 {
                    let engine = &engine;
                    let accepted = &accepted;
                    scope.spawn(move || {
                        for i in 0..10 {
                            let event = create_test_event(org, &format!("i-{}", i), T0 + i * 1_000);
                            if let Submission::Accepted { .. } = engine.submit(&event).unwrap() {
                                accepted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    });
                }
            }
        });

        assert_eq!(accepted.load(Ordering::SeqCst), 40);
        for org in orgs {
            let state = engine.snapshot(org).unwrap().unwrap();
            assert_eq!(state.version, 10);
            assert_eq!(state.accumulators.len(), 10);
        }
        assert_eq!(hour_consuming(&engine, "org-a"), dec!(5.0));
    }

    /// Fails the first `failures` appends and the first `persist_failures`
    /// snapshot writes with a transient error.
    struct FlakyStorage {
        inner: MemoryStorage,
        failures: AtomicUsize,
        persist_failures: AtomicUsize,
    }

    impl FlakyStorage {
        fn new(failures: usize, persist_failures: usize) -> Self {
            FlakyStorage {
                inner: MemoryStorage::new(),
                failures: AtomicUsize::new(failures),
                persist_failures: AtomicUsize::new(persist_failures),
            }
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl Storage for FlakyStorage {
        fn append_usage(&self, usage: &LoggedUsage) -> Result<u64> {
            if take_failure(&self.failures) {
                return Err(Error::StorageUnavailable("disk busy".to_string()));
            }
            self.inner.append_usage(usage)
        }

        fn load_snapshot(&self, organization_id: &str) -> Result<Option<OrgState>> {
            self.inner.load_snapshot(organization_id)
        }

        fn persist_snapshot(&self, state: &OrgState, expected_version: u64) -> Result<()> {
            if take_failure(&self.persist_failures) {
                return Err(Error::StorageUnavailable("snapshot volume offline".to_string()));
            }
            self.inner.persist_snapshot(state, expected_version)
        }

        fn organizations(&self) -> Result<Vec<String>> {
            self.inner.organizations()
        }

        fn load_usage_from(&self, from_index: u64) -> Result<Vec<LoggedUsage>> {
            self.inner.load_usage_from(from_index)
        }
    }

    #[test]
    fn test_transient_storage_failures_are_retried() {
        let engine = create_test_engine(FlakyStorage::new(3, 0));
        let submission = engine.submit(&create_test_event("org", "i-1", T0)).unwrap();
        assert!(matches!(submission, Submission::Accepted { .. }));
        assert_eq!(engine.storage().inner.log_len(), 1);
    }

    #[test]
    fn test_storage_outage_is_rejected_without_state_change() {
        let engine = create_test_engine(FlakyStorage::new(100, 0));
        let event = create_test_event("org", "i-1", T0);
        let rejection = engine.submit(&event).unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::StorageUnavailable);
        assert_eq!(engine.snapshot("org").unwrap().unwrap().version, 0);

        // Storage is back: the retried submission goes through
        engine.storage().failures.store(0, Ordering::SeqCst);
        assert!(matches!(engine.submit(&event).unwrap(), Submission::Accepted { .. }));
    }

    #[test]
    fn test_failed_snapshot_write_is_revoked_in_log() {
        let engine = create_test_engine(FlakyStorage::new(0, usize::MAX));
        let event = create_test_event("org", "i-1", T0);
        let rejection = engine.submit(&event).unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::StorageUnavailable);
        assert_eq!(engine.snapshot("org").unwrap().unwrap().version, 0);

        // The entry and its revocation
        let log = engine.storage().inner.load_usage_from(0).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].revokes, Some(0));

        // Replay must not resurrect usage the caller saw rejected
        let replayed = replay_to_tip(
            &engine.storage().inner,
            &FormulaRegistry::with_defaults(),
            &StaticPriceCatalog::linux_container(),
            &Config::new(),
        )
        .unwrap();
        assert_eq!(replayed.applied, 0);
        let state = &replayed.states["org"];
        assert!(state.accumulators.is_empty());
        assert_eq!(state.version, 0);
        assert_eq!(state.log_index, 2);

        // Once snapshots are writable again the same event is accepted
        engine.storage().persist_failures.store(0, Ordering::SeqCst);
        assert!(matches!(
            engine.submit(&event).unwrap(),
            Submission::Accepted { version: 1, .. }
        ));
    }

    #[test]
    fn test_conflict_reloads_and_reapplies() {
        let shared = Arc::new(MemoryStorage::new());
        let engine_a = create_test_engine(shared.clone());
        let engine_b = create_test_engine(shared.clone());

        engine_b.submit(&create_test_event("org", "i-1", T0)).unwrap();
        engine_a.submit(&create_test_event("org", "i-2", T0)).unwrap();
        // engine_b still holds version 1 and has to catch up
        let submission = engine_b.submit(&create_test_event("org", "i-3", T0)).unwrap();
        assert!(matches!(submission, Submission::Accepted { version: 3, .. }));

        assert_eq!(hour_consuming(&engine_b, "org"), dec!(1.5));
        assert_eq!(shared.load_snapshot("org").unwrap().unwrap().version, 3);
    }

    #[test]
    fn test_report_serves_committed_snapshot() {
        let engine = create_test_engine(MemoryStorage::new());
        engine.submit(&create_test_event("org", "i-1", T0)).unwrap();
        engine.submit(&create_test_event("org", "i-2", T0)).unwrap();

        let report = engine.report("org", T0 + HOUR, Some(Resolution::Hour)).unwrap();
        let hour = report.metric("memory").unwrap().slot(Resolution::Hour, T0).unwrap();
        assert_eq!(hour.summary, 1.0);
        assert!((hour.charge - 0.1375).abs() < 1e-12);
    }
}
