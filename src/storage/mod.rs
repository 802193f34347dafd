pub mod kv;
pub mod memory;

pub use kv::FileStorage;
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::state::OrgState;
use crate::usage::UsageEvent;
use serde::{Deserialize, Serialize};

/// A usage log entry: an accepted usage event with the processing time it
/// was accepted at, so replay reproduces sealing and pruning.
///
/// An entry whose snapshot never got committed is revoked by a later entry
/// carrying its index in `revokes`; replay skips both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedUsage {
    pub event: UsageEvent,
    pub processed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revokes: Option<u64>,
}

impl LoggedUsage {
    pub fn accepted(event: UsageEvent, processed_at: i64) -> Self {
        LoggedUsage {
            event,
            processed_at,
            revokes: None,
        }
    }

    /// Revocation of the entry at `index`, which carried `self.event`.
    pub fn revocation(&self, index: u64) -> Self {
        LoggedUsage {
            event: self.event.clone(),
            processed_at: self.processed_at,
            revokes: Some(index),
        }
    }
}

/// Storage abstraction for the usage log and per-organization snapshots.
///
/// Implementations must preserve:
/// - Append-only semantics for the usage log
/// - Atomic snapshot writes (crash-safe)
/// - Compare-and-swap on the snapshot version
///
/// Shared between writer threads, so every method takes `&self`.
pub trait Storage: Send + Sync {
    /// Append accepted usage to the log (append-only, durable before ack).
    ///
    /// Returns the position of the entry in the log.
    fn append_usage(&self, usage: &LoggedUsage) -> Result<u64>;

    /// Load the latest snapshot of an organization.
    ///
    /// Returns `None` if the organization has no snapshot yet.
    fn load_snapshot(&self, organization_id: &str) -> Result<Option<OrgState>>;

    /// Persist a snapshot atomically if the stored version is still
    /// `expected_version` (0 when none is stored). Otherwise `Error::Conflict`.
    fn persist_snapshot(&self, state: &OrgState, expected_version: u64) -> Result<()>;

    /// Organizations with a snapshot, sorted.
    fn organizations(&self) -> Result<Vec<String>>;

    /// Load logged usage from position `from_index` (inclusive) to the end of
    /// the log.
    fn load_usage_from(&self, from_index: u64) -> Result<Vec<LoggedUsage>>;
}

/// A store shared between engines (or processes) sharing one backend.
impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn append_usage(&self, usage: &LoggedUsage) -> Result<u64> {
        (**self).append_usage(usage)
    }

    fn load_snapshot(&self, organization_id: &str) -> Result<Option<OrgState>> {
        (**self).load_snapshot(organization_id)
    }

    fn persist_snapshot(&self, state: &OrgState, expected_version: u64) -> Result<()> {
        (**self).persist_snapshot(state, expected_version)
    }

    fn organizations(&self) -> Result<Vec<String>> {
        (**self).organizations()
    }

    fn load_usage_from(&self, from_index: u64) -> Result<Vec<LoggedUsage>> {
        (**self).load_usage_from(from_index)
    }
}
