use crate::error::{Error, Result};
use crate::state::OrgState;
use crate::storage::{LoggedUsage, Storage};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-process storage with the same semantics as [`super::FileStorage`],
/// without durability. Used by tests and by embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    log: RwLock<Vec<LoggedUsage>>,
    snapshots: RwLock<BTreeMap<String, OrgState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    pub fn log_len(&self) -> usize {
        self.log.read().len()
    }
}

impl Storage for MemoryStorage {
    fn append_usage(&self, usage: &LoggedUsage) -> Result<u64> {
        let mut log = self.log.write();
        log.push(usage.clone());
        Ok(log.len() as u64 - 1)
    }

    fn load_snapshot(&self, organization_id: &str) -> Result<Option<OrgState>> {
        Ok(self.snapshots.read().get(organization_id).cloned())
    }

    fn persist_snapshot(&self, state: &OrgState, expected_version: u64) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let stored = snapshots
            .get(&state.organization_id)
            .map(|s| s.version)
            .unwrap_or(0);
        if stored != expected_version {
            return Err(Error::Conflict(format!(
                "Snapshot of {} is at version {}, expected {}",
                state.organization_id, stored, expected_version
            )));
        }
        snapshots.insert(state.organization_id.clone(), state.clone());
        Ok(())
    }

    fn organizations(&self) -> Result<Vec<String>> {
        Ok(self.snapshots.read().keys().cloned().collect())
    }

    fn load_usage_from(&self, from_index: u64) -> Result<Vec<LoggedUsage>> {
        let log = self.log.read();
        let from = usize::try_from(from_index).unwrap_or(usize::MAX).min(log.len());
        Ok(log[from..].to_vec())
    }
}
