use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::OrgState;
use crate::storage::{LoggedUsage, Storage};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_EXTENSION: &str = "snap";

/// File-based storage implementation using an append-only log and snapshots.
///
/// Files:
/// - `usage.log`: Append-only usage log (u64 LE length prefix + JSON record)
/// - `snapshots/<hex org id>.snap`: Organization snapshot (u64 LE version + JSON state)
/// - `snapshots/<hex org id>.snap.tmp`: Temporary file for atomic snapshot writes
pub struct FileStorage {
    usage_log_path: PathBuf,
    snapshot_dir: PathBuf,
    /// Serializes appends; caches the number of entries once counted.
    log: Mutex<Option<u64>>,
    /// Serializes the version check and rename of snapshot writes.
    snapshots: Mutex<()>,
}

fn unavailable(what: &str, e: std::io::Error) -> Error {
    Error::StorageUnavailable(format!("{}: {}", what, e))
}

impl FileStorage {
    /// Create a new FileStorage with paths from config
    pub fn new(config: &Config) -> Self {
        FileStorage::with_paths(config.get_usage_log_path(), config.get_snapshot_dir())
    }

    /// Create FileStorage with custom paths (for testing)
    pub fn with_paths(usage_log_path: PathBuf, snapshot_dir: PathBuf) -> Self {
        FileStorage {
            usage_log_path,
            snapshot_dir,
            log: Mutex::new(None),
            snapshots: Mutex::new(()),
        }
    }

    /// Ensure the data directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.usage_log_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| unavailable("Failed to create data directory", e))?;
        }
        fs::create_dir_all(&self.snapshot_dir)
            .map_err(|e| unavailable("Failed to create snapshot directory", e))?;
        Ok(())
    }

    fn snapshot_path(&self, organization_id: &str) -> PathBuf {
        self.snapshot_dir.join(format!(
            "{}.{}",
            hex::encode(organization_id.as_bytes()),
            SNAPSHOT_EXTENSION
        ))
    }

    /// Version of the stored snapshot, 0 if there is none.
    fn stored_version(path: &Path) -> Result<u64> {
        if !path.exists() {
            return Ok(0);
        }
        let mut file = File::open(path).map_err(|e| unavailable("Failed to open snapshot", e))?;
        let mut version = [0u8; 8];
        file.read_exact(&mut version)
            .map_err(|e| Error::Storage(format!("Snapshot header unreadable: {}", e)))?;
        Ok(u64::from_le_bytes(version))
    }

    /// Walk the log, decoding entries from `from_index` on. Returns the total
    /// number of entries and the decoded ones.
    fn read_log(&self, from_index: u64) -> Result<(u64, Vec<LoggedUsage>)> {
        if !self.usage_log_path.exists() {
            return Ok((0, Vec::new()));
        }

        let file = File::open(&self.usage_log_path)
            .map_err(|e| unavailable("Failed to open usage log", e))?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut current = 0u64;

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 8];
            match reader.read_exact(&mut len_buf) {
                Ok(_) => {
                    let len = u64::from_le_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    reader.read_exact(&mut buf).map_err(|e| {
                        Error::Storage(format!("Usage log entry {} is truncated: {}", current, e))
                    })?;

                    if current >= from_index {
                        let usage: LoggedUsage = serde_json::from_slice(&buf).map_err(|e| {
                            Error::Storage(format!("Failed to decode usage log entry {}: {}", current, e))
                        })?;
                        entries.push(usage);
                    }

                    current += 1;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    return Err(unavailable("Failed to read usage log", e));
                }
            }
        }

        Ok((current, entries))
    }
}

impl Storage for FileStorage {
    fn append_usage(&self, usage: &LoggedUsage) -> Result<u64> {
        self.ensure_dirs()?;
        let mut next_index = self.log.lock();
        let index = match *next_index {
            Some(index) => index,
            None => self.read_log(u64::MAX)?.0,
        };

        let bytes = serde_json::to_vec(usage)
            .map_err(|e| Error::Storage(format!("Failed to serialize usage: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.usage_log_path)
            .map_err(|e| unavailable("Failed to open usage log for append", e))?;

        // Length prefix and record in one write
        let mut record = Vec::with_capacity(8 + bytes.len());
        record.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        record.extend_from_slice(&bytes);
        file.write_all(&record)
            .map_err(|e| unavailable("Failed to write usage record", e))?;

        // Fsync for crash safety (append-only semantics)
        file.sync_all()
            .map_err(|e| unavailable("Failed to fsync usage log", e))?;

        *next_index = Some(index + 1);
        Ok(index)
    }

    fn load_snapshot(&self, organization_id: &str) -> Result<Option<OrgState>> {
        let path = self.snapshot_path(organization_id);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path).map_err(|e| unavailable("Failed to open snapshot", e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| unavailable("Failed to read snapshot", e))?;

        // Format: [version: u64][OrgState JSON]
        if data.len() < 8 {
            return Err(Error::Storage(format!(
                "Snapshot of {} is too short",
                organization_id
            )));
        }
        let (header, body) = data.split_at(8);
        let mut version = [0u8; 8];
        version.copy_from_slice(header);
        let state: OrgState = serde_json::from_slice(body)
            .map_err(|e| Error::Storage(format!("Failed to deserialize snapshot: {}", e)))?;

        if state.version != u64::from_le_bytes(version) {
            return Err(Error::Storage(format!(
                "Snapshot of {} has a mismatched version header",
                organization_id
            )));
        }
        Ok(Some(state))
    }

    fn persist_snapshot(&self, state: &OrgState, expected_version: u64) -> Result<()> {
        self.ensure_dirs()?;
        let path = self.snapshot_path(&state.organization_id);
        let tmp_path = path.with_extension(format!("{}.tmp", SNAPSHOT_EXTENSION));

        let bytes = serde_json::to_vec(state)
            .map_err(|e| Error::Storage(format!("Failed to serialize snapshot: {}", e)))?;

        let _guard = self.snapshots.lock();
        let stored = FileStorage::stored_version(&path)?;
        if stored != expected_version {
            return Err(Error::Conflict(format!(
                "Snapshot of {} is at version {}, expected {}",
                state.organization_id, stored, expected_version
            )));
        }

        // Write to temporary file
        let mut file =
            File::create(&tmp_path).map_err(|e| unavailable("Failed to create temp snapshot", e))?;
        file.write_all(&state.version.to_le_bytes())
            .map_err(|e| unavailable("Failed to write snapshot version", e))?;
        file.write_all(&bytes)
            .map_err(|e| unavailable("Failed to write snapshot", e))?;

        // Fsync before rename (crash safety)
        file.sync_all()
            .map_err(|e| unavailable("Failed to fsync temp snapshot", e))?;
        drop(file);

        // Atomic rename (crash-safe snapshot)
        fs::rename(&tmp_path, &path).map_err(|e| unavailable("Failed to rename temp snapshot", e))?;

        // Fsync parent directory (ensure rename is persisted)
        let dir = File::open(&self.snapshot_dir)
            .map_err(|e| unavailable("Failed to open snapshot directory", e))?;
        dir.sync_all()
            .map_err(|e| unavailable("Failed to fsync snapshot directory", e))?;

        Ok(())
    }

    fn organizations(&self) -> Result<Vec<String>> {
        if !self.snapshot_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.snapshot_dir)
            .map_err(|e| unavailable("Failed to list snapshots", e))?;

        let mut organizations = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| unavailable("Failed to list snapshots", e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = hex::decode(stem)
                .map_err(|e| Error::Storage(format!("Unexpected snapshot file {}: {}", stem, e)))?;
            let organization_id = String::from_utf8(bytes)
                .map_err(|e| Error::Storage(format!("Unexpected snapshot file {}: {}", stem, e)))?;
            organizations.push(organization_id);
        }
        organizations.sort();
        Ok(organizations)
    }

    fn load_usage_from(&self, from_index: u64) -> Result<Vec<LoggedUsage>> {
        Ok(self.read_log(from_index)?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{Measure, UsageEvent};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn create_test_storage() -> (FileStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let usage_log_path = temp_dir.path().join("usage.log");
        let snapshot_dir = temp_dir.path().join("snapshots");
        let storage = FileStorage::with_paths(usage_log_path, snapshot_dir);
        (storage, temp_dir)
    }

    fn create_test_usage(organization_id: &str, at: i64) -> LoggedUsage {
        LoggedUsage {
            event: UsageEvent {
                resource_id: "linux-container".to_string(),
                plan_id: "basic".to_string(),
                organization_id: organization_id.to_string(),
                space_id: "space".to_string(),
                consumer_id: "app".to_string(),
                resource_instance_id: "i-1".to_string(),
                measures: vec![
                    Measure::new("instance_memory", dec!(536870912)),
                    Measure::new("running_instances", dec!(1)),
                ],
                start: at,
                end: at,
            },
            processed_at: at,
            revokes: None,
        }
    }

    #[test]
    fn test_append_and_load_usage() {
        let (storage, _temp_dir) = create_test_storage();

        let usage = create_test_usage("org", 1_000);
        assert_eq!(storage.append_usage(&usage).unwrap(), 0);
        let loaded = storage.load_usage_from(0).unwrap();
        assert_eq!(loaded, vec![usage]);
    }

    #[test]
    fn test_load_usage_from() {
        let (storage, _temp_dir) = create_test_storage();

        for i in 0..5 {
            assert_eq!(storage.append_usage(&create_test_usage("org", i)).unwrap(), i as u64);
        }

        let loaded = storage.load_usage_from(2).unwrap();
        assert_eq!(loaded.len(), 3); // positions 2, 3, 4
        assert_eq!(loaded[0].processed_at, 2);
    }

    #[test]
    fn test_append_index_survives_reopen() {
        let (storage, temp_dir) = create_test_storage();
        storage.append_usage(&create_test_usage("org", 1)).unwrap();
        storage.append_usage(&create_test_usage("org", 2)).unwrap();

        let reopened = FileStorage::with_paths(
            temp_dir.path().join("usage.log"),
            temp_dir.path().join("snapshots"),
        );
        assert_eq!(reopened.append_usage(&create_test_usage("org", 3)).unwrap(), 2);
    }

    #[test]
    fn test_persist_and_load_snapshot() {
        let (storage, _temp_dir) = create_test_storage();

        let mut state = OrgState::new("org/with spaces");
        state.version = 1;
        state.processed_at = 42;
        state.seen_events.insert("abc".to_string(), 42);

        storage.persist_snapshot(&state, 0).unwrap();

        let loaded = storage.load_snapshot("org/with spaces").unwrap();
        assert_eq!(loaded, Some(state));
        assert_eq!(storage.organizations().unwrap(), vec!["org/with spaces".to_string()]);
    }

    #[test]
    fn test_persist_snapshot_conflict() {
        let (storage, _temp_dir) = create_test_storage();

        let mut state = OrgState::new("org");
        state.version = 1;
        storage.persist_snapshot(&state, 0).unwrap();

        // Another writer already moved past version 0
        let mut stale = OrgState::new("org");
        stale.version = 1;
        assert!(matches!(
            storage.persist_snapshot(&stale, 0),
            Err(Error::Conflict(_))
        ));

        state.version = 2;
        storage.persist_snapshot(&state, 1).unwrap();
        assert_eq!(storage.load_snapshot("org").unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_load_snapshot_none() {
        let (storage, _temp_dir) = create_test_storage();
        assert!(storage.load_snapshot("org").unwrap().is_none());
        assert!(storage.organizations().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_log_is_storage_error() {
        let (storage, temp_dir) = create_test_storage();
        storage.append_usage(&create_test_usage("org", 1)).unwrap();

        let path = temp_dir.path().join("usage.log");
        let mut data = fs::read(&path).unwrap();
        data.truncate(data.len() - 3);
        fs::write(&path, data).unwrap();

        assert!(matches!(storage.load_usage_from(0), Err(Error::Storage(_))));
    }
}
