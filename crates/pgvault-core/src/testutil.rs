//! In-memory store and scripted database fakes shared by unit and
//! integration tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::db::{backup_name_for, BackupStart, BackupStop, DatabaseApi};
use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;
use crate::storage::{ObjectInfo, ObjectStore};

/// In-memory object store. Each put stamps a strictly increasing
/// last-modified time so catalog ordering is deterministic.
pub struct MemoryStore {
    data: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    clock: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(0),
        }
    }

    /// Convenience alias so tests can seed blobs without importing the trait.
    pub fn put_blob(&self, key: &str, data: Vec<u8>) -> Result<()> {
        ObjectStore::put(self, key, data)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).map(|(data, _)| data.clone()))
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let time = DateTime::UNIX_EPOCH + chrono::Duration::seconds(tick);
        self.data.lock().unwrap().insert(key.to_string(), (data, time));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let map = self.data.lock().unwrap();
        let mut out: Vec<ObjectInfo> = map
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (_, time))| ObjectInfo {
                key: key.clone(),
                last_modified: *time,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

/// Wrapper injecting failures, for atomic-commit tests.
pub struct FailingStore<S> {
    inner: S,
    fail_puts: bool,
}

impl<S> FailingStore<S> {
    /// Every `put` fails; reads pass through.
    pub fn failing_puts(inner: S) -> Self {
        Self {
            inner,
            fail_puts: true,
        }
    }
}

impl<S: ObjectStore> ObjectStore for FailingStore<S> {
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        if self.fail_puts {
            return Err(PgVaultError::Other(format!(
                "injected put failure for '{key}'"
            )));
        }
        self.inner.put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix)
    }
}

/// Scripted database: each expected backup pops one start/stop pair.
pub struct ScriptedDb {
    starts: VecDeque<(Lsn, u32)>,
    stops: VecDeque<Lsn>,
    timeline_changes: bool,
}

impl ScriptedDb {
    pub fn new() -> Self {
        Self {
            starts: VecDeque::new(),
            stops: VecDeque::new(),
            timeline_changes: false,
        }
    }

    pub fn expect_backup(mut self, start_lsn: Lsn, finish_lsn: Lsn) -> Self {
        self.starts.push_back((start_lsn, 160002));
        self.stops.push_back(finish_lsn);
        self
    }

    pub fn with_timeline_change(mut self) -> Self {
        self.timeline_changes = true;
        self
    }
}

impl Default for ScriptedDb {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseApi for ScriptedDb {
    fn start_backup(&mut self, _label: &str) -> Result<BackupStart> {
        let (lsn, version) = self
            .starts
            .pop_front()
            .ok_or_else(|| PgVaultError::Database("no scripted backup start left".into()))?;
        Ok(BackupStart {
            name: backup_name_for(lsn),
            lsn,
            version,
        })
    }

    fn stop_backup(&mut self) -> Result<BackupStop> {
        let lsn = self
            .stops
            .pop_front()
            .ok_or_else(|| PgVaultError::Database("no scripted backup stop left".into()))?;
        Ok(BackupStop {
            lsn,
            backup_label: format!("STOP WAL LOCATION: {lsn}\n").into_bytes(),
            tablespace_map: Vec::new(),
        })
    }

    fn timeline_changed(&mut self) -> Result<bool> {
        Ok(self.timeline_changes)
    }
}

/// Lay out files under `dir`, creating parent directories as needed.
pub fn write_files(dir: &Path, files: &[(&str, &[u8])]) {
    for (rel, data) in files {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, data).unwrap();
    }
}
