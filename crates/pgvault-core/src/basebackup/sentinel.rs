use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::basebackup::sentinel_key;
use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;
use crate::storage::ObjectStore;

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Per-file record in a sentinel's file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescription {
    #[serde(rename = "MTime", default = "unix_epoch")]
    pub mtime: DateTime<Utc>,
    /// Unchanged since the parent backup; not uploaded in this backup.
    #[serde(rename = "IsSkipped", default)]
    pub is_skipped: bool,
    /// Only pages newer than the parent's start LSN were uploaded.
    #[serde(rename = "IsIncremented", default)]
    pub is_incremented: bool,
}

/// The per-backup manifest. Its presence in the store is the atomic marker
/// that the backup exists; it is written exactly once, after every tar part
/// upload has been acknowledged.
///
/// The four increment fields are all present or all absent. Unknown fields
/// from other tool versions are ignored on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSentinel {
    #[serde(rename = "LSN", skip_serializing_if = "Option::is_none")]
    pub lsn: Option<Lsn>,

    #[serde(rename = "FinishLSN", default, skip_serializing_if = "Option::is_none")]
    pub finish_lsn: Option<Lsn>,

    #[serde(rename = "PgVersion", default, skip_serializing_if = "Option::is_none")]
    pub pg_version: Option<u32>,

    #[serde(
        rename = "IncrementFromLSN",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_from_lsn: Option<Lsn>,

    #[serde(
        rename = "IncrementFrom",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_from: Option<String>,

    #[serde(
        rename = "IncrementFullName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_full_name: Option<String>,

    #[serde(
        rename = "IncrementCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_count: Option<u32>,

    #[serde(rename = "Files", default)]
    pub files: HashMap<String, FileDescription>,
}

impl BackupSentinel {
    /// True iff all four increment fields are present.
    pub fn is_incremental(&self) -> bool {
        self.increment_from.is_some()
            && self.increment_from_lsn.is_some()
            && self.increment_full_name.is_some()
            && self.increment_count.is_some()
    }

    /// A partially populated increment header means the chain metadata
    /// cannot be trusted.
    fn check_increment_fields(&self, backup_name: &str) -> Result<()> {
        let present = [
            self.increment_from.is_some(),
            self.increment_from_lsn.is_some(),
            self.increment_full_name.is_some(),
            self.increment_count.is_some(),
        ];
        if present.iter().any(|p| *p) && !present.iter().all(|p| *p) {
            return Err(PgVaultError::ChainIntegrity(format!(
                "sentinel of '{backup_name}' has a partial increment header"
            )));
        }
        Ok(())
    }
}

pub fn sentinel_exists(store: &dyn ObjectStore, backup_name: &str) -> Result<bool> {
    store.exists(&sentinel_key(backup_name))
}

/// Read and validate a backup's sentinel. A missing sentinel means the
/// backup does not exist, whatever else may sit under its prefix.
pub fn fetch_sentinel(store: &dyn ObjectStore, backup_name: &str) -> Result<BackupSentinel> {
    let key = sentinel_key(backup_name);
    let raw = store
        .get(&key)?
        .ok_or_else(|| PgVaultError::BackupNotFound(backup_name.to_string()))?;
    let sentinel: BackupSentinel = serde_json::from_slice(&raw)?;
    sentinel.check_increment_fields(backup_name)?;
    Ok(sentinel)
}

/// Commit a completed backup. This is the push's single atomic commit point:
/// callers must not invoke it before every upload has succeeded.
pub fn write_sentinel(
    store: &dyn ObjectStore,
    backup_name: &str,
    sentinel: &BackupSentinel,
) -> Result<()> {
    let body = serde_json::to_vec_pretty(sentinel)?;
    store.put(&sentinel_key(backup_name), body)
}
