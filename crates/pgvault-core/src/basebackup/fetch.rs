use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::basebackup::catalog::get_latest;
use crate::basebackup::extract::extract_parts;
use crate::basebackup::sentinel::{fetch_sentinel, sentinel_exists, BackupSentinel};
use crate::basebackup::{
    backup_name_is_modern, is_pg_control_key, tar_part_key, tar_partitions_prefix,
    INCREMENT_BASE_DIR,
};
use crate::crypto::Crypter;
use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;
use crate::storage::ObjectStore;
use crate::walk::resolve_symlink;

/// Restore a base backup (or `LATEST`) into `target_dir`, replaying its
/// delta chain top-down. Returns the backup's start LSN, the point from
/// which WAL replay must continue.
pub fn fetch_backup(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    backup_name: &str,
    target_dir: &Path,
    workers: usize,
) -> Result<Lsn> {
    fs::create_dir_all(target_dir)?;
    let target = resolve_symlink(target_dir);

    let name = if backup_name == "LATEST" {
        let resolved = get_latest(store)?;
        info!(backup = %resolved, "resolved LATEST");
        resolved
    } else {
        if !sentinel_exists(store, backup_name)? {
            return Err(PgVaultError::BackupNotFound(backup_name.to_string()));
        }
        backup_name.to_string()
    };

    validate_chain(store, &name)?;
    let lsn = fetch_into(store, crypter, &name, &target, workers.max(1))?;
    info!(backup = %name, %lsn, "backup extraction complete");
    Ok(lsn)
}

/// Walk the increment chain before touching the filesystem: every ancestor
/// must exist, the chain must terminate at the declared full backup, and in
/// exactly the declared number of steps (which also rules out cycles).
fn validate_chain(store: &dyn ObjectStore, name: &str) -> Result<()> {
    let top = fetch_sentinel(store, name)?;
    if !top.is_incremental() {
        return Ok(());
    }
    let expected = top.increment_count.expect("incremental sentinel has a count");
    let full_name = top
        .increment_full_name
        .clone()
        .expect("incremental sentinel names its full ancestor");
    let mut current = top
        .increment_from
        .clone()
        .expect("incremental sentinel names its parent");
    let mut steps = 1u32;

    loop {
        let sentinel = fetch_sentinel(store, &current).map_err(|e| match e {
            PgVaultError::BackupNotFound(missing) => PgVaultError::ChainIntegrity(format!(
                "ancestor '{missing}' of '{name}' is missing"
            )),
            other => other,
        })?;
        if !sentinel.is_incremental() {
            if steps != expected {
                return Err(PgVaultError::ChainIntegrity(format!(
                    "chain of '{name}' reaches full backup '{current}' in {steps} steps, sentinel declares {expected}"
                )));
            }
            if current != full_name {
                return Err(PgVaultError::ChainIntegrity(format!(
                    "chain of '{name}' terminates at '{current}' but its sentinel claims '{full_name}'"
                )));
            }
            return Ok(());
        }
        steps += 1;
        if steps > expected {
            return Err(PgVaultError::ChainIntegrity(format!(
                "chain of '{name}' does not terminate within its declared {expected} steps"
            )));
        }
        current = sentinel
            .increment_from
            .clone()
            .expect("incremental sentinel names its parent");
    }
}

fn fetch_into(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    name: &str,
    target: &Path,
    workers: usize,
) -> Result<Lsn> {
    let sentinel = fetch_sentinel(store, name)?;
    if let Some(parent) = sentinel.increment_from.clone() {
        info!(
            backup = %name,
            %parent,
            from_lsn = %sentinel.increment_from_lsn.unwrap_or_default(),
            "delta backup; materializing parent first"
        );
        fetch_into(store, crypter, &parent, target, workers)?;
    }
    unwrap_backup(store, crypter, name, &sentinel, target, workers)?;
    Ok(sentinel.lsn.unwrap_or_default())
}

/// Replay one backup's tar parts over the target directory.
fn unwrap_backup(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    name: &str,
    sentinel: &BackupSentinel,
    target: &Path,
    workers: usize,
) -> Result<()> {
    let increment_base = target.join(INCREMENT_BASE_DIR);

    if !sentinel.is_incremental() {
        ensure_empty(target)?;
    } else {
        // Park the parent's materialized state out of the way, then bring
        // back the files this backup recorded as unchanged.
        fs::create_dir_all(&increment_base)?;
        for entry in fs::read_dir(target)? {
            let entry = entry?;
            if entry.file_name() == INCREMENT_BASE_DIR {
                continue;
            }
            fs::rename(entry.path(), increment_base.join(entry.file_name()))?;
        }
        for (file, description) in &sentinel.files {
            if !description.is_skipped {
                continue;
            }
            debug!(file, "reinstating unchanged file from parent state");
            move_file_creating_dirs(&increment_base.join(file), &target.join(file)).map_err(
                |e| {
                    PgVaultError::ChainIntegrity(format!(
                        "failed to reinstate skipped file '{file}' of '{name}': {e}"
                    ))
                },
            )?;
        }
    }

    let result = extract_backup_parts(store, crypter, name, sentinel, target, &increment_base, workers);
    if sentinel.is_incremental() {
        // The staging directory is scratch space; release it on every path.
        let _ = fs::remove_dir_all(&increment_base);
    }
    result
}

fn extract_backup_parts(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    name: &str,
    sentinel: &BackupSentinel,
    target: &Path,
    increment_base: &Path,
    workers: usize,
) -> Result<()> {
    let keys: Vec<String> = store
        .list(&tar_partitions_prefix(name))?
        .into_iter()
        .map(|o| o.key)
        .filter(|key| !is_pg_control_key(key))
        .collect();
    extract_parts(store, crypter, &keys, target, sentinel, increment_base, workers)?;

    // pg_control comes last, so an interrupted restore never looks like a
    // complete data directory. Its part must exist for incremental and
    // legacy-named backups; legacy full backups may embed it in the main
    // parts instead.
    let key = tar_part_key(name, "pg_control.tar.lz4");
    if store.exists(&key)? {
        extract_parts(store, crypter, &[key], target, sentinel, increment_base, 1)?;
    } else if !backup_name_is_modern(name) || sentinel.is_incremental() {
        return Err(PgVaultError::Corrupt(format!(
            "corrupt backup: missing pg_control in '{name}'"
        )));
    }
    Ok(())
}

fn ensure_empty(target: &Path) -> Result<()> {
    if fs::read_dir(target)?.next().is_some() {
        return Err(PgVaultError::TargetDirNotEmpty(
            target.to_string_lossy().to_string(),
        ));
    }
    Ok(())
}

fn move_file_creating_dirs(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}
