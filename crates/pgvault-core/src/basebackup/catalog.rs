use chrono::{DateTime, Utc};
use tracing::info;

use crate::basebackup::sentinel::fetch_sentinel;
use crate::basebackup::{sentinel_key, wal_segment_of_backup_name, BASE_BACKUP_PREFIX, SENTINEL_SUFFIX};
use crate::error::{PgVaultError, Result};
use crate::storage::ObjectStore;

/// One row of the backup catalog.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub name: String,
    /// Sentinel mtime, i.e. when the backup committed.
    pub time: DateTime<Utc>,
    pub wal_segment_start: String,
}

/// Enumerate completed backups, oldest first.
///
/// Only sentinel presence makes a backup exist: tar parts without a sentinel
/// (a failed or abandoned push) are invisible here.
pub fn list_backups(store: &dyn ObjectStore) -> Result<Vec<BackupEntry>> {
    let prefix = format!("{BASE_BACKUP_PREFIX}/");
    let mut entries = Vec::new();
    for obj in store.list(&prefix)? {
        let Some(name) = obj
            .key
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(SENTINEL_SUFFIX))
        else {
            continue;
        };
        // Sentinels sit directly under the prefix; anything deeper is a part.
        if name.contains('/') {
            continue;
        }
        entries.push(BackupEntry {
            name: name.to_string(),
            time: obj.last_modified,
            wal_segment_start: wal_segment_of_backup_name(name).unwrap_or_default().to_string(),
        });
    }
    entries.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

/// Name of the most recent completed backup.
pub fn get_latest(store: &dyn ObjectStore) -> Result<String> {
    list_backups(store)?
        .pop()
        .map(|entry| entry.name)
        .ok_or(PgVaultError::NoBackups)
}

/// Delete every backup strictly older than `target`.
///
/// If `target` is incremental, `find_full` moves the boundary back to its
/// chain's full ancestor so no surviving backup loses an ancestor; without
/// `find_full` the call is refused. Returns the deleted (or would-be
/// deleted, under `dry_run`) names, oldest first.
pub fn delete_before_name(
    store: &dyn ObjectStore,
    target: &str,
    find_full: bool,
    dry_run: bool,
) -> Result<Vec<String>> {
    let backups = list_backups(store)?;
    delete_before_in(store, &backups, target, find_full, dry_run)
}

/// Delete backups older than `cutoff`. The newest backup older than the
/// cutoff becomes the boundary and itself survives, so a restore point
/// before the cutoff always remains.
pub fn delete_before_time(
    store: &dyn ObjectStore,
    cutoff: DateTime<Utc>,
    find_full: bool,
    dry_run: bool,
) -> Result<Vec<String>> {
    let backups = list_backups(store)?;
    let target = backups.iter().rev().find(|b| b.time < cutoff);
    match target {
        Some(entry) => {
            let name = entry.name.clone();
            delete_before_in(store, &backups, &name, find_full, dry_run)
        }
        None => {
            info!(%cutoff, "no backups before cutoff");
            Ok(Vec::new())
        }
    }
}

/// Keep the `count` most recent backups (or, with `after_full`, enough
/// backups to preserve `count` full ancestries) and delete the rest.
pub fn retain(
    store: &dyn ObjectStore,
    count: usize,
    after_full: bool,
    find_full: bool,
    dry_run: bool,
) -> Result<Vec<String>> {
    if count == 0 {
        return Err(PgVaultError::Config("retain count must be positive".into()));
    }
    let backups = list_backups(store)?;
    if backups.len() <= count {
        info!(have = backups.len(), want = count, "have no more backups than the retain count");
        return Ok(Vec::new());
    }

    if after_full {
        let mut left = count;
        for entry in backups.iter().rev() {
            if left == 1 {
                return delete_before_in(store, &backups, &entry.name, true, dry_run);
            }
            let sentinel = fetch_sentinel(store, &entry.name)?;
            if !sentinel.is_incremental() {
                left -= 1;
            }
        }
        info!(want = count, "scanned all backups but found fewer full ones");
        Ok(Vec::new())
    } else {
        let target = backups[backups.len() - count].name.clone();
        delete_before_in(store, &backups, &target, find_full, dry_run)
    }
}

fn delete_before_in(
    store: &dyn ObjectStore,
    backups: &[BackupEntry],
    target: &str,
    find_full: bool,
    dry_run: bool,
) -> Result<Vec<String>> {
    let mut boundary = target.to_string();
    let sentinel = fetch_sentinel(store, &boundary)?;
    if sentinel.is_incremental() {
        if !find_full {
            return Err(PgVaultError::ProtectedBackup(boundary));
        }
        boundary = sentinel
            .increment_full_name
            .clone()
            .expect("incremental sentinel carries its full ancestor");
        let full = fetch_sentinel(store, &boundary)?;
        if full.is_incremental() {
            return Err(PgVaultError::ChainIntegrity(format!(
                "full ancestor '{boundary}' of '{target}' is itself incremental"
            )));
        }
    }

    let boundary_index = backups
        .iter()
        .position(|b| b.name == boundary)
        .ok_or_else(|| PgVaultError::BackupNotFound(boundary.clone()))?;

    let doomed: Vec<String> = backups[..boundary_index]
        .iter()
        .map(|b| b.name.clone())
        .collect();
    if doomed.is_empty() {
        info!(%boundary, "nothing to delete before boundary");
        return Ok(doomed);
    }

    for name in &doomed {
        if dry_run {
            info!(backup = %name, "would delete");
        } else {
            delete_backup(store, name)?;
        }
    }
    Ok(doomed)
}

/// Remove one backup: the sentinel first, so the backup disappears from
/// listings before its data goes, then everything under its prefix.
fn delete_backup(store: &dyn ObjectStore, name: &str) -> Result<()> {
    store.delete(&sentinel_key(name))?;
    for obj in store.list(&format!("{BASE_BACKUP_PREFIX}/{name}/"))? {
        store.delete(&obj.key)?;
    }
    info!(backup = %name, "deleted backup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basebackup::sentinel::{write_sentinel, BackupSentinel};
    use crate::lsn::Lsn;
    use crate::testutil::MemoryStore;

    /// Record a completed backup with one fake tar part.
    fn seed_backup(store: &MemoryStore, name: &str, parent: Option<(&str, &str)>) {
        let sentinel = match parent {
            None => BackupSentinel {
                lsn: Some(Lsn(0x10)),
                ..Default::default()
            },
            Some((from, full)) => BackupSentinel {
                lsn: Some(Lsn(0x20)),
                increment_from: Some(from.to_string()),
                increment_from_lsn: Some(Lsn(0x10)),
                increment_full_name: Some(full.to_string()),
                increment_count: Some(1),
                ..Default::default()
            },
        };
        store
            .put_blob(
                &crate::basebackup::tar_part_key(name, "0.tar.lz4"),
                vec![0],
            )
            .unwrap();
        write_sentinel(store, name, &sentinel).unwrap();
    }

    #[test]
    fn listing_orders_by_time_and_ignores_partless_noise() {
        let store = MemoryStore::new();
        seed_backup(&store, "base_10_000000010000000000000001", None);
        seed_backup(&store, "base_20_000000010000000000000002", None);
        // Tar parts without a sentinel are not a backup.
        store
            .put_blob(
                &crate::basebackup::tar_part_key("base_99_000000010000000000000009", "0.tar.lz4"),
                vec![0],
            )
            .unwrap();

        let rows = list_backups(&store).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "base_10_000000010000000000000001",
                "base_20_000000010000000000000002"
            ]
        );
        assert_eq!(rows[0].wal_segment_start, "000000010000000000000001");
    }

    #[test]
    fn get_latest_returns_newest_or_typed_error() {
        let store = MemoryStore::new();
        assert!(matches!(get_latest(&store), Err(PgVaultError::NoBackups)));
        seed_backup(&store, "base_10_000000010000000000000001", None);
        seed_backup(&store, "base_20_000000010000000000000002", None);
        assert_eq!(
            get_latest(&store).unwrap(),
            "base_20_000000010000000000000002"
        );
    }

    #[test]
    fn delete_before_full_target_removes_older_chain() {
        let store = MemoryStore::new();
        let b0 = "base_10_000000010000000000000001";
        let b1 = "base_20_000000010000000000000002_D_000000010000000000000001";
        let b2 = "base_30_000000010000000000000003";
        let b3 = "base_40_000000010000000000000004_D_000000010000000000000003";
        seed_backup(&store, b0, None);
        seed_backup(&store, b1, Some((b0, b0)));
        seed_backup(&store, b2, None);
        seed_backup(&store, b3, Some((b2, b2)));

        let deleted = delete_before_name(&store, b2, true, false).unwrap();
        assert_eq!(deleted, vec![b0.to_string(), b1.to_string()]);

        let survivors: Vec<String> = list_backups(&store).unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(survivors, vec![b2.to_string(), b3.to_string()]);
        // Deleted backups lose their tar parts too.
        assert!(store
            .list(&format!("{BASE_BACKUP_PREFIX}/{b0}/"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_before_incremental_without_find_full_is_refused() {
        let store = MemoryStore::new();
        let b0 = "base_10_000000010000000000000001";
        let b1 = "base_20_000000010000000000000002_D_000000010000000000000001";
        seed_backup(&store, b0, None);
        seed_backup(&store, b1, Some((b0, b0)));

        let err = delete_before_name(&store, b1, false, false).unwrap_err();
        assert!(matches!(err, PgVaultError::ProtectedBackup(_)));
        assert_eq!(list_backups(&store).unwrap().len(), 2);
    }

    #[test]
    fn delete_before_incremental_with_find_full_keeps_its_chain() {
        let store = MemoryStore::new();
        let b0 = "base_10_000000010000000000000001";
        let b1 = "base_20_000000010000000000000002_D_000000010000000000000001";
        seed_backup(&store, b0, None);
        seed_backup(&store, b1, Some((b0, b0)));

        // The boundary walks back to b0, so nothing is older than it.
        let deleted = delete_before_name(&store, b1, true, false).unwrap();
        assert!(deleted.is_empty());
        assert_eq!(list_backups(&store).unwrap().len(), 2);
    }

    #[test]
    fn delete_before_time_keeps_the_newest_backup_older_than_cutoff() {
        let store = MemoryStore::new();
        let b0 = "base_10_000000010000000000000001";
        let b1 = "base_20_000000010000000000000002";
        seed_backup(&store, b0, None);
        seed_backup(&store, b1, None);
        let times: Vec<DateTime<Utc>> =
            list_backups(&store).unwrap().into_iter().map(|b| b.time).collect();

        // Cutoff between the two: b0 becomes the boundary and survives.
        let cutoff = times[0] + chrono::Duration::milliseconds(500);
        assert!(delete_before_time(&store, cutoff, false, false)
            .unwrap()
            .is_empty());

        // Cutoff after both: b1 is the boundary, b0 goes.
        let cutoff = times[1] + chrono::Duration::milliseconds(500);
        let deleted = delete_before_time(&store, cutoff, false, false).unwrap();
        assert_eq!(deleted, vec![b0.to_string()]);

        // Cutoff before everything: nothing qualifies as a boundary.
        let early = DateTime::UNIX_EPOCH;
        assert!(delete_before_time(&store, early, false, false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn dry_run_plans_without_mutating() {
        let store = MemoryStore::new();
        let b0 = "base_10_000000010000000000000001";
        let b1 = "base_20_000000010000000000000002";
        seed_backup(&store, b0, None);
        seed_backup(&store, b1, None);

        let planned = delete_before_name(&store, b1, false, true).unwrap();
        assert_eq!(planned, vec![b0.to_string()]);
        assert_eq!(list_backups(&store).unwrap().len(), 2);
    }

    #[test]
    fn retain_keeps_the_newest_n() {
        let store = MemoryStore::new();
        let names = [
            "base_10_000000010000000000000001",
            "base_20_000000010000000000000002",
            "base_30_000000010000000000000003",
        ];
        for name in names {
            seed_backup(&store, name, None);
        }

        let deleted = retain(&store, 2, false, false, false).unwrap();
        assert_eq!(deleted, vec![names[0].to_string()]);
        assert_eq!(list_backups(&store).unwrap().len(), 2);
    }

    #[test]
    fn retain_short_circuits_when_catalog_is_small() {
        let store = MemoryStore::new();
        seed_backup(&store, "base_10_000000010000000000000001", None);
        let deleted = retain(&store, 5, false, false, false).unwrap();
        assert!(deleted.is_empty());
    }

    #[test]
    fn retain_after_full_counts_full_ancestries() {
        let store = MemoryStore::new();
        let f1 = "base_10_000000010000000000000001";
        let d1 = "base_20_000000010000000000000002_D_000000010000000000000001";
        let f2 = "base_30_000000010000000000000003";
        let d2 = "base_40_000000010000000000000004_D_000000010000000000000003";
        let f3 = "base_50_000000010000000000000005";
        seed_backup(&store, f1, None);
        seed_backup(&store, d1, Some((f1, f1)));
        seed_backup(&store, f2, None);
        seed_backup(&store, d2, Some((f2, f2)));
        seed_backup(&store, f3, None);

        let deleted = retain(&store, 2, true, false, false).unwrap();
        assert_eq!(deleted, vec![f1.to_string(), d1.to_string()]);

        let survivors: Vec<String> = list_backups(&store).unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(survivors, vec![f2.to_string(), d2.to_string(), f3.to_string()]);
    }

    #[test]
    fn survivors_remain_closed_under_increment_from() {
        // Retention safety over a mixed catalog: after any delete, no
        // surviving incremental references a deleted ancestor.
        let store = MemoryStore::new();
        let f1 = "base_10_000000010000000000000001";
        let d1 = "base_20_000000010000000000000002_D_000000010000000000000001";
        let f2 = "base_30_000000010000000000000003";
        let d2 = "base_40_000000010000000000000004_D_000000010000000000000003";
        seed_backup(&store, f1, None);
        seed_backup(&store, d1, Some((f1, f1)));
        seed_backup(&store, f2, None);
        seed_backup(&store, d2, Some((f2, f2)));

        delete_before_name(&store, d2, true, false).unwrap();

        let survivors: Vec<String> = list_backups(&store).unwrap().into_iter().map(|b| b.name).collect();
        for name in &survivors {
            let sentinel = fetch_sentinel(&store, name).unwrap();
            if let Some(parent) = sentinel.increment_from {
                assert!(
                    survivors.contains(&parent),
                    "survivor {name} references deleted parent {parent}"
                );
            }
        }
    }
}
