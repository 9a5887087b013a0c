use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::basebackup::bundle::Bundle;
use crate::basebackup::catalog::get_latest;
use crate::basebackup::sentinel::{fetch_sentinel, write_sentinel, BackupSentinel};
use crate::basebackup::wal_segment_of_backup_name;
use crate::config::{DeltaOrigin, Settings};
use crate::crypto::Crypter;
use crate::db::DatabaseApi;
use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;
use crate::storage::ObjectStore;
use crate::walk::{self, resolve_symlink};

/// How a push ended.
#[derive(Debug)]
pub enum PushOutcome {
    Completed {
        name: String,
        lsn: Lsn,
    },
    /// The timeline changed between backup start and stop. No sentinel was
    /// written; the uploaded parts stay invisible to listings until
    /// retention reclaims the name prefix.
    AbandonedTimelineChange,
}

/// Parent selection for an incremental backup.
struct DeltaPlan {
    parent_name: Option<String>,
    parent: BackupSentinel,
    increment_count: u32,
}

impl DeltaPlan {
    fn full() -> DeltaPlan {
        DeltaPlan {
            parent_name: None,
            parent: BackupSentinel::default(),
            increment_count: 1,
        }
    }
}

fn plan_delta(store: &dyn ObjectStore, settings: &Settings) -> Result<DeltaPlan> {
    if settings.max_deltas == 0 {
        return Ok(DeltaPlan::full());
    }
    let latest = match get_latest(store) {
        Ok(latest) => latest,
        Err(PgVaultError::NoBackups) => return Ok(DeltaPlan::full()),
        Err(e) => return Err(e),
    };
    let latest_sentinel = fetch_sentinel(store, &latest)?;

    if latest_sentinel.increment_count.unwrap_or(0) + 1 > settings.max_deltas {
        info!("reached max delta steps; doing a full backup");
        return Ok(DeltaPlan::full());
    }
    if latest_sentinel.lsn.is_none() {
        info!("latest backup was made without delta support; doing a full backup with an LSN marker for future deltas");
        return Ok(DeltaPlan::full());
    }

    match settings.delta_origin {
        DeltaOrigin::LatestFull if latest_sentinel.is_incremental() => {
            let full_name = latest_sentinel
                .increment_full_name
                .clone()
                .expect("incremental sentinel names its full ancestor");
            info!(parent = %full_name, "delta will be made from the chain's full backup");
            Ok(DeltaPlan {
                parent: fetch_sentinel(store, &full_name)?,
                parent_name: Some(full_name),
                increment_count: 1,
            })
        }
        _ => Ok(DeltaPlan {
            increment_count: latest_sentinel.increment_count.unwrap_or(0) + 1,
            parent: latest_sentinel,
            parent_name: Some(latest),
        }),
    }
}

/// Run a base-backup push: decide full vs delta, bundle the data directory
/// into tar parts, finalize the database protocol, and commit the sentinel.
///
/// The sentinel write is the single atomic commit point: every part upload,
/// `pg_control` included, happens-before it, and any failure along the way
/// leaves no durable record of the backup.
pub fn push_backup(
    store: &Arc<dyn ObjectStore>,
    crypter: &Arc<dyn Crypter>,
    db: &mut dyn DatabaseApi,
    data_dir: &Path,
    settings: &Settings,
) -> Result<PushOutcome> {
    let data_dir = resolve_symlink(data_dir);
    let plan = plan_delta(store.as_ref(), settings)?;

    let start = db.start_backup(&format!("pgvault {}", Utc::now().to_rfc3339()))?;
    let name = match &plan.parent_name {
        Some(parent_name) => {
            let parent_segment = wal_segment_of_backup_name(parent_name).ok_or_else(|| {
                PgVaultError::ChainIntegrity(format!(
                    "parent backup name '{parent_name}' carries no WAL segment"
                ))
            })?;
            let name = format!("{}_D_{parent_segment}", start.name);
            info!(
                backup = %name,
                parent = %parent_name,
                from_lsn = %plan.parent.lsn.unwrap_or_default(),
                "starting delta backup"
            );
            name
        }
        None => {
            info!(backup = %start.name, "starting full backup");
            start.name.clone()
        }
    };

    let mut bundle = Bundle::new(
        Arc::clone(store),
        Arc::clone(crypter),
        name.clone(),
        data_dir.clone(),
        plan.parent_name.as_ref().and(plan.parent.lsn),
        plan.parent.files.clone(),
    )
    .with_min_part_size(settings.tar_size_threshold);

    bundle.start_queue(settings.upload_concurrency);
    walk::walk(&data_dir, |path, metadata| bundle.visit(path, metadata))?;
    bundle.finish_queue()?;
    bundle.upload_pg_control()?;

    let stop = db.stop_backup()?;
    bundle.upload_label_files(&stop.backup_label, &stop.tablespace_map)?;

    if db.timeline_changed()? {
        warn!(backup = %name, "timeline changed during the backup; abandoning it");
        return Ok(PushOutcome::AbandonedTimelineChange);
    }

    let mut sentinel = BackupSentinel {
        lsn: Some(start.lsn),
        finish_lsn: Some(stop.lsn),
        pg_version: Some(start.version),
        files: bundle.take_files(),
        ..Default::default()
    };
    if let Some(parent_name) = plan.parent_name {
        sentinel.increment_from_lsn = plan.parent.lsn;
        sentinel.increment_full_name = Some(if plan.parent.is_incremental() {
            plan.parent
                .increment_full_name
                .clone()
                .expect("incremental sentinel names its full ancestor")
        } else {
            parent_name.clone()
        });
        sentinel.increment_from = Some(parent_name);
        sentinel.increment_count = Some(plan.increment_count);
    }

    write_sentinel(store.as_ref(), &name, &sentinel)?;
    info!(backup = %name, lsn = %start.lsn, "backup complete");
    Ok(PushOutcome::Completed {
        name,
        lsn: start.lsn,
    })
}
