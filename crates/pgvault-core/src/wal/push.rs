use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::compress::{self, Codec};
use crate::crypto::Crypter;
use crate::error::{PgVaultError, Result};
use crate::storage::ObjectStore;
use crate::wal::{is_segment_name, segment_key};

/// Upper bound on sibling segments shipped per invocation; anything beyond
/// is picked up by later archive calls.
const MAX_BACKGROUND_UPLOADS: usize = 32;

/// Upload a just-closed WAL segment.
///
/// A background uploader opportunistically ships sibling segments whose
/// `archive_status/*.ready` markers are present while the foreground upload
/// runs. Its queue is drained before this function returns, so background
/// completion happens-after the foreground segment is durable.
pub fn push_wal_segment(
    store: &Arc<dyn ObjectStore>,
    crypter: &Arc<dyn Crypter>,
    segment_path: &Path,
    concurrency: usize,
) -> Result<()> {
    let wal_dir = segment_path
        .parent()
        .ok_or_else(|| PgVaultError::Config("segment path has no parent directory".into()))?;
    let foreground = segment_file_name(segment_path)?;

    let background = BgUploader::start(
        Arc::clone(store),
        Arc::clone(crypter),
        wal_dir.to_path_buf(),
        foreground,
        concurrency.saturating_sub(1),
    );

    let result = upload_segment_file(store.as_ref(), crypter.as_ref(), segment_path);
    background.stop();
    result
}

fn segment_file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| PgVaultError::Config(format!("invalid segment path '{}'", path.display())))
}

/// Compress, encrypt and upload one segment file from disk.
pub(crate) fn upload_segment_file(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    path: &Path,
) -> Result<()> {
    let name = segment_file_name(path)?;
    let data = fs::read(path)?;
    let sealed = compress::seal(Codec::Lz4, crypter, &data)?;
    store.put(&segment_key(&name, Codec::Lz4.suffix()), sealed)?;
    info!(segment = %name, "uploaded WAL segment");
    Ok(())
}

/// Background uploader for closed sibling segments.
struct BgUploader {
    handles: Vec<JoinHandle<()>>,
}

impl BgUploader {
    fn start(
        store: Arc<dyn ObjectStore>,
        crypter: Arc<dyn Crypter>,
        wal_dir: PathBuf,
        exclude: String,
        workers: usize,
    ) -> BgUploader {
        if workers == 0 {
            return BgUploader {
                handles: Vec::new(),
            };
        }

        let (tx, rx) = crossbeam_channel::bounded::<PathBuf>(workers * 2);
        let mut handles = Vec::with_capacity(workers + 1);

        // Scanner: enumerate ready markers once, in name order.
        {
            let wal_dir = wal_dir.clone();
            handles.push(std::thread::spawn(move || {
                let status_dir = wal_dir.join("archive_status");
                let entries = match fs::read_dir(&status_dir) {
                    Ok(entries) => entries,
                    Err(_) => return,
                };
                let mut names: Vec<String> = entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .collect();
                names.sort();
                let mut queued = 0;
                for marker in names {
                    let Some(segment) = marker.strip_suffix(".ready") else {
                        continue;
                    };
                    if segment == exclude || !is_segment_name(segment) {
                        continue;
                    }
                    if queued >= MAX_BACKGROUND_UPLOADS
                        || tx.send(wal_dir.join(segment)).is_err()
                    {
                        break;
                    }
                    queued += 1;
                }
            }));
        }

        for _ in 0..workers {
            let store = Arc::clone(&store);
            let crypter = Arc::clone(&crypter);
            let rx = rx.clone();
            handles.push(std::thread::spawn(move || {
                while let Ok(path) = rx.recv() {
                    match upload_segment_file(store.as_ref(), crypter.as_ref(), &path) {
                        Ok(()) => mark_done(&path),
                        Err(e) => {
                            // Best effort: the archiver will hand this
                            // segment to the foreground eventually.
                            warn!(path = %path.display(), error = %e, "background upload failed");
                        }
                    }
                }
            }));
        }

        BgUploader { handles }
    }

    /// Stop accepting work and wait for the queued uploads to drain.
    fn stop(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Flip the segment's archive marker from `.ready` to `.done`.
fn mark_done(segment_path: &Path) {
    let Some(dir) = segment_path.parent() else {
        return;
    };
    let Some(name) = segment_path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let status_dir = dir.join("archive_status");
    let from = status_dir.join(format!("{name}.ready"));
    let to = status_dir.join(format!("{name}.done"));
    if let Err(e) = fs::rename(&from, &to) {
        debug!(segment = name, error = %e, "could not mark segment done");
    }
}
