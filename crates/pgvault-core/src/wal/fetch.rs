use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::compress::{self, Codec};
use crate::crypto::Crypter;
use crate::error::{PgVaultError, Result};
use crate::storage::ObjectStore;
use crate::wal::{segment_key, WAL_MAGIC_MIN, WAL_SEGMENT_SIZE};

/// Poll granularity while watching an in-progress prefetch download.
pub const PREFETCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cache paths for one segment on a restore host.
pub struct PrefetchLocations {
    pub prefetch_dir: PathBuf,
    pub running_dir: PathBuf,
    /// Completed download, ready to be renamed into place.
    pub prefetched: PathBuf,
    /// In-progress download owned by a prefetcher process.
    pub running: PathBuf,
}

pub fn prefetch_locations(dir: &Path, segment: &str) -> PrefetchLocations {
    let prefetch_dir = dir.join(".wal-g").join("prefetch");
    let running_dir = prefetch_dir.join("running");
    PrefetchLocations {
        prefetched: prefetch_dir.join(segment),
        running: running_dir.join(segment),
        prefetch_dir,
        running_dir,
    }
}

/// Serve one WAL segment to `destination`, consulting the shared prefetch
/// cache first and falling back to a direct download.
///
/// With `trigger_prefetch` set, a background prefetcher for the following
/// segments is scheduled on exit, success or failure.
pub fn fetch_wal_segment(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    segment: &str,
    destination: &Path,
    trigger_prefetch: bool,
) -> Result<()> {
    let destination = resolve_destination(destination);
    let result = fetch_via_cache(store, crypter, segment, &destination);
    if trigger_prefetch {
        super::prefetch::spawn_prefetch_process(segment, &destination);
    }
    result
}

/// Resolve the destination's parent through symlinks once; the file itself
/// usually does not exist yet.
fn resolve_destination(destination: &Path) -> PathBuf {
    match destination.parent() {
        Some(parent) if parent.as_os_str().is_empty() => destination.to_path_buf(),
        Some(parent) => {
            let resolved = crate::walk::resolve_symlink(parent);
            match destination.file_name() {
                Some(name) => resolved.join(name),
                None => destination.to_path_buf(),
            }
        }
        None => destination.to_path_buf(),
    }
}

fn fetch_via_cache(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    segment: &str,
    destination: &Path,
) -> Result<()> {
    let dir = destination.parent().unwrap_or(Path::new("."));
    let locations = prefetch_locations(dir, segment);

    let mut seen_size: Option<u64> = None;
    let mut stale_cleanup = false;

    loop {
        match fs::metadata(&locations.prefetched) {
            Ok(meta) => {
                if meta.len() != WAL_SEGMENT_SIZE {
                    warn!(
                        size = meta.len(),
                        segment, "prefetched file has wrong size; discarding"
                    );
                    let _ = fs::remove_file(&locations.prefetched);
                    break;
                }
                match fs::rename(&locations.prefetched, destination) {
                    Ok(()) => {}
                    // Lost a race with another consumer; look again.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
                match crate::wal::check_wal_magic(destination) {
                    Ok(()) => {
                        debug!(segment, "served WAL segment from prefetch cache");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(segment, error = %e, "prefetched file contains errors");
                        let _ = fs::remove_file(destination);
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // A prefetcher may commit (rename) between the check above and this
        // stat; that is fine, the next iteration sees the committed file.
        match fs::metadata(&locations.running) {
            Ok(meta) => {
                let observed = meta.len();
                if seen_size.is_some_and(|seen| observed <= seen) {
                    // No growth across two polls: the prefetcher is stuck or
                    // dead. Clean up its leavings and download directly.
                    stale_cleanup = true;
                    break;
                }
                seen_size = Some(observed);
            }
            // Normal startup path: nothing prefetched, nothing running.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(_) => break,
        }
        thread::sleep(PREFETCH_POLL_INTERVAL);
    }

    if stale_cleanup {
        let _ = fs::remove_file(&locations.running);
        let _ = fs::remove_file(&locations.prefetched);
    }

    download_segment(store, crypter, segment, destination)
}

/// Download a segment directly from the archive, probing the legacy `.lzo`
/// key before the current `.lz4` one.
pub(crate) fn download_segment(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    segment: &str,
    destination: &Path,
) -> Result<()> {
    for codec in [Codec::Lzo, Codec::Lz4] {
        let key = segment_key(segment, codec.suffix());
        if !store.exists(&key)? {
            continue;
        }
        let Some(blob) = store.get(&key)? else {
            // Deleted between probe and read; try the next key.
            continue;
        };
        let data = compress::open(codec, crypter, blob)?;
        if data.len() as u64 != WAL_SEGMENT_SIZE {
            return Err(PgVaultError::Corrupt(format!(
                "WAL segment '{segment}' has wrong size {} after decode",
                data.len()
            )));
        }
        if u32::from_le_bytes(data[0..4].try_into().unwrap()) < WAL_MAGIC_MIN {
            return Err(PgVaultError::Corrupt(format!(
                "WAL segment '{segment}' has invalid magic"
            )));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::write(destination, &data) {
            let _ = fs::remove_file(destination);
            return Err(e.into());
        }
        info!(segment, "downloaded WAL segment");
        return Ok(());
    }
    Err(PgVaultError::WalSegmentNotFound(segment.to_string()))
}
