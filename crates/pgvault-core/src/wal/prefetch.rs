use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use crate::crypto::Crypter;
use crate::error::Result;
use crate::storage::ObjectStore;
use crate::wal::fetch::{download_segment, prefetch_locations};
use crate::wal::successor_names;

/// Download the segments following `segment` into the prefetch cache next to
/// `destination`, one thread per segment.
///
/// This is the body of the detached prefetcher process, but it is an ordinary
/// function: foreground and prefetchers only coordinate through the cache
/// directory, so any number of processes can run it concurrently.
pub fn run_prefetch(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    segment: &str,
    destination: &Path,
    depth: usize,
) -> Result<()> {
    let dir = destination.parent().unwrap_or(Path::new(".")).to_path_buf();
    let names = successor_names(segment, depth)?;
    thread::scope(|scope| {
        for name in &names {
            let dir = &dir;
            scope.spawn(move || {
                if let Err(e) = prefetch_one(store, crypter, name, dir) {
                    debug!(segment = %name, error = %e, "prefetch skipped");
                }
            });
        }
    });
    Ok(())
}

/// Fetch one segment into the cache. Protocol: claim `running/<seg>`,
/// download into it, rename to `prefetched/<seg>` to commit; on any error
/// remove the running file so a stale claim never lingers.
fn prefetch_one(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    segment: &str,
    dir: &Path,
) -> Result<()> {
    let locations = prefetch_locations(dir, segment);
    fs::create_dir_all(&locations.running_dir)?;

    if locations.prefetched.exists() || locations.running.exists() {
        debug!(segment, "already prefetched or in progress");
        return Ok(());
    }

    fs::File::create(&locations.running)?;
    match download_segment(store, crypter, segment, &locations.running) {
        Ok(()) => {
            fs::rename(&locations.running, &locations.prefetched)?;
            debug!(segment, "prefetched WAL segment");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&locations.running);
            Err(e)
        }
    }
}

/// Schedule a detached prefetcher: a child instance of this binary running
/// the `wal-prefetch` command. A separate process survives the foreground's
/// exit, and independent restore processes interoperate through the cache.
pub fn spawn_prefetch_process(segment: &str, destination: &Path) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!(error = %e, "cannot locate own binary; skipping prefetch");
            return;
        }
    };
    let spawned = Command::new(exe)
        .arg("wal-prefetch")
        .arg(segment)
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(child) => debug!(segment, pid = child.id(), "scheduled prefetcher"),
        Err(e) => warn!(segment, error = %e, "failed to spawn prefetcher"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{self, Codec};
    use crate::crypto::NoCrypter;
    use crate::testutil::MemoryStore;
    use crate::wal::{segment_key, segment_name, WAL_SEGMENT_SIZE};

    fn segment_bytes(fill: u8) -> Vec<u8> {
        let mut data = 0xD062u32.to_le_bytes().to_vec();
        data.resize(WAL_SEGMENT_SIZE as usize, fill);
        data
    }

    #[test]
    fn prefetches_successors_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        for segno in [2u64, 3] {
            let name = segment_name(1, segno);
            let sealed =
                compress::seal(Codec::Lz4, &NoCrypter, &segment_bytes(segno as u8)).unwrap();
            store.put_blob(&segment_key(&name, "lz4"), sealed).unwrap();
        }

        let current = segment_name(1, 1);
        let destination = dir.path().join(&current);
        run_prefetch(&store, &NoCrypter, &current, &destination, 2).unwrap();

        for segno in [2u64, 3] {
            let name = segment_name(1, segno);
            let locations = prefetch_locations(dir.path(), &name);
            assert_eq!(
                fs::read(&locations.prefetched).unwrap(),
                segment_bytes(segno as u8),
                "segment {name} should be committed to the cache"
            );
            assert!(!locations.running.exists());
        }
    }

    #[test]
    fn missing_successors_leave_no_running_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let current = segment_name(1, 1);
        let destination = dir.path().join(&current);
        run_prefetch(&store, &NoCrypter, &current, &destination, 3).unwrap();

        for segno in 2u64..=4 {
            let locations = prefetch_locations(dir.path(), &segment_name(1, segno));
            assert!(!locations.running.exists());
            assert!(!locations.prefetched.exists());
        }
    }

    #[test]
    fn existing_claim_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let name = segment_name(1, 2);
        let sealed = compress::seal(Codec::Lz4, &NoCrypter, &segment_bytes(0)).unwrap();
        store.put_blob(&segment_key(&name, "lz4"), sealed).unwrap();

        // Another process is (apparently) downloading this segment.
        let locations = prefetch_locations(dir.path(), &name);
        fs::create_dir_all(&locations.running_dir).unwrap();
        fs::write(&locations.running, b"partial").unwrap();

        prefetch_one(&store, &NoCrypter, &name, dir.path()).unwrap();
        assert_eq!(fs::read(&locations.running).unwrap(), b"partial");
        assert!(!locations.prefetched.exists());
    }
}
