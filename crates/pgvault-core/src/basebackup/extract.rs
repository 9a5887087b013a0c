use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tar::{Archive, EntryType};
use tracing::debug;

use crate::basebackup::increment::apply_increment;
use crate::basebackup::rel_key;
use crate::basebackup::sentinel::BackupSentinel;
use crate::compress::{self, Codec};
use crate::crypto::Crypter;
use crate::error::{PgVaultError, Result};
use crate::storage::ObjectStore;

/// Extract a set of tar parts into `target`, in parallel across parts.
///
/// Each worker feeds its own tar demultiplexer; a file lives in exactly one
/// part, so per-path writes never race. Members recorded as incremented in
/// the sentinel are page overlays applied against the same relative path in
/// `increment_base`.
pub fn extract_parts(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    keys: &[String],
    target: &Path,
    sentinel: &BackupSentinel,
    increment_base: &Path,
    workers: usize,
) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let workers = workers.clamp(1, keys.len());
    let (tx, rx) = crossbeam_channel::bounded::<String>(keys.len());
    for key in keys {
        tx.send(key.clone()).expect("channel sized to the key count");
    }
    drop(tx);

    let first_error: Mutex<Option<PgVaultError>> = Mutex::new(None);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let first_error = &first_error;
            scope.spawn(move || {
                while let Ok(key) = rx.recv() {
                    if first_error.lock().unwrap().is_some() {
                        continue;
                    }
                    if let Err(e) =
                        extract_one(store, crypter, &key, target, sentinel, increment_base)
                    {
                        first_error.lock().unwrap().get_or_insert(e);
                    }
                }
            });
        }
    });

    match first_error.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn extract_one(
    store: &dyn ObjectStore,
    crypter: &dyn Crypter,
    key: &str,
    target: &Path,
    sentinel: &BackupSentinel,
    increment_base: &Path,
) -> Result<()> {
    let codec = Codec::for_key(key)?;
    let blob = store
        .get(key)?
        .ok_or_else(|| PgVaultError::Corrupt(format!("tar part '{key}' disappeared during fetch")))?;
    let reader = compress::open_reader(codec, crypter, blob)?;
    let mut archive = Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = sanitize_entry_path(&entry.path()?)?;
        let dest = target.join(&rel);
        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
            }
            EntryType::Symlink => {
                let link = entry.link_name()?.ok_or_else(|| {
                    PgVaultError::Corrupt(format!("symlink member '{}' has no target", rel.display()))
                })?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                restore_symlink(&link, &dest)?;
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let rel_str = rel_key(&rel);
                let incremented = sentinel
                    .files
                    .get(&rel_str)
                    .is_some_and(|fd| fd.is_incremented);
                if incremented {
                    let mut body = Vec::new();
                    entry.read_to_end(&mut body)?;
                    let base = fs::read(increment_base.join(&rel)).ok();
                    let full = apply_increment(&body, base.as_deref())?;
                    fs::write(&dest, full)?;
                } else {
                    entry.unpack(&dest)?;
                }
            }
            other => {
                debug!(entry_type = ?other, path = %rel.display(), "ignoring tar member");
            }
        }
    }
    debug!(part = %key, "extracted tar part");
    Ok(())
}

/// Reject member paths that would write outside the target directory.
fn sanitize_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(PgVaultError::Corrupt(format!(
                    "tar member path '{}' escapes the target directory",
                    raw.display()
                )))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(PgVaultError::Corrupt("tar member has an empty path".into()));
    }
    Ok(out)
}

#[cfg(unix)]
fn restore_symlink(link: &Path, dest: &Path) -> Result<()> {
    let _ = fs::remove_file(dest);
    std::os::unix::fs::symlink(link, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_symlink(link: &Path, dest: &Path) -> Result<()> {
    // Tablespace links cannot be recreated portably here.
    tracing::warn!(
        link = %link.display(),
        dest = %dest.display(),
        "skipping symlink member on this platform"
    );
    Ok(())
}
