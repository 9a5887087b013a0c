use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use lz4_flex::frame::FrameEncoder;
use tar::{Builder, EntryType, Header};
use tracing::{debug, info, warn};

use crate::basebackup::increment::{self, extract_increment};
use crate::basebackup::sentinel::FileDescription;
use crate::basebackup::{rel_key, tar_part_key};
use crate::crypto::Crypter;
use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;
use crate::storage::ObjectStore;
use crate::walk::WalkAction;

/// Cumulative uncompressed bytes at which the current tar part is sealed.
pub const DEFAULT_MIN_PART_SIZE: u64 = 1024 * 1024 * 1024;

/// Directories recorded as empty: their header goes into the tar, their
/// contents are the database's own transient state.
const EXCLUDED_DIRS: &[&str] = &["pg_wal", "pg_xlog", "pg_log"];

/// Files omitted entirely.
const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "pg_internal.init",
];

/// Withheld from the main parts and uploaded as the distinguished part that
/// extraction materializes last.
pub(crate) const PG_CONTROL_REL_PATH: &str = "global/pg_control";

/// Bundles a data directory into size-bounded tar parts and streams them to
/// the store through a bounded upload queue.
///
/// The walker visitor classifies each file against the parent backup's file
/// set, packs it (whole or page-incremental) into the current part, and
/// records its descriptor; sealed parts are compressed and encrypted by the
/// queue's worker threads.
pub struct Bundle {
    store: Arc<dyn ObjectStore>,
    crypter: Arc<dyn Crypter>,
    backup_name: String,
    base_dir: PathBuf,
    min_part_size: u64,
    increment_from_lsn: Option<Lsn>,
    increment_from_files: HashMap<String, FileDescription>,
    files: Mutex<HashMap<String, FileDescription>>,
    current: Option<PartBuilder>,
    next_part_index: usize,
    pg_control_path: Option<PathBuf>,
    queue: Option<UploadQueue>,
}

impl Bundle {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        crypter: Arc<dyn Crypter>,
        backup_name: String,
        base_dir: PathBuf,
        increment_from_lsn: Option<Lsn>,
        increment_from_files: HashMap<String, FileDescription>,
    ) -> Bundle {
        Bundle {
            store,
            crypter,
            backup_name,
            base_dir,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            increment_from_lsn,
            increment_from_files,
            files: Mutex::new(HashMap::new()),
            current: None,
            next_part_index: 0,
            pg_control_path: None,
            queue: None,
        }
    }

    /// Override the part-rollover threshold (tests use tiny parts).
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Bundle {
        self.min_part_size = min_part_size.max(1);
        self
    }

    /// Spin up the bounded pipeline of in-flight tar parts.
    pub fn start_queue(&mut self, concurrency: usize) {
        let concurrency = concurrency.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<SealedPart>(concurrency * 4);
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            workers.push(spawn_upload_worker(
                Arc::clone(&self.store),
                Arc::clone(&self.crypter),
                self.backup_name.clone(),
                rx.clone(),
            ));
        }
        self.queue = Some(UploadQueue {
            tx: Some(tx),
            workers,
        });
    }

    /// The walker visitor: classify and pack one directory entry.
    pub fn visit(&mut self, path: &Path, metadata: &Metadata) -> Result<WalkAction> {
        let rel = path.strip_prefix(&self.base_dir).map_err(|_| {
            PgVaultError::Other(format!(
                "walked path '{}' is outside the data directory",
                path.display()
            ))
        })?;
        let rel_str = rel_key(rel);
        if rel_str.is_empty() {
            return Ok(WalkAction::Continue);
        }
        let file_name = rel.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if metadata.is_dir() {
            self.append_dir(&rel_str, metadata)?;
            self.roll_over_if_needed()?;
            if EXCLUDED_DIRS.contains(&file_name) {
                debug!(dir = %rel_str, "recording excluded directory as empty");
                return Ok(WalkAction::SkipSubtree);
            }
            return Ok(WalkAction::Continue);
        }

        if metadata.file_type().is_symlink() {
            self.append_symlink(path, &rel_str, metadata)?;
            self.roll_over_if_needed()?;
            return Ok(WalkAction::Continue);
        }

        if !metadata.is_file() {
            return Ok(WalkAction::Continue);
        }
        if EXCLUDED_FILES.contains(&file_name) {
            return Ok(WalkAction::Continue);
        }
        if rel_str == PG_CONTROL_REL_PATH {
            // Uploaded separately, after every ordinary part.
            self.pg_control_path = Some(path.to_path_buf());
            return Ok(WalkAction::Continue);
        }

        let mtime: DateTime<Utc> = metadata.modified()?.into();
        let parent_entry = self.increment_from_files.get(&rel_str);

        if parent_entry.is_some_and(|parent| parent.mtime == mtime) {
            debug!(file = %rel_str, "unchanged since parent backup; skipped");
            self.files.lock().unwrap().insert(
                rel_str,
                FileDescription {
                    mtime,
                    is_skipped: true,
                    is_incremented: false,
                },
            );
            return Ok(WalkAction::Continue);
        }

        let increment = match self.increment_from_lsn {
            Some(parent_lsn) if parent_entry.is_some() && increment::is_paged_file(&rel_str) => {
                extract_increment(path, parent_lsn)?
            }
            _ => None,
        };

        let is_incremented = increment.is_some();
        match increment {
            Some(body) => self.append_file_bytes(&rel_str, metadata, &body)?,
            None => self.append_file(path, &rel_str, metadata)?,
        }
        self.files.lock().unwrap().insert(
            rel_str,
            FileDescription {
                mtime,
                is_skipped: false,
                is_incremented,
            },
        );
        self.roll_over_if_needed()?;
        Ok(WalkAction::Continue)
    }

    /// Seal the trailing part and wait for every queued upload to complete.
    /// Nothing may be committed before this returns Ok.
    pub fn finish_queue(&mut self) -> Result<()> {
        self.seal_current()?;
        let Some(mut queue) = self.queue.take() else {
            return Err(PgVaultError::Other("upload queue was never started".into()));
        };
        queue.tx.take();
        let mut first_error = None;
        for worker in queue.workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(PgVaultError::Other("upload worker panicked".into()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Upload the withheld `pg_control` as its own part. Runs after
    /// `finish_queue`, synchronously.
    pub fn upload_pg_control(&mut self) -> Result<()> {
        let Some(path) = self.pg_control_path.clone() else {
            warn!("data directory has no {PG_CONTROL_REL_PATH}; skipping its part");
            return Ok(());
        };
        let metadata = std::fs::symlink_metadata(&path)?;
        let mut builder = Builder::new(FrameEncoder::new(Vec::new()));
        let mut header = Header::new_gnu();
        header.set_metadata(&metadata);
        let mut file = File::open(&path)?;
        builder.append_data(&mut header, PG_CONTROL_REL_PATH, &mut file)?;
        let body = finish_tar(builder)?;
        let sealed = self.crypter.encrypt(body)?;
        self.store.put(
            &tar_part_key(&self.backup_name, "pg_control.tar.lz4"),
            sealed,
        )?;
        info!(backup = %self.backup_name, "uploaded pg_control part");
        Ok(())
    }

    /// Pack the label pseudo-files returned at backup stop into a final part
    /// and record them in the file set.
    pub fn upload_label_files(&mut self, backup_label: &[u8], tablespace_map: &[u8]) -> Result<()> {
        let mut builder = Builder::new(FrameEncoder::new(Vec::new()));
        let now: DateTime<Utc> = Utc::now();

        let mut members: Vec<(&str, &[u8])> = vec![("backup_label", backup_label)];
        if !tablespace_map.is_empty() {
            members.push(("tablespace_map", tablespace_map));
        }
        for (name, body) in &members {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o600);
            header.set_mtime(now.timestamp() as u64);
            header.set_size(body.len() as u64);
            builder.append_data(&mut header, name, *body)?;
            self.files.lock().unwrap().insert(
                (*name).to_string(),
                FileDescription {
                    mtime: now,
                    is_skipped: false,
                    is_incremented: false,
                },
            );
        }

        let part_name = format!("{}.tar.lz4", self.next_part_index);
        self.next_part_index += 1;
        let body = finish_tar(builder)?;
        let sealed = self.crypter.encrypt(body)?;
        self.store
            .put(&tar_part_key(&self.backup_name, &part_name), sealed)?;
        info!(backup = %self.backup_name, part = %part_name, "uploaded label files");
        Ok(())
    }

    /// Snapshot of the file set; call after the queue has drained.
    pub fn take_files(&mut self) -> HashMap<String, FileDescription> {
        std::mem::take(&mut *self.files.lock().unwrap())
    }

    fn part(&mut self) -> &mut PartBuilder {
        if self.current.is_none() {
            self.current = Some(PartBuilder::new(self.next_part_index));
            self.next_part_index += 1;
        }
        self.current.as_mut().unwrap()
    }

    fn roll_over_if_needed(&mut self) -> Result<()> {
        let full = self
            .current
            .as_ref()
            .is_some_and(|part| part.uncompressed >= self.min_part_size);
        if full {
            self.seal_current()?;
        }
        Ok(())
    }

    fn seal_current(&mut self) -> Result<()> {
        let Some(part) = self.current.take() else {
            return Ok(());
        };
        if part.entries == 0 {
            return Ok(());
        }
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| PgVaultError::Other("upload queue was never started".into()))?;
        let sealed = part.seal()?;
        debug!(part = %sealed.part_name, "sealed tar part");
        queue
            .tx
            .as_ref()
            .expect("queue sender lives until finish_queue")
            .send(sealed)
            .map_err(|_| PgVaultError::Other("upload queue closed unexpectedly".into()))?;
        Ok(())
    }

    fn append_dir(&mut self, rel: &str, metadata: &Metadata) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(mode_of(metadata));
        header.set_mtime(mtime_secs(metadata));
        header.set_size(0);
        let part = self.part();
        part.builder
            .append_data(&mut header, format!("{rel}/"), io::empty())?;
        part.entries += 1;
        Ok(())
    }

    fn append_symlink(&mut self, path: &Path, rel: &str, metadata: &Metadata) -> Result<()> {
        let target = std::fs::read_link(path)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_mtime(mtime_secs(metadata));
        header.set_size(0);
        let part = self.part();
        part.builder.append_link(&mut header, rel, &target)?;
        part.entries += 1;
        Ok(())
    }

    fn append_file(&mut self, path: &Path, rel: &str, metadata: &Metadata) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        let mut file = File::open(path)?;
        let part = self.part();
        part.builder.append_data(&mut header, rel, &mut file)?;
        part.entries += 1;
        part.uncompressed += metadata.len();
        Ok(())
    }

    fn append_file_bytes(&mut self, rel: &str, metadata: &Metadata, body: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(mode_of(metadata));
        header.set_mtime(mtime_secs(metadata));
        header.set_size(body.len() as u64);
        let part = self.part();
        part.builder.append_data(&mut header, rel, body)?;
        part.entries += 1;
        part.uncompressed += body.len() as u64;
        Ok(())
    }
}

/// One tar part under construction; compression happens as entries are
/// appended, so only compressed bytes are buffered.
struct PartBuilder {
    builder: Builder<FrameEncoder<Vec<u8>>>,
    uncompressed: u64,
    entries: usize,
    name: String,
}

impl PartBuilder {
    fn new(index: usize) -> PartBuilder {
        PartBuilder {
            builder: Builder::new(FrameEncoder::new(Vec::new())),
            uncompressed: 0,
            entries: 0,
            name: format!("{index}.tar.lz4"),
        }
    }

    fn seal(self) -> Result<SealedPart> {
        let body = finish_tar(self.builder)?;
        Ok(SealedPart {
            part_name: self.name,
            body,
        })
    }
}

struct SealedPart {
    part_name: String,
    /// Compressed, not yet encrypted.
    body: Vec<u8>,
}

struct UploadQueue {
    tx: Option<Sender<SealedPart>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

fn spawn_upload_worker(
    store: Arc<dyn ObjectStore>,
    crypter: Arc<dyn Crypter>,
    backup_name: String,
    rx: Receiver<SealedPart>,
) -> JoinHandle<Result<()>> {
    std::thread::spawn(move || {
        let mut failure: Option<PgVaultError> = None;
        while let Ok(part) = rx.recv() {
            // After a failure keep draining so the walker never blocks on a
            // full queue; the error surfaces from finish_queue.
            if failure.is_some() {
                continue;
            }
            let upload = crypter.encrypt(part.body).and_then(|sealed| {
                store.put(&tar_part_key(&backup_name, &part.part_name), sealed)
            });
            match upload {
                Ok(()) => debug!(part = %part.part_name, "uploaded tar part"),
                Err(e) => {
                    warn!(part = %part.part_name, error = %e, "tar part upload failed");
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

fn finish_tar(builder: Builder<FrameEncoder<Vec<u8>>>) -> Result<Vec<u8>> {
    let encoder = builder
        .into_inner()
        .map_err(|e| PgVaultError::Other(format!("tar finalize: {e}")))?;
    encoder
        .finish()
        .map_err(|e| PgVaultError::Other(format!("lz4 finalize: {e}")))
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn mtime_secs(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
