use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "pgvault",
    version,
    about = "Base-backup and WAL archival for PostgreSQL data directories",
    after_help = "\
Environment variables:
  WALG_S3_PREFIX           Store URL: s3://bucket[/root], file:///path, or a bare path
  WALG_DELTA_MAX_STEPS     Max delta-chain length; 0 (default) disables deltas
  WALG_DELTA_ORIGIN        LATEST (default) or LATEST_FULL
  WALG_UPLOAD_CONCURRENCY  Parallel uploads (default 16)
  WALG_DOWNLOAD_CONCURRENCY Parallel downloads and prefetch depth (default 10)
  WALG_TAR_SIZE_THRESHOLD  Uncompressed bytes per tar part (default 1 GiB)
  WALG_ENCRYPTION_KEY      64 hex chars enabling AES-256-GCM encryption
  WALG_PG_CONNINFO         Connection string for backup-push"
)]
pub(crate) struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Push a full or delta base backup of a data directory
    BackupPush {
        /// The database data directory
        data_dir: String,
    },

    /// Restore a base backup (replaying its delta chain) into a directory
    BackupFetch {
        /// Target data directory
        data_dir: String,

        /// Backup name, or LATEST
        backup_name: String,
    },

    /// List completed base backups
    BackupList,

    /// Delete base backups according to a boundary or a retain count
    Delete {
        #[command(subcommand)]
        command: DeleteCommand,

        /// Only show what would be deleted
        #[arg(short = 'n', long, global = true)]
        dry_run: bool,
    },

    /// Upload a just-closed WAL segment (archive_command)
    WalPush {
        /// Path to the closed segment file
        segment_path: String,
    },

    /// Download one WAL segment, consulting the prefetch cache (restore_command)
    WalFetch {
        /// Segment name (%f)
        segment: String,

        /// Destination path (%p)
        destination: String,

        /// Do not schedule a background prefetcher for upcoming segments
        #[arg(long)]
        no_prefetch: bool,
    },

    /// Prefetch upcoming WAL segments into the shared cache
    #[command(hide = true)]
    WalPrefetch {
        /// Segment the restore host just consumed
        segment: String,

        /// Destination path of that segment; the cache lives next to it
        destination: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum DeleteCommand {
    /// Delete backups older than a backup name or an RFC3339 timestamp
    Before {
        /// Backup name or timestamp boundary
        target: String,

        /// If the boundary is a delta, move it back to its full ancestor
        /// instead of refusing
        #[arg(long)]
        find_full: bool,
    },

    /// Keep the N most recent backups and delete the rest
    Retain {
        /// Number of backups (or full ancestries) to keep
        count: usize,

        /// Count full backups only; their deltas are kept with them
        #[arg(long)]
        after_full: bool,

        /// Allow the boundary to move back to a full ancestor
        #[arg(long)]
        find_full: bool,
    },
}
