mod cli;

use std::path::Path;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{error, warn};

use pgvault_core::basebackup::catalog::{
    delete_before_name, delete_before_time, list_backups, retain,
};
use pgvault_core::basebackup::fetch::fetch_backup;
use pgvault_core::basebackup::push::{push_backup, PushOutcome};
use pgvault_core::config::Settings;
use pgvault_core::crypto::crypter_from_settings;
use pgvault_core::db::DatabaseApi;
use pgvault_core::error::{PgVaultError, Result};
use pgvault_core::storage::store_from_url;
use pgvault_core::wal;

use cli::{Cli, Commands, DeleteCommand};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> Result<()> {
    let settings = Settings::from_env()?;
    if settings.store_url.is_empty() {
        return Err(PgVaultError::Config("WALG_S3_PREFIX is not set".into()));
    }
    let store = store_from_url(&settings.store_url)?;
    let crypter = crypter_from_settings(&settings);

    match command {
        Commands::BackupPush { data_dir } => {
            let mut db = connect_database()?;
            match push_backup(&store, &crypter, db.as_mut(), Path::new(&data_dir), &settings)? {
                PushOutcome::Completed { name, lsn } => {
                    println!("{name} {lsn}");
                }
                PushOutcome::AbandonedTimelineChange => {
                    warn!("timeline changed during the backup; nothing was committed");
                }
            }
        }

        Commands::BackupFetch {
            data_dir,
            backup_name,
        } => {
            let lsn = fetch_backup(
                store.as_ref(),
                crypter.as_ref(),
                &backup_name,
                Path::new(&data_dir),
                settings.download_concurrency,
            )?;
            println!("{lsn}");
        }

        Commands::BackupList => {
            let rows = list_backups(store.as_ref())?;
            println!("name\tlast_modified\twal_segment_backup_start");
            for row in rows.iter().rev() {
                println!(
                    "{}\t{}\t{}",
                    row.name,
                    row.time.to_rfc3339(),
                    row.wal_segment_start
                );
            }
        }

        Commands::Delete { command, dry_run } => {
            let deleted = match command {
                DeleteCommand::Before { target, find_full } => {
                    match DateTime::parse_from_rfc3339(&target) {
                        Ok(cutoff) => delete_before_time(
                            store.as_ref(),
                            cutoff.with_timezone(&Utc),
                            find_full,
                            dry_run,
                        )?,
                        Err(_) => {
                            delete_before_name(store.as_ref(), &target, find_full, dry_run)?
                        }
                    }
                }
                DeleteCommand::Retain {
                    count,
                    after_full,
                    find_full,
                } => retain(store.as_ref(), count, after_full, find_full, dry_run)?,
            };
            for name in deleted {
                println!("{}{name}", if dry_run { "would delete " } else { "" });
            }
        }

        Commands::WalPush { segment_path } => {
            wal::push::push_wal_segment(
                &store,
                &crypter,
                Path::new(&segment_path),
                settings.upload_concurrency,
            )?;
        }

        Commands::WalFetch {
            segment,
            destination,
            no_prefetch,
        } => {
            wal::fetch::fetch_wal_segment(
                store.as_ref(),
                crypter.as_ref(),
                &segment,
                Path::new(&destination),
                !no_prefetch,
            )?;
        }

        Commands::WalPrefetch {
            segment,
            destination,
        } => {
            wal::prefetch::run_prefetch(
                store.as_ref(),
                crypter.as_ref(),
                &segment,
                Path::new(&destination),
                settings.download_concurrency,
            )?;
        }
    }
    Ok(())
}

#[cfg(feature = "postgres")]
fn connect_database() -> Result<Box<dyn DatabaseApi>> {
    let conninfo = std::env::var("WALG_PG_CONNINFO")
        .unwrap_or_else(|_| "host=/var/run/postgresql".to_string());
    Ok(Box::new(pgvault_core::db::PgDatabase::connect(&conninfo)?))
}

#[cfg(not(feature = "postgres"))]
fn connect_database() -> Result<Box<dyn DatabaseApi>> {
    Err(PgVaultError::Config(
        "backup-push needs a database connection; rebuild with the 'postgres' feature".into(),
    ))
}
