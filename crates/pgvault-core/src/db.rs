use crate::error::Result;
use crate::lsn::Lsn;

/// Result of starting a non-exclusive backup.
pub struct BackupStart {
    /// Proposed backup name, `<label>_<startLSN>_<startSegment>`.
    pub name: String,
    pub lsn: Lsn,
    /// Server version number (e.g. 160002).
    pub version: u32,
}

/// Result of stopping a non-exclusive backup.
pub struct BackupStop {
    pub lsn: Lsn,
    pub backup_label: Vec<u8>,
    pub tablespace_map: Vec<u8>,
}

/// The three database protocol calls the push controller needs. Everything
/// else about the connection (credentials, host, TLS) is wiring that lives
/// outside the engine.
pub trait DatabaseApi {
    fn start_backup(&mut self, label: &str) -> Result<BackupStart>;

    fn stop_backup(&mut self) -> Result<BackupStop>;

    /// Did the server's timeline change since `start_backup`? A change makes
    /// the backup unusable.
    fn timeline_changed(&mut self) -> Result<bool>;
}

/// Canonical backup name for a start LSN.
pub fn backup_name_for(lsn: Lsn) -> String {
    format!(
        "base_{:X}_{}",
        lsn.0,
        crate::wal::segment_for_lsn(crate::wal::DEFAULT_TIMELINE, lsn)
    )
}

#[cfg(feature = "postgres")]
pub use live::PgDatabase;

#[cfg(feature = "postgres")]
mod live {
    use postgres::{Client, NoTls};

    use super::{backup_name_for, BackupStart, BackupStop, DatabaseApi};
    use crate::error::{PgVaultError, Result};
    use crate::lsn::Lsn;

    fn db_err(e: postgres::Error) -> PgVaultError {
        PgVaultError::Database(e.to_string())
    }

    /// Live connection speaking the non-exclusive backup protocol.
    pub struct PgDatabase {
        client: Client,
        start_timeline: Option<u32>,
    }

    impl PgDatabase {
        pub fn connect(conninfo: &str) -> Result<Self> {
            let client = Client::connect(conninfo, NoTls).map_err(db_err)?;
            Ok(Self {
                client,
                start_timeline: None,
            })
        }

        fn current_timeline(&mut self) -> Result<u32> {
            let row = self
                .client
                .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
                .map_err(db_err)?;
            let timeline: i32 = row.get(0);
            Ok(timeline as u32)
        }
    }

    impl DatabaseApi for PgDatabase {
        fn start_backup(&mut self, label: &str) -> Result<BackupStart> {
            self.start_timeline = Some(self.current_timeline()?);
            let row = self
                .client
                .query_one(
                    "SELECT current_setting('server_version_num')::int, \
                     pg_backup_start($1, false)::text",
                    &[&label],
                )
                .map_err(db_err)?;
            let version: i32 = row.get(0);
            let lsn: Lsn = row.get::<_, String>(1).parse()?;
            Ok(BackupStart {
                name: backup_name_for(lsn),
                lsn,
                version: version as u32,
            })
        }

        fn stop_backup(&mut self) -> Result<BackupStop> {
            let row = self
                .client
                .query_one(
                    "SELECT lsn::text, labelfile, spcmapfile FROM pg_backup_stop(true)",
                    &[],
                )
                .map_err(db_err)?;
            let lsn: Lsn = row.get::<_, String>(0).parse()?;
            let labelfile: String = row.get(1);
            let spcmapfile: Option<String> = row.get(2);
            Ok(BackupStop {
                lsn,
                backup_label: labelfile.into_bytes(),
                tablespace_map: spcmapfile.unwrap_or_default().into_bytes(),
            })
        }

        fn timeline_changed(&mut self) -> Result<bool> {
            let now = self.current_timeline()?;
            Ok(self.start_timeline.is_some_and(|then| then != now))
        }
    }
}
