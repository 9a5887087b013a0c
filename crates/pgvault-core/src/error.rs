use thiserror::Error;

pub type Result<T> = std::result::Result<T, PgVaultError>;

#[derive(Debug, Error)]
pub enum PgVaultError {
    #[error("storage I/O error: {0}")]
    Storage(#[source] Box<opendal::Error>),

    #[error("configuration error: {0}")]
    Config(String),

    /// Returned by `get_latest` when the catalog is empty. Callers that can
    /// fall back to a full backup treat this as a normal condition.
    #[error("no base backups found")]
    NoBackups,

    #[error("backup '{0}' does not exist")]
    BackupNotFound(String),

    #[error("WAL segment '{0}' does not exist in the archive")]
    WalSegmentNotFound(String),

    #[error("corrupt object: {0}")]
    Corrupt(String),

    #[error("unsupported file type: '{0}'")]
    UnsupportedFileType(String),

    #[error("backup chain integrity: {0}")]
    ChainIntegrity(String),

    /// Deleting backups older than an incremental target would orphan the
    /// survivors of its chain.
    #[error("backup '{0}' is incremental; its ancestors can only be deleted with find-full")]
    ProtectedBackup(String),

    #[error("target directory '{0}' for a base backup must be empty")]
    TargetDirNotEmpty(String),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(String),
}

impl From<opendal::Error> for PgVaultError {
    fn from(value: opendal::Error) -> Self {
        PgVaultError::Storage(Box::new(value))
    }
}
