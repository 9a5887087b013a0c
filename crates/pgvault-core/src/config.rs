use std::env;

use crate::error::{PgVaultError, Result};

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 16;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 10;

/// Which backup an incremental backup takes as its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeltaOrigin {
    /// Parent is the most recent backup, full or incremental.
    #[default]
    Latest,
    /// Parent is the full ancestor of the most recent backup's chain, so the
    /// chain never grows deeper than one step.
    LatestFull,
}

impl DeltaOrigin {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "LATEST" => Ok(DeltaOrigin::Latest),
            "LATEST_FULL" => Ok(DeltaOrigin::LatestFull),
            other => Err(PgVaultError::Config(format!(
                "unknown WALG_DELTA_ORIGIN: '{other}' (expected LATEST or LATEST_FULL)"
            ))),
        }
    }
}

/// Environment-supplied settings. Everything here has a default except the
/// store URL, which callers must provide one way or another.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Object-store URL: `s3://bucket[/root]`, `file:///path`, or a bare path.
    pub store_url: String,
    /// Maximum delta-chain length; 0 disables incremental backups.
    pub max_deltas: u32,
    pub delta_origin: DeltaOrigin,
    pub upload_concurrency: usize,
    /// Parallelism for fetch-side work; also the prefetch depth.
    pub download_concurrency: usize,
    /// Cumulative uncompressed bytes after which a tar part is sealed.
    pub tar_size_threshold: u64,
    /// 32-byte AES-256-GCM key; `None` disables the encryption stage.
    pub encryption_key: Option<[u8; 32]>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let store_url = env::var("WALG_S3_PREFIX").unwrap_or_default();
        Ok(Settings {
            store_url,
            max_deltas: parse_env_u32("WALG_DELTA_MAX_STEPS", 0)?,
            delta_origin: match env::var("WALG_DELTA_ORIGIN") {
                Ok(raw) => DeltaOrigin::parse(&raw)?,
                Err(_) => DeltaOrigin::default(),
            },
            upload_concurrency: parse_env_usize(
                "WALG_UPLOAD_CONCURRENCY",
                DEFAULT_UPLOAD_CONCURRENCY,
            )?
            .max(1),
            download_concurrency: parse_env_usize(
                "WALG_DOWNLOAD_CONCURRENCY",
                DEFAULT_DOWNLOAD_CONCURRENCY,
            )?
            .max(1),
            tar_size_threshold: parse_env_u64(
                "WALG_TAR_SIZE_THRESHOLD",
                crate::basebackup::bundle::DEFAULT_MIN_PART_SIZE,
            )?
            .max(1),
            encryption_key: parse_encryption_key()?,
        })
    }

    /// Defaults with an explicit store URL; used by tests and embedders.
    pub fn for_store(store_url: impl Into<String>) -> Self {
        Settings {
            store_url: store_url.into(),
            max_deltas: 0,
            delta_origin: DeltaOrigin::default(),
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            tar_size_threshold: crate::basebackup::bundle::DEFAULT_MIN_PART_SIZE,
            encryption_key: None,
        }
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| PgVaultError::Config(format!("unable to parse {name}='{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| PgVaultError::Config(format!("unable to parse {name}='{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| PgVaultError::Config(format!("unable to parse {name}='{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_encryption_key() -> Result<Option<[u8; 32]>> {
    let Ok(raw) = env::var("WALG_ENCRYPTION_KEY") else {
        return Ok(None);
    };
    let bytes = hex::decode(raw.trim())
        .map_err(|e| PgVaultError::Config(format!("WALG_ENCRYPTION_KEY is not hex: {e}")))?;
    let key: [u8; 32] = bytes.try_into().map_err(|_| {
        PgVaultError::Config("WALG_ENCRYPTION_KEY must be 64 hex characters (32 bytes)".into())
    })?;
    Ok(Some(key))
}
