pub mod local_backend;
pub mod opendal_backend;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{PgVaultError, Result};

/// A listed object: its key plus the store's last-modified timestamp. The
/// backup catalog orders sentinels by this timestamp.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Abstract blob storage for the archive. Keys are `/`-separated string
/// paths relative to the configured server prefix (e.g.
/// "basebackups_005/base_.../tar_partitions/0.tar.lz4").
///
/// Errors are surfaced unchanged; retries, if any, belong to the underlying
/// client. Implementations are stateless and shared across threads.
pub trait ObjectStore: Send + Sync {
    /// Check if an object exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Read an object by key. Returns `None` if not found.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object. Overwrites if it already exists.
    fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List all objects under a prefix, ordered by key.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

impl ObjectStore for Arc<dyn ObjectStore> {
    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }
    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        (**self).put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        (**self).list(prefix)
    }
}

/// Parsed store URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedUrl {
    /// Local filesystem directory.
    Local { path: String },
    /// S3 or S3-compatible storage; endpoint and credentials come from the
    /// ambient client configuration.
    S3 { bucket: String, root: String },
}

/// Parse a store URL into its components.
///
/// Supported formats:
/// - Bare path (`/archive`, `./relative`, `relative`) -> `Local`
/// - `file:///archive` -> `Local`
/// - `s3://bucket[/prefix]` -> `S3`
pub fn parse_store_url(raw: &str) -> Result<ParsedUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PgVaultError::Config("store URL must not be empty".into()));
    }

    if !trimmed.contains("://") {
        return Ok(ParsedUrl::Local {
            path: trimmed.to_string(),
        });
    }

    let url = Url::parse(trimmed)
        .map_err(|e| PgVaultError::Config(format!("invalid store URL '{trimmed}': {e}")))?;

    match url.scheme() {
        "file" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err(PgVaultError::Config("file:// URL has empty path".into()));
            }
            Ok(ParsedUrl::Local { path })
        }
        "s3" => {
            let bucket = url
                .host_str()
                .ok_or_else(|| PgVaultError::Config("s3:// URL is missing a bucket".into()))?;
            let root = url.path().trim_start_matches('/').to_string();
            Ok(ParsedUrl::S3 {
                bucket: bucket.to_string(),
                root,
            })
        }
        other => Err(PgVaultError::Config(format!(
            "unsupported store URL scheme: '{other}'"
        ))),
    }
}

/// Build an object store from a store URL.
pub fn store_from_url(raw: &str) -> Result<Arc<dyn ObjectStore>> {
    match parse_store_url(raw)? {
        ParsedUrl::Local { path } => Ok(Arc::new(local_backend::LocalStore::new(&path)?)),
        ParsedUrl::S3 { bucket, root } => Ok(Arc::new(opendal_backend::OpendalStore::s3(
            &bucket, &root,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_paths_are_local() {
        assert_eq!(
            parse_store_url("/archive/pg").unwrap(),
            ParsedUrl::Local {
                path: "/archive/pg".into()
            }
        );
        assert_eq!(
            parse_store_url("relative").unwrap(),
            ParsedUrl::Local {
                path: "relative".into()
            }
        );
    }

    #[test]
    fn file_url_is_local() {
        assert_eq!(
            parse_store_url("file:///archive/pg").unwrap(),
            ParsedUrl::Local {
                path: "/archive/pg".into()
            }
        );
    }

    #[test]
    fn s3_url_splits_bucket_and_root() {
        assert_eq!(
            parse_store_url("s3://backups/cluster-a").unwrap(),
            ParsedUrl::S3 {
                bucket: "backups".into(),
                root: "cluster-a".into()
            }
        );
        assert_eq!(
            parse_store_url("s3://backups").unwrap(),
            ParsedUrl::S3 {
                bucket: "backups".into(),
                root: "".into()
            }
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(parse_store_url("ftp://host/path").is_err());
        assert!(parse_store_url("   ").is_err());
    }
}
