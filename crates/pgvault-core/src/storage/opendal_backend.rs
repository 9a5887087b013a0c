use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use opendal::layers::BlockingLayer;
use opendal::{BlockingOperator, Operator};

use crate::error::{PgVaultError, Result};
use crate::storage::{ObjectInfo, ObjectStore};

/// Tokio runtime used to bridge OpenDAL's async S3 service into synchronous
/// call sites. Created lazily on first use.
static ASYNC_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    let worker_threads = std::thread::available_parallelism()
        .map(|n| n.get().clamp(4, 8))
        .unwrap_or(4);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime for blocking layer")
});

/// Object store backed by OpenDAL (S3 and S3-compatible services).
///
/// Endpoint, region and credentials come from the ambient client
/// configuration (AWS_* environment), which is deliberately outside the
/// archive engine.
pub struct OpendalStore {
    op: BlockingOperator,
}

impl OpendalStore {
    /// Create a store from an async OpenDAL operator by adding a
    /// `BlockingLayer`.
    pub fn from_async_operator(op: Operator) -> Result<Self> {
        let _guard = ASYNC_RUNTIME.enter();
        let op = op.layer(
            BlockingLayer::create()
                .map_err(|e| PgVaultError::Other(format!("failed to create blocking layer: {e}")))?,
        );
        Ok(Self { op: op.blocking() })
    }

    /// Create a store backed by S3 (or an S3-compatible service like MinIO).
    pub fn s3(bucket: &str, root: &str) -> Result<Self> {
        let mut builder = opendal::services::S3::default().bucket(bucket).root(root);
        if let Ok(endpoint) = std::env::var("AWS_ENDPOINT") {
            builder = builder.endpoint(&endpoint);
        }
        if let Ok(region) = std::env::var("AWS_REGION") {
            builder = builder.region(&region);
        }
        let op = Operator::new(builder)
            .map_err(|e| PgVaultError::Other(format!("opendal s3 init: {e}")))?
            .finish();
        Self::from_async_operator(op)
    }

    fn last_modified_of(&self, key: &str) -> Result<DateTime<Utc>> {
        let meta = self.op.stat(key)?;
        Ok(meta.last_modified().unwrap_or(DateTime::UNIX_EPOCH))
    }
}

impl ObjectStore for OpendalStore {
    fn exists(&self, key: &str) -> Result<bool> {
        match self.op.stat(key) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PgVaultError::from(e)),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.op.read(key) {
            Ok(buf) => Ok(Some(buf.to_vec())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PgVaultError::from(e)),
        }
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.op.write(key, data).map_err(PgVaultError::from)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.op.delete(key) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PgVaultError::from(e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let entries = self
            .op
            .list_with(prefix)
            .recursive(true)
            .call()
            .map_err(PgVaultError::from)?;
        let mut out = Vec::new();
        for entry in entries {
            let key = entry.path().to_string();
            // Skip directory markers.
            if key.ends_with('/') {
                continue;
            }
            let last_modified = match entry.metadata().last_modified() {
                Some(t) => t,
                None => self.last_modified_of(&key)?,
            };
            out.push(ObjectInfo { key, last_modified });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}
