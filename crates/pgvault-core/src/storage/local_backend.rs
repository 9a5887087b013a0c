use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{PgVaultError, Result};
use crate::storage::{ObjectInfo, ObjectStore};

/// Object store on the local filesystem, using `std::fs` directly. Useful for
/// archives on mounted network storage and for tests.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize when the path already exists so strip_prefix behaves
        // with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            fs::create_dir_all(&root_path)?;
            fs::canonicalize(&root_path)?
        };
        Ok(Self { root })
    }

    /// Reject storage keys that could escape the archive root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(PgVaultError::Corrupt("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(PgVaultError::Corrupt(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(PgVaultError::Corrupt(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &Path, out: &mut Vec<ObjectInfo>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    let last_modified = entry
                        .metadata()?
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or(DateTime::UNIX_EPOCH);
                    out.push(ObjectInfo { key, last_modified });
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalStore {
    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        let mut out = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&dir, &mut out)?,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalStore::validate_key("/etc/passwd").is_err());
        assert!(LocalStore::validate_key("../../outside").is_err());
        assert!(LocalStore::validate_key("foo/../../etc").is_err());
        assert!(LocalStore::validate_key("foo\\bar").is_err());
        assert!(LocalStore::validate_key("").is_err());
    }

    #[test]
    fn put_get_exists_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap()).unwrap();

        assert!(!store.exists("wal_005/seg.lz4").unwrap());
        store.put("wal_005/seg.lz4", b"payload".to_vec()).unwrap();
        assert!(store.exists("wal_005/seg.lz4").unwrap());
        assert_eq!(store.get("wal_005/seg.lz4").unwrap().unwrap(), b"payload");

        store.delete("wal_005/seg.lz4").unwrap();
        assert!(!store.exists("wal_005/seg.lz4").unwrap());
        // Deleting again is fine.
        store.delete("wal_005/seg.lz4").unwrap();
    }

    #[test]
    fn list_is_recursive_and_key_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap()).unwrap();
        store.put("base/b/1.tar.lz4", vec![1]).unwrap();
        store.put("base/a.json", vec![2]).unwrap();
        store.put("other/x", vec![3]).unwrap();

        let keys: Vec<String> = store
            .list("base")
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["base/a.json", "base/b/1.tar.lz4"]);
    }

    #[test]
    fn list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap()).unwrap();
        assert!(store.list("nothing").unwrap().is_empty());
    }
}
