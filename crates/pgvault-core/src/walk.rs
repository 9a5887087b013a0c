use std::fs::Metadata;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::error::{PgVaultError, Result};

/// What the visitor wants done after seeing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Continue,
    /// Do not descend into this directory; traversal continues elsewhere.
    SkipSubtree,
}

/// Resolve a path through symlinks once, if it exists. Used for roots and
/// restore targets so callers may pass a symlinked data directory.
pub fn resolve_symlink(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Walk `root` in lexicographic order, calling the visitor for every entry
/// below it with the entry's path and its (symlink-)metadata.
///
/// Symlinks are never followed inside the tree; the root itself is resolved
/// once before traversal begins. A `SkipSubtree` return aborts descent into
/// that directory only; any error return aborts the walk.
pub fn walk<F>(root: &Path, mut visitor: F) -> Result<()>
where
    F: FnMut(&Path, &Metadata) -> Result<WalkAction>,
{
    let root = resolve_symlink(root);

    let mut builder = WalkBuilder::new(&root);
    builder.follow_links(false);
    builder.hidden(false);
    builder.ignore(false);
    builder.git_global(false);
    builder.git_exclude(false);
    builder.git_ignore(false);
    builder.require_git(false);
    builder.parents(false);
    builder.sort_by_file_name(std::ffi::OsStr::cmp);

    // Children of a skipped directory arrive contiguously after it in the
    // sorted depth-first stream, so one pending prefix is enough.
    let mut skip_prefix: Option<PathBuf> = None;

    for entry in builder.build() {
        let entry = entry.map_err(|e| PgVaultError::Other(format!("walk error: {e}")))?;
        let path = entry.path();
        if path == root {
            continue;
        }
        if let Some(prefix) = &skip_prefix {
            if path.starts_with(prefix) {
                continue;
            }
            skip_prefix = None;
        }

        let metadata = std::fs::symlink_metadata(path)?;
        match visitor(path, &metadata)? {
            WalkAction::Continue => {}
            WalkAction::SkipSubtree => {
                if metadata.is_dir() {
                    skip_prefix = Some(path.to_path_buf());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn visits_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b/inner"));
        touch(&dir.path().join("a"));
        touch(&dir.path().join("c"));

        let mut seen = Vec::new();
        walk(dir.path(), |path, _| {
            seen.push(
                path.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .to_string(),
            );
            Ok(WalkAction::Continue)
        })
        .unwrap();

        assert_eq!(seen, vec!["a", "b", "b/inner", "c"]);
    }

    #[test]
    fn skip_subtree_prunes_descent_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("skipme/child"));
        touch(&dir.path().join("skipme/nested/deeper"));
        touch(&dir.path().join("zkeep"));

        let mut seen = Vec::new();
        walk(dir.path(), |path, meta| {
            let rel = path.strip_prefix(dir.path()).unwrap();
            seen.push(rel.to_string_lossy().to_string());
            if meta.is_dir() && rel == Path::new("skipme") {
                return Ok(WalkAction::SkipSubtree);
            }
            Ok(WalkAction::Continue)
        })
        .unwrap();

        assert_eq!(seen, vec!["skipme", "zkeep"]);
    }

    #[test]
    fn visitor_error_aborts_walk() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a"));
        touch(&dir.path().join("b"));

        let mut visits = 0;
        let err = walk(dir.path(), |_, _| {
            visits += 1;
            Err(PgVaultError::Other("stop".into()))
        })
        .unwrap_err();

        assert_eq!(visits, 1);
        assert!(err.to_string().contains("stop"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_is_resolved_but_inner_links_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        touch(&real.join("data"));
        fs::create_dir_all(real.join("sub")).unwrap();
        std::os::unix::fs::symlink(&real, dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink("sub", real.join("alias")).unwrap();

        let mut seen = Vec::new();
        walk(&dir.path().join("link"), |path, meta| {
            seen.push((
                path.file_name().unwrap().to_string_lossy().to_string(),
                meta.file_type().is_symlink(),
            ));
            Ok(WalkAction::Continue)
        })
        .unwrap();

        // The inner symlink appears as a symlink entry, not as a directory.
        assert!(seen.contains(&("alias".to_string(), true)));
        assert!(seen.contains(&("data".to_string(), false)));
    }
}
