pub mod bundle;
pub mod catalog;
pub mod extract;
pub mod fetch;
pub mod increment;
pub mod push;
pub mod sentinel;

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Store prefix for base backups.
pub const BASE_BACKUP_PREFIX: &str = "basebackups_005";

/// A backup exists iff this blob exists next to its tar parts.
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

/// The distinguished tar part extracted last on fetch.
pub const PG_CONTROL_TAR: &str = "pg_control.tar";

/// Staging directory inside a fetch target where the parent's state is
/// parked while a delta replays over it.
pub const INCREMENT_BASE_DIR: &str = "increment_base";

/// Relative path as a `/`-separated key, the sentinel's file-set keying.
pub(crate) fn rel_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn sentinel_key(backup_name: &str) -> String {
    format!("{BASE_BACKUP_PREFIX}/{backup_name}{SENTINEL_SUFFIX}")
}

/// Prefix under which a backup's tar parts live.
pub fn tar_partitions_prefix(backup_name: &str) -> String {
    format!("{BASE_BACKUP_PREFIX}/{backup_name}/tar_partitions")
}

pub fn tar_part_key(backup_name: &str, part_name: &str) -> String {
    format!("{}/{}", tar_partitions_prefix(backup_name), part_name)
}

/// Does this tar-part key name the distinguished `pg_control` part?
pub fn is_pg_control_key(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with(PG_CONTROL_TAR))
}

/// Modern backup names look like `<label>_<startLSN>_<startSegment>`; a name
/// that fails this pattern comes from the legacy layout in which
/// `pg_control` is embedded in the main tar parts.
static MODERN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^_]+._{1}[^_]+._{1})").expect("valid backup-name pattern"));

pub fn backup_name_is_modern(name: &str) -> bool {
    MODERN_NAME.is_match(name)
}

/// The WAL-segment-start component of a backup name (third `_`-separated
/// token). Used for the `_D_<parentSegment>` delta suffix and for listings.
pub fn wal_segment_of_backup_name(name: &str) -> Option<&str> {
    let segment = name.split('_').nth(2)?;
    if crate::wal::is_segment_name(segment) {
        Some(segment)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_the_archive_convention() {
        assert_eq!(
            sentinel_key("base_10_000000010000000000000002"),
            "basebackups_005/base_10_000000010000000000000002_backup_stop_sentinel.json"
        );
        assert_eq!(
            tar_part_key("base_10_000000010000000000000002", "0.tar.lz4"),
            "basebackups_005/base_10_000000010000000000000002/tar_partitions/0.tar.lz4"
        );
    }

    #[test]
    fn pg_control_key_detection() {
        assert!(is_pg_control_key(
            "basebackups_005/b/tar_partitions/pg_control.tar.lz4"
        ));
        assert!(!is_pg_control_key("basebackups_005/b/tar_partitions/0.tar.lz4"));
    }

    #[test]
    fn modern_names_match_and_legacy_names_do_not() {
        assert!(backup_name_is_modern("base_10_000000010000000000000002"));
        assert!(backup_name_is_modern(
            "base_20000028_000000010000000000000002_D_000000010000000000000001"
        ));
        assert!(!backup_name_is_modern("base-20170falselayout"));
    }

    #[test]
    fn wal_segment_token_is_extracted() {
        assert_eq!(
            wal_segment_of_backup_name("base_10_000000010000000000000002"),
            Some("000000010000000000000002")
        );
        assert_eq!(
            wal_segment_of_backup_name(
                "base_10_000000010000000000000003_D_000000010000000000000002"
            ),
            Some("000000010000000000000003")
        );
        assert_eq!(wal_segment_of_backup_name("legacyname"), None);
    }
}
