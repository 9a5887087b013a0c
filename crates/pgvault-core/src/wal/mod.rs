pub mod fetch;
pub mod prefetch;
pub mod push;

use std::path::Path;

use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;

/// Store prefix for archived WAL segments.
pub const WAL_PREFIX: &str = "wal_005";

/// Fixed on-disk size of a WAL segment in the standard configuration.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum value of the first four little-endian bytes of a valid segment.
/// Anything lower indicates a corrupt or incomplete file.
pub const WAL_MAGIC_MIN: u32 = 0xD061;

/// Segment names are 24 hex digits: timeline, log, seg (8 each).
pub const SEGMENT_NAME_LEN: usize = 24;

const SEGMENTS_PER_XLOG_ID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;

/// The cluster's only timeline as far as archival is concerned.
pub const DEFAULT_TIMELINE: u32 = 1;

pub fn is_segment_name(name: &str) -> bool {
    name.len() == SEGMENT_NAME_LEN && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// Render a segment name from a timeline and a segment number.
pub fn segment_name(timeline: u32, segno: u64) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        timeline,
        segno / SEGMENTS_PER_XLOG_ID,
        segno % SEGMENTS_PER_XLOG_ID
    )
}

/// Parse a segment name back into (timeline, segment number).
pub fn parse_segment_name(name: &str) -> Result<(u32, u64)> {
    if !is_segment_name(name) {
        return Err(PgVaultError::Corrupt(format!(
            "'{name}' is not a WAL segment name"
        )));
    }
    let timeline = u32::from_str_radix(&name[0..8], 16)
        .map_err(|e| PgVaultError::Corrupt(format!("segment name '{name}': {e}")))?;
    let log = u64::from_str_radix(&name[8..16], 16)
        .map_err(|e| PgVaultError::Corrupt(format!("segment name '{name}': {e}")))?;
    let seg = u64::from_str_radix(&name[16..24], 16)
        .map_err(|e| PgVaultError::Corrupt(format!("segment name '{name}': {e}")))?;
    Ok((timeline, log * SEGMENTS_PER_XLOG_ID + seg))
}

/// Name of the segment containing `lsn`.
pub fn segment_for_lsn(timeline: u32, lsn: Lsn) -> String {
    segment_name(timeline, lsn.segment_number(WAL_SEGMENT_SIZE))
}

/// The `count` segments following `name`, for prefetch.
pub fn successor_names(name: &str, count: usize) -> Result<Vec<String>> {
    let (timeline, segno) = parse_segment_name(name)?;
    Ok((1..=count as u64)
        .map(|i| segment_name(timeline, segno + i))
        .collect())
}

/// Archive key for a segment under the given codec suffix.
pub fn segment_key(segment: &str, suffix: &str) -> String {
    format!("{WAL_PREFIX}/{segment}.{suffix}")
}

/// Verify the magic gate on a segment already on disk.
pub fn check_wal_magic(path: &Path) -> Result<()> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if u32::from_le_bytes(magic) < WAL_MAGIC_MIN {
        return Err(PgVaultError::Corrupt(format!(
            "WAL file magic is invalid in '{}'",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_round_trip() {
        let name = segment_name(1, 5);
        assert_eq!(name, "000000010000000000000005");
        assert_eq!(parse_segment_name(&name).unwrap(), (1, 5));
    }

    #[test]
    fn segment_number_carries_into_log_part() {
        // Segment numbers wrap into the middle 8 digits every 256 segments
        // (4 GiB of WAL at 16 MiB per segment).
        let name = segment_name(1, SEGMENTS_PER_XLOG_ID + 2);
        assert_eq!(name, "000000010000000100000002");
        assert_eq!(parse_segment_name(&name).unwrap(), (1, SEGMENTS_PER_XLOG_ID + 2));
    }

    #[test]
    fn successor_names_cross_the_boundary() {
        let last_in_log = segment_name(1, SEGMENTS_PER_XLOG_ID - 1);
        let next = successor_names(&last_in_log, 2).unwrap();
        assert_eq!(next[0], segment_name(1, SEGMENTS_PER_XLOG_ID));
        assert_eq!(next[1], segment_name(1, SEGMENTS_PER_XLOG_ID + 1));
    }

    #[test]
    fn is_segment_name_rejects_odd_strings() {
        assert!(is_segment_name("000000010000000000000001"));
        assert!(!is_segment_name("00000001000000000000000"));
        assert!(!is_segment_name("00000001000000000000000G"));
        assert!(!is_segment_name("000000010000000000000001.partial"));
    }

    #[test]
    fn segment_for_lsn_uses_segment_size() {
        assert_eq!(
            segment_for_lsn(1, Lsn(WAL_SEGMENT_SIZE * 2 + 100)),
            segment_name(1, 2)
        );
    }

    #[test]
    fn magic_check_accepts_valid_and_rejects_low_values() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good");
        let mut data = 0xD062u32.to_le_bytes().to_vec();
        data.resize(64, 0);
        std::fs::write(&good, &data).unwrap();
        assert!(check_wal_magic(&good).is_ok());

        let bad = dir.path().join("bad");
        let mut data = 0x0001u32.to_le_bytes().to_vec();
        data.resize(64, 0);
        std::fs::write(&bad, &data).unwrap();
        assert!(matches!(
            check_wal_magic(&bad),
            Err(PgVaultError::Corrupt(_))
        ));
    }
}
