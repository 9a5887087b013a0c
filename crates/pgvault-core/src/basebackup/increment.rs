use std::path::Path;

use crate::error::{PgVaultError, Result};
use crate::lsn::Lsn;

/// Database page size. Relation files are a whole number of pages, each
/// carrying its last-modifying LSN in the first 8 header bytes.
pub const PAGE_SIZE: usize = 8192;

/// Header of a page-increment stream.
pub const INCREMENT_MAGIC: [u8; 4] = *b"wi1\x55";

const RECORD_SIZE: usize = 4 + PAGE_SIZE;

/// Is this relative path a relation file whose pages carry an LSN header?
/// Relation segments live at `base/<db-oid>/<relfilenode>[.<segno>]` and
/// `global/<relfilenode>[.<segno>]`.
pub fn is_paged_file(rel_path: &str) -> bool {
    let parts: Vec<&str> = rel_path.split('/').collect();
    match parts.as_slice() {
        ["global", file] => is_relation_file_name(file),
        ["base", db, file] => is_all_digits(db) && is_relation_file_name(file),
        _ => false,
    }
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_relation_file_name(name: &str) -> bool {
    match name.split_once('.') {
        Some((node, segno)) => is_all_digits(node) && is_all_digits(segno),
        None => is_all_digits(name),
    }
}

/// LSN stamped into a page header: two little-endian u32 words, high then low.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let hi = u32::from_le_bytes(page[0..4].try_into().unwrap()) as u64;
    let lo = u32::from_le_bytes(page[4..8].try_into().unwrap()) as u64;
    Lsn((hi << 32) | lo)
}

/// Read a relation file and serialize only the pages modified after
/// `parent_lsn`, prefixed by the increment header.
///
/// Returns `None` when the file does not look like relation pages (size not
/// a multiple of the page size); the caller falls back to a full upload.
pub fn extract_increment(path: &Path, parent_lsn: Lsn) -> Result<Option<Vec<u8>>> {
    let data = std::fs::read(path)?;
    if data.len() % PAGE_SIZE != 0 {
        return Ok(None);
    }

    let changed: Vec<(u32, &[u8])> = data
        .chunks_exact(PAGE_SIZE)
        .enumerate()
        .filter(|(_, page)| page_lsn(page) > parent_lsn)
        .map(|(index, page)| (index as u32, page))
        .collect();

    let mut out = Vec::with_capacity(16 + changed.len() * RECORD_SIZE);
    out.extend_from_slice(&INCREMENT_MAGIC);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(&(changed.len() as u32).to_le_bytes());
    for (index, page) in changed {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(page);
    }
    Ok(Some(out))
}

/// Reconstruct a full relation file from an increment stream and the file's
/// prior state. Pages absent from the increment come from the base; pages
/// beyond the base (file grew) come back zeroed, as a never-written page
/// would.
pub fn apply_increment(increment: &[u8], base: Option<&[u8]>) -> Result<Vec<u8>> {
    if increment.len() < 16 {
        return Err(PgVaultError::Corrupt("increment stream too short".into()));
    }
    if increment[0..4] != INCREMENT_MAGIC {
        return Err(PgVaultError::Corrupt("bad increment magic".into()));
    }
    let file_len = u64::from_le_bytes(increment[4..12].try_into().unwrap()) as usize;
    let count = u32::from_le_bytes(increment[12..16].try_into().unwrap()) as usize;
    let records = &increment[16..];
    if records.len() != count * RECORD_SIZE {
        return Err(PgVaultError::Corrupt(format!(
            "increment stream length mismatch: {} records declared, {} bytes of records",
            count,
            records.len()
        )));
    }

    let mut out = vec![0u8; file_len];
    if let Some(base) = base {
        let shared = base.len().min(file_len);
        out[..shared].copy_from_slice(&base[..shared]);
    }
    for record in records.chunks_exact(RECORD_SIZE) {
        let index = u32::from_le_bytes(record[0..4].try_into().unwrap()) as usize;
        let offset = index * PAGE_SIZE;
        if offset + PAGE_SIZE > file_len {
            return Err(PgVaultError::Corrupt(format!(
                "increment page {index} is outside the file"
            )));
        }
        out[offset..offset + PAGE_SIZE].copy_from_slice(&record[4..]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a page with the given LSN and fill byte.
    fn page(lsn: Lsn, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; PAGE_SIZE];
        page[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
        page[4..8].copy_from_slice(&((lsn.0 & 0xffff_ffff) as u32).to_le_bytes());
        page
    }

    #[test]
    fn paged_file_detection() {
        assert!(is_paged_file("base/16384/2619"));
        assert!(is_paged_file("base/16384/2619.1"));
        assert!(is_paged_file("global/1262"));
        assert!(!is_paged_file("base/16384/pg_filenode.map"));
        assert!(!is_paged_file("global/pg_control"));
        assert!(!is_paged_file("pg_clog/0000"));
        assert!(!is_paged_file("base/16384/sub/2619"));
        assert!(!is_paged_file("postgresql.conf"));
    }

    #[test]
    fn page_lsn_reads_both_words() {
        let p = page(Lsn(0x1_2000_0028), 0);
        assert_eq!(page_lsn(&p), Lsn(0x1_2000_0028));
    }

    #[test]
    fn extract_keeps_only_pages_newer_than_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2619");
        let mut data = page(Lsn(0x10), 0xAA);
        data.extend(page(Lsn(0x30), 0xBB));
        data.extend(page(Lsn(0x20), 0xCC));
        std::fs::write(&path, &data).unwrap();

        let inc = extract_increment(&path, Lsn(0x20)).unwrap().unwrap();
        let count = u32::from_le_bytes(inc[12..16].try_into().unwrap());
        assert_eq!(count, 1);
        let index = u32::from_le_bytes(inc[16..20].try_into().unwrap());
        assert_eq!(index, 1);

        // Applying over the old state reproduces the new file.
        let mut old = page(Lsn(0x10), 0xAA);
        old.extend(page(Lsn(0x05), 0x11));
        old.extend(page(Lsn(0x20), 0xCC));
        let rebuilt = apply_increment(&inc, Some(&old)).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn odd_sized_file_falls_back_to_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2619");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 1]).unwrap();
        assert!(extract_increment(&path, Lsn(0)).unwrap().is_none());
    }

    #[test]
    fn grown_file_gets_zero_pages_beyond_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2619");
        let mut data = page(Lsn(0x10), 0xAA);
        data.extend(page(Lsn(0x50), 0xBB));
        std::fs::write(&path, &data).unwrap();

        // Parent saw only the first page.
        let inc = extract_increment(&path, Lsn(0x20)).unwrap().unwrap();
        let base = page(Lsn(0x10), 0xAA);
        let rebuilt = apply_increment(&inc, Some(&base)).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn apply_rejects_corrupt_streams() {
        assert!(matches!(
            apply_increment(b"short", None),
            Err(PgVaultError::Corrupt(_))
        ));

        let mut bad_magic = vec![0u8; 16];
        bad_magic[0..4].copy_from_slice(b"nope");
        assert!(matches!(
            apply_increment(&bad_magic, None),
            Err(PgVaultError::Corrupt(_))
        ));

        // Declared one record but no bytes follow.
        let mut truncated = Vec::new();
        truncated.extend_from_slice(&INCREMENT_MAGIC);
        truncated.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        truncated.extend_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            apply_increment(&truncated, None),
            Err(PgVaultError::Corrupt(_))
        ));
    }

    #[test]
    fn empty_increment_reproduces_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2619");
        let data = page(Lsn(0x10), 0xAA);
        std::fs::write(&path, &data).unwrap();

        let inc = extract_increment(&path, Lsn(0x20)).unwrap().unwrap();
        let rebuilt = apply_increment(&inc, Some(&data)).unwrap();
        assert_eq!(rebuilt, data);
    }
}
