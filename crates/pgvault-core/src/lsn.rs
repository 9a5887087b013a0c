use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PgVaultError;

/// Log sequence number: a 64-bit position in the write-ahead log.
///
/// Displayed in the database's `X/X` notation (high 32 bits, slash, low 32
/// bits); stored in sentinels as a plain integer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Number of the WAL segment containing this position.
    pub fn segment_number(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl FromStr for Lsn {
    type Err = PgVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| PgVaultError::Config(format!("invalid LSN '{s}': expected X/X")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| PgVaultError::Config(format!("invalid LSN '{s}': {e}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| PgVaultError::Config(format!("invalid LSN '{s}': {e}")))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(PgVaultError::Config(format!("invalid LSN '{s}': out of range")));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}
