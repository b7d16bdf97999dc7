//! Sector string helpers.
//!
//! A stored string occupies one sector: the text, a NUL terminator, and
//! zero-fill to 512 bytes. Readers scan for the NUL; a sector with no NUL in
//! it is treated as non-string data, and the destination is always
//! NUL-terminated regardless.

use crate::drivers::ahci::port::AhciPort;
use crate::drivers::ahci::{AhciError, SECTOR_SIZE};

/// Outcome of reading a string out of a sector: how many bytes were copied,
/// and whether the source had to be cut to fit the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorString {
    /// The whole string fit; `len` bytes were copied (NUL not counted).
    Complete(usize),
    /// The destination was too small; `len` bytes were copied and the rest
    /// dropped.
    Truncated(usize),
}

/// Lay a string out in a zeroed sector image. Fails if the text plus its
/// terminator cannot fit.
fn encode_sector(s: &str) -> Result<[u8; SECTOR_SIZE], AhciError> {
    if s.len() + 1 > SECTOR_SIZE {
        return Err(AhciError::TooLarge);
    }
    let mut sector = [0u8; SECTOR_SIZE];
    sector[..s.len()].copy_from_slice(s.as_bytes());
    // The terminator and the rest of the sector are already zero.
    Ok(sector)
}

/// Copy the leading NUL-terminated string of a sector into `out`, always
/// leaving `out` NUL-terminated.
fn extract_string(sector: &[u8; SECTOR_SIZE], out: &mut [u8]) -> SectorString {
    // Without a NUL the whole sector counts as (non-string) source data.
    let source_len = sector
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(SECTOR_SIZE);

    let capacity = out.len().saturating_sub(1);
    let copied = source_len.min(capacity);
    out[..copied].copy_from_slice(&sector[..copied]);
    if !out.is_empty() {
        out[copied] = 0;
    }

    if copied < source_len {
        SectorString::Truncated(copied)
    } else {
        SectorString::Complete(copied)
    }
}

impl AhciPort {
    /// Write `s` into the sector at `lba`: the string, a NUL, zero-fill.
    ///
    /// Rejects strings that cannot fit alongside their terminator.
    pub fn write_string_to_sector(&mut self, lba: u64, s: &str) -> Result<(), AhciError> {
        let sector = encode_sector(s)?;
        self.write_sectors(lba, 1, &sector)
    }

    /// Read the sector at `lba` and copy its leading string into `out`.
    ///
    /// `out` is always NUL-terminated on success; `Truncated` reports a
    /// source longer than the destination.
    pub fn read_string_from_sector(
        &mut self,
        lba: u64,
        out: &mut [u8],
    ) -> Result<SectorString, AhciError> {
        if out.is_empty() {
            return Err(AhciError::InvalidBuffer);
        }
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sectors(lba, 1, &mut sector)?;
        Ok(extract_string(&sector, out))
    }
}
