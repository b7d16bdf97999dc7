//! ATA command layer.
//!
//! Builds Host-to-Device Register FISes for IDENTIFY DEVICE, READ/WRITE DMA
//! (EXT) and FLUSH CACHE (EXT), selects the 28-bit or 48-bit command
//! variant, and parses the 512-byte IDENTIFY block.

use alloc::string::String;

use super::port::AhciPort;
use super::{AhciError, MAX_SECTORS_PER_COMMAND, SECTOR_SIZE};

// =============================================================================
// FIS
// =============================================================================

/// Host to Device Register FIS type
const FIS_TYPE_REG_H2D: u8 = 0x27;

// =============================================================================
// ATA Commands
// =============================================================================

/// IDENTIFY DEVICE
const ATA_CMD_IDENTIFY: u8 = 0xEC;
/// READ DMA (28-bit LBA)
const ATA_CMD_READ_DMA: u8 = 0xC8;
/// READ DMA EXT (48-bit LBA)
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
/// WRITE DMA (28-bit LBA)
const ATA_CMD_WRITE_DMA: u8 = 0xCA;
/// WRITE DMA EXT (48-bit LBA)
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
/// FLUSH CACHE
const ATA_CMD_FLUSH: u8 = 0xE7;
/// FLUSH CACHE EXT
const ATA_CMD_FLUSH_EXT: u8 = 0xEA;

/// Device register: LBA mode
const ATA_DEVICE_LBA: u8 = 0x40;

/// Commands addressing more sectors than this need the EXT (48-bit) variant.
const LBA28_LIMIT: u64 = 1 << 28;

/// IDENTIFY completion budget.
const IDENTIFY_TIMEOUT_MS: u64 = 5_000;
/// Data transfer completion budget.
const DATA_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// IDENTIFY
// =============================================================================

/// Parsed IDENTIFY DEVICE data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    /// Model string (words 27-46), byte-swapped and trimmed.
    pub model: String,
    /// Serial string (words 10-19), byte-swapped and trimmed.
    pub serial: String,
    /// LBA addressing supported (word 49 bit 9).
    pub lba: bool,
    /// 48-bit addressing supported (word 83 bit 10).
    pub lba48: bool,
    /// Addressable sectors in 28-bit mode (words 60-61).
    pub max_lba28: u32,
    /// Addressable sectors in 48-bit mode (words 100-103).
    pub max_lba48: u64,
    /// Highest supported SATA generation (word 76 bits 1-3), 0 if unknown.
    pub sata_gen: u8,
    /// Command set / feature words 82-87, verbatim.
    pub features: [u16; 6],
}

impl IdentifyInfo {
    /// Sectors this device can address with the commands we will use.
    pub fn sector_count(&self) -> u64 {
        if self.lba48 {
            self.max_lba48
        } else {
            self.max_lba28 as u64
        }
    }
}

/// Decode an ATA string field: within each 16-bit word the high byte comes
/// first. Trailing spaces (and any stray NULs) are trimmed.
fn ata_string(words: &[u16]) -> String {
    let mut bytes = alloc::vec::Vec::with_capacity(words.len() * 2);
    for &w in words {
        bytes.push((w >> 8) as u8);
        bytes.push((w & 0xFF) as u8);
    }
    while matches!(bytes.last(), Some(&b' ') | Some(&0)) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse a raw 512-byte IDENTIFY block (256 little-endian words).
fn parse_identify(block: &[u8; SECTOR_SIZE]) -> IdentifyInfo {
    let mut words = [0u16; 256];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u16::from_le_bytes([block[i * 2], block[i * 2 + 1]]);
    }

    let max_lba28 = (words[60] as u32) | ((words[61] as u32) << 16);
    let max_lba48 = (words[100] as u64)
        | ((words[101] as u64) << 16)
        | ((words[102] as u64) << 32)
        | ((words[103] as u64) << 48);

    let sata_caps = words[76];
    let sata_gen = if sata_caps & (1 << 3) != 0 {
        3
    } else if sata_caps & (1 << 2) != 0 {
        2
    } else if sata_caps & (1 << 1) != 0 {
        1
    } else {
        0
    };

    let mut features = [0u16; 6];
    features.copy_from_slice(&words[82..88]);

    IdentifyInfo {
        model: ata_string(&words[27..47]),
        serial: ata_string(&words[10..20]),
        lba: words[49] & (1 << 9) != 0,
        lba48: words[83] & (1 << 10) != 0,
        max_lba28,
        max_lba48,
        sata_gen,
        features,
    }
}

// =============================================================================
// FIS construction and command selection
// =============================================================================

/// Build a 20-byte H2D Register FIS with the C bit set.
///
/// The 48-bit LBA is split into two 24-bit halves: bytes 4-6 carry bits
/// 0-23, bytes 8-10 carry bits 24-47.
fn build_h2d_fis(command: u8, device: u8, lba: u64, count: u16) -> [u8; 20] {
    let mut fis = [0u8; 20];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = 0x80; // C bit: command, not device control
    fis[2] = command;
    fis[4] = lba as u8; // LBA 7:0
    fis[5] = (lba >> 8) as u8; // LBA 15:8
    fis[6] = (lba >> 16) as u8; // LBA 23:16
    fis[7] = device;
    fis[8] = (lba >> 24) as u8; // LBA 31:24
    fis[9] = (lba >> 32) as u8; // LBA 39:32
    fis[10] = (lba >> 40) as u8; // LBA 47:40
    fis[12] = count as u8;
    fis[13] = (count >> 8) as u8;
    fis
}

/// Pick the transfer opcode and device register for a read or write.
///
/// The 48-bit variant is mandatory past the 28-bit boundary and preferred
/// whenever the device has it (one uniform code path); a request past the
/// boundary on a non-LBA48 device is rejected before any MMIO.
fn select_transfer(
    write: bool,
    lba: u64,
    count: u64,
    lba48: bool,
) -> Result<(u8, u8), AhciError> {
    let past_lba28 = lba.saturating_add(count) > LBA28_LIMIT;
    if lba48 {
        let opcode = if write {
            ATA_CMD_WRITE_DMA_EXT
        } else {
            ATA_CMD_READ_DMA_EXT
        };
        Ok((opcode, ATA_DEVICE_LBA))
    } else if past_lba28 {
        Err(AhciError::Lba48Unsupported)
    } else {
        let opcode = if write { ATA_CMD_WRITE_DMA } else { ATA_CMD_READ_DMA };
        // In 28-bit mode LBA bits 24-27 ride in the device register.
        Ok((opcode, ATA_DEVICE_LBA | ((lba >> 24) & 0x0F) as u8))
    }
}

// =============================================================================
// Port-level ATA operations
// =============================================================================

impl AhciPort {
    /// Issue IDENTIFY DEVICE and parse the result.
    ///
    /// Also caches the device's LBA48 capability and sector count on the
    /// port, which the read/write path consults afterwards.
    pub fn identify(&mut self) -> Result<IdentifyInfo, AhciError> {
        let fis = build_h2d_fis(ATA_CMD_IDENTIFY, ATA_DEVICE_LBA, 0, 0);
        // W=1: the device fills the identify buffer.
        self.exec_command(&fis, true, SECTOR_SIZE as u32, IDENTIFY_TIMEOUT_MS)?;

        let mut block = [0u8; SECTOR_SIZE];
        block.copy_from_slice(self.bounce(SECTOR_SIZE));
        let info = parse_identify(&block);

        log::info!(
            "AHCI: port {} \"{}\" serial \"{}\" lba48={} sectors={}",
            self.id(),
            info.model,
            info.serial,
            info.lba48,
            info.sector_count(),
        );

        self.set_identify_caps(info.lba48, info.sector_count());
        Ok(info)
    }

    /// Read `count` sectors starting at `lba` into `buf`.
    ///
    /// `count == 0` returns immediately without touching the hardware.
    pub fn read_sectors(&mut self, lba: u64, count: u64, buf: &mut [u8]) -> Result<(), AhciError> {
        let byte_len = validate_transfer(lba, count, buf.len())?;
        if byte_len == 0 {
            return Ok(());
        }
        let (opcode, device) = select_transfer(false, lba, count, self.lba48())?;
        let fis = build_h2d_fis(opcode, device, lba, count as u16);

        self.exec_command(&fis, true, byte_len, DATA_TIMEOUT_MS)?;
        buf[..byte_len as usize].copy_from_slice(self.bounce(byte_len as usize));
        Ok(())
    }

    /// Write `count` sectors starting at `lba` from `buf`.
    ///
    /// The data may still sit in the device's volatile write cache when this
    /// returns; durability requires an explicit [`AhciPort::flush`]. This
    /// driver never flushes on the caller's behalf.
    pub fn write_sectors(&mut self, lba: u64, count: u64, buf: &[u8]) -> Result<(), AhciError> {
        let byte_len = validate_transfer(lba, count, buf.len())?;
        if byte_len == 0 {
            return Ok(());
        }
        let (opcode, device) = select_transfer(true, lba, count, self.lba48())?;
        let fis = build_h2d_fis(opcode, device, lba, count as u16);

        self.bounce_mut(byte_len as usize)
            .copy_from_slice(&buf[..byte_len as usize]);
        self.exec_command(&fis, false, byte_len, DATA_TIMEOUT_MS)
    }

    /// Issue FLUSH CACHE (EXT on LBA48 devices): force the write cache to
    /// stable media.
    pub fn flush(&mut self) -> Result<(), AhciError> {
        let opcode = if self.lba48() {
            ATA_CMD_FLUSH_EXT
        } else {
            ATA_CMD_FLUSH
        };
        let fis = build_h2d_fis(opcode, ATA_DEVICE_LBA, 0, 0);
        self.exec_command(&fis, false, 0, DATA_TIMEOUT_MS)
    }
}

/// Entry validation shared by reads and writes. Returns the transfer length
/// in bytes; all failures here happen before any MMIO.
fn validate_transfer(_lba: u64, count: u64, buf_len: usize) -> Result<u32, AhciError> {
    if count == 0 {
        return Ok(0);
    }
    if count > MAX_SECTORS_PER_COMMAND {
        return Err(AhciError::TooLarge);
    }
    let byte_len = count as usize * SECTOR_SIZE;
    if buf_len < byte_len {
        return Err(AhciError::InvalidBuffer);
    }
    Ok(byte_len as u32)
}
