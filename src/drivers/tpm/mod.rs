//! TPM 2.0 TIS (TPM Interface Specification) MMIO driver.
//!
//! Drives a TPM over its memory-mapped locality windows: locality
//! acquisition, status polling, and command FIFO transfer in both
//! directions. The command encodings live in [`commands`]; the labeled
//! key-value layer over NV indices lives in [`storage`]; base-address
//! autodiscovery lives in [`discover`].
//!
//! # Register layout
//!
//! Each locality owns a 4 KiB window at `base + locality * 0x1000`:
//!
//! ```text
//! +0x00  ACCESS           +0x14  INTF_CAPABILITY
//! +0x08  INT_ENABLE       +0x18  STS (burst count in bits 8-23)
//! +0x0C  INT_VECTOR       +0x24  DATA_FIFO
//! +0x10  INT_STATUS
//! ```
//!
//! Only the owner hierarchy with empty authorization is used; there is no
//! session cryptography here.

use core::fmt;

use crate::hal::{self, Hal};
use crate::mmio;

pub mod commands;
pub mod discover;
pub mod storage;


/// Size of one locality register window.
pub const TPM_LOCALITY_STRIDE: u64 = 0x1000;

// Register offsets within a locality window.
pub const TPM_ACCESS: u64 = 0x00;
pub const TPM_INT_ENABLE: u64 = 0x08;
pub const TPM_INT_VECTOR: u64 = 0x0C;
pub const TPM_INT_STATUS: u64 = 0x10;
pub const TPM_INTF_CAPABILITY: u64 = 0x14;
pub const TPM_STS: u64 = 0x18;
pub const TPM_DATA_FIFO: u64 = 0x24;

// ACCESS bits
pub const TPM_ACCESS_VALID: u8 = 0x80;
const TPM_ACCESS_ACTIVE_LOCALITY: u8 = 0x20;
const TPM_ACCESS_REQUEST_USE: u8 = 0x02;

// STS bits
pub const TPM_STS_VALID: u32 = 0x80;
pub const TPM_STS_COMMAND_READY: u32 = 0x40;
pub const TPM_STS_GO: u32 = 0x20;
pub const TPM_STS_DATA_AVAIL: u32 = 0x10;
pub const TPM_STS_DATA_EXPECT: u32 = 0x08;

const TPM_STS_BURST_SHIFT: u32 = 8;
const TPM_STS_BURST_MASK: u32 = 0xFFFF;

// Poll budgets.
const TIMEOUT_LOCALITY_MS: u64 = 10;
const TIMEOUT_READY_MS: u64 = 100;
const TIMEOUT_VALID_MS: u64 = 100;
const TIMEOUT_EXEC_MS: u64 = 2_000;

/// Errors surfaced by the TPM stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmError {
    /// No TPM located by any discovery method.
    NotFound,
    /// The TPM did not grant the requested locality.
    LocalityDenied,
    /// A status bit did not appear within its budget.
    Timeout,
    /// The TPM returned a non-success response code.
    Protocol { rc: u32 },
    /// The response was too short to carry a header.
    ShortResponse,
    /// The value is larger than the NV layer stores.
    ValueTooLarge,
    /// The stored value does not fit the caller's buffer.
    BufferTooSmall,
    /// No label stored under this name.
    LabelNotFound,
    /// The driver has not been initialized.
    NotInitialized,
}

impl fmt::Display for TpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpmError::NotFound => write!(f, "no TPM device found"),
            TpmError::LocalityDenied => write!(f, "TPM locality not granted"),
            TpmError::Timeout => write!(f, "TPM status poll timed out"),
            TpmError::Protocol { rc } => write!(f, "TPM response code {:#x}", rc),
            TpmError::ShortResponse => write!(f, "TPM response shorter than a header"),
            TpmError::ValueTooLarge => write!(f, "value exceeds NV storage limit"),
            TpmError::BufferTooSmall => write!(f, "stored value exceeds caller buffer"),
            TpmError::LabelNotFound => write!(f, "no value stored under label"),
            TpmError::NotInitialized => write!(f, "TPM driver not initialized"),
        }
    }
}

/// A TPM 2.0 device behind a TIS MMIO window.
pub struct TpmDevice {
    hal: &'static dyn Hal,
    /// Physical base of locality 0.
    base: u64,
    /// Currently active locality. The driver acquires one and keeps it.
    locality: u8,
}

impl TpmDevice {
    /// Wrap a TPM at the given locality-0 base address.
    pub fn new(hal: &'static dyn Hal, base: u64) -> Self {
        TpmDevice {
            hal,
            base,
            locality: 0,
        }
    }

    fn locality_base(&self) -> u64 {
        self.base + self.locality as u64 * TPM_LOCALITY_STRIDE
    }

    fn sts(&self) -> u32 {
        mmio::read32(self.locality_base() + TPM_STS)
    }

    fn sts_write(&self, bits: u32) {
        mmio::write32(self.locality_base() + TPM_STS, bits);
    }

    /// Bytes the FIFO will accept or deliver right now. The interface may
    /// report zero mid-transfer; a minimum of one keeps progress.
    fn burst_count(&self) -> usize {
        let burst = (self.sts() >> TPM_STS_BURST_SHIFT) & TPM_STS_BURST_MASK;
        (burst as usize).max(1)
    }

    /// Request and wait for the given locality.
    pub fn set_locality(&mut self, locality: u8) -> Result<(), TpmError> {
        let window = self.base + locality as u64 * TPM_LOCALITY_STRIDE;
        mmio::write8(window + TPM_ACCESS, TPM_ACCESS_REQUEST_USE);

        let granted = hal::wait_until(self.hal, TIMEOUT_LOCALITY_MS, || {
            mmio::read8(window + TPM_ACCESS) & TPM_ACCESS_ACTIVE_LOCALITY != 0
        });
        if !granted {
            log::warn!("TPM: locality {} not granted", locality);
            return Err(TpmError::LocalityDenied);
        }
        self.locality = locality;
        Ok(())
    }

    /// Push a complete command into the FIFO and start execution.
    ///
    /// Bytes go in burst-sized chunks; after each chunk the driver waits for
    /// stsValid before trusting burstCount again. Finally GO is set and the
    /// call blocks until the response is available.
    pub fn send(&mut self, cmd: &[u8]) -> Result<(), TpmError> {
        let fifo = self.locality_base() + TPM_DATA_FIFO;

        if self.sts() & TPM_STS_COMMAND_READY == 0 {
            // Ask for the idle->ready transition (also aborts a stale
            // command).
            self.sts_write(TPM_STS_COMMAND_READY);
            let ready = hal::wait_until(self.hal, TIMEOUT_READY_MS, || {
                self.sts() & TPM_STS_COMMAND_READY != 0
            });
            if !ready {
                return Err(TpmError::Timeout);
            }
        }

        let mut sent = 0;
        while sent < cmd.len() {
            let burst = self.burst_count().min(cmd.len() - sent);
            for &byte in &cmd[sent..sent + burst] {
                mmio::write8(fifo, byte);
            }
            sent += burst;

            let valid = hal::wait_until(self.hal, TIMEOUT_VALID_MS, || {
                self.sts() & TPM_STS_VALID != 0
            });
            if !valid {
                return Err(TpmError::Timeout);
            }
        }

        self.sts_write(TPM_STS_GO);
        let available = hal::wait_until(self.hal, TIMEOUT_EXEC_MS, || {
            self.sts() & TPM_STS_DATA_AVAIL != 0
        });
        if !available {
            return Err(TpmError::Timeout);
        }
        Ok(())
    }

    /// Drain the response FIFO into `buf`, then return the TPM to idle.
    ///
    /// Reads stop when dataAvail clears or `buf` is full.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TpmError> {
        let fifo = self.locality_base() + TPM_DATA_FIFO;

        let available = hal::wait_until(self.hal, TIMEOUT_VALID_MS, || {
            self.sts() & TPM_STS_DATA_AVAIL != 0
        });
        if !available {
            return Err(TpmError::Timeout);
        }

        let mut n = 0;
        while self.sts() & TPM_STS_DATA_AVAIL != 0 && n < buf.len() {
            let burst = self.burst_count().min(buf.len() - n);
            for slot in &mut buf[n..n + burst] {
                *slot = mmio::read8(fifo);
            }
            n += burst;
        }

        // Back to idle/ready for the next command.
        self.sts_write(TPM_STS_COMMAND_READY);
        Ok(n)
    }

    /// Run one command to completion and return the response length.
    ///
    /// The response header is validated for size only; response-code
    /// handling is the caller's business (some codes are benign in
    /// context).
    pub fn execute(&mut self, cmd: &[u8], resp: &mut [u8]) -> Result<usize, TpmError> {
        self.send(cmd)?;
        let n = self.recv(resp)?;
        if n < commands::RESPONSE_HEADER_LEN {
            return Err(TpmError::ShortResponse);
        }
        Ok(n)
    }

    /// Bring the TPM to a usable state: Startup(CLEAR) then a full
    /// self-test. A TPM that was already started answers Startup with
    /// TPM_RC_INITIALIZE, which is benign here.
    pub fn startup(&mut self) -> Result<(), TpmError> {
        let mut resp = [0u8; 64];

        let cmd = commands::startup_clear();
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if rc != commands::TPM_RC_SUCCESS && rc != commands::TPM_RC_INITIALIZE {
            return Err(TpmError::Protocol { rc });
        }

        let cmd = commands::self_test_full();
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if rc != commands::TPM_RC_SUCCESS {
            return Err(TpmError::Protocol { rc });
        }

        log::info!("TPM: started at {:#x}, locality {}", self.base, self.locality);
        Ok(())
    }

    /// Locality-0 base address of this device.
    pub fn base(&self) -> u64 {
        self.base
    }
}
