//! Bare-metal block storage for x86-64.
//!
//! This crate drives SATA disks through an AHCI host bus adapter found over
//! the PCI configuration space, and a TPM 2.0 device over memory-mapped I/O
//! for a small labeled secure-storage API. Completion is discovered by
//! polling; there is no interrupt path and no command queuing.
//!
//! # Architecture
//!
//! The stack is layered bottom-up:
//!
//! - `mmio`: volatile 8/16/32-bit register access and bounded spin-waits
//! - `pci`: configuration-space access (0xCF8/0xCFC or ECAM) and enumeration
//! - `drivers::ahci`: HBA discovery, the per-port command engine, and the
//!   ATA command layer (IDENTIFY, READ/WRITE DMA (EXT), FLUSH CACHE)
//! - `drivers::tpm`: TIS locality/FIFO driver, TPM 2.0 NV commands, and the
//!   labeled key-value layer
//! - `block`: the sector string helpers
//!
//! The surrounding platform supplies a [`hal::Hal`] with a delay source and
//! virtual-to-physical translation (identity on identity-mapped systems).
//! Trace output goes through the `log` facade; with no logger installed the
//! core runs silently.
//!
//! # Entry points
//!
//! [`disk_init`] discovers and brings up the first AHCI controller, after
//! which [`identify`], [`read_sectors`], [`write_sectors`] and [`flush`]
//! operate on its ports. [`tpm_init`] locates the TPM and opens locality 0,
//! after which [`tpm_store`] / [`tpm_retrieve`] provide the labeled store.
//! The disk and TPM paths are independent: either may fail without affecting
//! the other.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod hal;
pub mod mmio;
pub mod pci;

#[cfg(test)]
pub(crate) mod sim;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use block::SectorString;
use drivers::ahci::{AhciController, AhciError, IdentifyInfo};
use drivers::tpm::{self, TpmDevice, TpmError};
use hal::Hal;
use pci::ConfigSpace;

/// Global AHCI controller, installed by `disk_init`.
static DISK: Mutex<Option<AhciController>> = Mutex::new(None);

/// Global TPM device, installed by `tpm_init`.
static TPM: Mutex<Option<TpmDevice>> = Mutex::new(None);

/// Discovered TPM base address; discovery walks PCI and ACPI, so the result
/// is cached across re-initializations.
static TPM_BASE: OnceCell<u64> = OnceCell::uninit();

/// Discover the AHCI controller over the 0xCF8/0xCFC port pair and bring up
/// every implemented port. Returns the number of ports with a ready device.
pub fn disk_init(hal: &'static dyn Hal) -> Result<usize, AhciError> {
    disk_init_with(hal, ConfigSpace::PortIo)
}

/// As [`disk_init`], but with an explicit configuration-space access method
/// (e.g. an ECAM window on platforms that expose one).
pub fn disk_init_with(hal: &'static dyn Hal, cfg: ConfigSpace) -> Result<usize, AhciError> {
    let controller = AhciController::discover(hal, cfg)?;
    let ready = controller.ready_ports();
    *DISK.lock() = Some(controller);
    Ok(ready)
}

fn with_disk<T>(f: impl FnOnce(&mut AhciController) -> Result<T, AhciError>) -> Result<T, AhciError> {
    let mut guard = DISK.lock();
    let controller = guard.as_mut().ok_or(AhciError::NotInitialized)?;
    f(controller)
}

/// Issue IDENTIFY DEVICE on the given port and return the parsed record.
pub fn identify(port: usize) -> Result<IdentifyInfo, AhciError> {
    with_disk(|c| c.port_mut(port)?.identify())
}

/// Read `count` sectors starting at `lba` into `buf`.
pub fn read_sectors(port: usize, lba: u64, count: u64, buf: &mut [u8]) -> Result<(), AhciError> {
    with_disk(|c| c.port_mut(port)?.read_sectors(lba, count, buf))
}

/// Write `count` sectors starting at `lba` from `buf`.
///
/// The device may hold the data in its volatile write cache afterwards; this
/// function does NOT issue FLUSH CACHE. Callers that need the data on stable
/// media must call [`flush`] explicitly.
pub fn write_sectors(port: usize, lba: u64, count: u64, buf: &[u8]) -> Result<(), AhciError> {
    with_disk(|c| c.port_mut(port)?.write_sectors(lba, count, buf))
}

/// Issue FLUSH CACHE (EXT) on the given port.
pub fn flush(port: usize) -> Result<(), AhciError> {
    with_disk(|c| c.port_mut(port)?.flush())
}

/// Write a NUL-terminated string into one sector, zero-filling the remainder.
pub fn write_string_to_sector(port: usize, lba: u64, s: &str) -> Result<(), AhciError> {
    with_disk(|c| c.port_mut(port)?.write_string_to_sector(lba, s))
}

/// Read one sector and copy its leading NUL-terminated string into `out`.
pub fn read_string_from_sector(
    port: usize,
    lba: u64,
    out: &mut [u8],
) -> Result<SectorString, AhciError> {
    with_disk(|c| c.port_mut(port)?.read_string_from_sector(lba, out))
}

/// Locate the TPM (PCI, then ACPI, then the well-known bases), open
/// locality 0 and run Startup/SelfTest.
pub fn tpm_init(hal: &'static dyn Hal) -> Result<(), TpmError> {
    tpm_init_with(hal, ConfigSpace::PortIo)
}

/// As [`tpm_init`], with an explicit configuration-space access method.
pub fn tpm_init_with(hal: &'static dyn Hal, cfg: ConfigSpace) -> Result<(), TpmError> {
    let base = match TPM_BASE.get() {
        Some(&base) => base,
        None => {
            let found = tpm::discover::discover(cfg).ok_or(TpmError::NotFound)?;
            let _ = TPM_BASE.try_init_once(|| found);
            found
        }
    };
    let mut dev = TpmDevice::new(hal, base);
    dev.set_locality(0)?;
    dev.startup()?;
    *TPM.lock() = Some(dev);
    Ok(())
}

fn with_tpm<T>(f: impl FnOnce(&mut TpmDevice) -> Result<T, TpmError>) -> Result<T, TpmError> {
    let mut guard = TPM.lock();
    let dev = guard.as_mut().ok_or(TpmError::NotInitialized)?;
    f(dev)
}

/// Store `bytes` under `label` in TPM non-volatile storage.
pub fn tpm_store(label: &str, bytes: &[u8]) -> Result<(), TpmError> {
    with_tpm(|t| t.store(label, bytes))
}

/// Retrieve the value stored under `label`. Returns the number of bytes
/// copied into `out`.
pub fn tpm_retrieve(label: &str, out: &mut [u8]) -> Result<usize, TpmError> {
    with_tpm(|t| t.retrieve(label, out))
}
