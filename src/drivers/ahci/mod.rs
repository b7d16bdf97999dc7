//! AHCI (Advanced Host Controller Interface) Storage Driver
//!
//! Implements polled AHCI access to SATA drives: controller discovery over
//! PCI, per-port bring-up, and DMA command execution.
//!
//! # Architecture
//!
//! AHCI exposes a Host Bus Adapter (HBA) via PCI BAR5 (ABAR). The HBA
//! manages up to 32 ports, each connected to a SATA device. Communication
//! uses DMA with command lists and FIS (Frame Information Structures) in
//! host memory.
//!
//! This driver issues one command at a time per port and polls the Command
//! Issue register for completion; NCQ and interrupt-driven completion are
//! deliberately not used.
//!
//! # Memory Layout (per port)
//!
//! - Command List: 1 KB (32 x 32-byte command headers)
//! - Received FIS: 256 bytes
//! - Command Table: CFIS + PRDT
//! - Bounce buffer: 64 KB (one full-size transfer)

use core::fmt;

use crate::hal::Hal;
use crate::mmio;
use crate::pci::{self, ConfigSpace, DeviceClass};

pub mod ata;
pub mod port;


pub use ata::IdentifyInfo;
pub use port::AhciPort;

/// Sector size in bytes (standard for SATA).
pub const SECTOR_SIZE: usize = 512;

/// Maximum number of AHCI ports.
pub const MAX_PORTS: usize = 32;

/// Maximum sectors accepted per command.
pub const MAX_SECTORS_PER_COMMAND: u64 = 128;

/// AHCI port register block size.
const PORT_REG_SIZE: u64 = 0x80;

// =============================================================================
// HBA Generic Host Control Registers (offset from ABAR)
// =============================================================================

/// Host Capabilities
const HBA_CAP: u64 = 0x00;
/// Global Host Control
const HBA_GHC: u64 = 0x04;
/// Ports Implemented
const HBA_PI: u64 = 0x0C;
/// Version
const HBA_VS: u64 = 0x10;

/// GHC bits
const GHC_AE: u32 = 1 << 31; // AHCI Enable

/// CAP bits
const CAP_S64A: u32 = 1 << 31; // Supports 64-bit Addressing

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by the AHCI stack.
///
/// Each variant maps to one failure source; none of them are panics. The
/// diagnostic-register variants carry the raw values so callers can log or
/// act on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// No AHCI function found on the PCI bus.
    NotFound,
    /// BAR5 is zero or not a memory BAR.
    BarInvalid,
    /// SSTS.DET reports no established device on the port.
    PortNotPresent,
    /// SSTS.IPM reports a non-active link power state.
    PortInactive,
    /// FRE or ST refused to latch during port start.
    PortStartFailed,
    /// Every command slot is busy.
    NoFreeSlot,
    /// The device never dropped BSY/DRQ before issue.
    PortBusy,
    /// The command did not complete within its deadline.
    TimedOut,
    /// The task file reported ERR or DF after completion.
    DeviceError { tfd: u32, serr: u32 },
    /// The HBA transferred fewer bytes than the command required.
    ShortTransfer { prdbc: u32 },
    /// The request requires 48-bit addressing the device lacks.
    Lba48Unsupported,
    /// More sectors than a single command may carry.
    TooLarge,
    /// The caller's buffer cannot hold the transfer.
    InvalidBuffer,
    /// No device, or the port index is out of range.
    InvalidPort,
    /// DMA memory allocation failed.
    OutOfMemory,
    /// The driver has not been initialized.
    NotInitialized,
}

impl fmt::Display for AhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AhciError::NotFound => write!(f, "no AHCI controller found"),
            AhciError::BarInvalid => write!(f, "ABAR (BAR5) is invalid"),
            AhciError::PortNotPresent => write!(f, "no device present on port"),
            AhciError::PortInactive => write!(f, "port link not in active power state"),
            AhciError::PortStartFailed => write!(f, "port command engine failed to start"),
            AhciError::NoFreeSlot => write!(f, "no free command slot"),
            AhciError::PortBusy => write!(f, "port stuck busy (BSY/DRQ)"),
            AhciError::TimedOut => write!(f, "command timed out"),
            AhciError::DeviceError { tfd, serr } => {
                write!(f, "device error (TFD={:#x}, SERR={:#x})", tfd, serr)
            }
            AhciError::ShortTransfer { prdbc } => {
                write!(f, "short transfer ({} bytes moved)", prdbc)
            }
            AhciError::Lba48Unsupported => write!(f, "LBA beyond 28 bits on a non-LBA48 device"),
            AhciError::TooLarge => write!(f, "transfer exceeds per-command sector limit"),
            AhciError::InvalidBuffer => write!(f, "buffer too small for transfer"),
            AhciError::InvalidPort => write!(f, "invalid or empty port"),
            AhciError::OutOfMemory => write!(f, "DMA memory allocation failed"),
            AhciError::NotInitialized => write!(f, "AHCI driver not initialized"),
        }
    }
}

/// AHCI device type, from the port signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Sata,
    Atapi,
    EnclosureBridge,
    PortMultiplier,
    Unknown,
}

/// Device signatures
const SIG_SATA: u32 = 0x0000_0101;
const SIG_ATAPI: u32 = 0xEB14_0101;
const SIG_SEMB: u32 = 0xC33C_0101;
const SIG_PM: u32 = 0x9669_0101;

impl DeviceType {
    fn from_signature(sig: u32) -> Self {
        match sig {
            SIG_SATA => DeviceType::Sata,
            SIG_ATAPI => DeviceType::Atapi,
            SIG_SEMB => DeviceType::EnclosureBridge,
            SIG_PM => DeviceType::PortMultiplier,
            _ => DeviceType::Unknown,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// A single AHCI controller: the HBA register window plus its ports.
pub struct AhciController {
    /// ABAR: physical base of the HBA register window.
    abar: u64,
    /// Number of command slots per port (CAP.NCS + 1).
    num_cmd_slots: u32,
    /// Whether the HBA can address 64-bit DMA structures (CAP.S64A).
    supports_64bit: bool,
    /// Bitmask of implemented ports (PI).
    ports_implemented: u32,
    /// Port states; `None` where nothing usable is attached.
    ports: [Option<AhciPort>; MAX_PORTS],
}

impl AhciController {
    /// Find the AHCI function on the PCI bus and bring the controller up.
    ///
    /// The first function with class/subclass/prog-IF = 01h/06h/01h and a
    /// configured memory BAR5 wins. Returns `NotFound` if nothing matched
    /// and `BarInvalid` if the match has no usable ABAR.
    pub fn discover(hal: &'static dyn Hal, cfg: ConfigSpace) -> Result<Self, AhciError> {
        let devices = pci::enumerate(&cfg);
        let ahci_dev = devices
            .iter()
            .find(|d| d.class == DeviceClass::MassStorage && d.subclass == 0x06 && d.prog_if == 0x01)
            .ok_or(AhciError::NotFound)?;

        log::info!(
            "AHCI: found controller {:04x}:{:04x} at {:02x}:{:02x}.{}",
            ahci_dev.vendor_id,
            ahci_dev.device_id,
            ahci_dev.bus,
            ahci_dev.device,
            ahci_dev.function,
        );

        let bar5 = &ahci_dev.bars[5];
        if !bar5.is_valid() || bar5.is_io || bar5.address == 0 {
            return Err(AhciError::BarInvalid);
        }
        let abar = bar5.address & !0xF;

        // The HBA must be reachable and allowed to master the bus before we
        // touch the ABAR.
        ahci_dev.enable(&cfg);

        Self::init_common(hal, abar)
    }

    /// Bring up a controller at a known ABAR (no PCI involvement).
    pub fn with_abar(hal: &'static dyn Hal, abar: u64) -> Result<Self, AhciError> {
        Self::init_common(hal, abar)
    }

    /// Common controller initialization: AHCI mode, capabilities, ports.
    fn init_common(hal: &'static dyn Hal, abar: u64) -> Result<Self, AhciError> {
        // Enable AHCI mode
        let ghc = mmio::read32(abar + HBA_GHC);
        mmio::write32(abar + HBA_GHC, ghc | GHC_AE);

        let cap = mmio::read32(abar + HBA_CAP);
        let num_cmd_slots = ((cap >> 8) & 0x1F) + 1;
        let num_ports = (cap & 0x1F) + 1;
        let supports_64bit = (cap & CAP_S64A) != 0;
        let ports_implemented = mmio::read32(abar + HBA_PI);
        let version = mmio::read32(abar + HBA_VS);

        log::info!(
            "AHCI: HBA version {}.{}, {} ports, {} cmd slots, 64-bit: {}, PI={:#010x}",
            version >> 16,
            version & 0xFFFF,
            num_ports,
            num_cmd_slots,
            supports_64bit,
            ports_implemented,
        );

        let mut controller = AhciController {
            abar,
            num_cmd_slots,
            supports_64bit,
            ports_implemented,
            ports: core::array::from_fn(|_| None),
        };

        for port_num in 0..MAX_PORTS {
            if (ports_implemented & (1 << port_num)) == 0 {
                continue;
            }
            match AhciPort::bring_up(
                hal,
                abar + 0x100 + (port_num as u64) * PORT_REG_SIZE,
                port_num as u8,
                num_cmd_slots,
                supports_64bit,
            ) {
                Ok(port) => {
                    log::info!(
                        "AHCI: port {} up, device type {:?}",
                        port_num,
                        port.device_type()
                    );
                    controller.ports[port_num] = Some(port);
                }
                Err(AhciError::PortNotPresent) => {
                    log::debug!("AHCI: port {} has no device", port_num);
                }
                Err(e) => {
                    log::warn!("AHCI: port {} failed to start: {}", port_num, e);
                }
            }
        }

        Ok(controller)
    }

    /// Number of ports that came up with a device attached.
    pub fn ready_ports(&self) -> usize {
        self.ports.iter().flatten().count()
    }

    /// Borrow a port by index.
    pub fn port_mut(&mut self, index: usize) -> Result<&mut AhciPort, AhciError> {
        self.ports
            .get_mut(index)
            .and_then(|p| p.as_mut())
            .ok_or(AhciError::InvalidPort)
    }

    /// ABAR of this controller.
    pub fn abar(&self) -> u64 {
        self.abar
    }

    /// Bitmask of implemented ports.
    pub fn ports_implemented(&self) -> u32 {
        self.ports_implemented
    }

    /// Command slots per port, as reported by CAP.NCS.
    pub fn num_cmd_slots(&self) -> u32 {
        self.num_cmd_slots
    }

    /// Whether the HBA can address 64-bit DMA structures.
    pub fn supports_64bit(&self) -> bool {
        self.supports_64bit
    }
}
