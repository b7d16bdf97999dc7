//! PCI Bus Enumeration and Device Discovery
//!
//! This module provides PCI configuration space access and device
//! enumeration for locating the AHCI host adapter and (optionally) a
//! PCI-attached TPM.
//!
//! # Architecture
//!
//! Legacy access uses two I/O ports:
//! - CONFIG_ADDRESS (0xCF8): the address of the config register to access
//! - CONFIG_DATA (0xCFC): the configuration data itself
//!
//! The address format is:
//! ```text
//! Bit 31    : Enable bit (must be 1)
//! Bits 23-16: Bus number (0-255)
//! Bits 15-11: Device number (0-31)
//! Bits 10-8 : Function number (0-7)
//! Bits 7-2  : Register offset (32-bit aligned)
//! Bits 1-0  : Must be 0
//! ```
//!
//! Platforms that expose an ECAM window can use it instead; the register
//! layout is identical, addressed as `base | bus<<20 | dev<<15 | fn<<12 | off`.
//!
//! All narrow (8/16-bit) accesses are performed as an aligned DWord access
//! plus shift-and-mask. Some chipsets do not honor narrow accesses to the
//! data port, and the DWord form behaves identically everywhere.

use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::mmio;

/// PCI configuration address port
const CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port
const CONFIG_DATA: u16 = 0xCFC;

/// Maximum number of PCI buses to scan
const MAX_BUS: u8 = 255;
/// Maximum number of devices per bus
const MAX_DEVICE: u8 = 32;
/// Maximum number of functions per device
const MAX_FUNCTION: u8 = 8;

/// The 0xCF8/0xCFC pair is a single-writer resource: an address write and
/// the following data access must not interleave with another pair.
static CONFIG_PORTS: Mutex<()> = Mutex::new(());

/// Intel vendor ID (common in QEMU)
pub const INTEL_VENDOR_ID: u16 = 0x8086;
/// Red Hat / QEMU vendor ID
pub const QEMU_VENDOR_ID: u16 = 0x1B36;

/// PCI device class codes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceClass {
    Legacy = 0x00,
    MassStorage = 0x01,
    Network = 0x02,
    Display = 0x03,
    Multimedia = 0x04,
    Memory = 0x05,
    Bridge = 0x06,
    SimpleCommunication = 0x07,
    BaseSystemPeripheral = 0x08,
    InputDevice = 0x09,
    DockingStation = 0x0A,
    Processor = 0x0B,
    SerialBus = 0x0C,
    Wireless = 0x0D,
    IntelligentIO = 0x0E,
    SatelliteCommunication = 0x0F,
    Encryption = 0x10,
    SignalProcessing = 0x11,
    Unknown = 0xFF,
}

impl DeviceClass {
    fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DeviceClass::Legacy,
            0x01 => DeviceClass::MassStorage,
            0x02 => DeviceClass::Network,
            0x03 => DeviceClass::Display,
            0x04 => DeviceClass::Multimedia,
            0x05 => DeviceClass::Memory,
            0x06 => DeviceClass::Bridge,
            0x07 => DeviceClass::SimpleCommunication,
            0x08 => DeviceClass::BaseSystemPeripheral,
            0x09 => DeviceClass::InputDevice,
            0x0A => DeviceClass::DockingStation,
            0x0B => DeviceClass::Processor,
            0x0C => DeviceClass::SerialBus,
            0x0D => DeviceClass::Wireless,
            0x0E => DeviceClass::IntelligentIO,
            0x0F => DeviceClass::SatelliteCommunication,
            0x10 => DeviceClass::Encryption,
            0x11 => DeviceClass::SignalProcessing,
            _ => DeviceClass::Unknown,
        }
    }
}

/// How configuration space is reached on this platform.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigSpace {
    /// The legacy 0xCF8/0xCFC I/O port pair.
    PortIo,
    /// A memory-mapped ECAM window at the given physical base.
    Ecam { base: u64 },
}

impl ConfigSpace {
    /// Read a 32-bit value from configuration space.
    pub fn read32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        match *self {
            ConfigSpace::PortIo => portio_read_dword(bus, device, function, offset),
            ConfigSpace::Ecam { base } => {
                mmio::read32(ecam_address(base, bus, device, function, offset))
            }
        }
    }

    /// Write a 32-bit value to configuration space.
    pub fn write32(&self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
        match *self {
            ConfigSpace::PortIo => portio_write_dword(bus, device, function, offset, value),
            ConfigSpace::Ecam { base } => {
                mmio::write32(ecam_address(base, bus, device, function, offset), value)
            }
        }
    }

    /// Read a 16-bit value (DWord read, then extract).
    pub fn read16(&self, bus: u8, device: u8, function: u8, offset: u8) -> u16 {
        let dword = self.read32(bus, device, function, offset & 0xFC);
        let shift = ((offset & 2) * 8) as u32;
        ((dword >> shift) & 0xFFFF) as u16
    }

    /// Write a 16-bit value (read-modify-write of the containing DWord).
    pub fn write16(&self, bus: u8, device: u8, function: u8, offset: u8, value: u16) {
        let dword_offset = offset & 0xFC;
        let mut dword = self.read32(bus, device, function, dword_offset);
        let shift = ((offset & 2) * 8) as u32;
        let mask = !(0xFFFFu32 << shift);
        dword = (dword & mask) | ((value as u32) << shift);
        self.write32(bus, device, function, dword_offset, dword);
    }

    /// Read an 8-bit value (DWord read, then extract).
    pub fn read8(&self, bus: u8, device: u8, function: u8, offset: u8) -> u8 {
        let dword = self.read32(bus, device, function, offset & 0xFC);
        let shift = ((offset & 3) * 8) as u32;
        ((dword >> shift) & 0xFF) as u8
    }

    /// Write an 8-bit value (read-modify-write of the containing DWord).
    pub fn write8(&self, bus: u8, device: u8, function: u8, offset: u8, value: u8) {
        let dword_offset = offset & 0xFC;
        let mut dword = self.read32(bus, device, function, dword_offset);
        let shift = ((offset & 3) * 8) as u32;
        let mask = !(0xFFu32 << shift);
        dword = (dword & mask) | ((value as u32) << shift);
        self.write32(bus, device, function, dword_offset, dword);
    }
}

fn ecam_address(base: u64, bus: u8, device: u8, function: u8, offset: u8) -> u64 {
    base | ((bus as u64) << 20) | ((device as u64) << 15) | ((function as u64) << 12) | offset as u64
}

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset & 0xFC) as u32)
}

#[cfg(target_arch = "x86_64")]
fn portio_read_dword(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    use x86_64::instructions::port::Port;

    let _guard = CONFIG_PORTS.lock();
    unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);

        addr_port.write(config_address(bus, device, function, offset));
        data_port.read()
    }
}

#[cfg(target_arch = "x86_64")]
fn portio_write_dword(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    use x86_64::instructions::port::Port;

    let _guard = CONFIG_PORTS.lock();
    unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);

        addr_port.write(config_address(bus, device, function, offset));
        data_port.write(value);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn portio_read_dword(_bus: u8, _device: u8, _function: u8, _offset: u8) -> u32 {
    let _guard = CONFIG_PORTS.lock();
    // No legacy config mechanism off x86; reads float high like an empty slot.
    0xFFFF_FFFF
}

#[cfg(not(target_arch = "x86_64"))]
fn portio_write_dword(_bus: u8, _device: u8, _function: u8, _offset: u8, _value: u32) {
    let _guard = CONFIG_PORTS.lock();
}

/// Base Address Register (BAR) information
#[derive(Debug, Copy, Clone)]
pub struct Bar {
    /// Physical address of the BAR
    pub address: u64,
    /// Size of the BAR region in bytes
    pub size: u64,
    /// Whether this is an I/O port BAR (vs memory-mapped)
    pub is_io: bool,
    /// Whether this is a 64-bit BAR (occupies two BAR slots)
    pub is_64bit: bool,
    /// Whether the memory is prefetchable
    pub prefetchable: bool,
}

impl Bar {
    /// Create an empty/invalid BAR
    const fn empty() -> Self {
        Bar {
            address: 0,
            size: 0,
            is_io: false,
            is_64bit: false,
            prefetchable: false,
        }
    }

    /// Check if this BAR is valid (has non-zero size)
    pub fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// Represents a PCI function
#[derive(Clone)]
pub struct Device {
    /// Bus number (0-255)
    pub bus: u8,
    /// Device/slot number (0-31)
    pub device: u8,
    /// Function number (0-7)
    pub function: u8,
    /// Vendor ID
    pub vendor_id: u16,
    /// Device ID
    pub device_id: u16,
    /// Revision ID
    pub revision_id: u8,
    /// Device class
    pub class: DeviceClass,
    /// Device subclass
    pub subclass: u8,
    /// Programming interface
    pub prog_if: u8,
    /// Interrupt line
    pub interrupt_line: u8,
    /// Interrupt pin
    pub interrupt_pin: u8,
    /// Whether this is a multifunction device
    pub multifunction: bool,
    /// Base Address Registers (up to 6 for standard devices)
    pub bars: [Bar; 6],
}

impl Device {
    /// Enable I/O space, memory space and bus mastering in one shot.
    pub fn enable(&self, cfg: &ConfigSpace) {
        let command = cfg.read16(self.bus, self.device, self.function, 0x04);
        cfg.write16(
            self.bus,
            self.device,
            self.function,
            0x04,
            command | 0x01 | 0x02 | 0x04,
        );
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{} {:04x}:{:04x} {:?}/{:02x}",
            self.bus,
            self.device,
            self.function,
            self.vendor_id,
            self.device_id,
            self.class,
            self.subclass
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field(
                "location",
                &format_args!("{:02x}:{:02x}.{}", self.bus, self.device, self.function),
            )
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("device_id", &format_args!("{:#06x}", self.device_id))
            .field("class", &self.class)
            .field("subclass", &format_args!("{:#04x}", self.subclass))
            .field("irq", &self.interrupt_line)
            .finish()
    }
}

/// Check whether any function responds at the given location.
pub fn device_present(cfg: &ConfigSpace, bus: u8, device: u8, function: u8) -> bool {
    cfg.read16(bus, device, function, 0x00) != 0xFFFF
}

/// Decode a BAR from configuration space.
///
/// Sizing uses the standard probe: write all-ones, read back the size mask,
/// restore the original value.
fn decode_bar(cfg: &ConfigSpace, bus: u8, device: u8, function: u8, bar_index: u8) -> (Bar, bool) {
    let offset = 0x10 + (bar_index * 4);

    let bar_low = cfg.read32(bus, device, function, offset);

    if bar_low & 0x01 != 0 {
        // I/O space BAR
        cfg.write32(bus, device, function, offset, 0xFFFF_FFFF);
        let size_mask = cfg.read32(bus, device, function, offset);
        cfg.write32(bus, device, function, offset, bar_low);

        let address = (bar_low & 0xFFFF_FFFC) as u64;
        let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
            0
        } else {
            (!(size_mask & 0xFFFF_FFFC)).wrapping_add(1) as u64
        };

        (
            Bar {
                address,
                size,
                is_io: true,
                is_64bit: false,
                prefetchable: false,
            },
            false,
        )
    } else {
        // Memory space BAR
        let bar_type = (bar_low >> 1) & 0x03;
        let prefetchable = (bar_low & 0x08) != 0;

        if bar_type == 0x02 {
            // 64-bit BAR
            let bar_high = cfg.read32(bus, device, function, offset + 4);

            cfg.write32(bus, device, function, offset, 0xFFFF_FFFF);
            cfg.write32(bus, device, function, offset + 4, 0xFFFF_FFFF);
            let size_low = cfg.read32(bus, device, function, offset);
            let size_high = cfg.read32(bus, device, function, offset + 4);
            cfg.write32(bus, device, function, offset, bar_low);
            cfg.write32(bus, device, function, offset + 4, bar_high);

            let address = ((bar_high as u64) << 32) | ((bar_low & 0xFFFF_FFF0) as u64);
            let size_mask = ((size_high as u64) << 32) | ((size_low & 0xFFFF_FFF0) as u64);
            let size = if size_mask == 0 {
                0
            } else {
                (!size_mask).wrapping_add(1)
            };

            (
                Bar {
                    address,
                    size,
                    is_io: false,
                    is_64bit: true,
                    prefetchable,
                },
                true, // 64-bit BAR, skip next slot
            )
        } else {
            // 32-bit BAR
            cfg.write32(bus, device, function, offset, 0xFFFF_FFFF);
            let size_mask = cfg.read32(bus, device, function, offset);
            cfg.write32(bus, device, function, offset, bar_low);

            let address = (bar_low & 0xFFFF_FFF0) as u64;
            let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
                0
            } else {
                (!(size_mask & 0xFFFF_FFF0)).wrapping_add(1) as u64
            };

            (
                Bar {
                    address,
                    size,
                    is_io: false,
                    is_64bit: false,
                    prefetchable,
                },
                false,
            )
        }
    }
}

/// Probe for a function at the given bus/device/function
fn probe_device(cfg: &ConfigSpace, bus: u8, device: u8, function: u8) -> Option<Device> {
    let vendor_device = cfg.read32(bus, device, function, 0x00);

    // 0xFFFFFFFF indicates no device present
    if vendor_device == 0xFFFF_FFFF {
        return None;
    }

    let vendor_id = vendor_device as u16;
    let device_id = (vendor_device >> 16) as u16;

    // Read class/subclass/prog_if/revision
    let class_reg = cfg.read32(bus, device, function, 0x08);
    let revision_id = class_reg as u8;
    let prog_if = (class_reg >> 8) as u8;
    let subclass = (class_reg >> 16) as u8;
    let class_code = (class_reg >> 24) as u8;

    // Read header type (to check multifunction)
    let header_reg = cfg.read32(bus, device, function, 0x0C);
    let header_type = (header_reg >> 16) as u8;
    let multifunction = (header_type & 0x80) != 0;

    // Read interrupt info
    let int_reg = cfg.read32(bus, device, function, 0x3C);
    let interrupt_line = int_reg as u8;
    let interrupt_pin = (int_reg >> 8) as u8;

    // Decode BARs
    let mut bars = [Bar::empty(); 6];
    let mut bar_index = 0;
    while bar_index < 6 {
        let (bar, skip_next) = decode_bar(cfg, bus, device, function, bar_index);
        bars[bar_index as usize] = bar;
        bar_index += 1;
        if skip_next && bar_index < 6 {
            bar_index += 1; // 64-bit BAR consumed the next slot
        }
    }

    Some(Device {
        bus,
        device,
        function,
        vendor_id,
        device_id,
        revision_id,
        class: DeviceClass::from_u8(class_code),
        subclass,
        prog_if,
        interrupt_line,
        interrupt_pin,
        multifunction,
        bars,
    })
}

/// Get a human-readable vendor name for common vendors
fn vendor_name(vendor_id: u16) -> &'static str {
    match vendor_id {
        INTEL_VENDOR_ID => "Intel",
        QEMU_VENDOR_ID => "QEMU/RedHat",
        0x1022 => "AMD",
        0x10DE => "NVIDIA",
        0x14E4 => "Broadcom",
        0x10EC => "Realtek",
        _ => "Unknown",
    }
}

/// Enumerate all PCI functions on the bus.
///
/// Functions 1..8 of a device are only probed when function 0 reports the
/// multifunction bit in its header type.
pub fn enumerate(cfg: &ConfigSpace) -> Vec<Device> {
    log::info!("PCI: starting bus enumeration");

    let mut devices = Vec::new();

    for bus in 0..=MAX_BUS {
        for device in 0..MAX_DEVICE {
            // First check function 0
            let Some(dev) = probe_device(cfg, bus, device, 0) else {
                continue;
            };
            let is_multifunction = dev.multifunction;

            log::debug!("PCI: {} ({})", dev, vendor_name(dev.vendor_id));
            devices.push(dev);

            if is_multifunction {
                for function in 1..MAX_FUNCTION {
                    if let Some(dev) = probe_device(cfg, bus, device, function) {
                        log::debug!("PCI: {} ({})", dev, vendor_name(dev.vendor_id));
                        devices.push(dev);
                    }
                }
            }
        }
    }

    log::info!("PCI: enumeration complete, {} functions", devices.len());
    devices
}
