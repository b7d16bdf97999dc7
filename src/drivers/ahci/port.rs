//! AHCI port engine.
//!
//! Each port owns its DMA memory (command list, received-FIS area, command
//! table, bounce buffer) and runs the command state machine:
//!
//! ```text
//! Unknown ── SSTS.DET=3 ──▶ Idle ── FRE=1, ST=1 ──▶ Ready
//! Ready ── CI bit set ──▶ Busy(slot)
//! Busy(slot) ── CI clear, TFD ok ──▶ Ready
//! Busy(slot) ── CI clear, TFD err ──▶ Errored ── SERR/IS cleared ──▶ Ready
//! Busy(slot) ── timeout ──▶ Errored (caller may reset)
//! ```
//!
//! One command is in flight per port at a time. While the CI bit for a slot
//! is set, the HBA owns the command list, command table and data region;
//! nothing here touches them until the bit clears.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::mem::offset_of;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

use super::{AhciError, DeviceType, MAX_SECTORS_PER_COMMAND, SECTOR_SIZE};
use crate::hal::{self, Hal};
use crate::mmio;

// =============================================================================
// Port Registers (offset from the port register block)
// =============================================================================

/// Command List Base Address (low)
const PORT_CLB: u64 = 0x00;
/// Command List Base Address (high)
const PORT_CLBU: u64 = 0x04;
/// FIS Base Address (low)
const PORT_FB: u64 = 0x08;
/// FIS Base Address (high)
const PORT_FBU: u64 = 0x0C;
/// Interrupt Status
const PORT_IS: u64 = 0x10;
/// Command and Status
const PORT_CMD: u64 = 0x18;
/// Task File Data
const PORT_TFD: u64 = 0x20;
/// Signature
const PORT_SIG: u64 = 0x24;
/// SATA Status (SCR0: SStatus)
const PORT_SSTS: u64 = 0x28;
/// SATA Error (SCR1: SError)
const PORT_SERR: u64 = 0x30;
/// SATA Active
const PORT_SACT: u64 = 0x34;
/// Command Issue
const PORT_CI: u64 = 0x38;

/// PORT_CMD bits
const PORT_CMD_ST: u32 = 1 << 0; // Start
const PORT_CMD_FRE: u32 = 1 << 4; // FIS Receive Enable
const PORT_CMD_FR: u32 = 1 << 14; // FIS Receive Running
const PORT_CMD_CR: u32 = 1 << 15; // Command List Running

/// PORT_TFD bits
const PORT_TFD_ERR: u32 = 1 << 0; // Error
const PORT_TFD_DRQ: u32 = 1 << 3; // Data Request
const PORT_TFD_DF: u32 = 1 << 5; // Device Fault
const PORT_TFD_BSY: u32 = 1 << 7; // Busy

/// SATA Status (SSTS) fields
const SSTS_DET_MASK: u32 = 0x0F;
const SSTS_DET_PRESENT: u32 = 0x03; // Device detected, Phy link established
const SSTS_IPM_SHIFT: u32 = 8;
const SSTS_IPM_MASK: u32 = 0x0F;
const SSTS_IPM_ACTIVE: u32 = 0x01;

// =============================================================================
// Timeouts
// =============================================================================

/// Engine stop: CR/FR must clear within this budget.
const ENGINE_STOP_TIMEOUT_MS: u64 = 500;
/// BSY/DRQ must drop before a command may be issued.
const ISSUE_READY_TIMEOUT_MS: u64 = 1_000;
/// Settle time after flipping FRE/ST before the re-read.
const ENGINE_SETTLE_US: u64 = 1_000;

// =============================================================================
// DMA Memory Structures
// =============================================================================

/// Command List entry (Command Header) - 32 bytes each, 32 per port.
#[repr(C, packed)]
struct CmdHeader {
    /// DW0: Command FIS length in DWords (bits 4:0), ATAPI (bit 5),
    ///      Write (bit 6), Prefetchable (bit 7), PRDTL (bits 31:16)
    dw0: u32,
    /// DW1: Physical Region Descriptor Byte Count (bytes transferred,
    ///      written back by the HBA)
    prdbc: u32,
    /// DW2: Command Table Base Address (low, 128-byte aligned)
    ctba: u32,
    /// DW3: Command Table Base Address (high)
    ctbau: u32,
    /// DW4-7: Reserved
    _reserved: [u32; 4],
}

/// Command header DW0 bits.
const CMDH_W: u32 = 1 << 6;
const CMDH_PREFETCHABLE: u32 = 1 << 7;

/// Physical Region Descriptor Table entry - 16 bytes.
#[repr(C, packed)]
struct PrdtEntry {
    /// Data Base Address (low, 2-byte aligned)
    dba: u32,
    /// Data Base Address (high)
    dbau: u32,
    /// Reserved
    _reserved: u32,
    /// Data Byte Count minus one (bits 21:0), Interrupt on Completion (bit 31)
    dbc: u32,
}

/// PRDT "interrupt on completion" bit. Kept set even though completion is
/// polled; the HBA still posts the corresponding IS bit, which we clear.
const PRDT_IOC: u32 = 1 << 31;

/// Command Table: the command FIS plus the PRDT.
///
/// A single PRDT entry covers the largest command this driver issues
/// (128 sectors = 64 KiB, well under the 4 MiB entry limit).
#[repr(C, align(128))]
struct CmdTable {
    /// Command FIS (up to 64 bytes)
    cfis: [u8; 64],
    /// ATAPI command (16 bytes, unused for SATA disks)
    acmd: [u8; 16],
    /// Reserved (48 bytes)
    _reserved: [u8; 48],
    /// PRDT entries
    prdt: [PrdtEntry; 1],
}

/// Largest data payload a single command may carry.
pub const MAX_BYTES_PER_COMMAND: usize = MAX_SECTORS_PER_COMMAND as usize * SECTOR_SIZE;

/// Per-port DMA memory.
///
/// Field order realizes the alignment the HBA requires: the command list at
/// a 1 KiB boundary, the received-FIS area at a 256-byte boundary, and the
/// command table at a 128-byte boundary.
#[repr(C, align(1024))]
struct PortDma {
    /// Command list (32 headers x 32 bytes = 1024 bytes)
    cmd_list: [CmdHeader; 32],
    /// Received FIS area
    rx_fis: [u8; 256],
    /// Command table (CFIS + PRDT)
    cmd_table: CmdTable,
    /// Bounce buffer for data transfers
    bounce: [u8; MAX_BYTES_PER_COMMAND],
}

const _: () = assert!(core::mem::size_of::<CmdHeader>() == 32);
const _: () = assert!(core::mem::size_of::<PrdtEntry>() == 16);
const _: () = assert!(offset_of!(PortDma, cmd_list) == 0);
const _: () = assert!(offset_of!(PortDma, rx_fis) % 256 == 0);
const _: () = assert!(offset_of!(PortDma, cmd_table) % 128 == 0);
const _: () = assert!(offset_of!(PortDma, bounce) % 2 == 0);

/// Owned, aligned, zero-initialized DMA block for one port.
struct DmaBlock {
    ptr: NonNull<PortDma>,
}

impl DmaBlock {
    fn new() -> Result<Self, AhciError> {
        let layout = Layout::new::<PortDma>();
        let raw = unsafe { alloc_zeroed(layout) } as *mut PortDma;
        NonNull::new(raw)
            .map(|ptr| DmaBlock { ptr })
            .ok_or(AhciError::OutOfMemory)
    }

    fn get(&self) -> &PortDma {
        unsafe { self.ptr.as_ref() }
    }

    fn get_mut(&mut self) -> &mut PortDma {
        unsafe { self.ptr.as_mut() }
    }

    fn virt(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }
}

impl Drop for DmaBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, Layout::new::<PortDma>()) }
    }
}

// The block is exclusively owned and only handed to the HBA while a command
// is in flight; moving the owner between threads is fine.
unsafe impl Send for DmaBlock {}

// =============================================================================
// Port
// =============================================================================

/// One AHCI port and its attached device.
pub struct AhciPort {
    /// Port number (0-31)
    id: u8,
    /// MMIO base of this port's register block
    regs: u64,
    hal: &'static dyn Hal,
    /// Command slots implemented by the HBA (CAP.NCS + 1)
    num_slots: u32,
    dma: DmaBlock,
    /// Device signature read at bring-up
    signature: u32,
    /// Whether the device advertises 48-bit addressing (set by IDENTIFY)
    lba48: bool,
    /// Addressable sectors (set by IDENTIFY)
    sector_count: u64,
}

impl AhciPort {
    /// Detect, allocate and start a port.
    ///
    /// Fails with `PortNotPresent` when SSTS reports no established device.
    /// A non-active IPM state is only a warning: the port is still started
    /// and any real trouble shows up as a command timeout later.
    pub(super) fn bring_up(
        hal: &'static dyn Hal,
        regs: u64,
        id: u8,
        num_slots: u32,
        supports_64bit: bool,
    ) -> Result<Self, AhciError> {
        let ssts = mmio::read32(regs + PORT_SSTS);
        if ssts & SSTS_DET_MASK != SSTS_DET_PRESENT {
            return Err(AhciError::PortNotPresent);
        }
        if (ssts >> SSTS_IPM_SHIFT) & SSTS_IPM_MASK != SSTS_IPM_ACTIVE {
            log::warn!(
                "AHCI: port {} link power state not active (SSTS={:#x}), proceeding",
                id,
                ssts
            );
        }

        let dma = DmaBlock::new()?;
        if !supports_64bit && hal.virt_to_phys(dma.virt()) >> 32 != 0 {
            log::warn!(
                "AHCI: port {} DMA memory above 4 GiB on a 32-bit-only HBA",
                id
            );
        }

        let mut port = AhciPort {
            id,
            regs,
            hal,
            num_slots,
            dma,
            signature: 0,
            lba48: false,
            sector_count: 0,
        };
        port.prepare()?;
        port.signature = mmio::read32(regs + PORT_SIG);
        Ok(port)
    }

    /// Prepare the port: stop the engine, program the DMA bases, clear
    /// latched status, then start FIS receive and the command engine.
    fn prepare(&mut self) -> Result<(), AhciError> {
        self.stop_engine();

        let base = self.hal.virt_to_phys(self.dma.virt());
        let clb = base + offset_of!(PortDma, cmd_list) as u64;
        let fb = base + offset_of!(PortDma, rx_fis) as u64;
        mmio::write32(self.regs + PORT_CLB, clb as u32);
        mmio::write32(self.regs + PORT_CLBU, (clb >> 32) as u32);
        mmio::write32(self.regs + PORT_FB, fb as u32);
        mmio::write32(self.regs + PORT_FBU, (fb >> 32) as u32);

        // Clear latched interrupt status (write-1-to-clear) and any sticky
        // SATA error bits (read, write the value back).
        mmio::write32(self.regs + PORT_IS, 0xFFFF_FFFF);
        let serr = mmio::read32(self.regs + PORT_SERR);
        mmio::write32(self.regs + PORT_SERR, serr);

        self.start_engine()
    }

    /// Stop the command engine: clear ST, wait for CR, clear FRE, wait FR.
    fn stop_engine(&mut self) {
        let mut cmd = mmio::read32(self.regs + PORT_CMD);
        cmd &= !PORT_CMD_ST;
        mmio::write32(self.regs + PORT_CMD, cmd);

        if !mmio::wait_for_clear(self.hal, self.regs + PORT_CMD, PORT_CMD_CR, ENGINE_STOP_TIMEOUT_MS)
        {
            log::warn!("AHCI: port {} command list still running after stop", self.id);
        }

        cmd = mmio::read32(self.regs + PORT_CMD);
        cmd &= !PORT_CMD_FRE;
        mmio::write32(self.regs + PORT_CMD, cmd);

        if !mmio::wait_for_clear(self.hal, self.regs + PORT_CMD, PORT_CMD_FR, ENGINE_STOP_TIMEOUT_MS)
        {
            log::warn!("AHCI: port {} FIS receive still running after stop", self.id);
        }
    }

    /// Start the engine: FRE first, then ST, each with a settle delay and a
    /// read-back check.
    fn start_engine(&mut self) -> Result<(), AhciError> {
        let mut cmd = mmio::read32(self.regs + PORT_CMD);
        cmd |= PORT_CMD_FRE;
        mmio::write32(self.regs + PORT_CMD, cmd);
        self.hal.delay_us(ENGINE_SETTLE_US);
        if mmio::read32(self.regs + PORT_CMD) & PORT_CMD_FRE == 0 {
            log::error!("AHCI: port {} FRE did not latch", self.id);
            return Err(AhciError::PortStartFailed);
        }

        cmd = mmio::read32(self.regs + PORT_CMD);
        cmd |= PORT_CMD_ST;
        mmio::write32(self.regs + PORT_CMD, cmd);
        self.hal.delay_us(ENGINE_SETTLE_US);
        if mmio::read32(self.regs + PORT_CMD) & PORT_CMD_ST == 0 {
            log::error!("AHCI: port {} ST did not latch", self.id);
            return Err(AhciError::PortStartFailed);
        }

        Ok(())
    }

    /// Find the lowest command slot that is free in both CI and SACT.
    ///
    /// The lowest-index policy makes single-threaded retries deterministic.
    pub fn find_free_slot(&self) -> Option<u8> {
        let ci = mmio::read32(self.regs + PORT_CI);
        let sact = mmio::read32(self.regs + PORT_SACT);
        let busy = ci | sact;
        (0..self.num_slots as u8).find(|&slot| busy & (1u32 << slot) == 0)
    }

    /// Issue the command in `slot`.
    ///
    /// The device must have dropped BSY and DRQ first; a device that stays
    /// busy for a second yields `PortBusy` and nothing is issued.
    pub fn issue(&mut self, slot: u8) -> Result<(), AhciError> {
        let ready = hal::wait_until(self.hal, ISSUE_READY_TIMEOUT_MS, || {
            mmio::read32(self.regs + PORT_TFD) & (PORT_TFD_BSY | PORT_TFD_DRQ) == 0
        });
        if !ready {
            log::warn!(
                "AHCI: port {} stuck busy before issue (TFD={:#x})",
                self.id,
                mmio::read32(self.regs + PORT_TFD)
            );
            return Err(AhciError::PortBusy);
        }

        // Everything written to the command structures must be visible to
        // the HBA before the doorbell.
        fence(Ordering::SeqCst);
        mmio::write32(self.regs + PORT_CI, 1u32 << slot);
        Ok(())
    }

    /// Wait for the slot's CI bit to clear and audit the outcome.
    ///
    /// On a task-file error the SATA error register is reported and written
    /// back (clearing its latched bits) before this returns. A successful
    /// completion with `expected_bytes > 0` additionally requires PRDBC to
    /// match.
    pub fn await_completion(
        &mut self,
        slot: u8,
        expected_bytes: u32,
        timeout_ms: u64,
    ) -> Result<(), AhciError> {
        let mask = 1u32 << slot;
        let done = hal::wait_until(self.hal, timeout_ms, || {
            mmio::read32(self.regs + PORT_CI) & mask == 0
        });
        if !done {
            log::error!(
                "AHCI: port {} slot {} timed out after {} ms",
                self.id,
                slot,
                timeout_ms
            );
            return Err(AhciError::TimedOut);
        }

        // The HBA's writes to the received FIS, PRDBC and data buffers must
        // be visible before we read them.
        fence(Ordering::SeqCst);

        let tfd = mmio::read32(self.regs + PORT_TFD);
        if tfd & (PORT_TFD_ERR | PORT_TFD_DF) != 0 {
            let serr = mmio::read32(self.regs + PORT_SERR);
            log::error!(
                "AHCI: port {} device error (TFD={:#x}, SERR={:#x})",
                self.id,
                tfd,
                serr
            );
            mmio::write32(self.regs + PORT_SERR, serr);
            return Err(AhciError::DeviceError { tfd, serr });
        }

        let prdbc = self.dma.get().cmd_list[slot as usize].prdbc;
        if expected_bytes > 0 && prdbc != expected_bytes {
            log::error!(
                "AHCI: port {} short transfer ({} of {} bytes)",
                self.id,
                prdbc,
                expected_bytes
            );
            return Err(AhciError::ShortTransfer { prdbc });
        }

        Ok(())
    }

    /// Lay out and run one command: slot acquisition, command header,
    /// command table, PRDT, issue, completion.
    ///
    /// `cfis` is the 20-byte H2D Register FIS. Data moves through the
    /// port-owned bounce buffer: the caller fills it before a write and
    /// drains it after a read. `byte_len == 0` runs a non-data command.
    ///
    /// `device_to_host` sets the header W bit: 1 when the data phase has
    /// the device writing host memory (IDENTIFY and reads). Some AHCI
    /// implementations read W with the opposite sense; DMA commands
    /// complete either way on the controllers this was written against,
    /// but the bit deserves a check when porting to new silicon.
    pub(super) fn exec_command(
        &mut self,
        cfis: &[u8; 20],
        device_to_host: bool,
        byte_len: u32,
        timeout_ms: u64,
    ) -> Result<(), AhciError> {
        debug_assert!(byte_len as usize <= MAX_BYTES_PER_COMMAND);

        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => {
                // One polite retry; with a polled single-command engine a
                // transiently full port drains quickly or not at all.
                self.hal.delay_us(1_000);
                self.find_free_slot().ok_or(AhciError::NoFreeSlot)?
            }
        };

        let base = self.hal.virt_to_phys(self.dma.virt());
        let ctba = base + offset_of!(PortDma, cmd_table) as u64;
        let dba = base + offset_of!(PortDma, bounce) as u64;
        let prdtl: u16 = if byte_len > 0 { 1 } else { 0 };

        {
            let dma = self.dma.get_mut();

            // Command header: CFL = 5 DWords (20-byte H2D FIS), direction,
            // prefetch for data commands, PRDT length, table address.
            let header = &mut dma.cmd_list[slot as usize];
            let mut dw0 = (cfis.len() as u32 / 4) & 0x1F;
            if device_to_host {
                dw0 |= CMDH_W;
            }
            if prdtl > 0 {
                dw0 |= CMDH_PREFETCHABLE;
            }
            dw0 |= (prdtl as u32) << 16;
            header.dw0 = dw0;
            header.prdbc = 0;
            header.ctba = ctba as u32;
            header.ctbau = (ctba >> 32) as u32;
            header._reserved = [0; 4];

            // Command table: zero the FIS area and the PRDT, then write the
            // FIS in place.
            dma.cmd_table.cfis = [0; 64];
            dma.cmd_table.cfis[..cfis.len()].copy_from_slice(cfis);
            dma.cmd_table.prdt[0] = PrdtEntry {
                dba: 0,
                dbau: 0,
                _reserved: 0,
                dbc: 0,
            };
            if prdtl > 0 {
                dma.cmd_table.prdt[0] = PrdtEntry {
                    dba: dba as u32,
                    dbau: (dba >> 32) as u32,
                    _reserved: 0,
                    dbc: (byte_len - 1) | PRDT_IOC,
                };
            }
        }

        // Re-program the DMA bases; redundant when unchanged, but the slot
        // contract keeps this together with the layout it describes.
        let clb = base + offset_of!(PortDma, cmd_list) as u64;
        let fb = base + offset_of!(PortDma, rx_fis) as u64;
        mmio::write32(self.regs + PORT_CLB, clb as u32);
        mmio::write32(self.regs + PORT_CLBU, (clb >> 32) as u32);
        mmio::write32(self.regs + PORT_FB, fb as u32);
        mmio::write32(self.regs + PORT_FBU, (fb >> 32) as u32);

        self.issue(slot)?;
        self.await_completion(slot, byte_len, timeout_ms)
    }

    /// Recover a port after an error or timeout: stop the engine, wait for
    /// it to wind down, then restart FIS receive and command processing.
    pub fn reset(&mut self) -> Result<(), AhciError> {
        log::info!("AHCI: resetting port {}", self.id);
        self.stop_engine();
        mmio::write32(self.regs + PORT_IS, 0xFFFF_FFFF);
        let serr = mmio::read32(self.regs + PORT_SERR);
        mmio::write32(self.regs + PORT_SERR, serr);
        self.start_engine()
    }

    /// Borrow the bounce buffer for an outgoing transfer.
    pub(super) fn bounce_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.dma.get_mut().bounce[..len]
    }

    /// Borrow the bounce buffer after an incoming transfer.
    pub(super) fn bounce(&self, len: usize) -> &[u8] {
        &self.dma.get().bounce[..len]
    }

    pub(super) fn set_identify_caps(&mut self, lba48: bool, sector_count: u64) {
        self.lba48 = lba48;
        self.sector_count = sector_count;
    }

    /// Port number.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Device signature as read at bring-up.
    pub fn signature(&self) -> u32 {
        self.signature
    }

    /// Device type decoded from the signature.
    pub fn device_type(&self) -> DeviceType {
        DeviceType::from_signature(self.signature)
    }

    /// Whether IDENTIFY reported 48-bit addressing.
    pub fn lba48(&self) -> bool {
        self.lba48
    }

    /// Addressable sectors, as reported by IDENTIFY (0 before IDENTIFY).
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }
}
