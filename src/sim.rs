//! Simulated hardware for unit tests.
//!
//! Test builds route every MMIO access through a thread-local bus of
//! simulated devices, so the real driver code — register pokes, DMA
//! descriptors, polling loops — runs unmodified against fake hardware.
//!
//! The devices are reactive: the simulated HBA executes a command the
//! moment its CI bit is written (parsing the live command list, command
//! table and PRDT out of process memory and DMA-ing into the real
//! buffers), and the simulated TPM runs its TIS state machine on register
//! writes. Physical addresses are host addresses: the drivers run with an
//! identity `virt_to_phys`, so the devices can dereference what they are
//! handed.
//!
//! The bus is thread-local, which isolates parallel tests; each test calls
//! `reset()` first so single-threaded runs stay clean too.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::hal::Hal;

// =============================================================================
// Bus
// =============================================================================

/// A device occupying a physical address range.
pub trait SimDevice {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

struct Mapping {
    start: u64,
    len: u64,
    dev: Rc<RefCell<dyn SimDevice>>,
}

thread_local! {
    static BUS: RefCell<Vec<Mapping>> = RefCell::new(Vec::new());
}

/// Forget all mappings on this thread.
pub fn reset() {
    BUS.with(|bus| bus.borrow_mut().clear());
}

/// Map a device at `[start, start+len)`.
pub fn map<T: SimDevice + 'static>(start: u64, len: u64, dev: T) {
    map_shared(start, len, Rc::new(RefCell::new(dev)));
}

/// Map a device the test keeps a handle to.
pub fn map_shared<T: SimDevice + 'static>(start: u64, len: u64, dev: Rc<RefCell<T>>) {
    BUS.with(|bus| {
        bus.borrow_mut().push(Mapping { start, len, dev });
    });
}

/// Bus read; called from `crate::mmio` in test builds.
pub fn mmio_read(pa: u64, size: usize) -> u64 {
    BUS.with(|bus| {
        let bus = bus.borrow();
        for m in bus.iter() {
            if pa >= m.start && pa + size as u64 <= m.start + m.len {
                return m.dev.borrow_mut().read(pa - m.start, size);
            }
        }
        panic!("unmapped MMIO read at {:#x} (size {})", pa, size);
    })
}

/// Bus write; called from `crate::mmio` in test builds.
pub fn mmio_write(pa: u64, size: usize, value: u64) {
    BUS.with(|bus| {
        let bus = bus.borrow();
        for m in bus.iter() {
            if pa >= m.start && pa + size as u64 <= m.start + m.len {
                return m.dev.borrow_mut().write(pa - m.start, size, value);
            }
        }
        panic!("unmapped MMIO write at {:#x} (size {})", pa, size);
    })
}

/// Test HAL: identity translation, no wall-clock delay. The simulated
/// devices complete synchronously, so polls converge immediately and
/// timeout paths spin through their budget quickly.
pub struct TestHal;

impl Hal for TestHal {
    fn delay_us(&self, _us: u64) {}
}

pub static TEST_HAL: TestHal = TestHal;

/// The byte that makes an ACPI structure checksum to zero, assuming the
/// checksum position currently holds zero.
pub fn acpi_checksum_fix(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |a, &b| a.wrapping_add(b)))
}

// =============================================================================
// Plain memory window
// =============================================================================

/// A flat little-endian memory region (BIOS data, ACPI tables, dead MMIO).
pub struct SimRam {
    bytes: Vec<u8>,
}

impl SimRam {
    pub fn new(len: usize) -> Self {
        SimRam {
            bytes: vec![0; len],
        }
    }

    /// Copy `data` into the region at `offset`.
    pub fn load(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Set a single byte.
    pub fn poke(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }
}

impl SimDevice for SimRam {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        let mut value = 0u64;
        for i in 0..size {
            value |= (self.bytes[offset as usize + i] as u64) << (i * 8);
        }
        value
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        for i in 0..size {
            self.bytes[offset as usize + i] = (value >> (i * 8)) as u8;
        }
    }
}

// =============================================================================
// PCI configuration space (ECAM)
// =============================================================================

/// One simulated BAR with the standard sizing-probe behavior.
#[derive(Clone, Copy, Default)]
struct SimBar {
    addr: u32,
    size: u32,
    io: bool,
    probing: bool,
}

impl SimBar {
    fn flags(&self) -> u32 {
        if self.io {
            0x1
        } else {
            0x0 // 32-bit, non-prefetchable memory
        }
    }

    fn read(&self) -> u32 {
        if self.size == 0 {
            return 0;
        }
        if self.probing {
            !(self.size - 1) | self.flags()
        } else {
            self.addr | self.flags()
        }
    }

    fn write(&mut self, value: u32) {
        if self.size == 0 {
            return;
        }
        if value == 0xFFFF_FFFF {
            self.probing = true;
        } else {
            self.probing = false;
            self.addr = value & !(self.size - 1) & !0xF;
        }
    }
}

/// A simulated PCI function: IDs, class words, command register, six BARs.
pub struct SimFunction {
    vendor_id: u16,
    device_id: u16,
    command: u16,
    revision: u8,
    prog_if: u8,
    subclass: u8,
    class: u8,
    multifunction: bool,
    bars: [SimBar; 6],
}

impl SimFunction {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        SimFunction {
            vendor_id,
            device_id,
            command: 0,
            revision: 0,
            prog_if: 0,
            subclass: 0,
            class: 0,
            multifunction: false,
            bars: [SimBar::default(); 6],
        }
    }

    pub fn set_class(&mut self, class: u8, subclass: u8, prog_if: u8, revision: u8) {
        self.class = class;
        self.subclass = subclass;
        self.prog_if = prog_if;
        self.revision = revision;
    }

    pub fn set_multifunction(&mut self, multifunction: bool) {
        self.multifunction = multifunction;
    }

    /// Install a 32-bit memory BAR. `size` must be a power of two.
    pub fn set_mem_bar(&mut self, index: usize, addr: u32, size: u32) {
        assert!(size.is_power_of_two());
        self.bars[index] = SimBar {
            addr,
            size,
            io: false,
            probing: false,
        };
    }

    fn read32(&self, reg: u16) -> u32 {
        match reg {
            0x00 => (self.vendor_id as u32) | ((self.device_id as u32) << 16),
            0x04 => self.command as u32,
            0x08 => {
                (self.revision as u32)
                    | ((self.prog_if as u32) << 8)
                    | ((self.subclass as u32) << 16)
                    | ((self.class as u32) << 24)
            }
            0x0C => {
                let header_type = if self.multifunction { 0x80u32 } else { 0 };
                header_type << 16
            }
            0x10..=0x24 => self.bars[(reg as usize - 0x10) / 4].read(),
            _ => 0,
        }
    }

    fn write32(&mut self, reg: u16, value: u32) {
        match reg {
            0x04 => self.command = value as u16,
            0x10..=0x24 => self.bars[(reg as usize - 0x10) / 4].write(value),
            _ => {}
        }
    }
}

/// A simulated ECAM window over a set of functions.
pub struct SimEcam {
    functions: BTreeMap<(u8, u8, u8), SimFunction>,
}

impl SimEcam {
    pub fn new() -> Self {
        SimEcam {
            functions: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, bus: u8, device: u8, function: u8, f: SimFunction) {
        self.functions.insert((bus, device, function), f);
    }
}

fn ecam_decode(offset: u64) -> ((u8, u8, u8), u16) {
    let bus = ((offset >> 20) & 0xFF) as u8;
    let device = ((offset >> 15) & 0x1F) as u8;
    let function = ((offset >> 12) & 0x07) as u8;
    let reg = (offset & 0xFFC) as u16;
    ((bus, device, function), reg)
}

impl SimDevice for SimEcam {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        assert_eq!(size, 4, "config space is accessed as aligned DWords");
        let (bdf, reg) = ecam_decode(offset);
        match self.functions.get(&bdf) {
            Some(f) => f.read32(reg) as u64,
            None => 0xFFFF_FFFF,
        }
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        assert_eq!(size, 4, "config space is accessed as aligned DWords");
        let (bdf, reg) = ecam_decode(offset);
        if let Some(f) = self.functions.get_mut(&bdf) {
            f.write32(reg, value as u32);
        }
    }
}

// =============================================================================
// AHCI HBA
// =============================================================================

const HBA_PORTS_OFFSET: u64 = 0x100;
const HBA_PORT_STRIDE: u64 = 0x80;

/// Register file of one simulated port.
struct SimPort {
    clb: u32,
    clbu: u32,
    fb: u32,
    fbu: u32,
    is: u32,
    ie: u32,
    cmd: u32,
    tfd: u32,
    sig: u32,
    ssts: u32,
    sctl: u32,
    serr: u32,
    sact: u32,
    ci: u32,
}

impl SimPort {
    fn new() -> Self {
        SimPort {
            clb: 0,
            clbu: 0,
            fb: 0,
            fbu: 0,
            is: 0,
            ie: 0,
            cmd: 0,
            tfd: 0x50, // DRDY | DSC
            sig: 0x0000_0101,
            ssts: 0x113, // DET=3, SPD=1, IPM=1
            sctl: 0,
            serr: 0,
            sact: 0,
            ci: 0,
        }
    }
}

/// Build a 512-byte IDENTIFY block for the simulated drive.
pub fn identify_block(model: &str, serial: &str, lba48: bool, sectors: u64) -> [u8; 512] {
    let mut words = [0u16; 256];

    let mut put_string = |start: usize, len_words: usize, s: &str| {
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(len_words * 2, b' ');
        for i in 0..len_words {
            words[start + i] = ((bytes[i * 2] as u16) << 8) | bytes[i * 2 + 1] as u16;
        }
    };
    put_string(27, 20, model);
    put_string(10, 10, serial);

    words[49] = 1 << 9; // LBA supported
    words[76] = (1 << 2) | (1 << 1); // SATA gen 1+2
    let lba28 = sectors.min(0x0FFF_FFFF) as u32;
    words[60] = lba28 as u16;
    words[61] = (lba28 >> 16) as u16;
    if lba48 {
        words[83] = 1 << 10;
        words[100] = sectors as u16;
        words[101] = (sectors >> 16) as u16;
        words[102] = (sectors >> 32) as u16;
        words[103] = (sectors >> 48) as u16;
    }

    let mut block = [0u8; 512];
    for (i, w) in words.iter().enumerate() {
        block[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
    }
    block
}

/// A simulated single-port AHCI HBA with a sparse disk image.
///
/// Commands execute synchronously when CI is written: the device parses the
/// command header, command table and PRDT straight out of process memory
/// (addresses are host addresses under the identity HAL) and moves data
/// between the PRD regions and the disk image.
pub struct SimHba {
    cap: u32,
    ghc: u32,
    pi: u32,
    vs: u32,
    port: SimPort,
    identify: [u8; 512],
    disk: BTreeMap<u64, [u8; 512]>,
    /// Diagnostics for assertions.
    pub last_cfis: Option<[u8; 20]>,
    pub last_dw0: Option<u32>,
    pub last_slot: Option<u8>,
    pub executed: u32,
    fail_next: Option<(u32, u32)>,
    hang_next: bool,
    short_next: Option<u32>,
}

impl SimHba {
    pub fn new() -> Self {
        SimHba {
            // S64A, 32 command slots, 1 port
            cap: (1 << 31) | (31 << 8),
            ghc: 0,
            pi: 0x1,
            vs: 0x0001_0301,
            port: SimPort::new(),
            identify: identify_block("QEMU HARDDISK", "QM00001", true, 2_097_152),
            disk: BTreeMap::new(),
            last_cfis: None,
            last_dw0: None,
            last_slot: None,
            executed: 0,
            fail_next: None,
            hang_next: false,
            short_next: None,
        }
    }

    pub fn set_identify(&mut self, block: [u8; 512]) {
        self.identify = block;
    }

    /// Report no established device on the port.
    pub fn set_device_absent(&mut self) {
        self.port.ssts = 0;
    }

    /// Report an active device with a non-active link power state.
    pub fn set_link_partial(&mut self) {
        self.port.ssts = 0x213; // DET=3, IPM=2
    }

    /// Fail the next command with the given task file and SATA error.
    pub fn fail_next_command(&mut self, tfd: u32, serr: u32) {
        self.fail_next = Some((tfd, serr));
    }

    /// Leave the next command's CI bit set forever.
    pub fn hang_next_command(&mut self) {
        self.hang_next = true;
    }

    /// Complete the next command but report this PRDBC.
    pub fn short_next_command(&mut self, prdbc: u32) {
        self.short_next = Some(prdbc);
    }

    /// Current SATA error register (for write-back assertions).
    pub fn port_serr(&self) -> u32 {
        self.port.serr
    }

    /// Current CI register.
    pub fn port_ci(&self) -> u32 {
        self.port.ci
    }

    /// A sector of the disk image (zeros if never written).
    pub fn sector(&self, lba: u64) -> [u8; 512] {
        self.disk.get(&lba).copied().unwrap_or([0u8; 512])
    }

    fn read_host(addr: u64, buf: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len())
        }
    }

    fn write_host(addr: u64, buf: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), addr as usize as *mut u8, buf.len())
        }
    }

    fn execute_slot(&mut self, slot: u8) {
        self.executed += 1;
        self.last_slot = Some(slot);

        let clb = (self.port.clb as u64) | ((self.port.clbu as u64) << 32);
        let header_addr = clb + slot as u64 * 32;
        let mut header = [0u8; 32];
        Self::read_host(header_addr, &mut header);

        let dw0 = u32::from_le_bytes(header[0..4].try_into().unwrap());
        self.last_dw0 = Some(dw0);
        let prdtl = (dw0 >> 16) as usize;
        let ctba = u32::from_le_bytes(header[8..12].try_into().unwrap()) as u64
            | ((u32::from_le_bytes(header[12..16].try_into().unwrap()) as u64) << 32);

        let mut cfis = [0u8; 20];
        Self::read_host(ctba, &mut cfis);
        self.last_cfis = Some(cfis);

        if let Some((tfd, serr)) = self.fail_next.take() {
            self.port.tfd = tfd;
            self.port.serr |= serr;
            self.port.is |= 1 << 30; // TFES
            Self::write_host(header_addr + 4, &0u32.to_le_bytes());
            return;
        }

        // Gather the PRD regions (entries start at CTBA + 0x80).
        let mut regions = Vec::new();
        for i in 0..prdtl {
            let mut entry = [0u8; 16];
            Self::read_host(ctba + 0x80 + i as u64 * 16, &mut entry);
            let dba = u32::from_le_bytes(entry[0..4].try_into().unwrap()) as u64
                | ((u32::from_le_bytes(entry[4..8].try_into().unwrap()) as u64) << 32);
            let dbc = u32::from_le_bytes(entry[12..16].try_into().unwrap());
            let len = ((dbc & 0x3F_FFFF) + 1) as usize;
            regions.push((dba, len));
        }

        let opcode = cfis[2];
        let lba = (cfis[4] as u64)
            | ((cfis[5] as u64) << 8)
            | ((cfis[6] as u64) << 16)
            | ((cfis[8] as u64) << 24)
            | ((cfis[9] as u64) << 32)
            | ((cfis[10] as u64) << 40);
        let count = (cfis[12] as u64) | ((cfis[13] as u64) << 8);

        let mut prdbc: u32 = 0;
        match opcode {
            0xEC => {
                // IDENTIFY DEVICE
                let identify = self.identify;
                prdbc = Self::scatter(&regions, &identify);
            }
            0xC8 | 0x25 => {
                // READ DMA (EXT)
                let mut data = vec![0u8; count as usize * 512];
                for s in 0..count {
                    let sector = self.sector(lba + s);
                    data[s as usize * 512..(s as usize + 1) * 512].copy_from_slice(&sector);
                }
                prdbc = Self::scatter(&regions, &data);
            }
            0xCA | 0x35 => {
                // WRITE DMA (EXT)
                let mut data = vec![0u8; count as usize * 512];
                prdbc = Self::gather(&regions, &mut data);
                for s in 0..count {
                    let mut sector = [0u8; 512];
                    sector.copy_from_slice(&data[s as usize * 512..(s as usize + 1) * 512]);
                    self.disk.insert(lba + s, sector);
                }
            }
            0xE7 | 0xEA => {
                // FLUSH CACHE (EXT): no data
            }
            _ => {
                // Unknown command: abort
                self.port.tfd = 0x51;
                self.port.serr |= 1 << 16;
                self.port.is |= 1 << 30;
                Self::write_host(header_addr + 4, &0u32.to_le_bytes());
                return;
            }
        }

        if let Some(short) = self.short_next.take() {
            prdbc = short;
        }

        self.port.tfd = 0x50;
        Self::write_host(header_addr + 4, &prdbc.to_le_bytes());
    }

    /// Copy `data` out across the PRD regions in order.
    fn scatter(regions: &[(u64, usize)], data: &[u8]) -> u32 {
        let mut off = 0;
        for &(dba, len) in regions {
            if off >= data.len() {
                break;
            }
            let n = len.min(data.len() - off);
            Self::write_host(dba, &data[off..off + n]);
            off += n;
        }
        off as u32
    }

    /// Collect `data` from the PRD regions in order.
    fn gather(regions: &[(u64, usize)], data: &mut [u8]) -> u32 {
        let mut off = 0;
        for &(dba, len) in regions {
            if off >= data.len() {
                break;
            }
            let n = len.min(data.len() - off);
            Self::read_host(dba, &mut data[off..off + n]);
            off += n;
        }
        off as u32
    }

    fn port_read(&mut self, reg: u64) -> u32 {
        match reg {
            0x00 => self.port.clb,
            0x04 => self.port.clbu,
            0x08 => self.port.fb,
            0x0C => self.port.fbu,
            0x10 => self.port.is,
            0x14 => self.port.ie,
            0x18 => self.port.cmd,
            0x20 => self.port.tfd,
            0x24 => self.port.sig,
            0x28 => self.port.ssts,
            0x2C => self.port.sctl,
            0x30 => self.port.serr,
            0x34 => self.port.sact,
            0x38 => self.port.ci,
            _ => 0,
        }
    }

    fn port_write(&mut self, reg: u64, value: u32) {
        match reg {
            0x00 => self.port.clb = value,
            0x04 => self.port.clbu = value,
            0x08 => self.port.fb = value,
            0x0C => self.port.fbu = value,
            0x10 => self.port.is &= !value, // W1C
            0x14 => self.port.ie = value,
            0x18 => {
                // ST and FRE mirror into CR and FR; dropping ST also clears
                // any outstanding commands, as a real HBA does.
                let mut cmd = value;
                if cmd & (1 << 0) != 0 {
                    cmd |= 1 << 15; // CR
                } else {
                    cmd &= !(1 << 15);
                    self.port.ci = 0;
                }
                if cmd & (1 << 4) != 0 {
                    cmd |= 1 << 14; // FR
                } else {
                    cmd &= !(1 << 14);
                }
                self.port.cmd = cmd;
            }
            0x2C => self.port.sctl = value,
            0x30 => self.port.serr &= !value, // W1C
            0x34 => self.port.sact = value,
            0x38 => {
                self.port.ci |= value;
                for slot in 0..32u8 {
                    if self.port.ci & (1 << slot) == 0 {
                        continue;
                    }
                    if self.hang_next {
                        self.hang_next = false;
                        continue;
                    }
                    self.execute_slot(slot);
                    self.port.ci &= !(1 << slot);
                }
            }
            _ => {}
        }
    }
}

impl SimDevice for SimHba {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        assert_eq!(size, 4, "AHCI registers are accessed as DWords");
        let value = if offset < HBA_PORTS_OFFSET {
            match offset {
                0x00 => self.cap,
                0x04 => self.ghc,
                0x0C => self.pi,
                0x10 => self.vs,
                _ => 0,
            }
        } else {
            let reg = (offset - HBA_PORTS_OFFSET) % HBA_PORT_STRIDE;
            let port = (offset - HBA_PORTS_OFFSET) / HBA_PORT_STRIDE;
            if port == 0 {
                self.port_read(reg)
            } else {
                0
            }
        };
        value as u64
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        assert_eq!(size, 4, "AHCI registers are accessed as DWords");
        if offset < HBA_PORTS_OFFSET {
            match offset {
                0x04 => self.ghc = value as u32,
                _ => {}
            }
        } else {
            let reg = (offset - HBA_PORTS_OFFSET) % HBA_PORT_STRIDE;
            let port = (offset - HBA_PORTS_OFFSET) / HBA_PORT_STRIDE;
            if port == 0 {
                self.port_write(reg, value as u32);
            }
        }
    }
}

// =============================================================================
// TPM (TIS interface + TPM 2.0 command processing)
// =============================================================================

const TIS_LOCALITY_STRIDE: u64 = 0x1000;
const TIS_ACCESS: u64 = 0x00;
const TIS_STS: u64 = 0x18;
const TIS_DATA_FIFO: u64 = 0x24;

const TIS_ACCESS_VALID: u8 = 0x80;
const TIS_ACCESS_ACTIVE: u8 = 0x20;
const TIS_ACCESS_REQUEST_USE: u8 = 0x02;

const TIS_STS_VALID: u32 = 0x80;
const TIS_STS_COMMAND_READY: u32 = 0x40;
const TIS_STS_GO: u32 = 0x20;
const TIS_STS_DATA_AVAIL: u32 = 0x10;
const TIS_STS_DATA_EXPECT: u32 = 0x08;

const TIS_BURST: u32 = 32;

// Response codes the simulated TPM produces.
const RC_SUCCESS: u32 = 0;
const RC_INITIALIZE: u32 = 0x100;
const RC_NV_RANGE: u32 = 0x146;
const RC_NV_DEFINED: u32 = 0x14C;
const RC_HANDLE: u32 = 0x18B;

#[derive(Clone, Copy, PartialEq, Eq)]
enum TisState {
    Idle,
    Ready,
    Reception,
    Completion,
}

struct NvSlot {
    size: u16,
    data: Vec<u8>,
}

/// A simulated TPM 2.0 behind the TIS register interface.
///
/// Implements the FIFO state machine plus the seven commands the driver
/// issues, over an in-memory NV store.
pub struct SimTpm {
    active_locality: Option<u8>,
    state: TisState,
    cmd: Vec<u8>,
    resp: Vec<u8>,
    resp_pos: usize,
    nv: BTreeMap<u32, NvSlot>,
    started: bool,
    /// Refuse locality requests.
    pub deny_locality: bool,
    /// One-shot: answer the next NV_ReadPublic as if the index were absent.
    pub force_read_public_miss: bool,
    /// One-shot: fail the next command with the given command code using
    /// the given response code.
    pub fail_rc: Option<(u32, u32)>,
    /// Commands executed (for assertions).
    pub executed: u32,
}

impl SimTpm {
    pub fn new() -> Self {
        SimTpm {
            active_locality: None,
            state: TisState::Idle,
            cmd: Vec::new(),
            resp: Vec::new(),
            resp_pos: 0,
            nv: BTreeMap::new(),
            started: false,
            deny_locality: false,
            force_read_public_miss: false,
            fail_rc: None,
            executed: 0,
        }
    }

    /// Declared size of an NV index, if defined.
    pub fn nv_slot_size(&self, index: u32) -> Option<u16> {
        self.nv.get(&index).map(|slot| slot.size)
    }

    fn sts_value(&self) -> u32 {
        // In the completion phase burstCount reports what remains readable.
        let burst = match self.state {
            TisState::Completion => (self.resp.len() - self.resp_pos).min(TIS_BURST as usize) as u32,
            _ => TIS_BURST,
        };
        let mut sts = TIS_STS_VALID | (burst << 8);
        match self.state {
            TisState::Ready => sts |= TIS_STS_COMMAND_READY,
            TisState::Reception => {
                if !self.command_complete() {
                    sts |= TIS_STS_DATA_EXPECT;
                }
            }
            TisState::Completion => {
                if self.resp_pos < self.resp.len() {
                    sts |= TIS_STS_DATA_AVAIL;
                }
            }
            TisState::Idle => {}
        }
        sts
    }

    fn command_complete(&self) -> bool {
        if self.cmd.len() < 10 {
            return false;
        }
        let declared = u32::from_be_bytes(self.cmd[2..6].try_into().unwrap()) as usize;
        self.cmd.len() >= declared
    }

    fn be16(&self, at: usize) -> u16 {
        u16::from_be_bytes(self.cmd[at..at + 2].try_into().unwrap())
    }

    fn be32(&self, at: usize) -> u32 {
        u32::from_be_bytes(self.cmd[at..at + 4].try_into().unwrap())
    }

    fn error_resp(rc: u32) -> Vec<u8> {
        let mut resp = Vec::with_capacity(10);
        resp.extend_from_slice(&0x8001u16.to_be_bytes());
        resp.extend_from_slice(&10u32.to_be_bytes());
        resp.extend_from_slice(&rc.to_be_bytes());
        resp
    }

    /// Success response for a no-session command: header + raw parameters.
    fn plain_resp(params: &[u8]) -> Vec<u8> {
        let mut resp = Vec::with_capacity(10 + params.len());
        resp.extend_from_slice(&0x8001u16.to_be_bytes());
        resp.extend_from_slice(&((10 + params.len()) as u32).to_be_bytes());
        resp.extend_from_slice(&RC_SUCCESS.to_be_bytes());
        resp.extend_from_slice(params);
        resp
    }

    /// Success response for a session command: header + parameterSize +
    /// parameters + password-session acknowledgement.
    fn session_resp(params: &[u8]) -> Vec<u8> {
        let total = 10 + 4 + params.len() + 5;
        let mut resp = Vec::with_capacity(total);
        resp.extend_from_slice(&0x8002u16.to_be_bytes());
        resp.extend_from_slice(&(total as u32).to_be_bytes());
        resp.extend_from_slice(&RC_SUCCESS.to_be_bytes());
        resp.extend_from_slice(&(params.len() as u32).to_be_bytes());
        resp.extend_from_slice(params);
        resp.extend_from_slice(&[0, 0, 0, 0, 0]);
        resp
    }

    fn execute(&mut self) -> Vec<u8> {
        self.executed += 1;
        if self.cmd.len() < 10 {
            return Self::error_resp(RC_HANDLE);
        }

        let cc = self.be32(6);
        if let Some((fail_cc, rc)) = self.fail_rc {
            if fail_cc == cc {
                self.fail_rc = None;
                return Self::error_resp(rc);
            }
        }
        match cc {
            0x144 => {
                // Startup
                let su = self.be16(10);
                if self.started && su == 0 {
                    Self::error_resp(RC_INITIALIZE)
                } else {
                    self.started = true;
                    Self::plain_resp(&[])
                }
            }
            0x143 => Self::plain_resp(&[]), // SelfTest
            0x169 => {
                // NV_ReadPublic
                let index = self.be32(10);
                if self.force_read_public_miss {
                    self.force_read_public_miss = false;
                    return Self::error_resp(RC_HANDLE);
                }
                match self.nv.get(&index) {
                    None => Self::error_resp(RC_HANDLE),
                    Some(slot) => {
                        // TPM2B_NV_PUBLIC followed by an empty TPM2B_NAME.
                        let mut params = Vec::new();
                        params.extend_from_slice(&14u16.to_be_bytes());
                        params.extend_from_slice(&index.to_be_bytes());
                        params.extend_from_slice(&0x000Bu16.to_be_bytes());
                        params.extend_from_slice(&0x0002_0002u32.to_be_bytes());
                        params.extend_from_slice(&0u16.to_be_bytes());
                        params.extend_from_slice(&slot.size.to_be_bytes());
                        params.extend_from_slice(&0u16.to_be_bytes());
                        Self::plain_resp(&params)
                    }
                }
            }
            0x12A => {
                // NV_DefineSpace: skip auth area, find the public template.
                let auth_len = self.be32(14) as usize;
                let mut p = 18 + auth_len;
                let auth2b = self.be16(p) as usize;
                p += 2 + auth2b;
                p += 2; // publicInfo TPM2B size
                let index = self.be32(p);
                let policy_len = self.be16(p + 10) as usize;
                let data_size = self.be16(p + 12 + policy_len);

                if self.nv.contains_key(&index) {
                    Self::error_resp(RC_NV_DEFINED)
                } else {
                    self.nv.insert(
                        index,
                        NvSlot {
                            size: data_size,
                            data: vec![0; data_size as usize],
                        },
                    );
                    Self::session_resp(&[])
                }
            }
            0x122 => {
                // NV_UndefineSpace
                let index = self.be32(14);
                if self.nv.remove(&index).is_some() {
                    Self::session_resp(&[])
                } else {
                    Self::error_resp(RC_HANDLE)
                }
            }
            0x137 => {
                // NV_Write
                let index = self.be32(14);
                let auth_len = self.be32(18) as usize;
                let p = 22 + auth_len;
                let data_len = self.be16(p) as usize;
                let data = self.cmd[p + 2..p + 2 + data_len].to_vec();
                let offset = self.be16(p + 2 + data_len) as usize;
                match self.nv.get_mut(&index) {
                    None => Self::error_resp(RC_HANDLE),
                    Some(slot) => {
                        if offset + data_len > slot.size as usize {
                            Self::error_resp(RC_NV_RANGE)
                        } else {
                            slot.data[offset..offset + data_len].copy_from_slice(&data);
                            Self::session_resp(&[])
                        }
                    }
                }
            }
            0x14E => {
                // NV_Read
                let index = self.be32(14);
                let auth_len = self.be32(18) as usize;
                let p = 22 + auth_len;
                let size = self.be16(p) as usize;
                let offset = self.be16(p + 2) as usize;
                match self.nv.get(&index) {
                    None => Self::error_resp(RC_HANDLE),
                    Some(slot) => {
                        if offset + size > slot.size as usize {
                            Self::error_resp(RC_NV_RANGE)
                        } else {
                            let mut params = Vec::with_capacity(2 + size);
                            params.extend_from_slice(&(size as u16).to_be_bytes());
                            params.extend_from_slice(&slot.data[offset..offset + size]);
                            Self::session_resp(&params)
                        }
                    }
                }
            }
            _ => Self::error_resp(RC_HANDLE),
        }
    }
}

impl SimDevice for SimTpm {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        let locality = (offset / TIS_LOCALITY_STRIDE) as u8;
        let reg = offset % TIS_LOCALITY_STRIDE;
        match (reg, size) {
            (TIS_ACCESS, 1) => {
                let mut access = TIS_ACCESS_VALID;
                if self.active_locality == Some(locality) {
                    access |= TIS_ACCESS_ACTIVE;
                }
                access as u64
            }
            (TIS_STS, 4) => self.sts_value() as u64,
            (TIS_DATA_FIFO, 1) => {
                if self.state == TisState::Completion && self.resp_pos < self.resp.len() {
                    let byte = self.resp[self.resp_pos];
                    self.resp_pos += 1;
                    byte as u64
                } else {
                    0xFF
                }
            }
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        let locality = (offset / TIS_LOCALITY_STRIDE) as u8;
        let reg = offset % TIS_LOCALITY_STRIDE;
        match (reg, size) {
            (TIS_ACCESS, 1) => {
                if value as u8 & TIS_ACCESS_REQUEST_USE != 0 && !self.deny_locality {
                    self.active_locality = Some(locality);
                }
            }
            (TIS_STS, 4) => {
                let bits = value as u32;
                if bits & TIS_STS_COMMAND_READY != 0 {
                    self.state = TisState::Ready;
                    self.cmd.clear();
                    self.resp.clear();
                    self.resp_pos = 0;
                }
                if bits & TIS_STS_GO != 0 && self.state == TisState::Reception {
                    self.resp = self.execute();
                    self.resp_pos = 0;
                    self.cmd.clear();
                    self.state = TisState::Completion;
                }
            }
            (TIS_DATA_FIFO, 1) => {
                if self.state == TisState::Ready {
                    self.state = TisState::Reception;
                }
                if self.state == TisState::Reception {
                    self.cmd.push(value as u8);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_ram_little_endian() {
        let mut ram = SimRam::new(8);
        ram.write(0, 4, 0x1234_5678);
        assert_eq!(ram.read(0, 1), 0x78);
        assert_eq!(ram.read(2, 2), 0x1234);
    }

    #[test]
    fn bar_sizing_latch() {
        let mut bar = SimBar {
            addr: 0xFEBF_1000,
            size: 0x2000,
            io: false,
            probing: false,
        };
        assert_eq!(bar.read(), 0xFEBF_1000);
        bar.write(0xFFFF_FFFF);
        assert_eq!(bar.read(), !(0x2000 - 1));
        bar.write(0xFEBF_1000);
        assert_eq!(bar.read(), 0xFEBF_1000);
    }

    #[test]
    fn identify_block_strings_are_swapped() {
        let block = identify_block("AB", "CD", true, 100);
        // Word 27, high byte first
        assert_eq!(block[54], b'B');
        assert_eq!(block[55], b'A');
    }
}
