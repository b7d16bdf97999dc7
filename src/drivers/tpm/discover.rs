//! TPM base-address autodiscovery.
//!
//! Three passes, cheapest evidence first:
//!
//! 1. PCI: a function from a known TPM vendor, or in the SerialBus class
//!    with the TPM subclass, that has a configured memory BAR0.
//! 2. ACPI: locate the RSDP (EBDA pointer, then the BIOS ROM scan area),
//!    validate it, then walk the XSDT (or RSDT) for a "TPM2" table — "TCPA"
//!    as the legacy fallback — and take the control-area address from it.
//! 3. The three well-known candidates, each probed for life via the ACCESS
//!    register VALID bit.

use crate::mmio;
use crate::pci::{self, ConfigSpace, DeviceClass};

use super::{TPM_ACCESS, TPM_ACCESS_VALID};

/// Well-known TIS base candidates, probed in order.
pub const TPM_DEFAULT_BASES: [u64; 3] = [0xFED4_0000, 0xFED4_5000, 0xFED4_A000];

/// PCI vendors that ship discrete TPMs (STMicro, Nuvoton, Atmel, Infineon).
const TPM_PCI_VENDORS: [u16; 4] = [0x104A, 0x1050, 0x1114, 0x15D1];

/// TPM subclass within the SerialBus class.
const PCI_SUBCLASS_TPM: u8 = 0x05;

/// EBDA segment pointer in the BIOS data area.
const BDA_EBDA_POINTER: u64 = 0x40E;

/// BIOS ROM scan window for the RSDP.
const BIOS_ROM_START: u64 = 0xE_0000;
const BIOS_ROM_END: u64 = 0x10_0000;

/// ACPI system description table header length.
const SDT_HEADER_LEN: u64 = 36;

/// Control-area address offsets within the TPM tables.
const TPM2_CONTROL_OFFSET: u64 = 40;
const TCPA_CONTROL_OFFSET: u64 = 48;

/// Locate the TPM. Returns the locality-0 base address.
pub fn discover(cfg: ConfigSpace) -> Option<u64> {
    if let Some(base) = pci_probe(&cfg) {
        log::info!("TPM: found via PCI at {:#x}", base);
        return Some(base);
    }
    if let Some(base) = acpi_probe() {
        log::info!("TPM: found via ACPI at {:#x}", base);
        return Some(base);
    }
    if let Some(base) = candidate_probe() {
        log::info!("TPM: found by probing at {:#x}", base);
        return Some(base);
    }
    log::warn!("TPM: no device found");
    None
}

/// PCI pass: a TPM function with a configured memory BAR0.
///
/// A match without a usable BAR falls through to the other methods rather
/// than failing discovery.
fn pci_probe(cfg: &ConfigSpace) -> Option<u64> {
    pci::enumerate(cfg).iter().find_map(|d| {
        let vendor_match = TPM_PCI_VENDORS.contains(&d.vendor_id);
        let class_match = d.class == DeviceClass::SerialBus && d.subclass == PCI_SUBCLASS_TPM;
        if !vendor_match && !class_match {
            return None;
        }
        let bar = &d.bars[0];
        if bar.is_valid() && !bar.is_io && bar.address != 0 {
            Some(bar.address)
        } else {
            None
        }
    })
}

fn read64(pa: u64) -> u64 {
    mmio::read32(pa) as u64 | ((mmio::read32(pa + 4) as u64) << 32)
}

/// Byte-sum of a region; a valid ACPI structure sums to zero.
fn checksum(pa: u64, len: u64) -> u8 {
    let mut sum: u8 = 0;
    for i in 0..len {
        sum = sum.wrapping_add(mmio::read8(pa + i));
    }
    sum
}

fn has_signature(pa: u64, sig: &[u8]) -> bool {
    sig.iter()
        .enumerate()
        .all(|(i, &b)| mmio::read8(pa + i as u64) == b)
}

/// Scan a window for "RSD PTR " on 16-byte boundaries, checksum-validating
/// every candidate.
fn scan_for_rsdp(start: u64, end: u64) -> Option<u64> {
    let mut pa = start & !0xF;
    while pa + 36 <= end {
        if has_signature(pa, b"RSD PTR ") && checksum(pa, 20) == 0 {
            let revision = mmio::read8(pa + 15);
            if revision < 2 || checksum(pa, 36) == 0 {
                return Some(pa);
            }
        }
        pa += 16;
    }
    None
}

/// Find the RSDP: the EBDA first, then the BIOS ROM area.
fn find_rsdp() -> Option<u64> {
    let ebda_segment = mmio::read16(BDA_EBDA_POINTER) as u64;
    if ebda_segment != 0 {
        let ebda = ebda_segment << 4;
        if let Some(rsdp) = scan_for_rsdp(ebda, ebda + 0x400) {
            return Some(rsdp);
        }
    }
    scan_for_rsdp(BIOS_ROM_START, BIOS_ROM_END)
}

/// ACPI pass: RSDP, then the XSDT/RSDT entry walk for TPM2, then TCPA.
fn acpi_probe() -> Option<u64> {
    let rsdp = find_rsdp()?;
    let revision = mmio::read8(rsdp + 15);

    let (sdt, entry_size) = if revision >= 2 {
        let xsdt = read64(rsdp + 24);
        if xsdt != 0 {
            (xsdt, 8u64)
        } else {
            (mmio::read32(rsdp + 16) as u64, 4u64)
        }
    } else {
        (mmio::read32(rsdp + 16) as u64, 4u64)
    };
    if sdt == 0 {
        return None;
    }

    let length = mmio::read32(sdt + 4) as u64;
    if length < SDT_HEADER_LEN || checksum(sdt, length) != 0 {
        log::warn!("TPM: ACPI root table at {:#x} fails validation", sdt);
        return None;
    }
    let entries = (length - SDT_HEADER_LEN) / entry_size;

    for (sig, control_offset) in [
        (&b"TPM2"[..], TPM2_CONTROL_OFFSET),
        (&b"TCPA"[..], TCPA_CONTROL_OFFSET),
    ] {
        for i in 0..entries {
            let slot = sdt + SDT_HEADER_LEN + i * entry_size;
            let table = if entry_size == 8 {
                read64(slot)
            } else {
                mmio::read32(slot) as u64
            };
            if table == 0 || !has_signature(table, sig) {
                continue;
            }
            let control = read64(table + control_offset);
            if control != 0 {
                return Some(control);
            }
        }
    }
    None
}

/// Liveness-probe the well-known bases via the ACCESS register.
fn candidate_probe() -> Option<u64> {
    TPM_DEFAULT_BASES.into_iter().find(|&base| {
        let access = mmio::read8(base + TPM_ACCESS);
        access != 0xFF && access & TPM_ACCESS_VALID != 0
    })
}
