//! Labeled key-value storage over TPM NV indices.
//!
//! Each label maps to an NV index in the owner space: a small
//! non-cryptographic hash of the label, masked into the low 16 bits and
//! placed under the 0x01 owner prefix. Values are stored as a 2-byte
//! big-endian length followed by the bytes, so a slot can be larger than
//! its current content.

use alloc::vec::Vec;

use super::commands::{self, TPM_RC_NV_DEFINED, TPM_RC_SUCCESS};
use super::{TpmDevice, TpmError};

/// Owner-space prefix for label slots.
const NV_INDEX_BASE: u32 = 0x0100_0000;

/// Largest value the labeled store accepts.
pub const MAX_VALUE_LEN: usize = 1024;

/// Length prefix stored in front of each value.
const LENGTH_PREFIX: usize = 2;

/// Response scratch: the largest NV_Read answer plus headers and session.
const RESPONSE_BUF_LEN: usize = MAX_VALUE_LEN + LENGTH_PREFIX + 64;

/// Map a label to its NV index.
///
/// DJB-style mixer over the label bytes, masked to 16 bits. Collisions are
/// possible and tolerated: the label set on a single device is small and
/// controlled. (A production system would widen the index space or keep an
/// on-device label directory.)
pub fn nv_index_for_label(label: &str) -> u32 {
    let mut h: u32 = 5381;
    for &byte in label.as_bytes() {
        h = (h << 5).wrapping_add(h).wrapping_add(byte as u32);
    }
    NV_INDEX_BASE | (h & 0xFFFF)
}

impl TpmDevice {
    /// Declared size of an index, or `None` if it does not exist.
    fn nv_slot_size(&mut self, nv_index: u32) -> Result<Option<u16>, TpmError> {
        let mut resp = [0u8; 128];
        let cmd = commands::nv_read_public(nv_index);
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if rc != TPM_RC_SUCCESS {
            // Any failure here means "no such index" for our purposes.
            return Ok(None);
        }
        commands::nv_read_public_data_size(&resp[..n])
            .map(Some)
            .ok_or(TpmError::ShortResponse)
    }

    fn nv_define(&mut self, nv_index: u32, size: u16) -> Result<(), TpmError> {
        let mut resp = [0u8; 64];
        let cmd = commands::nv_define_space(nv_index, size);
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        // "Already defined" satisfies the caller's intent: a slot of at
        // least this size exists.
        if rc != TPM_RC_SUCCESS && rc != TPM_RC_NV_DEFINED {
            return Err(TpmError::Protocol { rc });
        }
        Ok(())
    }

    fn nv_undefine(&mut self, nv_index: u32) -> Result<(), TpmError> {
        let mut resp = [0u8; 64];
        let cmd = commands::nv_undefine_space(nv_index);
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if rc != TPM_RC_SUCCESS {
            return Err(TpmError::Protocol { rc });
        }
        Ok(())
    }

    /// Store `bytes` under `label`, resizing the slot if required.
    ///
    /// An existing slot large enough for the value is reused in place; a
    /// smaller one is undefined and redefined at the new size.
    pub fn store(&mut self, label: &str, bytes: &[u8]) -> Result<(), TpmError> {
        if bytes.len() > MAX_VALUE_LEN {
            return Err(TpmError::ValueTooLarge);
        }
        let nv_index = nv_index_for_label(label);
        let needed = (bytes.len() + LENGTH_PREFIX) as u16;

        match self.nv_slot_size(nv_index)? {
            None => self.nv_define(nv_index, needed)?,
            Some(size) if size < needed => {
                log::debug!(
                    "TPM: resizing slot {:#010x} from {} to {} bytes",
                    nv_index,
                    size,
                    needed
                );
                self.nv_undefine(nv_index)?;
                self.nv_define(nv_index, needed)?;
            }
            Some(_) => {}
        }

        let mut value = Vec::with_capacity(bytes.len() + LENGTH_PREFIX);
        value.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        value.extend_from_slice(bytes);

        let mut resp = [0u8; 64];
        let cmd = commands::nv_write(nv_index, 0, &value);
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if rc != TPM_RC_SUCCESS {
            return Err(TpmError::Protocol { rc });
        }

        log::debug!(
            "TPM: stored {} bytes under \"{}\" ({:#010x})",
            bytes.len(),
            label,
            nv_index
        );
        Ok(())
    }

    /// Retrieve the value stored under `label` into `out`.
    ///
    /// Returns the value length. Fails with `LabelNotFound` when no slot
    /// exists and `BufferTooSmall` when the stored value will not fit.
    pub fn retrieve(&mut self, label: &str, out: &mut [u8]) -> Result<usize, TpmError> {
        let nv_index = nv_index_for_label(label);
        let size = self
            .nv_slot_size(nv_index)?
            .ok_or(TpmError::LabelNotFound)?;

        let mut resp = [0u8; RESPONSE_BUF_LEN];
        let cmd = commands::nv_read(nv_index, 0, size);
        let n = self.execute(&cmd, &mut resp)?;
        let rc = commands::response_code(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if rc != TPM_RC_SUCCESS {
            return Err(TpmError::Protocol { rc });
        }

        let payload = commands::nv_read_payload(&resp[..n]).ok_or(TpmError::ShortResponse)?;
        if payload.len() < LENGTH_PREFIX {
            return Err(TpmError::ShortResponse);
        }
        let stored_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let data = payload
            .get(LENGTH_PREFIX..LENGTH_PREFIX + stored_len)
            .ok_or(TpmError::ShortResponse)?;

        if stored_len > out.len() {
            return Err(TpmError::BufferTooSmall);
        }
        out[..stored_len].copy_from_slice(data);
        Ok(stored_len)
    }
}
