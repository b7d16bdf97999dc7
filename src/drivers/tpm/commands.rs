//! TPM 2.0 command encoders and response decoding.
//!
//! Every command buffer starts with the standard header: a 2-byte tag, a
//! 4-byte total size, and a 4-byte command code, all big-endian. Commands in
//! the owner hierarchy carry a password-session authorization area with an
//! empty password.

use alloc::vec::Vec;

/// Command/response header length.
pub const RESPONSE_HEADER_LEN: usize = 10;

// Structure tags.
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;
pub const TPM_ST_SESSIONS: u16 = 0x8002;

// Command codes.
pub const TPM_CC_NV_UNDEFINE_SPACE: u32 = 0x0000_0122;
pub const TPM_CC_NV_DEFINE_SPACE: u32 = 0x0000_012A;
pub const TPM_CC_NV_WRITE: u32 = 0x0000_0137;
pub const TPM_CC_SELF_TEST: u32 = 0x0000_0143;
pub const TPM_CC_STARTUP: u32 = 0x0000_0144;
pub const TPM_CC_NV_READ: u32 = 0x0000_014E;
pub const TPM_CC_NV_READ_PUBLIC: u32 = 0x0000_0169;

// Permanent handles.
pub const TPM_RH_OWNER: u32 = 0x4000_0001;
pub const TPM_RS_PW: u32 = 0x4000_0009;

// Response codes this driver interprets.
pub const TPM_RC_SUCCESS: u32 = 0x0000_0000;
/// Startup after the TPM already started.
pub const TPM_RC_INITIALIZE: u32 = 0x0000_0100;
/// NV_DefineSpace on an index that already exists.
pub const TPM_RC_NV_DEFINED: u32 = 0x0000_014C;

/// TPM_SU_CLEAR startup type.
const TPM_SU_CLEAR: u16 = 0x0000;

/// SHA-256 name algorithm for NV publics.
const TPM_ALG_SHA256: u16 = 0x000B;

/// TPMA_NV: owner may write (bit 1) and read (bit 17).
const TPMA_NV_OWNER_RW: u32 = (1 << 1) | (1 << 17);

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Start a command buffer; the size field is patched by `finish`.
fn begin(tag: u16, cc: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    put_u16(&mut buf, tag);
    put_u32(&mut buf, 0); // patched below
    put_u32(&mut buf, cc);
    buf
}

/// Patch the total size into the header.
fn finish(mut buf: Vec<u8>) -> Vec<u8> {
    let size = buf.len() as u32;
    buf[2..6].copy_from_slice(&size.to_be_bytes());
    buf
}

/// The empty password-session authorization area: 4-byte area size, the
/// TPM_RS_PW handle, an empty nonce, zero attributes, an empty hmac.
fn put_password_auth(buf: &mut Vec<u8>) {
    put_u32(buf, 9); // area size
    put_u32(buf, TPM_RS_PW);
    put_u16(buf, 0); // nonce
    buf.push(0); // session attributes
    put_u16(buf, 0); // hmac / password
}

/// TPM2_Startup(TPM_SU_CLEAR)
pub fn startup_clear() -> Vec<u8> {
    let mut buf = begin(TPM_ST_NO_SESSIONS, TPM_CC_STARTUP);
    put_u16(&mut buf, TPM_SU_CLEAR);
    finish(buf)
}

/// TPM2_SelfTest(fullTest = YES)
pub fn self_test_full() -> Vec<u8> {
    let mut buf = begin(TPM_ST_NO_SESSIONS, TPM_CC_SELF_TEST);
    buf.push(1);
    finish(buf)
}

/// TPM2_NV_ReadPublic for an index.
pub fn nv_read_public(nv_index: u32) -> Vec<u8> {
    let mut buf = begin(TPM_ST_NO_SESSIONS, TPM_CC_NV_READ_PUBLIC);
    put_u32(&mut buf, nv_index);
    finish(buf)
}

/// TPM2_NV_DefineSpace: an owner-readable, owner-writable index of
/// `data_size` bytes with no policy and an empty auth value.
pub fn nv_define_space(nv_index: u32, data_size: u16) -> Vec<u8> {
    let mut buf = begin(TPM_ST_SESSIONS, TPM_CC_NV_DEFINE_SPACE);
    put_u32(&mut buf, TPM_RH_OWNER);
    put_password_auth(&mut buf);
    put_u16(&mut buf, 0); // auth: empty TPM2B
    put_u16(&mut buf, 14); // publicInfo size: the TPMS_NV_PUBLIC below
    put_u32(&mut buf, nv_index);
    put_u16(&mut buf, TPM_ALG_SHA256);
    put_u32(&mut buf, TPMA_NV_OWNER_RW);
    put_u16(&mut buf, 0); // authPolicy: empty TPM2B
    put_u16(&mut buf, data_size);
    finish(buf)
}

/// TPM2_NV_UndefineSpace under the owner hierarchy.
pub fn nv_undefine_space(nv_index: u32) -> Vec<u8> {
    let mut buf = begin(TPM_ST_SESSIONS, TPM_CC_NV_UNDEFINE_SPACE);
    put_u32(&mut buf, TPM_RH_OWNER);
    put_u32(&mut buf, nv_index);
    put_password_auth(&mut buf);
    finish(buf)
}

/// TPM2_NV_Write of `data` at `offset`, authorized by the owner.
pub fn nv_write(nv_index: u32, offset: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = begin(TPM_ST_SESSIONS, TPM_CC_NV_WRITE);
    put_u32(&mut buf, TPM_RH_OWNER);
    put_u32(&mut buf, nv_index);
    put_password_auth(&mut buf);
    put_u16(&mut buf, data.len() as u16);
    buf.extend_from_slice(data);
    put_u16(&mut buf, offset);
    finish(buf)
}

/// TPM2_NV_Read of `size` bytes at `offset`, authorized by the owner.
pub fn nv_read(nv_index: u32, offset: u16, size: u16) -> Vec<u8> {
    let mut buf = begin(TPM_ST_SESSIONS, TPM_CC_NV_READ);
    put_u32(&mut buf, TPM_RH_OWNER);
    put_u32(&mut buf, nv_index);
    put_password_auth(&mut buf);
    put_u16(&mut buf, size);
    put_u16(&mut buf, offset);
    finish(buf)
}

fn be16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn be32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

/// Response code: bytes 6..10 of the response, big-endian.
pub fn response_code(resp: &[u8]) -> Option<u32> {
    be32(resp, 6)
}

/// Data payload of a successful NV_Read response: the TPM2B inside the
/// parameter area.
pub fn nv_read_payload(resp: &[u8]) -> Option<&[u8]> {
    // header(10) | parameterSize(4) | TPM2B: size(2) data(..)
    let len = be16(resp, 14)? as usize;
    resp.get(16..16 + len)
}

/// Declared data size of an index, from a successful NV_ReadPublic
/// response.
pub fn nv_read_public_data_size(resp: &[u8]) -> Option<u16> {
    // header(10) | TPM2B_NV_PUBLIC: size(2) | nvIndex(4) nameAlg(2)
    // attributes(4) authPolicy(2+n) dataSize(2) | TPM2B_NAME ...
    let policy_len = be16(resp, 22)? as usize;
    be16(resp, 24 + policy_len)
}
