//! Record header
//!
//! Fixed 10-byte header that precedes each record's key and value bytes.

use crate::acl::Permissions;

/// Encoded size of a record header
pub const HEADER_SIZE: usize = 10;

/// Flag bit: record is hidden and will be removed on last close
const FLAG_DELETING: u8 = 0b0000_0001;

/// Decoded record header
///
/// ```text
/// ┌──────────────┬────────────┬────────────┬───────┬───────┬──────┐
/// │ ValueLen (4) │ RefCnt (2) │ KeyLen (1) │ Perms │ Flags │ Rsvd │
/// └──────────────┴────────────┴────────────┴───────┴───────┴──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub value_len: u32,
    pub refcount: u16,
    pub key_len: u8,
    pub permissions: Permissions,
    pub deleting: bool,
}

impl RecordHeader {
    pub fn new(key_len: u8, value_len: u32, permissions: Permissions) -> Self {
        Self {
            value_len,
            refcount: 0,
            key_len,
            permissions,
            deleting: false,
        }
    }

    /// Total bytes occupied by header, key and value
    pub fn record_size(&self) -> usize {
        HEADER_SIZE + self.key_len as usize + self.value_len as usize
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.value_len.to_le_bytes());
        raw[4..6].copy_from_slice(&self.refcount.to_le_bytes());
        raw[6] = self.key_len;
        raw[7] = self.permissions.bits();
        raw[8] = if self.deleting { FLAG_DELETING } else { 0 };
        raw
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        Self {
            value_len: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            refcount: u16::from_le_bytes([raw[4], raw[5]]),
            key_len: raw[6],
            permissions: Permissions::from_bits(raw[7]),
            deleting: raw[8] & FLAG_DELETING != 0,
        }
    }
}
