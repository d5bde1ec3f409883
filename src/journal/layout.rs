//! Journal on-device framing
//!
//! Encoding of the journal header and the per-slot head and tail, plus the
//! arithmetic that places slots on the device.

use bytes::{Buf, BufMut};

use crate::device::{align_up, Geometry};

use super::{JournalError, JournalResult};

/// Magic identifying a formatted journal ("NVJL")
pub(crate) const JOURNAL_MAGIC: u32 = 0x4E56_4A4C;

/// Journal header format version
pub(crate) const JOURNAL_VERSION: u32 = 1;

/// Encoded size of the journal header
pub(crate) const JOURNAL_HEADER_SIZE: usize = 36;

/// Magic identifying slot framing ("NVSL")
pub(crate) const SLOT_MAGIC: u32 = 0x4E56_534C;

/// Slot framing version
pub(crate) const SLOT_VERSION: u32 = 1;

/// Encoded size of a slot head: Version (4) + Magic (4) + Seq (4) + Reserved (4)
pub const SLOT_HEAD_SIZE: usize = 16;

/// Encoded size of a slot tail: Size (8) + Magic (4) + Seq (4) + CRC (4) + Reserved (4)
pub const SLOT_TAIL_SIZE: usize = 24;

/// Byte offset of the checksum inside the encoded tail
const TAIL_CHECKSUM_OFFSET: usize = 16;

/// Byte offset of the checksum inside the encoded journal header
const HEADER_CHECKSUM_OFFSET: usize = 32;

// =============================================================================
// Journal Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JournalHeader {
    pub total_size: u64,
    pub slot_offset: u32,
    pub slot_count: u32,
    pub slot_size: u32,
}

impl JournalHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(JOURNAL_HEADER_SIZE);
        buf.put_u32_le(JOURNAL_MAGIC);
        buf.put_u32_le(JOURNAL_VERSION);
        buf.put_u64_le(self.total_size);
        buf.put_u32_le(JOURNAL_HEADER_SIZE as u32);
        buf.put_u32_le(self.slot_offset);
        buf.put_u32_le(self.slot_count);
        buf.put_u32_le(self.slot_size);
        buf.put_u32_le(0);

        let crc = crc32fast::hash(&buf);
        buf[HEADER_CHECKSUM_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and validate; `None` means "not formatted"
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < JOURNAL_HEADER_SIZE {
            return None;
        }

        let mut zeroed = raw[..JOURNAL_HEADER_SIZE].to_vec();
        zeroed[HEADER_CHECKSUM_OFFSET..].fill(0);

        let mut buf = &raw[..JOURNAL_HEADER_SIZE];
        let magic = buf.get_u32_le();
        let version = buf.get_u32_le();
        let total_size = buf.get_u64_le();
        let header_size = buf.get_u32_le();
        let slot_offset = buf.get_u32_le();
        let slot_count = buf.get_u32_le();
        let slot_size = buf.get_u32_le();
        let checksum = buf.get_u32_le();

        if magic != JOURNAL_MAGIC
            || version != JOURNAL_VERSION
            || header_size as usize != JOURNAL_HEADER_SIZE
            || crc32fast::hash(&zeroed) != checksum
        {
            return None;
        }

        Some(Self {
            total_size,
            slot_offset,
            slot_count,
            slot_size,
        })
    }
}

// =============================================================================
// Slot Framing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotHead {
    pub sequence: u32,
}

impl SlotHead {
    /// Encode, zero padded to `len`
    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(len);
        buf.put_u32_le(SLOT_VERSION);
        buf.put_u32_le(SLOT_MAGIC);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(0);
        buf.resize(len.max(SLOT_HEAD_SIZE), 0);
        buf
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < SLOT_HEAD_SIZE {
            return None;
        }
        let mut buf = raw;
        let version = buf.get_u32_le();
        let magic = buf.get_u32_le();
        let sequence = buf.get_u32_le();

        if version != SLOT_VERSION || magic != SLOT_MAGIC {
            return None;
        }
        Some(Self { sequence })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotTail {
    pub body_size: u64,
    pub sequence: u32,
    pub checksum: u32,
}

impl SlotTail {
    /// Encode, zero padded to `len`
    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(len);
        buf.put_u64_le(self.body_size);
        buf.put_u32_le(SLOT_MAGIC);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(SLOT_VERSION);
        buf.resize(len.max(SLOT_TAIL_SIZE), 0);
        buf
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < SLOT_TAIL_SIZE {
            return None;
        }
        let mut buf = raw;
        let body_size = buf.get_u64_le();
        let magic = buf.get_u32_le();
        let sequence = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        let version = buf.get_u32_le();

        if magic != SLOT_MAGIC || version != SLOT_VERSION {
            return None;
        }
        Some(Self {
            body_size,
            sequence,
            checksum,
        })
    }

    /// The encoded tail with its checksum field zeroed, as fed to the CRC
    pub fn encode_for_checksum(&self, len: usize) -> Vec<u8> {
        let mut raw = self.encode(len);
        raw[TAIL_CHECKSUM_OFFSET..TAIL_CHECKSUM_OFFSET + 4].fill(0);
        raw
    }
}

// =============================================================================
// Layout
// =============================================================================

/// Placement of the journal header and slots on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalLayout {
    pub geometry: Geometry,
    /// Bytes reserved for the journal header (erase aligned)
    pub header_region: u64,
    pub slot_offset: u64,
    pub slot_count: u32,
    pub slot_size: u64,
    /// Program aligned head and tail sizes
    pub head_len: usize,
    pub tail_len: usize,
}

impl JournalLayout {
    /// Compute a layout for `slot_count` slots on a device
    pub fn compute(geometry: Geometry, slot_count: u32) -> JournalResult<Self> {
        if geometry.program_unit == 0 || geometry.erase_unit == 0 {
            return Err(JournalError::InvalidGeometry(
                "program and erase units must be non-zero".to_string(),
            ));
        }
        if geometry.erase_unit % geometry.program_unit != 0 {
            return Err(JournalError::InvalidGeometry(format!(
                "erase unit {} is not a multiple of program unit {}",
                geometry.erase_unit, geometry.program_unit
            )));
        }
        if slot_count < 2 {
            return Err(JournalError::InvalidGeometry(format!(
                "need at least 2 slots, got {slot_count}"
            )));
        }

        let header_region = geometry.align_erase(geometry.align_program(JOURNAL_HEADER_SIZE)) as u64;
        if header_region >= geometry.size {
            return Err(JournalError::InvalidGeometry(
                "device too small for journal header".to_string(),
            ));
        }

        let available = geometry.size - header_region;
        let erase = geometry.erase_unit as u64;
        let slot_size = (available / slot_count as u64) / erase * erase;

        let head_len = geometry.align_program(SLOT_HEAD_SIZE);
        let tail_len = geometry.align_program(SLOT_TAIL_SIZE);
        let min_slot = (head_len + tail_len + geometry.program_unit) as u64;
        if slot_size < min_slot || slot_size > u32::MAX as u64 {
            return Err(JournalError::InvalidGeometry(format!(
                "slot size {slot_size} unusable for {slot_count} slots on {} bytes",
                geometry.size
            )));
        }

        Ok(Self {
            geometry,
            header_region,
            slot_offset: header_region,
            slot_count,
            slot_size,
            head_len,
            tail_len,
        })
    }

    /// Rebuild a layout from a decoded header, rejecting inconsistent ones
    pub(crate) fn from_header(geometry: Geometry, header: &JournalHeader) -> Option<Self> {
        let layout = Self::compute(geometry, header.slot_count).ok()?;
        let consistent = header.total_size == geometry.size
            && header.slot_offset as u64 == layout.slot_offset
            && header.slot_size as u64 == layout.slot_size;
        consistent.then_some(layout)
    }

    pub(crate) fn header(&self) -> JournalHeader {
        JournalHeader {
            total_size: self.geometry.size,
            slot_offset: self.slot_offset as u32,
            slot_count: self.slot_count,
            slot_size: self.slot_size as u32,
        }
    }

    /// Largest body a slot can hold
    pub fn max_body_size(&self) -> usize {
        self.slot_size as usize - self.head_len - self.tail_len
    }

    pub fn slot_base(&self, index: u32) -> u64 {
        self.slot_offset + index as u64 * self.slot_size
    }

    pub fn body_addr(&self, index: u32) -> u64 {
        self.slot_base(index) + self.head_len as u64
    }

    pub fn tail_addr(&self, index: u32) -> u64 {
        self.slot_base(index) + self.slot_size - self.tail_len as u64
    }

    /// Slot that follows `index` in rotation
    pub fn next_slot(&self, index: u32) -> u32 {
        (index + 1) % self.slot_count
    }

    /// Padded length of a program-aligned write covering `len` bytes
    pub fn program_len(&self, len: usize) -> usize {
        align_up(len, self.geometry.program_unit)
    }
}
