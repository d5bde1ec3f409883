//! Arena Module
//!
//! The single packed byte region holding every record.
//!
//! ## Responsibilities
//! - Append records at the end
//! - Grow/shrink a value in place, shifting the records after it
//! - Remove a record, shifting the records after it down
//! - Serialize to and rebuild from the persisted image
//!
//! ## Layout
//! ```text
//! ┌────────┬─────┬───────┬────────┬─────┬───────┬─────┐
//! │ Header │ Key │ Value │ Header │ Key │ Value │ ... │
//! └────────┴─────┴───────┴────────┴─────┴───────┴─────┘
//! 0                                                  len
//! ```
//!
//! Records are addressed by the offset of their header. Offsets survive a
//! reallocation of the buffer, but not a shift: callers holding offsets past
//! a resized or removed record must rebase them by the returned delta.

mod record;

use bytes::{Buf, BufMut};

use crate::acl::Permissions;
use crate::device::align_up;
use crate::error::{NvkvError, Result};

pub use record::{RecordHeader, HEADER_SIZE};

/// Magic at the start of a persisted arena image ("NVAR")
const IMAGE_MAGIC: u32 = 0x4E56_4152;

/// Image preamble: Magic (4) + ArenaLen (4)
pub const IMAGE_HEADER_SIZE: usize = 8;

/// A record located in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    pub offset: usize,
    pub header: RecordHeader,
}

impl RecordRef {
    /// Offset just past this record's value bytes
    pub fn end(&self) -> usize {
        self.offset + self.header.record_size()
    }
}

/// Packed record arena
#[derive(Debug, Clone, Default)]
pub struct Arena {
    buf: Vec<u8>,
    limit: usize,
}

impl Arena {
    /// Create an empty arena that may grow up to `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf = Vec::new();
    }

    // =========================================================================
    // Record Access
    // =========================================================================

    pub fn header(&self, offset: usize) -> Result<RecordHeader> {
        let raw: &[u8; HEADER_SIZE] = self
            .buf
            .get(offset..offset + HEADER_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| NvkvError::Internal(format!("no record header at {offset}")))?;
        Ok(RecordHeader::decode(raw))
    }

    pub fn set_header(&mut self, offset: usize, header: &RecordHeader) -> Result<()> {
        let slot = self
            .buf
            .get_mut(offset..offset + HEADER_SIZE)
            .ok_or_else(|| NvkvError::Internal(format!("no record header at {offset}")))?;
        slot.copy_from_slice(&header.encode());
        Ok(())
    }

    /// Read-modify-write a record header
    pub fn update_header<F>(&mut self, offset: usize, f: F) -> Result<RecordHeader>
    where
        F: FnOnce(&mut RecordHeader),
    {
        let mut header = self.header(offset)?;
        f(&mut header);
        self.set_header(offset, &header)?;
        Ok(header)
    }

    pub fn key(&self, offset: usize) -> Result<&str> {
        let header = self.header(offset)?;
        let start = offset + HEADER_SIZE;
        let raw = self
            .buf
            .get(start..start + header.key_len as usize)
            .ok_or_else(|| NvkvError::Internal(format!("truncated key at {offset}")))?;
        std::str::from_utf8(raw)
            .map_err(|_| NvkvError::Internal(format!("non-UTF-8 key at {offset}")))
    }

    fn value_range(&self, offset: usize) -> Result<std::ops::Range<usize>> {
        let header = self.header(offset)?;
        let start = offset + HEADER_SIZE + header.key_len as usize;
        let end = start + header.value_len as usize;
        if end > self.buf.len() {
            return Err(NvkvError::Internal(format!("truncated value at {offset}")));
        }
        Ok(start..end)
    }

    pub fn value(&self, offset: usize) -> Result<&[u8]> {
        let range = self.value_range(offset)?;
        Ok(&self.buf[range])
    }

    pub fn value_mut(&mut self, offset: usize) -> Result<&mut [u8]> {
        let range = self.value_range(offset)?;
        Ok(&mut self.buf[range])
    }

    /// Iterate records in arena order
    pub fn records(&self) -> Records<'_> {
        self.records_from(0)
    }

    /// Iterate records starting at the record whose header is at `offset`
    pub fn records_from(&self, offset: usize) -> Records<'_> {
        Records {
            arena: self,
            offset,
        }
    }

    /// Find a record by exact key, deleting or not
    pub fn find(&self, key: &str) -> Option<RecordRef> {
        self.records()
            .find(|r| self.key(r.offset).map_or(false, |k| k == key))
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Make room for `additional` bytes, honoring the limit
    fn reserve(&mut self, additional: usize) -> Result<()> {
        let requested = self.buf.len() + additional;
        if requested > self.limit {
            return Err(NvkvError::OutOfMemory {
                requested,
                limit: self.limit,
            });
        }
        self.buf
            .try_reserve(additional)
            .map_err(|_| NvkvError::OutOfMemory {
                requested,
                limit: self.limit,
            })
    }

    /// Append a record with a zero-filled value; returns its offset
    pub fn append(&mut self, key: &str, value_len: u32, permissions: Permissions) -> Result<usize> {
        let key_len = u8::try_from(key.len())
            .map_err(|_| NvkvError::Internal(format!("key of {} bytes", key.len())))?;
        let header = RecordHeader::new(key_len, value_len, permissions);
        self.reserve(header.record_size())?;

        let offset = self.buf.len();
        self.buf.extend_from_slice(&header.encode());
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.resize(offset + header.record_size(), 0);
        Ok(offset)
    }

    /// Change a record's value length in place.
    ///
    /// Grown bytes are zero-filled, shrinking drops the tail of the value.
    /// Returns the signed size change; every record after this one moved by
    /// that amount.
    pub fn resize_value(&mut self, offset: usize, new_len: u32) -> Result<isize> {
        let header = self.header(offset)?;
        let old_end = offset + header.record_size();
        let old_len = self.buf.len();

        if new_len > header.value_len {
            let grow = (new_len - header.value_len) as usize;
            self.reserve(grow)?;
            self.buf.resize(old_len + grow, 0);
            self.buf.copy_within(old_end..old_len, old_end + grow);
            self.buf[old_end..old_end + grow].fill(0);
        } else if new_len < header.value_len {
            let shrink = (header.value_len - new_len) as usize;
            self.buf.copy_within(old_end..old_len, old_end - shrink);
            self.buf.truncate(old_len - shrink);
        }

        self.update_header(offset, |h| h.value_len = new_len)?;
        Ok(new_len as isize - header.value_len as isize)
    }

    /// Physically remove a record; returns the number of bytes removed
    pub fn remove(&mut self, offset: usize) -> Result<usize> {
        let header = self.header(offset)?;
        let size = header.record_size();
        if offset + size > self.buf.len() {
            return Err(NvkvError::Internal(format!("truncated record at {offset}")));
        }
        self.buf.drain(offset..offset + size);
        Ok(size)
    }

    // =========================================================================
    // Integrity
    // =========================================================================

    /// Walk every record and check that they tile the arena exactly.
    ///
    /// Returns the offsets of all record headers.
    pub fn validate(&self) -> Result<Vec<usize>> {
        let mut offsets = Vec::new();
        let mut offset = 0;

        while offset < self.buf.len() {
            let header = self.header(offset)?;
            if header.key_len == 0 {
                return Err(NvkvError::Internal(format!("empty key at {offset}")));
            }
            if offset + header.record_size() > self.buf.len() {
                return Err(NvkvError::Internal(format!(
                    "record at {offset} overruns arena of {} bytes",
                    self.buf.len()
                )));
            }
            self.key(offset)?;
            offsets.push(offset);
            offset += header.record_size();
        }

        Ok(offsets)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serialize to the journal body format, zero padded to `unit`
    pub fn to_image(&self, unit: usize) -> Vec<u8> {
        let len = align_up(IMAGE_HEADER_SIZE + self.buf.len(), unit);
        let mut image = Vec::with_capacity(len);
        image.put_u32_le(IMAGE_MAGIC);
        image.put_u32_le(self.buf.len() as u32);
        image.extend_from_slice(&self.buf);
        image.resize(len, 0);
        image
    }

    /// Rebuild an arena from a journal body.
    ///
    /// Reference counts are reset and records left mid-delete are dropped,
    /// since no handle survives a restart.
    pub fn from_image(image: &[u8], limit: usize) -> Result<Self> {
        if image.is_empty() {
            return Ok(Self::new(limit));
        }
        if image.len() < IMAGE_HEADER_SIZE {
            return Err(NvkvError::Internal("arena image truncated".to_string()));
        }

        let mut preamble = &image[..IMAGE_HEADER_SIZE];
        let magic = preamble.get_u32_le();
        let len = preamble.get_u32_le() as usize;

        if magic != IMAGE_MAGIC {
            return Err(NvkvError::Internal(format!("bad arena image magic {magic:#010x}")));
        }
        let body = image
            .get(IMAGE_HEADER_SIZE..IMAGE_HEADER_SIZE + len)
            .ok_or_else(|| NvkvError::Internal("arena image shorter than header claims".to_string()))?;
        if len > limit {
            return Err(NvkvError::OutOfMemory {
                requested: len,
                limit,
            });
        }

        let mut arena = Self {
            buf: body.to_vec(),
            limit,
        };
        let offsets = arena.validate()?;

        // Back to front so earlier offsets stay put
        for &offset in offsets.iter().rev() {
            let header = arena.update_header(offset, |h| h.refcount = 0)?;
            if header.deleting {
                arena.remove(offset)?;
            }
        }

        Ok(arena)
    }
}

/// Iterator over arena records
pub struct Records<'a> {
    arena: &'a Arena,
    offset: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = RecordRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.arena.len() {
            return None;
        }
        let header = self.arena.header(self.offset).ok()?;
        let record = RecordRef {
            offset: self.offset,
            header,
        };
        self.offset = record.end();
        Some(record)
    }
}
