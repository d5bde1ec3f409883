//! Sequential Journal
//!
//! Slot-rotating journal over a synchronous `BlockDevice`. Every call
//! completes immediately with `Status::Done`.

use tracing::{debug, info, warn};

use crate::device::{BlockDevice, Geometry};

use super::layout::{JournalHeader, JournalLayout, SlotHead, SlotTail, JOURNAL_HEADER_SIZE};
use super::{
    JournalCaps, JournalError, JournalInfo, JournalResult, Outcome, Status, Journal,
};

/// Chunk size used when hashing a slot body during scans
const SCAN_CHUNK: usize = 512;

/// Serial-number order on slot sequences, so 1 follows `u32::MAX`.
///
/// Live slots are never more than `slot_count` generations apart.
fn is_newer(sequence: u32, than: u32) -> bool {
    (sequence.wrapping_sub(than) as i32) > 0
}

/// The committed slot recovery will pick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CurrentSlot {
    index: u32,
    sequence: u32,
    body_size: usize,
}

/// A slot being logged but not yet committed
struct PendingSlot {
    index: u32,
    sequence: u32,
    written: usize,
    hasher: crc32fast::Hasher,
}

/// Journal over a block device with N rotating slots
pub struct SequentialJournal<D: BlockDevice> {
    device: D,
    geometry: Geometry,
    /// Slot count used when formatting
    slot_count: u32,
    /// Known once formatted or initialized
    layout: Option<JournalLayout>,
    current: Option<CurrentSlot>,
    next_sequence: u32,
    pending: Option<PendingSlot>,
}

impl<D: BlockDevice> SequentialJournal<D> {
    /// Create a journal that formats the device with `slot_count` slots
    pub fn new(device: D, slot_count: u32) -> JournalResult<Self> {
        let geometry = device.geometry();
        // Validate early so a bad geometry is not discovered at format time
        JournalLayout::compute(geometry, slot_count)?;

        Ok(Self {
            device,
            geometry,
            slot_count,
            layout: None,
            current: None,
            next_sequence: 1,
            pending: None,
        })
    }

    /// Get the underlying device (for inspection)
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Unwrap the device, e.g. to reopen it after a simulated restart
    pub fn into_device(self) -> D {
        self.device
    }

    /// Layout in use, once formatted or initialized
    pub fn layout(&self) -> Option<&JournalLayout> {
        self.layout.as_ref()
    }

    /// Sequence number of the current slot (0 = none)
    pub fn sequence(&self) -> u32 {
        self.current.map_or(0, |c| c.sequence)
    }

    fn require_layout(&self) -> JournalResult<JournalLayout> {
        self.layout.ok_or(JournalError::NotInitialized)
    }

    fn info(&self, layout: &JournalLayout) -> JournalInfo {
        JournalInfo {
            body_size: self.current.map_or(0, |c| c.body_size),
            sequence: self.sequence(),
            slot_count: layout.slot_count,
            max_body_size: layout.max_body_size(),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn do_format(&mut self) -> JournalResult<Outcome> {
        let layout = JournalLayout::compute(self.geometry, self.slot_count)?;

        self.device.erase(0, layout.header_region)?;
        let mut header = layout.header().encode();
        header.resize(layout.program_len(JOURNAL_HEADER_SIZE), 0);
        self.device.program(0, &header)?;

        self.layout = Some(layout);
        self.do_reset()?;

        info!(
            slots = layout.slot_count,
            slot_size = layout.slot_size,
            "formatted journal"
        );
        Ok(Outcome::Formatted)
    }

    fn do_initialize(&mut self) -> JournalResult<Outcome> {
        let mut raw = [0u8; JOURNAL_HEADER_SIZE];
        self.device.read(0, &mut raw)?;

        let layout = JournalHeader::decode(&raw)
            .and_then(|header| JournalLayout::from_header(self.geometry, &header))
            .ok_or(JournalError::NotFormatted)?;

        self.layout = Some(layout);
        self.pending = None;
        self.current = None;

        for index in 0..layout.slot_count {
            match self.scan_slot(&layout, index)? {
                Some(slot) => {
                    debug!(index, sequence = slot.sequence, size = slot.body_size, "valid slot");
                    if self.current.map_or(true, |c| is_newer(slot.sequence, c.sequence)) {
                        self.current = Some(slot);
                    }
                }
                None => debug!(index, "slot empty or invalid"),
            }
        }

        self.next_sequence = self.sequence().wrapping_add(1).max(1);
        let info = self.info(&layout);
        info!(
            sequence = info.sequence,
            body_size = info.body_size,
            "journal initialized"
        );
        Ok(Outcome::Info(info))
    }

    /// Validate one slot's framing and checksum; `None` means skip it
    fn scan_slot(&mut self, layout: &JournalLayout, index: u32) -> JournalResult<Option<CurrentSlot>> {
        let mut head_raw = vec![0u8; layout.head_len];
        self.device.read(layout.slot_base(index), &mut head_raw)?;
        let Some(head) = SlotHead::decode(&head_raw) else {
            return Ok(None);
        };

        let mut tail_raw = vec![0u8; layout.tail_len];
        self.device.read(layout.tail_addr(index), &mut tail_raw)?;
        let Some(tail) = SlotTail::decode(&tail_raw) else {
            // Head without tail: an interrupted log, not corruption
            debug!(index, sequence = head.sequence, "slot has no tail");
            return Ok(None);
        };

        let body_size = tail.body_size as usize;
        if tail.sequence != head.sequence
            || body_size > layout.max_body_size()
            || body_size % self.geometry.program_unit != 0
        {
            warn!(index, "slot framing mismatch, skipping");
            return Ok(None);
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head_raw);

        let mut chunk = vec![0u8; SCAN_CHUNK];
        let mut offset = 0;
        while offset < body_size {
            let n = (body_size - offset).min(SCAN_CHUNK);
            self.device
                .read(layout.body_addr(index) + offset as u64, &mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            offset += n;
        }
        hasher.update(&tail.encode_for_checksum(layout.tail_len));

        if hasher.finalize() != tail.checksum {
            warn!(index, sequence = head.sequence, "slot checksum mismatch, skipping");
            return Ok(None);
        }

        Ok(Some(CurrentSlot {
            index,
            sequence: head.sequence,
            body_size,
        }))
    }

    fn do_read(&mut self) -> JournalResult<Outcome> {
        let layout = self.require_layout()?;
        let current = self.current.ok_or(JournalError::NoCurrentSlot)?;

        let mut body = vec![0u8; layout.program_len(current.body_size)];
        self.device
            .read(layout.body_addr(current.index), &mut body[..current.body_size])?;
        Ok(Outcome::Body(body))
    }

    fn do_log(&mut self, blob: &[u8]) -> JournalResult<Outcome> {
        let layout = self.require_layout()?;
        let unit = self.geometry.program_unit;

        if blob.len() < unit {
            return Err(JournalError::SmallLogRequest {
                len: blob.len(),
                unit,
            });
        }

        if self.pending.is_none() {
            self.pending = Some(self.open_slot(&layout)?);
        }

        let result = self.append(&layout, blob);
        if result.is_err() {
            // Abort this generation; the half-written slot fails validation
            self.pending = None;
        }
        result
    }

    /// Erase the slot after the current one and program its head
    fn open_slot(&mut self, layout: &JournalLayout) -> JournalResult<PendingSlot> {
        let index = self
            .current
            .map_or(0, |c| layout.next_slot(c.index));
        let sequence = self.next_sequence;

        self.device.erase(layout.slot_base(index), layout.slot_size)?;
        let head = SlotHead { sequence }.encode(layout.head_len);
        self.device.program(layout.slot_base(index), &head)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);

        debug!(index, sequence, "opened slot for logging");
        Ok(PendingSlot {
            index,
            sequence,
            written: 0,
            hasher,
        })
    }

    fn append(&mut self, layout: &JournalLayout, blob: &[u8]) -> JournalResult<Outcome> {
        let unit = self.geometry.program_unit;
        let pending = self.pending.as_mut().ok_or(JournalError::NotInitialized)?;

        let accepted = blob.len() / unit * unit;
        let capacity = layout.max_body_size();
        if pending.written + accepted > capacity {
            return Err(JournalError::BlobTooLarge {
                len: pending.written + accepted,
                capacity,
            });
        }

        let addr = layout.body_addr(pending.index) + pending.written as u64;
        self.device.program(addr, &blob[..accepted])?;
        pending.hasher.update(&blob[..accepted]);
        pending.written += accepted;

        Ok(Outcome::Logged(accepted))
    }

    fn do_commit(&mut self) -> JournalResult<Outcome> {
        let layout = self.require_layout()?;
        let Some(pending) = self.pending.take() else {
            return Ok(Outcome::Committed(0));
        };

        let mut tail = SlotTail {
            body_size: pending.written as u64,
            sequence: pending.sequence,
            checksum: 0,
        };
        let mut hasher = pending.hasher;
        hasher.update(&tail.encode_for_checksum(layout.tail_len));
        tail.checksum = hasher.finalize();

        self.device
            .program(layout.tail_addr(pending.index), &tail.encode(layout.tail_len))?;

        self.current = Some(CurrentSlot {
            index: pending.index,
            sequence: pending.sequence,
            body_size: pending.written,
        });
        self.next_sequence = pending.sequence.wrapping_add(1).max(1);

        debug!(
            index = pending.index,
            sequence = pending.sequence,
            size = pending.written,
            "committed slot"
        );
        Ok(Outcome::Committed(pending.written))
    }

    fn do_reset(&mut self) -> JournalResult<Outcome> {
        let layout = self.require_layout()?;
        self.pending = None;
        self.current = None;
        self.next_sequence = 1;

        for index in 0..layout.slot_count {
            self.device.erase(layout.slot_base(index), layout.slot_size)?;
        }
        debug!(slots = layout.slot_count, "reset all slots");
        Ok(Outcome::Reset)
    }
}

impl<D: BlockDevice> Journal for SequentialJournal<D> {
    fn capabilities(&self) -> JournalCaps {
        let layout = self
            .layout
            .or_else(|| JournalLayout::compute(self.geometry, self.slot_count).ok());
        JournalCaps {
            asynchronous: false,
            program_unit: self.geometry.program_unit,
            max_body_size: layout.map_or(0, |l| l.max_body_size()),
        }
    }

    fn format(&mut self) -> JournalResult<Status> {
        self.do_format().map(Status::Done)
    }

    fn initialize(&mut self) -> JournalResult<Status> {
        self.do_initialize().map(Status::Done)
    }

    fn read(&mut self) -> JournalResult<Status> {
        self.do_read().map(Status::Done)
    }

    fn log(&mut self, blob: &[u8]) -> JournalResult<Status> {
        self.do_log(blob).map(Status::Done)
    }

    fn commit(&mut self) -> JournalResult<Status> {
        self.do_commit().map(Status::Done)
    }

    fn reset(&mut self) -> JournalResult<Status> {
        self.do_reset().map(Status::Done)
    }
}
