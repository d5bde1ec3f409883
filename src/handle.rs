//! Handle table
//!
//! Tracks every open handle so offsets can be repaired after arena bytes
//! move. Callers only ever see the opaque `Handle` token.

use crate::acl::Access;

/// Opaque reference to an open record.
///
/// Neither `Copy` nor `Clone`: `Store::close` and `Store::find` consume it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open handle keeps its record alive until closed"]
pub struct Handle {
    index: u32,
    generation: u32,
}

/// Per-handle state kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    /// Offset of the record header in the arena
    pub head: usize,
    pub read_pos: usize,
    pub write_pos: usize,
    /// Access granted at open
    pub access: Access,
}

impl HandleEntry {
    pub fn new(head: usize, access: Access) -> Self {
        Self {
            head,
            read_pos: 0,
            write_pos: 0,
            access,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<HandleEntry>,
}

/// Slab of open handles with generation checks
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    open: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: HandleEntry) -> Handle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.open += 1;

        Handle {
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, handle: &Handle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    pub fn get(&self, handle: &Handle) -> Option<&HandleEntry> {
        self.slot(handle)?.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: &Handle) -> Option<&mut HandleEntry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?
            .entry
            .as_mut()
    }

    /// Retire a handle; its token can never resolve again
    pub fn remove(&mut self, handle: Handle) -> Option<HandleEntry> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?;
        let entry = slot.entry.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.open -= 1;
        Some(entry)
    }

    /// Shift the head of every handle at or after `from` by `delta`
    pub fn rebase(&mut self, from: usize, delta: isize) {
        if delta == 0 {
            return;
        }
        for entry in self.entries_mut().filter(|e| e.head >= from) {
            entry.head = entry.head.saturating_add_signed(delta);
        }
    }

    /// Clamp cursors of handles on the record at `head` to `len`
    pub fn clamp_cursors(&mut self, head: usize, len: usize) {
        for entry in self.entries_mut().filter(|e| e.head == head) {
            entry.read_pos = entry.read_pos.min(len);
            entry.write_pos = entry.write_pos.min(len);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &HandleEntry> {
        self.slots.iter().filter_map(|s| s.entry.as_ref())
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut HandleEntry> {
        self.slots.iter_mut().filter_map(|s| s.entry.as_mut())
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.open
    }

    pub fn is_empty(&self) -> bool {
        self.open == 0
    }

    /// Retire every handle at once
    pub fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free.push(index as u32);
        }
        self.open = 0;
    }
}
