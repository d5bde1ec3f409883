//! Store Module
//!
//! The key-value store clients talk to. Owns the record arena and the handle
//! table, and hands initialize/flush/reset to the flush machine.
//!
//! ## Responsibilities
//! - create/open/find/read/write/rseek/delete/close against the arena
//! - Repair every open handle after arena bytes move
//! - Defer physical removal of a deleted record to its last close
//! - Refuse mutations while an asynchronous flush is in flight

mod types;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::acl::{Access, Authorizer, OwnerAlways};
use crate::arena::{Arena, RecordRef};
use crate::config::Config;
use crate::device::BlockDevice;
use crate::error::{NvkvError, Result};
use crate::flush::{Finished, FlushMachine, FlushState};
use crate::handle::{Handle, HandleEntry, HandleTable};
use crate::journal::{Journal, JournalError, SequentialJournal};
use crate::key::{validate_key, Query};

pub use types::{Capabilities, KeyDesc, Progress, StoreEvent, StoreOp, StoreStatus};

/// How long `wait` blocks before re-checking the machine
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Arena and handle table borrowed for one mutating operation
struct Txn<'a> {
    arena: &'a mut Arena,
    handles: &'a mut HandleTable,
    dirty: bool,
}

/// Crash-safe key-value store
///
/// ## Concurrency Model
///
/// - **Mutations** (create/write/delete/grow-shrink/flush/reset): serialized
///   by `write_lock`, then machine → arena → handles.
/// - **Reads** (read/rseek/key_name/value_len/status): arena read lock plus
///   the handle table; no `write_lock`.
/// - While initialize/flush/reset is pending on an asynchronous driver,
///   mutations fail with `OperationPending` instead of blocking.
pub struct Store<J: Journal> {
    config: Config,
    authorizer: Box<dyn Authorizer>,

    /// Serializes mutating operations
    write_lock: Mutex<()>,

    machine: Mutex<FlushMachine<J>>,
    arena: RwLock<Arena>,
    handles: Mutex<HandleTable>,

    events_tx: Sender<StoreEvent>,
    events_rx: Receiver<StoreEvent>,
}

impl<D: BlockDevice> Store<SequentialJournal<D>> {
    /// Build a store over a synchronous device, with `config.slot_count` slots
    pub fn open_device(config: Config, device: D) -> Result<Self> {
        let journal = SequentialJournal::new(device, config.slot_count)?;
        Ok(Self::new(config, journal))
    }
}

impl<J: Journal> Store<J> {
    /// Create a stopped store over a journal driver
    pub fn new(config: Config, journal: J) -> Self {
        let machine = FlushMachine::new(journal, config.auto_format);
        let (events_tx, events_rx) = channel::unbounded();

        Self {
            arena: RwLock::new(Arena::new(config.arena_limit)),
            config,
            authorizer: Box::new(OwnerAlways),
            write_lock: Mutex::new(()),
            machine: Mutex::new(machine),
            handles: Mutex::new(HandleTable::new()),
            events_tx,
            events_rx,
        }
    }

    /// Replace the hook that decides key ownership
    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Box::new(authorizer);
        self
    }

    /// Completion events for operations that answered `Progress::Pending`
    pub fn events(&self) -> Receiver<StoreEvent> {
        self.events_rx.clone()
    }

    /// Stop the store and return the journal driver
    pub fn into_journal(self) -> J {
        self.machine.into_inner().into_journal()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load the newest persisted arena (formatting a blank device if enabled)
    pub fn initialize(&self) -> Result<Progress> {
        let _guard = self.write_lock.lock();
        let mut machine = self.machine.lock();

        match machine.state() {
            FlushState::Ready => return Ok(Progress::Done),
            FlushState::Stopped => {}
            _ => return Err(NvkvError::OperationPending),
        }

        machine.request_init()?;
        self.settle(&mut machine)
    }

    /// Persist the arena into a new journal slot
    pub fn flush(&self) -> Result<Progress> {
        let _guard = self.write_lock.lock();
        let mut machine = self.machine.lock();
        Self::ensure_ready(&machine)?;

        let unit = machine.capabilities().program_unit;
        {
            let arena = self.arena.read();
            machine.request_flush(|| arena.to_image(unit))?;
        }
        self.settle(&mut machine)
    }

    /// Erase every slot and empty the arena
    pub fn reset(&self) -> Result<Progress> {
        let _guard = self.write_lock.lock();
        let mut machine = self.machine.lock();
        Self::ensure_ready(&machine)?;

        let open = self.handles.lock().len();
        if open > 0 {
            return Err(NvkvError::HandlesOpen(open));
        }

        machine.request_reset()?;
        self.settle(&mut machine)
    }

    /// Return to `Stopped`, discarding the in-memory arena
    pub fn uninitialize(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut machine = self.machine.lock();

        if machine.state() == FlushState::Stopped {
            return Ok(());
        }
        let open = self.handles.lock().len();
        if open > 0 {
            return Err(NvkvError::HandlesOpen(open));
        }
        if machine.is_dirty() {
            warn!("uninitializing with unflushed changes");
        }

        machine.stop()?;
        self.arena.write().clear();
        info!("store uninitialized");
        Ok(())
    }

    /// Process driver completions that already arrived; returns the number
    /// of client operations that finished
    pub fn poll(&self) -> usize {
        let mut machine = self.machine.lock();
        machine.poll();
        self.dispatch(&mut machine)
    }

    /// Block until no initialize/flush/reset is in flight.
    ///
    /// Returns the outcome of the operation that was pending, if any.
    pub fn wait(&self) -> Result<()> {
        let completions = self.machine.lock().completion_receiver();
        let mut outcome = Ok(());

        loop {
            {
                let mut machine = self.machine.lock();
                machine.poll();
                if let Some(result) = self.dispatch_one(&mut machine) {
                    outcome = result;
                }
                if !machine.is_busy() {
                    return outcome;
                }
            }

            match completions.recv_timeout(WAIT_SLICE) {
                Ok(completion) => self.machine.lock().complete(completion),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.machine.lock().abort(JournalError::Disconnected)
                }
            }
        }
    }

    /// Finish a just-issued request: `Done` if the machine already settled
    fn settle(&self, machine: &mut FlushMachine<J>) -> Result<Progress> {
        match machine.take_finished() {
            Some(finished) => self.apply(machine, finished).map(|_| Progress::Done),
            None => Ok(Progress::Pending),
        }
    }

    /// Apply finished asynchronous work and publish events
    fn dispatch(&self, machine: &mut FlushMachine<J>) -> usize {
        let mut count = 0;
        while self.dispatch_one(machine).is_some() {
            count += 1;
        }
        count
    }

    fn dispatch_one(&self, machine: &mut FlushMachine<J>) -> Option<Result<()>> {
        let finished = machine.take_finished()?;
        let op = match &finished {
            Finished::Initialized(_) => StoreOp::Initialize,
            Finished::Flushed(_) => StoreOp::Flush,
            Finished::Reset(_) => StoreOp::Reset,
        };
        let result = self.apply(machine, finished);
        debug!(?op, ok = result.is_ok(), "asynchronous operation completed");

        if self.events_tx.send(StoreEvent { op, result: result.clone() }).is_err() {
            warn!(?op, "event receiver dropped");
        }
        Some(result)
    }

    /// Bring the arena in line with a finished machine request
    fn apply(&self, machine: &mut FlushMachine<J>, finished: Finished) -> Result<()> {
        match finished {
            Finished::Initialized(result) => {
                let image = result?.unwrap_or_default();
                match Arena::from_image(&image, self.config.arena_limit) {
                    Ok(arena) => {
                        info!(bytes = arena.len(), "arena loaded");
                        *self.arena.write() = arena;
                        self.handles.lock().clear();
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "persisted arena rejected");
                        machine.stop()?;
                        Err(e)
                    }
                }
            }
            Finished::Flushed(result) => {
                self.purge_orphans(machine)?;
                result
            }
            Finished::Reset(result) => {
                result?;
                self.arena.write().clear();
                self.handles.lock().clear();
                Ok(())
            }
        }
    }

    /// Remove deleted records whose last close came in while a flush was
    /// pending
    fn purge_orphans(&self, machine: &mut FlushMachine<J>) -> Result<()> {
        let mut arena = self.arena.write();
        let mut handles = self.handles.lock();

        let orphans: Vec<RecordRef> = arena
            .records()
            .filter(|r| r.header.deleting && r.header.refcount == 0)
            .collect();

        for record in orphans.iter().rev() {
            let size = arena.remove(record.offset)?;
            handles.rebase(record.offset + size, -(size as isize));
        }
        if !orphans.is_empty() {
            machine.mark_dirty();
        }
        Ok(())
    }

    fn ensure_ready(machine: &FlushMachine<J>) -> Result<()> {
        match machine.state() {
            FlushState::Ready => Ok(()),
            FlushState::Stopped => Err(NvkvError::NotInitialized),
            _ => Err(NvkvError::OperationPending),
        }
    }

    /// Non-mutating calls only need the store to have been initialized.
    ///
    /// A pending reset is about to drop every record, so no new handle may be
    /// taken against the arena it is replacing.
    fn ensure_started(machine: &FlushMachine<J>) -> Result<()> {
        match machine.state() {
            FlushState::Stopped
            | FlushState::Initializing
            | FlushState::Formatting
            | FlushState::Reading => Err(NvkvError::NotInitialized),
            FlushState::Resetting => Err(NvkvError::OperationPending),
            _ => Ok(()),
        }
    }

    /// Run a mutating operation under the full lock set
    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T>,
    {
        let _guard = self.write_lock.lock();
        let mut machine = self.machine.lock();
        Self::ensure_ready(&machine)?;

        let mut arena = self.arena.write();
        let mut handles = self.handles.lock();
        let mut txn = Txn {
            arena: &mut *arena,
            handles: &mut *handles,
            dirty: false,
        };

        let result = f(&mut txn);
        if txn.dirty {
            machine.mark_dirty();
        }
        result
    }

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Create a record, or with `desc = None` resize an existing one in place
    pub fn create(&self, key: &str, value_len: usize, desc: Option<&KeyDesc>) -> Result<Handle> {
        validate_key(key, self.config.max_key_len)?;
        if value_len > self.config.max_value_len {
            return Err(NvkvError::ValueTooLarge {
                len: value_len,
                max: self.config.max_value_len,
            });
        }
        let is_owner = self.authorizer.is_owner(key);

        self.mutate(|txn| match desc {
            Some(desc) => Self::create_new(txn, key, value_len as u32, desc),
            None => Self::resize_existing(txn, key, value_len as u32, is_owner),
        })
    }

    fn create_new(txn: &mut Txn<'_>, key: &str, value_len: u32, desc: &KeyDesc) -> Result<Handle> {
        if let Some(existing) = txn.arena.find(key) {
            return Err(if existing.header.deleting {
                NvkvError::PreexistingKeyDeleting
            } else {
                NvkvError::PreexistingKey
            });
        }

        let offset = txn.arena.append(key, value_len, desc.permissions)?;
        txn.arena.update_header(offset, |h| h.refcount = 1)?;
        txn.dirty = true;

        debug!(key, value_len, offset, "created record");
        Ok(txn.handles.insert(HandleEntry::new(offset, desc.access)))
    }

    fn resize_existing(txn: &mut Txn<'_>, key: &str, value_len: u32, is_owner: bool) -> Result<Handle> {
        let record = txn.arena.find(key).ok_or(NvkvError::KeyNotFound)?;
        if record.header.deleting {
            return Err(NvkvError::PreexistingKeyDeleting);
        }

        let allowed = record.header.permissions.allowed(is_owner);
        if !allowed.write() {
            return Err(NvkvError::PermissionDenied(Access::WRITE));
        }
        if record.header.refcount == u16::MAX {
            return Err(NvkvError::HandleLimit);
        }

        let delta = txn.arena.resize_value(record.offset, value_len)?;
        txn.handles.rebase(record.end(), delta);
        txn.handles.clamp_cursors(record.offset, value_len as usize);
        txn.arena.update_header(record.offset, |h| h.refcount += 1)?;
        txn.dirty = true;

        debug!(key, value_len, delta, "resized record in place");
        let access = Access::from_bits(allowed.bits() & Access::READ_WRITE.bits());
        Ok(txn.handles.insert(HandleEntry::new(record.offset, access)))
    }

    /// Open a live record by exact key
    pub fn open(&self, key: &str, access: Access) -> Result<Handle> {
        validate_key(key, self.config.max_key_len)?;

        let machine = self.machine.lock();
        Self::ensure_started(&machine)?;
        let mut arena = self.arena.write();
        let mut handles = self.handles.lock();

        let record = arena
            .find(key)
            .filter(|r| !r.header.deleting)
            .ok_or(NvkvError::KeyNotFound)?;

        let allowed = record.header.permissions.allowed(self.authorizer.is_owner(key));
        let missing = Access::from_bits(access.bits() & !allowed.bits());
        if missing != Access::NONE {
            return Err(NvkvError::PermissionDenied(missing));
        }

        Self::acquire(&mut arena, &mut handles, record, access)
    }

    /// Bump a record's refcount and hand out a handle to it
    fn acquire(
        arena: &mut Arena,
        handles: &mut HandleTable,
        record: RecordRef,
        access: Access,
    ) -> Result<Handle> {
        if record.header.refcount == u16::MAX {
            return Err(NvkvError::HandleLimit);
        }
        arena.update_header(record.offset, |h| h.refcount += 1)?;
        Ok(handles.insert(HandleEntry::new(record.offset, access)))
    }

    /// Find the next readable record matching `query`, after `previous`.
    ///
    /// `previous` is closed as part of the call.
    pub fn find(&self, query: &str, previous: Option<Handle>) -> Result<Handle> {
        let machine = self.machine.lock();
        Self::ensure_started(&machine)?;
        let mut arena = self.arena.write();
        let mut handles = self.handles.lock();

        let start = match previous {
            Some(prev) => {
                let head = handles.get(&prev).ok_or(NvkvError::InvalidHandle)?.head;
                let next = head + arena.header(head)?.record_size();
                match Self::release(&mut arena, &mut handles, prev, machine.is_ready())? {
                    Some(removed) => next - removed,
                    None => next,
                }
            }
            None => 0,
        };

        // Compile after consuming `previous`, which is closed either way
        let query = Query::compile(query, self.config.max_key_len)?;

        let found = arena.records_from(start).find(|r| {
            if r.header.deleting {
                return false;
            }
            match arena.key(r.offset) {
                Ok(key) => {
                    query.matches(key)
                        && r.header.permissions.allowed(self.authorizer.is_owner(key)).read()
                }
                Err(_) => false,
            }
        });

        let record = found.ok_or(NvkvError::KeyNotFound)?;
        Self::acquire(&mut arena, &mut handles, record, Access::READ)
    }

    /// Copy from the value at the read cursor; returns bytes copied
    pub fn read(&self, handle: &Handle, buf: &mut [u8]) -> Result<usize> {
        let arena = self.arena.read();
        let mut handles = self.handles.lock();
        let entry = handles.get_mut(handle).ok_or(NvkvError::InvalidHandle)?;
        if !entry.access.read() {
            return Err(NvkvError::PermissionDenied(Access::READ));
        }

        let value = arena.value(entry.head)?;
        let pos = entry.read_pos.min(value.len());
        let n = buf.len().min(value.len() - pos);
        buf[..n].copy_from_slice(&value[pos..pos + n]);
        entry.read_pos = pos + n;
        Ok(n)
    }

    /// Copy into the value at the write cursor; returns bytes copied
    pub fn write(&self, handle: &Handle, buf: &[u8]) -> Result<usize> {
        self.mutate(|txn| {
            let entry = txn.handles.get_mut(handle).ok_or(NvkvError::InvalidHandle)?;
            if !entry.access.write() {
                return Err(NvkvError::PermissionDenied(Access::WRITE));
            }

            let value = txn.arena.value_mut(entry.head)?;
            let pos = entry.write_pos.min(value.len());
            let n = buf.len().min(value.len() - pos);
            value[pos..pos + n].copy_from_slice(&buf[..n]);
            entry.write_pos = pos + n;

            if n > 0 {
                txn.dirty = true;
            }
            Ok(n)
        })
    }

    /// Move the read cursor
    pub fn rseek(&self, handle: &Handle, offset: usize) -> Result<()> {
        let arena = self.arena.read();
        let mut handles = self.handles.lock();
        let entry = handles.get_mut(handle).ok_or(NvkvError::InvalidHandle)?;
        if !entry.access.read() {
            return Err(NvkvError::PermissionDenied(Access::READ));
        }

        let len = arena.header(entry.head)?.value_len as usize;
        if offset > len {
            return Err(NvkvError::InvalidSeek { offset, len });
        }
        entry.read_pos = offset;
        Ok(())
    }

    /// Mark a record for deletion; it disappears at its last close
    pub fn delete(&self, handle: &Handle) -> Result<()> {
        self.mutate(|txn| {
            let entry = txn.handles.get(handle).ok_or(NvkvError::InvalidHandle)?;
            if !entry.access.write() {
                return Err(NvkvError::PermissionDenied(Access::WRITE));
            }

            let head = entry.head;
            let header = txn.arena.header(head)?;
            if !header.deleting {
                txn.arena.update_header(head, |h| h.deleting = true)?;
                txn.dirty = true;
                debug!(offset = head, "record marked deleting");
            }
            Ok(())
        })
    }

    /// Retire a handle, removing its record if it was the last reference to
    /// a deleting record
    pub fn close(&self, handle: Handle) -> Result<()> {
        let mut machine = self.machine.lock();
        let mut arena = self.arena.write();
        let mut handles = self.handles.lock();

        let removed = Self::release(&mut arena, &mut handles, handle, machine.is_ready())?;
        if removed.is_some() {
            machine.mark_dirty();
        }
        Ok(())
    }

    /// Drop a handle and its reference; returns the bytes removed if the
    /// record went away. Removal waits for the machine to be idle.
    fn release(
        arena: &mut Arena,
        handles: &mut HandleTable,
        handle: Handle,
        can_remove: bool,
    ) -> Result<Option<usize>> {
        let entry = handles.remove(handle).ok_or(NvkvError::InvalidHandle)?;
        let header = arena.update_header(entry.head, |h| h.refcount = h.refcount.saturating_sub(1))?;

        if header.refcount > 0 || !header.deleting || !can_remove {
            return Ok(None);
        }

        let size = arena.remove(entry.head)?;
        handles.rebase(entry.head + size, -(size as isize));
        debug!(offset = entry.head, size, "record removed");
        Ok(Some(size))
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Key name of the record behind a handle
    pub fn key_name(&self, handle: &Handle) -> Result<String> {
        let arena = self.arena.read();
        let handles = self.handles.lock();
        let entry = handles.get(handle).ok_or(NvkvError::InvalidHandle)?;
        Ok(arena.key(entry.head)?.to_string())
    }

    /// Value length of the record behind a handle
    pub fn value_len(&self, handle: &Handle) -> Result<usize> {
        let arena = self.arena.read();
        let handles = self.handles.lock();
        let entry = handles.get(handle).ok_or(NvkvError::InvalidHandle)?;
        Ok(arena.header(entry.head)?.value_len as usize)
    }

    pub fn status(&self) -> StoreStatus {
        let (state, dirty) = {
            let machine = self.machine.lock();
            (machine.state(), machine.is_dirty())
        };
        let arena = self.arena.read();
        let handles = self.handles.lock();

        StoreStatus {
            state,
            dirty,
            records: arena.records().count(),
            arena_len: arena.len(),
            open_handles: handles.len(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let caps = self.machine.lock().capabilities();
        Capabilities {
            asynchronous: caps.asynchronous,
            max_key_len: self.config.max_key_len,
            max_value_len: self.config.max_value_len,
            program_unit: caps.program_unit,
            max_image_size: caps.max_body_size,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check that records tile the arena and that handles and refcounts
    /// agree with each other
    pub fn verify_integrity(&self) -> Result<()> {
        let arena = self.arena.read();
        let handles = self.handles.lock();
        Self::check_integrity(&arena, &handles)
    }

    fn check_integrity(arena: &Arena, handles: &HandleTable) -> Result<()> {
        let offsets = arena.validate()?;

        for entry in handles.entries() {
            if offsets.binary_search(&entry.head).is_err() {
                return Err(NvkvError::Internal(format!(
                    "handle points into the middle of a record at {}",
                    entry.head
                )));
            }
        }

        for record in arena.records() {
            let open = handles.entries().filter(|e| e.head == record.offset).count();
            if open != record.header.refcount as usize {
                return Err(NvkvError::Internal(format!(
                    "record at {} has refcount {} but {} open handles",
                    record.offset, record.header.refcount, open
                )));
            }
        }
        Ok(())
    }
}
