//! Journal Module
//!
//! Persists one logical blob (the serialized arena) atomically into one of N
//! rotating slots on a block device.
//!
//! ## Responsibilities
//! - CRC32 protected head/tail framing per slot
//! - Monotonic sequence numbers to pick the newest generation
//! - Never overwrite the current slot before the next one is committed
//! - Report completion synchronously (`Status::Done`) or through a
//!   completion channel (`Status::Pending`)
//!
//! ## Device Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Journal Header (one erase unit)                         │
//! │   Magic | Version | Total | HdrSize | SlotOff | N | Sz  │
//! │   CRC32                                                 │
//! ├─────────────────────────────────────────────────────────┤
//! │ Slot 0                                                  │
//! │ ┌──────────────┬───────────────────────┬──────────────┐ │
//! │ │ Head (16)    │ Body (arena image)    │ Tail (24)    │ │
//! │ │ Ver|Mag|Seq  │ ... program aligned   │ Size|Mag|Seq │ │
//! │ │              │                       │ CRC32        │ │
//! │ └──────────────┴───────────────────────┴──────────────┘ │
//! ├─────────────────────────────────────────────────────────┤
//! │ Slot 1 ... Slot N-1                                     │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod async_journal;
mod layout;
mod sequential;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::device::DeviceError;

pub use async_journal::AsyncJournal;
pub use layout::{JournalLayout, SLOT_HEAD_SIZE, SLOT_TAIL_SIZE};
pub use sequential::SequentialJournal;

/// Result type alias for journal operations
pub type JournalResult<T> = std::result::Result<T, JournalError>;

/// Errors reported by the journal
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("journal is not formatted")]
    NotFormatted,

    #[error("journal has not been initialized")]
    NotInitialized,

    #[error("log request of {len} bytes is smaller than the program unit ({unit})")]
    SmallLogRequest { len: usize, unit: usize },

    #[error("blob of {len} bytes exceeds slot capacity of {capacity}")]
    BlobTooLarge { len: usize, capacity: usize },

    #[error("no committed slot to read")]
    NoCurrentSlot,

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("journal driver disconnected")]
    Disconnected,
}

/// Identifies a journal call, so completions can be matched to requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Format,
    Initialize,
    Read,
    Log,
    Commit,
    Reset,
}

/// What the newest valid slot looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalInfo {
    /// Body size of the current slot (0 = formatted but empty)
    pub body_size: usize,
    /// Sequence number of the current slot (0 = none)
    pub sequence: u32,
    /// Number of slots on the device
    pub slot_count: u32,
    /// Largest body a slot can hold
    pub max_body_size: usize,
}

/// Result payload of a completed journal call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Formatted,
    Info(JournalInfo),
    Body(Vec<u8>),
    /// Number of bytes accepted by `log`
    Logged(usize),
    /// Number of body bytes finalized by `commit`
    Committed(usize),
    Reset,
}

/// Immediate answer of a journal call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Finished synchronously
    Done(Outcome),
    /// Accepted; a `Completion` will follow on the attached channel
    Pending,
}

/// Asynchronous completion of a journal call
#[derive(Debug, Clone)]
pub struct Completion {
    pub op: JournalOp,
    pub result: JournalResult<Outcome>,
}

/// Static properties of a journal driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalCaps {
    /// Whether calls may answer `Status::Pending`
    pub asynchronous: bool,
    /// Minimum number of bytes `log` accepts
    pub program_unit: usize,
    /// Largest body a slot can hold
    pub max_body_size: usize,
}

/// The driver boundary the flush machine talks to
pub trait Journal: Send {
    /// Static driver properties
    fn capabilities(&self) -> JournalCaps;

    /// Hand the driver the channel that asynchronous completions go to
    fn attach(&mut self, _completions: Sender<Completion>) {}

    /// Write a fresh journal header and reset every slot
    fn format(&mut self) -> JournalResult<Status>;

    /// Locate the newest valid slot
    fn initialize(&mut self) -> JournalResult<Status>;

    /// Read back the body of the current slot
    fn read(&mut self) -> JournalResult<Status>;

    /// Append bytes to the slot after the current one
    fn log(&mut self, blob: &[u8]) -> JournalResult<Status>;

    /// Finalize the slot being logged
    fn commit(&mut self) -> JournalResult<Status>;

    /// Erase every slot and restart sequence numbering
    fn reset(&mut self) -> JournalResult<Status>;
}

impl<J: Journal + ?Sized> Journal for Box<J> {
    fn capabilities(&self) -> JournalCaps {
        (**self).capabilities()
    }

    fn attach(&mut self, completions: Sender<Completion>) {
        (**self).attach(completions)
    }

    fn format(&mut self) -> JournalResult<Status> {
        (**self).format()
    }

    fn initialize(&mut self) -> JournalResult<Status> {
        (**self).initialize()
    }

    fn read(&mut self) -> JournalResult<Status> {
        (**self).read()
    }

    fn log(&mut self, blob: &[u8]) -> JournalResult<Status> {
        (**self).log(blob)
    }

    fn commit(&mut self) -> JournalResult<Status> {
        (**self).commit()
    }

    fn reset(&mut self) -> JournalResult<Status> {
        (**self).reset()
    }
}
