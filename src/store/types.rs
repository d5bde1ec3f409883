//! Store types
//!
//! Descriptors, progress reports and completion events exchanged with
//! store clients.

use crate::acl::{Access, Permissions};
use crate::error::Result;
use crate::flush::FlushState;

/// How a new record is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDesc {
    /// Permission bits stored with the record
    pub permissions: Permissions,
    /// Access granted to the handle `create` returns
    pub access: Access,
}

impl KeyDesc {
    pub fn new(permissions: Permissions) -> Self {
        Self {
            permissions,
            access: Access::READ_WRITE,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }
}

impl Default for KeyDesc {
    fn default() -> Self {
        Self::new(Permissions::default())
    }
}

/// Immediate answer of `initialize`, `flush` and `reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Finished before the call returned
    Done,
    /// Accepted; a `StoreEvent` reports the outcome
    Pending,
}

/// Client operations that may complete asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Initialize,
    Flush,
    Reset,
}

/// Outcome of an operation that answered `Progress::Pending`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub op: StoreOp,
    pub result: Result<()>,
}

/// Snapshot of store state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub state: FlushState,
    pub dirty: bool,
    /// Records present, including ones waiting for their last close
    pub records: usize,
    pub arena_len: usize,
    pub open_handles: usize,
}

/// Static properties of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether initialize/flush/reset may answer `Progress::Pending`
    pub asynchronous: bool,
    pub max_key_len: usize,
    pub max_value_len: usize,
    pub program_unit: usize,
    /// Largest persisted arena image the journal can hold
    pub max_image_size: usize,
}
