//! Error types for nvkv
//!
//! Provides a unified error type for all store operations. Device and journal
//! codes are carried through unchanged inside `Storage`.

use thiserror::Error;

use crate::acl::Access;
use crate::journal::JournalError;
use crate::key::KeyNameError;

/// Result type alias using NvkvError
pub type Result<T> = std::result::Result<T, NvkvError>;

/// Unified error type for nvkv operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvkvError {
    // -------------------------------------------------------------------------
    // Handle Errors
    // -------------------------------------------------------------------------
    #[error("invalid or expired handle")]
    InvalidHandle,

    #[error("too many handles open on one record")]
    HandleLimit,

    #[error("{0} handle(s) still open")]
    HandlesOpen(usize),

    // -------------------------------------------------------------------------
    // Key Errors
    // -------------------------------------------------------------------------
    #[error("invalid key name: {0}")]
    InvalidKeyName(#[from] KeyNameError),

    #[error("key already exists")]
    PreexistingKey,

    #[error("key already exists and is being deleted")]
    PreexistingKeyDeleting,

    #[error("key not found")]
    KeyNotFound,

    // -------------------------------------------------------------------------
    // Value Errors
    // -------------------------------------------------------------------------
    #[error("value of {len} bytes exceeds maximum of {max}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("seek to {offset} beyond value length {len}")]
    InvalidSeek { offset: usize, len: usize },

    #[error("permission denied: {0} access required")]
    PermissionDenied(Access),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("out of memory: arena of {requested} bytes exceeds limit of {limit}")]
    OutOfMemory { requested: usize, limit: usize },

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("an asynchronous operation is pending")]
    OperationPending,

    #[error("store is not initialized")]
    NotInitialized,

    #[error("storage is not formatted")]
    NotFormatted,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("storage error: {0}")]
    Storage(JournalError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JournalError> for NvkvError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::NotFormatted => NvkvError::NotFormatted,
            other => NvkvError::Storage(other),
        }
    }
}
