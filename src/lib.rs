//! # nvkv
//!
//! An embedded, crash-safe key-value store for flash-like devices with:
//! - A single packed in-memory arena holding every record
//! - Opaque handles that survive records moving around in the arena
//! - A rotating-slot journal, so a power cut never loses the last commit
//! - Synchronous or asynchronous persistence drivers behind one state machine
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Store                                │
//! │     create/open/find/read/write/delete/close, flush          │
//! └──────────────┬───────────────────────────┬──────────────────┘
//!                │                           │
//!                ▼                           ▼
//!   ┌────────────────────────┐     ┌───────────────────┐
//!   │  Arena + HandleTable   │     │   FlushMachine    │
//!   │  (RwLock / Mutex)      │     │  (state machine)  │
//!   └────────────────────────┘     └─────────┬─────────┘
//!                                            │ Journal trait
//!                                            ▼
//!                                  ┌───────────────────┐
//!                                  │ SequentialJournal │
//!                                  │  (or AsyncJournal)│
//!                                  └─────────┬─────────┘
//!                                            │ BlockDevice trait
//!                                            ▼
//!                                  ┌───────────────────┐
//!                                  │ RamFlash/FileFlash│
//!                                  └───────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod acl;
pub mod arena;
pub mod device;
pub mod flush;
pub mod handle;
pub mod journal;
pub mod key;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use acl::{Access, Authorizer, Permissions};
pub use config::Config;
pub use error::{NvkvError, Result};
pub use flush::FlushState;
pub use handle::Handle;
pub use store::{Capabilities, KeyDesc, Progress, Store, StoreEvent, StoreOp, StoreStatus};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of nvkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
