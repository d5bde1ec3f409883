//! Block Device Module
//!
//! The raw storage the journal is written to.
//!
//! ## Responsibilities
//! - Byte-addressable read
//! - Program (write) in whole program units, only onto erased bytes
//! - Erase in whole erase units (erased bytes read back as `0xFF`)
//!
//! ## Implementations
//! ```text
//! ┌──────────────────┬────────────────────────────────────────────┐
//! │ RamFlash         │ In-memory NOR flash simulator              │
//! │ FileFlash        │ Flash image stored in a regular file       │
//! │ FailingDevice<D> │ Wrapper that injects program/erase failure │
//! └──────────────────┴────────────────────────────────────────────┘
//! ```

mod failing;
mod file;
mod ram;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use failing::{FailingDevice, FailurePolicy};
pub use file::FileFlash;
pub use ram::RamFlash;

/// Value of an erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

/// Result type alias for device operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors reported by a block device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("access out of bounds: addr={addr} len={len} size={size}")]
    OutOfBounds { addr: u64, len: u64, size: u64 },

    #[error("misaligned access: addr={addr} len={len} unit={unit}")]
    Misaligned { addr: u64, len: u64, unit: usize },

    #[error("program onto non-erased byte at {addr}")]
    NotErased { addr: u64 },

    #[error("device IO error: {0}")]
    Io(String),

    #[error("simulated power loss")]
    PowerLoss,
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}

/// Size and granularity of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Total addressable bytes
    pub size: u64,
    /// Minimum number of bytes programmed in one operation
    pub program_unit: usize,
    /// Minimum number of bytes erased in one operation
    pub erase_unit: usize,
}

impl Geometry {
    pub fn new(size: u64, program_unit: usize, erase_unit: usize) -> Self {
        Self {
            size,
            program_unit,
            erase_unit,
        }
    }

    /// Round `len` up to a whole number of program units
    pub fn align_program(&self, len: usize) -> usize {
        align_up(len, self.program_unit)
    }

    /// Round `len` up to a whole number of erase units
    pub fn align_erase(&self, len: usize) -> usize {
        align_up(len, self.erase_unit)
    }

    /// Check an access lies within the device and is aligned to `unit`
    pub(crate) fn check(&self, addr: u64, len: u64, unit: usize) -> DeviceResult<()> {
        let end = addr.checked_add(len);
        if end.map_or(true, |end| end > self.size) {
            return Err(DeviceError::OutOfBounds {
                addr,
                len,
                size: self.size,
            });
        }
        if unit > 1 && (addr % unit as u64 != 0 || len % unit as u64 != 0) {
            return Err(DeviceError::Misaligned { addr, len, unit });
        }
        Ok(())
    }
}

/// Round `value` up to the next multiple of `unit`
pub fn align_up(value: usize, unit: usize) -> usize {
    if unit <= 1 {
        return value;
    }
    value.div_ceil(unit) * unit
}

/// Raw storage with flash program/erase semantics
pub trait BlockDevice: Send {
    /// Device size and granularity
    fn geometry(&self) -> Geometry;

    /// Read `buf.len()` bytes starting at `addr`
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> DeviceResult<()>;

    /// Program `data` at `addr`; both must be program-unit aligned and the
    /// target range must be erased
    fn program(&mut self, addr: u64, data: &[u8]) -> DeviceResult<()>;

    /// Erase `len` bytes at `addr`; both must be erase-unit aligned
    fn erase(&mut self, addr: u64, len: u64) -> DeviceResult<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> DeviceResult<()> {
        (**self).read(addr, buf)
    }

    fn program(&mut self, addr: u64, data: &[u8]) -> DeviceResult<()> {
        (**self).program(addr, data)
    }

    fn erase(&mut self, addr: u64, len: u64) -> DeviceResult<()> {
        (**self).erase(addr, len)
    }
}
