//! RAM Flash
//!
//! In-memory NOR flash simulator.

use super::{BlockDevice, DeviceError, DeviceResult, Geometry, ERASED_BYTE};

/// In-memory flash that enforces erase-before-program
#[derive(Debug, Clone)]
pub struct RamFlash {
    geometry: Geometry,
    data: Vec<u8>,
    /// Counters for tests and benchmarks
    programs: u64,
    erases: u64,
}

impl RamFlash {
    /// Create a fully erased device
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            data: vec![ERASED_BYTE; geometry.size as usize],
            programs: 0,
            erases: 0,
        }
    }

    /// Raw contents (for inspection and corruption tests)
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw contents, bypassing flash rules
    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Number of successful program operations
    pub fn program_count(&self) -> u64 {
        self.programs
    }

    /// Number of successful erase operations
    pub fn erase_count(&self) -> u64 {
        self.erases
    }
}

impl BlockDevice for RamFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> DeviceResult<()> {
        self.geometry.check(addr, buf.len() as u64, 1)?;
        let start = addr as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, addr: u64, data: &[u8]) -> DeviceResult<()> {
        self.geometry
            .check(addr, data.len() as u64, self.geometry.program_unit)?;
        let start = addr as usize;
        let target = &mut self.data[start..start + data.len()];

        if let Some(pos) = target.iter().position(|&b| b != ERASED_BYTE) {
            return Err(DeviceError::NotErased {
                addr: addr + pos as u64,
            });
        }

        target.copy_from_slice(data);
        self.programs += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> DeviceResult<()> {
        self.geometry.check(addr, len, self.geometry.erase_unit)?;
        let start = addr as usize;
        self.data[start..start + len as usize].fill(ERASED_BYTE);
        self.erases += 1;
        Ok(())
    }
}
