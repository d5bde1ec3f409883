//! Failing Block Device
//!
//! A `BlockDevice` wrapper that simulates power loss and I/O failure, so
//! recovery can be tested without pulling the plug.

use super::{BlockDevice, DeviceError, DeviceResult, Geometry};

/// When failures should occur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Never fail (passthrough)
    Never,
    /// Lose power once `n` programs have succeeded; every later program or
    /// erase fails
    PowerLossAfterPrograms(usize),
    /// Like `PowerLossAfterPrograms`, but the failing program lands half of
    /// its bytes first (a torn write)
    TornProgramAfter(usize),
    /// Fail any program or erase touching `[start, end)` with an I/O error
    OnRange { start: u64, end: u64 },
}

/// Wrapper around a `BlockDevice` that can simulate failures
pub struct FailingDevice<D: BlockDevice> {
    inner: D,
    policy: FailurePolicy,
    program_count: usize,
    powered_off: bool,
}

impl<D: BlockDevice> FailingDevice<D> {
    /// Create a new failing device with the given policy
    pub fn new(inner: D, policy: FailurePolicy) -> Self {
        Self {
            inner,
            policy,
            program_count: 0,
            powered_off: false,
        }
    }

    /// Get the underlying device (for inspection)
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Unwrap the device, e.g. to "reboot" onto it
    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Number of programs that reached the underlying device
    pub fn program_count(&self) -> usize {
        self.program_count
    }

    /// Whether a simulated power loss has happened
    pub fn is_powered_off(&self) -> bool {
        self.powered_off
    }

    /// Replace the failure policy and restore power
    pub fn set_policy(&mut self, policy: FailurePolicy) {
        self.policy = policy;
        self.program_count = 0;
        self.powered_off = false;
    }

    fn touches_range(&self, addr: u64, len: u64) -> bool {
        match self.policy {
            FailurePolicy::OnRange { start, end } => addr < end && addr + len > start,
            _ => false,
        }
    }
}

impl<D: BlockDevice> BlockDevice for FailingDevice<D> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> DeviceResult<()> {
        self.inner.read(addr, buf)
    }

    fn program(&mut self, addr: u64, data: &[u8]) -> DeviceResult<()> {
        if self.powered_off {
            return Err(DeviceError::PowerLoss);
        }
        if self.touches_range(addr, data.len() as u64) {
            return Err(DeviceError::Io(format!("injected program failure at {addr}")));
        }

        match self.policy {
            FailurePolicy::PowerLossAfterPrograms(n) if self.program_count >= n => {
                self.powered_off = true;
                return Err(DeviceError::PowerLoss);
            }
            FailurePolicy::TornProgramAfter(n) if self.program_count >= n => {
                self.powered_off = true;
                let unit = self.inner.geometry().program_unit.max(1);
                let half = (data.len() / 2) / unit * unit;
                if half > 0 {
                    self.inner.program(addr, &data[..half])?;
                }
                return Err(DeviceError::PowerLoss);
            }
            _ => {}
        }

        self.inner.program(addr, data)?;
        self.program_count += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> DeviceResult<()> {
        if self.powered_off {
            return Err(DeviceError::PowerLoss);
        }
        if self.touches_range(addr, len) {
            return Err(DeviceError::Io(format!("injected erase failure at {addr}")));
        }
        self.inner.erase(addr, len)
    }
}
