//! RAII ownership of a single raw device allocation.

use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::error::CoherenceResult;
use crate::place::DeviceId;
use crate::runtime::{DeviceAllocation, DeviceQueue};
use crate::stats;

/// Owns one raw allocation in one device memory space.
///
/// The type is move-only: a copy would leave two owners freeing the same
/// allocation. Ownership changes hands through moves or [`DeviceBuffer::swap`],
/// and the allocation is released on drop.
pub struct DeviceBuffer {
    queue: Arc<dyn DeviceQueue>,
    allocation: DeviceAllocation,
}

impl DeviceBuffer {
    /// Allocates `bytes` on the queue's device.
    pub fn allocate(queue: Arc<dyn DeviceQueue>, bytes: usize) -> CoherenceResult<Self> {
        let allocation = queue.allocate(bytes)?;
        stats::record_device_allocation(queue.device(), bytes);
        Ok(Self { queue, allocation })
    }

    /// The device the allocation lives on, fixed at allocation time.
    pub fn device(&self) -> DeviceId {
        self.queue.device()
    }

    /// Size of the allocation in bytes.
    pub fn bytes(&self) -> usize {
        self.allocation.bytes()
    }

    /// Raw device address of the allocation.
    pub fn addr(&self) -> u64 {
        self.allocation.addr()
    }

    /// Replaces the allocation with a fresh one of `bytes` on `queue`'s
    /// device. Contents are never preserved: the old block is released and a
    /// new one takes its place.
    pub fn resize(&mut self, queue: Arc<dyn DeviceQueue>, bytes: usize) -> CoherenceResult<()> {
        let mut fresh = DeviceBuffer::allocate(queue, bytes)?;
        self.swap(&mut fresh);
        Ok(())
    }

    /// Exchanges ownership with `other` without copying device memory.
    pub fn swap(&mut self, other: &mut DeviceBuffer) {
        mem::swap(self, other);
    }

    /// Copies host bytes into the allocation and drains the queue.
    pub fn upload(&self, src: &[u8]) -> CoherenceResult<()> {
        self.queue.copy_host_to_device(&self.allocation, src)?;
        self.queue.wait()?;
        stats::record_host_to_device(self.device(), src.len());
        Ok(())
    }

    /// Copies the allocation back into host bytes and drains the queue.
    pub fn download(&self, dst: &mut [u8]) -> CoherenceResult<()> {
        self.queue.copy_device_to_host(&self.allocation, dst)?;
        self.queue.wait()?;
        stats::record_device_to_host(self.device(), dst.len());
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.queue.deallocate(self.allocation);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device())
            .field("bytes", &self.bytes())
            .field("addr", &self.addr())
            .finish()
    }
}
