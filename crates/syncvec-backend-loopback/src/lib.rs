//! Reference execution queue that services "device" memory from host heap
//! blocks.
//!
//! The loopback queue gives the coherence engine a complete transfer backend
//! without any driver: allocations are boxed word blocks keyed by address,
//! copies are `memcpy`s, and `wait` is bookkeeping. Every operation is
//! counted per queue, which is what the transfer-minimality and detach tests
//! are built on. An allocation failure can be injected to exercise the
//! fatal-allocation path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use syncvec::error::{CoherenceError, CoherenceResult, TransferDirection};
use syncvec::place::DeviceId;
use syncvec::runtime::{self, DeviceAllocation, DeviceQueue};

/// In-host queue for one simulated device.
///
/// Blocks are backed by `u64` words so the addresses handed out are aligned
/// for every element type the container supports.
pub struct LoopbackQueue {
    device: DeviceId,
    blocks: Mutex<HashMap<u64, Box<[u64]>>>,
    host_to_device: AtomicU64,
    device_to_host: AtomicU64,
    allocations: AtomicU64,
    waits: AtomicU64,
    fail_next_allocation: AtomicBool,
}

impl LoopbackQueue {
    /// Creates a queue for `device` without registering it.
    pub fn new(device: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            device,
            blocks: Mutex::new(HashMap::new()),
            host_to_device: AtomicU64::new(0),
            device_to_host: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            fail_next_allocation: AtomicBool::new(false),
        })
    }

    /// Creates a queue for `device` and registers it in the global queue
    /// registry, replacing any previous queue for that device.
    pub fn register(device: DeviceId) -> Arc<Self> {
        let queue = Self::new(device);
        runtime::register_queue(queue.clone());
        queue
    }

    /// Host-to-device copies issued so far.
    pub fn host_to_device_copies(&self) -> u64 {
        self.host_to_device.load(Ordering::SeqCst)
    }

    /// Device-to-host copies issued so far.
    pub fn device_to_host_copies(&self) -> u64 {
        self.device_to_host.load(Ordering::SeqCst)
    }

    /// Allocations served so far, released or not.
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Drain requests observed so far.
    pub fn wait_count(&self) -> u64 {
        self.waits.load(Ordering::SeqCst)
    }

    /// Allocations currently live (allocated and not yet released).
    pub fn live_allocations(&self) -> usize {
        self.blocks.lock().expect("loopback mutex poisoned").len()
    }

    /// Makes the next `allocate` call fail, then clears itself.
    pub fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::SeqCst);
    }
}

impl DeviceQueue for LoopbackQueue {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn allocate(&self, bytes: usize) -> CoherenceResult<DeviceAllocation> {
        if self.fail_next_allocation.swap(false, Ordering::SeqCst) {
            return Err(CoherenceError::AllocationFailure {
                device: self.device,
                bytes,
            });
        }
        // Zero-length requests still get a distinct backing block so the
        // returned address stays unique.
        let words = (bytes + 7) / 8;
        let block = vec![0u64; words.max(1)].into_boxed_slice();
        let addr = block.as_ptr() as u64;
        self.blocks
            .lock()
            .expect("loopback mutex poisoned")
            .insert(addr, block);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceAllocation::new(addr, bytes))
    }

    fn deallocate(&self, allocation: DeviceAllocation) {
        self.blocks
            .lock()
            .expect("loopback mutex poisoned")
            .remove(&allocation.addr());
    }

    fn copy_host_to_device(&self, dst: &DeviceAllocation, src: &[u8]) -> CoherenceResult<()> {
        let mut blocks = self.blocks.lock().expect("loopback mutex poisoned");
        let block = blocks.get_mut(&dst.addr()).ok_or_else(|| {
            CoherenceError::TransferFailure {
                device: self.device,
                direction: TransferDirection::HostToDevice,
                bytes: src.len(),
            }
        })?;
        if src.len() > dst.bytes() {
            return Err(CoherenceError::TransferFailure {
                device: self.device,
                direction: TransferDirection::HostToDevice,
                bytes: src.len(),
            });
        }
        block_bytes_mut(block)[..src.len()].copy_from_slice(src);
        self.host_to_device.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_device_to_host(&self, src: &DeviceAllocation, dst: &mut [u8]) -> CoherenceResult<()> {
        let blocks = self.blocks.lock().expect("loopback mutex poisoned");
        let block = blocks.get(&src.addr()).ok_or_else(|| {
            CoherenceError::TransferFailure {
                device: self.device,
                direction: TransferDirection::DeviceToHost,
                bytes: dst.len(),
            }
        })?;
        if dst.len() > src.bytes() {
            return Err(CoherenceError::TransferFailure {
                device: self.device,
                direction: TransferDirection::DeviceToHost,
                bytes: dst.len(),
            });
        }
        dst.copy_from_slice(&block_bytes(block)[..dst.len()]);
        self.device_to_host.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&self) -> CoherenceResult<()> {
        // Copies complete synchronously; draining is pure bookkeeping.
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn block_bytes(block: &[u64]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(block.as_ptr() as *const u8, std::mem::size_of_val(block))
    }
}

fn block_bytes_mut(block: &mut [u64]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            block.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(block),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_copy_roundtrip() {
        let queue = LoopbackQueue::new(DeviceId(800));
        let allocation = queue.allocate(8).unwrap();

        queue
            .copy_host_to_device(&allocation, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        let mut readback = [0u8; 8];
        queue.copy_device_to_host(&allocation, &mut readback).unwrap();
        assert_eq!(readback, [1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(queue.host_to_device_copies(), 1);
        assert_eq!(queue.device_to_host_copies(), 1);
        assert_eq!(queue.live_allocations(), 1);
        queue.deallocate(allocation);
        assert_eq!(queue.live_allocations(), 0);
    }

    #[test]
    fn test_injected_allocation_failure_is_one_shot() {
        let queue = LoopbackQueue::new(DeviceId(801));
        queue.fail_next_allocation();
        let err = queue.allocate(16).unwrap_err();
        assert!(matches!(err, CoherenceError::AllocationFailure { .. }));
        assert!(queue.allocate(16).is_ok());
    }

    #[test]
    fn test_oversized_copy_is_rejected() {
        let queue = LoopbackQueue::new(DeviceId(802));
        let allocation = queue.allocate(4).unwrap();
        let err = queue
            .copy_host_to_device(&allocation, &[0u8; 8])
            .unwrap_err();
        assert!(matches!(err, CoherenceError::TransferFailure { .. }));
    }

    #[test]
    fn test_register_installs_queue() {
        let device = DeviceId(803);
        let queue = LoopbackQueue::register(device);
        let found = runtime::queue_for(device).expect("registered above");
        assert_eq!(found.device(), queue.device());
    }
}
