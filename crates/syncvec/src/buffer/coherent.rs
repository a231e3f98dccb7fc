//! Coherence engine deciding, per access intent, whether a transfer is due.
//!
//! A [`CoherentBuffer`] holds the host-resident element sequence and at most
//! one device mirror. The host sequence's length is the container's logical
//! size; the device buffer's byte length is derived from it and is never an
//! independent size. The engine only ever transfers host<->device for a
//! single, already-chosen device; cross-device conflicts are reported, never
//! resolved here.

use std::sync::{Mutex, MutexGuard};

use crate::buffer::device::DeviceBuffer;
use crate::element::{self, Element};
use crate::error::{CoherenceError, CoherenceResult};
use crate::place::DeviceId;
use crate::runtime;

/// Which side of the storage is present, and which side is authoritative.
///
/// These are the reachable combinations of the {host, device, dirty} bits.
/// Dirty decouples "has a copy" from "has the latest copy": the side named by
/// a dirty state is sole authority and the other side's mirror is stale.
/// Every state keeps at least one side resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Residency {
    /// Host data only; no device buffer has been materialized yet.
    HostOnly,
    /// Host is sole authority; any device buffer is stale.
    HostDirty,
    /// Both sides hold the same contents.
    Synced,
    /// Device is sole authority; the host sequence is stale.
    DeviceDirty,
}

impl Residency {
    pub(crate) fn resides_on_host(self) -> bool {
        !matches!(self, Residency::DeviceDirty)
    }

    pub(crate) fn resides_on_device(self) -> bool {
        matches!(self, Residency::Synced | Residency::DeviceDirty)
    }

    pub(crate) fn is_dirty(self) -> bool {
        matches!(self, Residency::HostDirty | Residency::DeviceDirty)
    }
}

/// Mutable interior of a [`CoherentBuffer`], reached through its mutex.
pub(crate) struct BufferState<T: Element> {
    host: Vec<T>,
    device: Option<DeviceBuffer>,
    residency: Residency,
}

impl<T: Element> BufferState<T> {
    fn new(host: Vec<T>) -> Self {
        Self {
            host,
            device: None,
            residency: Residency::HostOnly,
        }
    }

    pub(crate) fn host(&self) -> &[T] {
        &self.host
    }

    /// Mutable host sequence. Callers must have forced host writability
    /// first; the length of this vector is the container's logical size.
    pub(crate) fn host_mut(&mut self) -> &mut Vec<T> {
        &mut self.host
    }

    pub(crate) fn host_capacity(&self) -> usize {
        self.host.capacity()
    }

    pub(crate) fn residency(&self) -> Residency {
        self.residency
    }

    /// The device the current device buffer belongs to, if one exists. The
    /// buffer may be stale; staleness is the dirty bit's concern, not this
    /// accessor's.
    pub(crate) fn bound_device(&self) -> Option<DeviceId> {
        self.device.as_ref().map(|buffer| buffer.device())
    }

    pub(crate) fn device_addr(&self) -> Option<u64> {
        self.device.as_ref().map(|buffer| buffer.addr())
    }

    /// Makes the host sequence current for reading.
    pub(crate) fn ensure_readable_host(&mut self) -> CoherenceResult<()> {
        if self.residency.is_dirty() && !self.residency.resides_on_host() {
            self.download_to_host()?;
            self.residency = Residency::Synced;
        }
        Ok(())
    }

    /// Makes the host sequence current and sole authority. Any existing
    /// device buffer becomes stale, signalled by the dirty bit.
    pub(crate) fn ensure_writable_host(&mut self) -> CoherenceResult<()> {
        if self.residency.resides_on_device() && self.residency.is_dirty() {
            self.download_to_host()?;
        }
        self.residency = Residency::HostDirty;
        Ok(())
    }

    /// Makes a device mirror on `device` current for reading.
    pub(crate) fn ensure_readable_device(&mut self, device: DeviceId) -> CoherenceResult<()> {
        match self.residency {
            Residency::HostOnly | Residency::HostDirty => {
                self.upload_to_device(device)?;
                self.residency = Residency::Synced;
            }
            Residency::Synced | Residency::DeviceDirty => {
                let bound = self
                    .bound_device()
                    .expect("device-resident state without a device buffer");
                if bound != device {
                    return Err(CoherenceError::CrossDeviceMismatch {
                        bound,
                        requested: device,
                    });
                }
            }
        }
        Ok(())
    }

    /// Makes a device mirror on `device` current and sole authority.
    pub(crate) fn ensure_writable_device(&mut self, device: DeviceId) -> CoherenceResult<()> {
        self.ensure_readable_device(device)?;
        self.residency = Residency::DeviceDirty;
        Ok(())
    }

    /// Discards the contents. The host side becomes sole authority without a
    /// read-back: the data being dropped is not worth a transfer.
    pub(crate) fn clear_host(&mut self) {
        self.host.clear();
        self.residency = Residency::HostDirty;
    }

    fn upload_to_device(&mut self, device: DeviceId) -> CoherenceResult<()> {
        let bytes = std::mem::size_of_val(self.host.as_slice());
        let reusable = matches!(
            &self.device,
            Some(buffer) if buffer.device() == device && buffer.bytes() == bytes
        );
        if !reusable {
            let queue = runtime::queue_for(device)
                .ok_or(CoherenceError::UnsupportedDevice(device))?;
            match self.device.as_mut() {
                Some(buffer) => buffer.resize(queue, bytes)?,
                None => self.device = Some(DeviceBuffer::allocate(queue, bytes)?),
            }
        }
        let buffer = self
            .device
            .as_ref()
            .expect("device buffer just materialized");
        buffer.upload(element::as_bytes(&self.host))
    }

    fn download_to_host(&mut self) -> CoherenceResult<()> {
        let buffer = self
            .device
            .as_ref()
            .expect("device-authoritative state without a device buffer");
        debug_assert_eq!(
            buffer.bytes(),
            std::mem::size_of_val(self.host.as_slice()),
            "device mirror out of step with the host length"
        );
        buffer.download(element::as_bytes_mut(&mut self.host))
    }
}

/// Host sequence plus an optional device mirror, synchronized lazily.
///
/// The mutex carries the interior mutability every access path needs (reads
/// may themselves trigger a transfer and a flag update) and makes the
/// container's "read bound device, then maybe detach" sequence race-free
/// against a concurrent attempt to materialize a buffer for another device.
/// It does not make mutation of one shared handle safe; callers serialize
/// that themselves.
pub struct CoherentBuffer<T: Element> {
    state: Mutex<BufferState<T>>,
}

impl<T: Element> CoherentBuffer<T> {
    pub(crate) fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub(crate) fn filled(count: usize, value: T) -> Self {
        Self::from_vec(vec![value; count])
    }

    pub(crate) fn from_vec(host: Vec<T>) -> Self {
        Self {
            state: Mutex::new(BufferState::new(host)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BufferState<T>> {
        self.state.lock().expect("coherent buffer mutex poisoned")
    }

    pub(crate) fn state_mut(&mut self) -> &mut BufferState<T> {
        self.state
            .get_mut()
            .expect("coherent buffer mutex poisoned")
    }
}

impl<T: Element> Clone for CoherentBuffer<T> {
    /// Copies always read back through the host first and never carry device
    /// residency forward: the clone starts host-authoritative with no device
    /// buffer of its own.
    fn clone(&self) -> Self {
        let mut state = self.lock();
        state
            .ensure_readable_host()
            .expect("device read-back failed while cloning shared storage");
        Self {
            state: Mutex::new(BufferState {
                host: state.host.clone(),
                device: None,
                residency: Residency::HostDirty,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DeviceAllocation, DeviceQueue};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Minimal in-host queue for exercising the transition table.
    struct FakeQueue {
        device: DeviceId,
        blocks: Mutex<HashMap<u64, Box<[u8]>>>,
        uploads: AtomicU64,
        downloads: AtomicU64,
    }

    impl FakeQueue {
        fn register(device: DeviceId) -> Arc<Self> {
            let queue = Arc::new(FakeQueue {
                device,
                blocks: Mutex::new(HashMap::new()),
                uploads: AtomicU64::new(0),
                downloads: AtomicU64::new(0),
            });
            runtime::register_queue(queue.clone());
            queue
        }

        fn uploads(&self) -> u64 {
            self.uploads.load(Ordering::SeqCst)
        }

        fn downloads(&self) -> u64 {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    impl DeviceQueue for FakeQueue {
        fn device(&self) -> DeviceId {
            self.device
        }

        fn allocate(&self, bytes: usize) -> CoherenceResult<DeviceAllocation> {
            let block = vec![0u8; bytes.max(1)].into_boxed_slice();
            let addr = block.as_ptr() as u64;
            self.blocks.lock().unwrap().insert(addr, block);
            Ok(DeviceAllocation::new(addr, bytes))
        }

        fn deallocate(&self, allocation: DeviceAllocation) {
            self.blocks.lock().unwrap().remove(&allocation.addr());
        }

        fn copy_host_to_device(
            &self,
            dst: &DeviceAllocation,
            src: &[u8],
        ) -> CoherenceResult<()> {
            let mut blocks = self.blocks.lock().unwrap();
            let block = blocks.get_mut(&dst.addr()).expect("unknown allocation");
            block[..src.len()].copy_from_slice(src);
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn copy_device_to_host(
            &self,
            src: &DeviceAllocation,
            dst: &mut [u8],
        ) -> CoherenceResult<()> {
            let blocks = self.blocks.lock().unwrap();
            let block = blocks.get(&src.addr()).expect("unknown allocation");
            dst.copy_from_slice(&block[..dst.len()]);
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn wait(&self) -> CoherenceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_initial_state_is_host_only() {
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1, 2, 3]);
        let state = buffer.lock();
        assert_eq!(state.residency(), Residency::HostOnly);
        assert!(state.bound_device().is_none());
        assert_eq!(state.host(), &[1, 2, 3]);
    }

    #[test]
    fn test_host_reads_do_not_transfer_without_device_state() {
        let buffer = CoherentBuffer::<u64>::from_vec(vec![7]);
        let mut state = buffer.lock();
        state.ensure_readable_host().unwrap();
        assert_eq!(state.residency(), Residency::HostOnly);
        state.ensure_writable_host().unwrap();
        assert_eq!(state.residency(), Residency::HostDirty);
    }

    #[test]
    fn test_readable_device_uploads_once_and_syncs() {
        let device = DeviceId(910);
        let queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1, 2, 3, 4]);
        let mut state = buffer.lock();

        state.ensure_readable_device(device).unwrap();
        assert_eq!(state.residency(), Residency::Synced);
        assert_eq!(state.bound_device(), Some(device));
        assert_eq!(queue.uploads(), 1);

        // Already synced: a second read intent must not copy again.
        state.ensure_readable_device(device).unwrap();
        assert_eq!(queue.uploads(), 1);
    }

    #[test]
    fn test_writable_device_marks_device_authoritative() {
        let device = DeviceId(911);
        let _queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![5, 6]);
        let mut state = buffer.lock();

        state.ensure_writable_device(device).unwrap();
        assert_eq!(state.residency(), Residency::DeviceDirty);
        assert!(!state.residency().resides_on_host());
        assert!(state.residency().resides_on_device());
        assert!(state.residency().is_dirty());
    }

    #[test]
    fn test_device_write_then_host_read_round_trips() {
        let device = DeviceId(912);
        let queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![10, 20, 30]);
        let mut state = buffer.lock();

        state.ensure_writable_device(device).unwrap();
        // Poke the fake device memory directly, as a kernel would.
        {
            let addr = state.device_addr().unwrap();
            let mut blocks = queue.blocks.lock().unwrap();
            let block = blocks.get_mut(&addr).unwrap();
            block[..8].copy_from_slice(&99u64.to_ne_bytes());
        }

        state.ensure_readable_host().unwrap();
        assert_eq!(state.residency(), Residency::Synced);
        assert_eq!(state.host(), &[99, 20, 30]);
        assert_eq!(queue.downloads(), 1);
    }

    #[test]
    fn test_host_write_invalidates_device_mirror() {
        let device = DeviceId(913);
        let queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1, 2]);
        let mut state = buffer.lock();

        state.ensure_readable_device(device).unwrap();
        state.ensure_writable_host().unwrap();
        assert_eq!(state.residency(), Residency::HostDirty);
        // The stale buffer stays bound; the dirty bit marks it out of date.
        assert_eq!(state.bound_device(), Some(device));

        state.host_mut()[0] = 42;
        state.ensure_readable_device(device).unwrap();
        assert_eq!(state.residency(), Residency::Synced);
        assert_eq!(queue.uploads(), 2);
    }

    #[test]
    fn test_cross_device_mismatch_is_reported_not_resolved() {
        let first = DeviceId(914);
        let second = DeviceId(915);
        let _q1 = FakeQueue::register(first);
        let _q2 = FakeQueue::register(second);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1]);
        let mut state = buffer.lock();

        state.ensure_writable_device(first).unwrap();
        let err = state.ensure_readable_device(second).unwrap_err();
        assert_eq!(
            err,
            CoherenceError::CrossDeviceMismatch {
                bound: first,
                requested: second,
            }
        );
        // Still bound to the first device; nothing was discarded.
        assert_eq!(state.bound_device(), Some(first));
        assert_eq!(state.residency(), Residency::DeviceDirty);
    }

    #[test]
    fn test_stale_mirror_retargets_when_host_is_authoritative() {
        let first = DeviceId(916);
        let second = DeviceId(917);
        let q1 = FakeQueue::register(first);
        let q2 = FakeQueue::register(second);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![8, 9]);
        let mut state = buffer.lock();

        state.ensure_readable_device(first).unwrap();
        state.ensure_writable_host().unwrap();
        // Host is sole authority, so the first device's stale buffer may be
        // replaced wholesale by a mirror on the second device.
        state.ensure_readable_device(second).unwrap();
        assert_eq!(state.bound_device(), Some(second));
        assert_eq!(q1.blocks.lock().unwrap().len(), 0);
        assert_eq!(q2.blocks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_resize_reallocates_device_mirror() {
        let device = DeviceId(918);
        let queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1, 2, 3]);
        let mut state = buffer.lock();

        state.ensure_readable_device(device).unwrap();
        let old_addr = state.device_addr().unwrap();

        state.ensure_writable_host().unwrap();
        state.host_mut().push(4);
        state.ensure_readable_device(device).unwrap();

        assert_ne!(state.device_addr().unwrap(), old_addr);
        assert_eq!(queue.blocks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unregistered_device_is_unsupported() {
        let device = DeviceId(919);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1]);
        let mut state = buffer.lock();
        let err = state.ensure_readable_device(device).unwrap_err();
        assert_eq!(err, CoherenceError::UnsupportedDevice(device));
        assert_eq!(state.residency(), Residency::HostOnly);
    }

    #[test]
    fn test_clone_is_host_authoritative_without_device_buffer() {
        let device = DeviceId(920);
        let queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![3, 1, 4]);
        {
            let mut state = buffer.lock();
            state.ensure_writable_device(device).unwrap();
            let addr = state.device_addr().unwrap();
            let mut blocks = queue.blocks.lock().unwrap();
            blocks.get_mut(&addr).unwrap()[..8].copy_from_slice(&5u64.to_ne_bytes());
        }

        let copy = buffer.clone();
        let copy_state = copy.lock();
        // The clone saw the device write, but owns no device buffer.
        assert_eq!(copy_state.host(), &[5, 1, 4]);
        assert_eq!(copy_state.residency(), Residency::HostDirty);
        assert!(copy_state.bound_device().is_none());

        // The source was synced by the read-back, not privatized.
        let state = buffer.lock();
        assert_eq!(state.residency(), Residency::Synced);
        assert_eq!(state.bound_device(), Some(device));
    }

    #[test]
    fn test_clear_discards_without_read_back() {
        let device = DeviceId(921);
        let queue = FakeQueue::register(device);
        let buffer = CoherentBuffer::<u64>::from_vec(vec![1, 2, 3]);
        let mut state = buffer.lock();

        state.ensure_writable_device(device).unwrap();
        state.clear_host();
        assert_eq!(state.residency(), Residency::HostDirty);
        assert!(state.host().is_empty());
        assert_eq!(queue.downloads(), 0);
    }
}
