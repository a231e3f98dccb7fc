//! Execution queue abstraction and the process-wide queue registry.
//!
//! The container never talks to a device driver directly. Each device is
//! represented by a [`DeviceQueue`] registered here; the coherence engine
//! looks queues up by device identifier, which keeps it testable against any
//! injected transfer backend.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::CoherenceResult;
use crate::place::DeviceId;

/// One raw allocation handed out by a queue.
///
/// The address is opaque to the container; only the queue that produced the
/// allocation can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAllocation {
    addr: u64,
    bytes: usize,
}

impl DeviceAllocation {
    pub fn new(addr: u64, bytes: usize) -> Self {
        Self { addr, bytes }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Per-device execution queue: allocation plus synchronous transfer service.
///
/// Both copy directions are issued by the coherence engine and followed by a
/// [`DeviceQueue::wait`], so transfers are observably synchronous even when a
/// backend queues them asynchronously.
pub trait DeviceQueue: Send + Sync {
    /// The device this queue serves.
    fn device(&self) -> DeviceId;

    /// Allocates `bytes` of device memory. Failure is fatal to the caller;
    /// there is no retry inside the container.
    fn allocate(&self, bytes: usize) -> CoherenceResult<DeviceAllocation>;

    /// Releases an allocation previously produced by this queue.
    fn deallocate(&self, allocation: DeviceAllocation);

    /// Copies host bytes into a device allocation.
    fn copy_host_to_device(&self, dst: &DeviceAllocation, src: &[u8]) -> CoherenceResult<()>;

    /// Copies a device allocation back into host bytes.
    fn copy_device_to_host(&self, src: &DeviceAllocation, dst: &mut [u8]) -> CoherenceResult<()>;

    /// Blocks until every previously issued operation has drained.
    fn wait(&self) -> CoherenceResult<()>;
}

struct QueueRegistry {
    queues: RwLock<HashMap<DeviceId, Arc<dyn DeviceQueue>>>,
}

impl QueueRegistry {
    fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<QueueRegistry> = OnceLock::new();

fn global_registry() -> &'static QueueRegistry {
    GLOBAL_REGISTRY.get_or_init(QueueRegistry::new)
}

/// Registers a queue for its device, replacing any previous registration.
pub fn register_queue(queue: Arc<dyn DeviceQueue>) {
    global_registry()
        .queues
        .write()
        .unwrap()
        .insert(queue.device(), queue);
}

/// Looks up the queue registered for `device`.
pub fn queue_for(device: DeviceId) -> Option<Arc<dyn DeviceQueue>> {
    global_registry()
        .queues
        .read()
        .unwrap()
        .get(&device)
        .cloned()
}

/// Returns `true` when a queue is registered for `device`.
pub fn has_queue(device: DeviceId) -> bool {
    global_registry().queues.read().unwrap().contains_key(&device)
}

/// Lists every device with a registered queue.
pub fn registered_devices() -> Vec<DeviceId> {
    let mut devices: Vec<DeviceId> = global_registry()
        .queues
        .read()
        .unwrap()
        .keys()
        .copied()
        .collect();
    devices.sort();
    devices
}
