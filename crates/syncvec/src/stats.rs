//! Process-wide transfer accounting.
//!
//! Counters cover every container in the process; per-queue counts live on
//! the backend. Set `SYNCVEC_TRACE_TRANSFERS=1` to echo each transfer and
//! allocation to stderr.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::env;
use crate::place::DeviceId;

static HOST_TO_DEVICE: AtomicU64 = AtomicU64::new(0);
static DEVICE_TO_HOST: AtomicU64 = AtomicU64::new(0);
static DEVICE_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the process-wide transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub host_to_device: u64,
    pub device_to_host: u64,
    pub device_allocations: u64,
}

/// Reads the current counter values.
pub fn snapshot() -> TransferStats {
    TransferStats {
        host_to_device: HOST_TO_DEVICE.load(Ordering::Relaxed),
        device_to_host: DEVICE_TO_HOST.load(Ordering::Relaxed),
        device_allocations: DEVICE_ALLOCATIONS.load(Ordering::Relaxed),
    }
}

/// Resets every counter to zero.
pub fn reset() {
    HOST_TO_DEVICE.store(0, Ordering::Relaxed);
    DEVICE_TO_HOST.store(0, Ordering::Relaxed);
    DEVICE_ALLOCATIONS.store(0, Ordering::Relaxed);
}

pub(crate) fn record_host_to_device(device: DeviceId, bytes: usize) {
    HOST_TO_DEVICE.fetch_add(1, Ordering::Relaxed);
    if env::trace_transfers_enabled() {
        eprintln!("[syncvec] host->device {bytes} B on device {device}");
    }
}

pub(crate) fn record_device_to_host(device: DeviceId, bytes: usize) {
    DEVICE_TO_HOST.fetch_add(1, Ordering::Relaxed);
    if env::trace_transfers_enabled() {
        eprintln!("[syncvec] device->host {bytes} B on device {device}");
    }
}

pub(crate) fn record_device_allocation(device: DeviceId, bytes: usize) {
    DEVICE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    if env::trace_transfers_enabled() {
        eprintln!("[syncvec] allocated {bytes} B on device {device}");
    }
}
