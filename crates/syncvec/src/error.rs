//! Error surface shared by the coherence engine and the container.

use thiserror::Error;

use crate::place::{DeviceId, Place};

/// Direction of a host/device transfer, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::HostToDevice => write!(f, "host to device"),
            TransferDirection::DeviceToHost => write!(f, "device to host"),
        }
    }
}

/// Failures surfaced by device access paths.
///
/// Host access never fails; every variant here is produced while allocating,
/// transferring, or validating device-side state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoherenceError {
    /// The queue could not provide a device allocation.
    #[error("allocation of {bytes} bytes failed on device {device}")]
    AllocationFailure { device: DeviceId, bytes: usize },

    /// A device buffer already exists for a different device. The engine
    /// never resolves this itself; the owning container decides whether to
    /// discard the buffer.
    #[error("device buffer is bound to device {bound}, but device {requested} was requested")]
    CrossDeviceMismatch { bound: DeviceId, requested: DeviceId },

    /// A cross-device mismatch survived a detach, which can only happen when
    /// the same handle is mutated from several threads without coordination.
    #[error("cross-device mismatch persisted after detach; handle mutated concurrently")]
    InvariantViolation,

    /// A device accessor was called with a placement that is not a device.
    #[error("device access requires a device placement, got {0}")]
    InvalidPlacement(Place),

    /// No execution queue is registered for the requested device.
    #[error("no execution queue registered for device {0}")]
    UnsupportedDevice(DeviceId),

    /// The queue reported a failed copy.
    #[error("{direction} copy of {bytes} bytes failed on device {device}")]
    TransferFailure {
        device: DeviceId,
        direction: TransferDirection,
        bytes: usize,
    },
}

/// Convenience alias for results returned by coherence routines.
pub type CoherenceResult<T> = Result<T, CoherenceError>;
