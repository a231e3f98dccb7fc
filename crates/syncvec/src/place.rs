//! Placement types naming where a piece of storage lives.

use std::fmt;

/// Identifies one accelerator device within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes directly addressable host memory from a specific device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    Host,
    Device(DeviceId),
}

impl Place {
    /// Returns `true` for the host placement.
    pub fn is_host(&self) -> bool {
        matches!(self, Place::Host)
    }

    /// Returns `true` for any device placement.
    pub fn is_device(&self) -> bool {
        matches!(self, Place::Device(_))
    }

    /// Returns the device identifier when the placement names a device.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Place::Host => None,
            Place::Device(device) => Some(*device),
        }
    }
}

impl From<DeviceId> for Place {
    fn from(device: DeviceId) -> Self {
        Place::Device(device)
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Host => write!(f, "host"),
            Place::Device(device) => write!(f, "device {device}"),
        }
    }
}
