//! Device allocation ownership and the host/device coherence engine.

pub mod coherent;
pub mod device;

pub use coherent::CoherentBuffer;
pub use device::DeviceBuffer;
