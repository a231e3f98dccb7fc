pub mod buffer;
pub mod cow;
pub mod element;
mod env;
pub mod error;
pub mod place;
pub mod runtime;
pub mod stats;
pub mod vector;

pub use buffer::{CoherentBuffer, DeviceBuffer};
pub use cow::{CowHandle, StorageHandle};
pub use element::Element;
pub use error::{CoherenceError, CoherenceResult};
pub use place::{DeviceId, Place};
pub use vector::{
    DeviceSpan, DeviceSpanMut, HostRead, HostWrite, SyncedVector, UnifiedMut, UnifiedRead,
};
