//! Reference-counted handle with copy-on-write mutable access.

use std::fmt;
use std::sync::Arc;

/// Opaque identity token for the storage a handle currently references.
///
/// Two handles compare equal here exactly when they alias the same payload.
/// The token is only meaningful while both handles are alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageHandle(usize);

/// Shared-ownership handle over a payload `P`, cloned on divergence.
///
/// Any number of handles may alias one payload for reading. Mutable access
/// privatizes first: a shared payload is deep-copied and the handle rebound
/// to the copy, so the handle is guaranteed to be the payload's unique owner
/// the moment [`CowHandle::make_mut`] returns. Other handles keep the
/// original payload untouched. The payload is dropped with its last handle.
pub struct CowHandle<P> {
    payload: Arc<P>,
}

impl<P> CowHandle<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// Immutable view of the payload. Never affects sharing.
    pub fn read(&self) -> &P {
        &self.payload
    }

    /// Identity token for alias detection.
    pub fn storage_handle(&self) -> StorageHandle {
        StorageHandle(Arc::as_ptr(&self.payload) as usize)
    }

    /// Returns `true` when no other handle aliases the payload.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.payload) == 1
    }

    /// Returns `true` when both handles alias the same payload.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl<P: Clone> CowHandle<P> {
    /// Mutable view of the payload, privatizing it first when shared.
    pub fn make_mut(&mut self) -> &mut P {
        Arc::make_mut(&mut self.payload)
    }

    /// Rebinds this handle to a fresh deep copy of the payload, even when it
    /// is already uniquely owned.
    pub fn detach(&mut self) {
        self.payload = Arc::new(self.payload.as_ref().clone());
    }
}

impl<P> Clone for CowHandle<P> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for CowHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CowHandle")
            .field("payload", &self.payload)
            .field("handle", &self.storage_handle())
            .finish()
    }
}
