//! The public container: array surface over copy-on-write coherent storage.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;

use crate::buffer::coherent::{BufferState, CoherentBuffer};
use crate::cow::{CowHandle, StorageHandle};
use crate::element::Element;
use crate::error::{CoherenceError, CoherenceResult};
use crate::place::{DeviceId, Place};

/// Dynamic array whose backing storage can live in host memory, in one
/// device memory space, or both, synchronizing lazily.
///
/// Values behave like cheap copies: cloning shares storage until one side
/// mutates, at which point the mutator privatizes its own copy. Host reads
/// go through [`SyncedVector::read`] and never privatize; every mutating
/// operation privatizes first and then forces the host side current.
///
/// A vector is a value: distinct vectors with disjoint storage may be used
/// freely from different threads, but one handle must not be mutated
/// concurrently. Handles that share storage also share one internal lock, so
/// holding host views of two aliasing handles at once will deadlock; take
/// one view at a time.
pub struct SyncedVector<T: Element> {
    data: CowHandle<CoherentBuffer<T>>,
}

/// Read-only host view. Derefs to the element slice.
pub struct HostRead<'a, T: Element> {
    state: MutexGuard<'a, BufferState<T>>,
}

impl<T: Element> Deref for HostRead<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.state.host()
    }
}

/// Mutable host view over privately owned storage. Derefs to the element
/// slice; length-changing operations live on [`SyncedVector`] itself.
pub struct HostWrite<'a, T: Element> {
    state: &'a mut BufferState<T>,
}

impl<T: Element> Deref for HostWrite<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.state.host()
    }
}

impl<T: Element> DerefMut for HostWrite<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.state.host_mut().as_mut_slice()
    }
}

/// Read-only span of device memory: a raw device address plus a length.
///
/// The address is only meaningful to kernels running on the span's device
/// (or to whatever backs the queue). It is invalidated by any subsequent
/// mutation of the vector.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpan<T: Element> {
    device: DeviceId,
    addr: u64,
    len: usize,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> DeviceSpan<T> {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const T {
        self.addr as *const T
    }
}

/// Mutable span of device memory.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpanMut<T: Element> {
    device: DeviceId,
    addr: u64,
    len: usize,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> DeviceSpanMut<T> {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const T {
        self.addr as *const T
    }

    pub fn as_mut_ptr(&self) -> *mut T {
        self.addr as *mut T
    }
}

/// Result of a place-dispatched read access.
pub enum UnifiedRead<'a, T: Element> {
    Host(HostRead<'a, T>),
    Device(DeviceSpan<T>),
}

impl<T: Element> UnifiedRead<'_, T> {
    pub fn place(&self) -> Place {
        match self {
            UnifiedRead::Host(_) => Place::Host,
            UnifiedRead::Device(span) => Place::Device(span.device()),
        }
    }

    pub fn as_host(&self) -> Option<&[T]> {
        match self {
            UnifiedRead::Host(view) => Some(&**view),
            UnifiedRead::Device(_) => None,
        }
    }

    pub fn as_device(&self) -> Option<DeviceSpan<T>> {
        match self {
            UnifiedRead::Host(_) => None,
            UnifiedRead::Device(span) => Some(*span),
        }
    }
}

/// Result of a place-dispatched mutable access.
pub enum UnifiedMut<'a, T: Element> {
    Host(HostWrite<'a, T>),
    Device(DeviceSpanMut<T>),
}

impl<T: Element> UnifiedMut<'_, T> {
    pub fn place(&self) -> Place {
        match self {
            UnifiedMut::Host(_) => Place::Host,
            UnifiedMut::Device(span) => Place::Device(span.device()),
        }
    }

    pub fn as_host_mut(&mut self) -> Option<&mut [T]> {
        match self {
            UnifiedMut::Host(view) => Some(&mut **view),
            UnifiedMut::Device(_) => None,
        }
    }

    pub fn as_device(&self) -> Option<DeviceSpanMut<T>> {
        match self {
            UnifiedMut::Host(_) => None,
            UnifiedMut::Device(span) => Some(*span),
        }
    }
}

impl<T: Element> SyncedVector<T> {
    /// Creates an empty vector.
    pub fn new() -> Self {
        Self {
            data: CowHandle::new(CoherentBuffer::new()),
        }
    }

    /// Creates a vector of `count` copies of `value`.
    pub fn filled(count: usize, value: T) -> Self {
        Self {
            data: CowHandle::new(CoherentBuffer::filled(count, value)),
        }
    }

    /// Creates a vector from a host slice.
    pub fn from_slice(values: &[T]) -> Self {
        Self::from(values.to_vec())
    }

    /// Number of elements. Tracked on the host side regardless of where the
    /// authoritative copy lives, so this never transfers.
    pub fn len(&self) -> usize {
        self.data.read().lock().host().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host-side capacity in elements.
    pub fn capacity(&self) -> usize {
        self.data.read().lock().host_capacity()
    }

    /// Read-only host view. Syncs from the device when the device holds the
    /// authoritative copy; never privatizes shared storage.
    pub fn read(&self) -> HostRead<'_, T> {
        HostRead {
            state: self.read_state(),
        }
    }

    /// Mutable host view. Privatizes shared storage, then makes the host
    /// side current and sole authority. Taking the view marks the contents
    /// dirty whether or not anything is written through it.
    pub fn write(&mut self) -> HostWrite<'_, T> {
        HostWrite {
            state: self.write_state(),
        }
    }

    /// Appends an element.
    pub fn push(&mut self, value: T) {
        self.write_state().host_mut().push(value);
    }

    /// Appends every element of `values`.
    pub fn extend_from_slice(&mut self, values: &[T]) {
        self.write_state().host_mut().extend_from_slice(values);
    }

    /// Replaces the contents with the elements of `values`.
    pub fn assign<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = T>,
    {
        let host = self.write_state().host_mut();
        host.clear();
        host.extend(values);
    }

    /// Resizes to `new_len`, filling with `T::default()`. A resize to the
    /// current length is a complete no-op and does not privatize.
    pub fn resize(&mut self, new_len: usize) {
        if self.len() == new_len {
            return;
        }
        self.write_state().host_mut().resize(new_len, T::default());
    }

    /// Drops all elements. Discards the device mirror's contents without a
    /// read-back, since they are being thrown away anyway.
    pub fn clear(&mut self) {
        self.data.make_mut().state_mut().clear_host();
    }

    /// Reserves host capacity for at least `additional` more elements.
    pub fn reserve(&mut self, additional: usize) {
        self.write_state().host_mut().reserve(additional);
    }

    /// Copies the contents into a plain host vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.read().to_vec()
    }

    /// Opaque identity token for the storage this vector currently
    /// references; equal tokens mean aliased storage.
    pub fn handle(&self) -> StorageHandle {
        self.data.storage_handle()
    }

    /// Read access to a device mirror on the placement's device.
    ///
    /// When a mirror for a different device exists, it is discarded: the
    /// vector detaches to a private host-authoritative copy and the access
    /// is retried once. A mismatch surviving the detach means the handle is
    /// being mutated concurrently and is reported as
    /// [`CoherenceError::InvariantViolation`].
    pub fn device_read(&mut self, place: Place) -> CoherenceResult<DeviceSpan<T>> {
        let device = place
            .device()
            .ok_or(CoherenceError::InvalidPlacement(place))?;
        match self.try_device_read(device) {
            Err(CoherenceError::CrossDeviceMismatch { .. }) => {
                self.data.detach();
                match self.try_device_read(device) {
                    Err(CoherenceError::CrossDeviceMismatch { .. }) => {
                        Err(CoherenceError::InvariantViolation)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Mutable access to a device mirror on the placement's device.
    ///
    /// Privatizes shared storage, makes the device side current and sole
    /// authority, and applies the same detach-and-retry policy as
    /// [`SyncedVector::device_read`]. Taking the span marks the device
    /// contents dirty whether or not a kernel writes through it.
    pub fn device_mutable(&mut self, place: Place) -> CoherenceResult<DeviceSpanMut<T>> {
        let device = place
            .device()
            .ok_or(CoherenceError::InvalidPlacement(place))?;
        match self.try_device_mutable(device) {
            Err(CoherenceError::CrossDeviceMismatch { .. }) => {
                self.data.detach();
                match self.try_device_mutable(device) {
                    Err(CoherenceError::CrossDeviceMismatch { .. }) => {
                        Err(CoherenceError::InvariantViolation)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Read access dispatched on the placement's kind.
    pub fn unified_read(&mut self, place: Place) -> CoherenceResult<UnifiedRead<'_, T>> {
        match place {
            Place::Host => Ok(UnifiedRead::Host(self.read())),
            Place::Device(_) => self.device_read(place).map(UnifiedRead::Device),
        }
    }

    /// Mutable access dispatched on the placement's kind.
    pub fn unified_mutable(&mut self, place: Place) -> CoherenceResult<UnifiedMut<'_, T>> {
        match place {
            Place::Host => Ok(UnifiedMut::Host(self.write())),
            Place::Device(_) => self.device_mutable(place).map(UnifiedMut::Device),
        }
    }

    fn read_state(&self) -> MutexGuard<'_, BufferState<T>> {
        let mut state = self.data.read().lock();
        state
            .ensure_readable_host()
            .expect("device read-back failed during host read");
        state
    }

    fn write_state(&mut self) -> &mut BufferState<T> {
        let state = self.data.make_mut().state_mut();
        state
            .ensure_writable_host()
            .expect("device read-back failed during host write");
        state
    }

    /// Single attempt at a device read: identity check and transfer run
    /// under one lock on the buffer, so no other thread can rebind the
    /// mirror in between.
    fn try_device_read(&self, device: DeviceId) -> CoherenceResult<DeviceSpan<T>> {
        let buffer = self.data.read();
        let mut state = buffer.lock();
        if let Some(bound) = state.bound_device() {
            if bound != device {
                return Err(CoherenceError::CrossDeviceMismatch {
                    bound,
                    requested: device,
                });
            }
        }
        state.ensure_readable_device(device)?;
        Ok(DeviceSpan {
            device,
            addr: state
                .device_addr()
                .expect("device-readable state without a buffer"),
            len: state.host().len(),
            _elem: PhantomData,
        })
    }

    /// Single attempt at a mutable device access. The identity check runs
    /// against the current payload before privatizing, matching the policy
    /// that a foreign-device mirror forces a detach rather than a private
    /// copy that silently drops it.
    fn try_device_mutable(&mut self, device: DeviceId) -> CoherenceResult<DeviceSpanMut<T>> {
        {
            let buffer = self.data.read();
            let state = buffer.lock();
            if let Some(bound) = state.bound_device() {
                if bound != device {
                    return Err(CoherenceError::CrossDeviceMismatch {
                        bound,
                        requested: device,
                    });
                }
            }
        }
        let state = self.data.make_mut().state_mut();
        state.ensure_writable_device(device)?;
        Ok(DeviceSpanMut {
            device,
            addr: state
                .device_addr()
                .expect("device-writable state without a buffer"),
            len: state.host().len(),
            _elem: PhantomData,
        })
    }
}

impl<T: Element> Clone for SyncedVector<T> {
    /// Cheap copy: duplicates the handle, not the buffer.
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Element> Default for SyncedVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> From<Vec<T>> for SyncedVector<T> {
    fn from(values: Vec<T>) -> Self {
        Self {
            data: CowHandle::new(CoherentBuffer::from_vec(values)),
        }
    }
}

impl<T: Element> From<&[T]> for SyncedVector<T> {
    fn from(values: &[T]) -> Self {
        Self::from_slice(values)
    }
}

impl<T: Element> FromIterator<T> for SyncedVector<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<T>>())
    }
}

impl<T: Element> Extend<T> for SyncedVector<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.write_state().host_mut().extend(iter);
    }
}

impl<T: Element> From<SyncedVector<T>> for Vec<T> {
    fn from(vector: SyncedVector<T>) -> Self {
        vector.to_vec()
    }
}

impl<T: Element> From<&SyncedVector<T>> for Vec<T> {
    fn from(vector: &SyncedVector<T>) -> Self {
        vector.to_vec()
    }
}

impl<T: Element + PartialEq> PartialEq for SyncedVector<T> {
    /// Element-wise equality over host-resident views. Aliased storage is
    /// trivially equal, and a size mismatch decides without touching
    /// elements (or triggering a transfer).
    fn eq(&self, other: &Self) -> bool {
        if self.data.shares_storage_with(&other.data) {
            return true;
        }
        if self.len() != other.len() {
            return false;
        }
        *self.read() == *other.read()
    }
}

impl<T: Element + Eq> Eq for SyncedVector<T> {}

impl<T: Element + fmt::Debug> fmt::Debug for SyncedVector<T> {
    /// Reports shape and residency without forcing a transfer.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.data.read().lock();
        f.debug_struct("SyncedVector")
            .field("len", &state.host().len())
            .field("residency", &state.residency())
            .field("handle", &self.data.storage_handle())
            .finish()
    }
}
