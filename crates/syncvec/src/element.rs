//! Scalar element trait for values that may be mirrored into device memory.

/// Marker for plain-data scalars whose host representation can be copied to a
/// device byte-for-byte.
///
/// Implemented for the primitive numeric types only: a type with padding or
/// interior pointers must not be mirrored as raw bytes.
pub trait Element: Copy + Default + Send + Sync + 'static {}

macro_rules! impl_element {
    ($($ty:ty),* $(,)?) => {
        $(impl Element for $ty {})*
    };
}

impl_element!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

/// Views a typed slice as its raw bytes.
pub(crate) fn as_bytes<T: Element>(values: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
    }
}

/// Views a mutable typed slice as its raw bytes.
pub(crate) fn as_bytes_mut<T: Element>(values: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            values.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(values),
        )
    }
}
