//! Scratch workspace arena for decoding layers.
//!
//! Layers declare what a call needs with [`WorkspaceLayout`] and carve typed,
//! zero-initialised slices out of a caller-owned [`Workspace`] while the call
//! runs. Everything carved is released in bulk by [`Workspace::reset`], which
//! needs exclusive access and therefore cannot run while a slice is alive.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use thiserror::Error;

/// Errors raised while carving scratch memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    #[error("workspace exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
}

mod sealed {
    pub trait Sealed {}
}

/// Element types that can live in a workspace. All of them are valid when
/// zeroed, and carving writes `ZERO` before handing a slice out.
pub trait Scratch: Copy + sealed::Sealed + 'static {
    const ZERO: Self;
}

macro_rules! impl_scratch {
    ($($t:ty => $zero:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}
            impl Scratch for $t {
                const ZERO: Self = $zero;
            }
        )*
    };
}

impl_scratch!(f32 => 0.0, u32 => 0, i32 => 0, usize => 0, bool => false);

/// Declared scratch requirement of a call, in bytes.
///
/// Every pushed region is charged its worst-case alignment padding, so a
/// workspace of `size_bytes()` always fits the regions in push order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceLayout {
    bytes: usize,
}

impl WorkspaceLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `len` elements of `T`.
    pub fn push<T: Scratch>(self, len: usize) -> Self {
        let region = len.saturating_mul(size_of::<T>());
        Self {
            bytes: self
                .bytes
                .saturating_add(region)
                .saturating_add(align_of::<T>() - 1),
        }
    }

    /// The larger of two layouts. Stages that run one after another reuse
    /// the same scratch, so the call needs only the biggest of them.
    pub fn max(self, other: Self) -> Self {
        Self { bytes: self.bytes.max(other.bytes) }
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes
    }
}

/// Caller-supplied bump arena. Not reentrant: a layer borrows it mutably for
/// the duration of one `setup` or `forward` call.
pub struct Workspace {
    buffer: Box<[UnsafeCell<u8>]>,
    offset: Cell<usize>,
}

impl Workspace {
    /// Create a workspace with `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let buffer: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            buffer: buffer.into_boxed_slice(),
            offset: Cell::new(0),
        }
    }

    /// Create a workspace large enough for `layout`.
    pub fn for_layout(layout: WorkspaceLayout) -> Self {
        Self::new(layout.size_bytes())
    }

    /// Carve `len` zeroed elements of `T`.
    pub fn carve<T: Scratch>(&self, len: usize) -> Result<ScratchSlice<'_, T>, WorkspaceError> {
        let capacity = self.capacity();
        let current = self.offset.get();
        let base = self.buffer.as_ptr() as usize;
        let align = align_of::<T>();
        let start = ((base + current + align - 1) & !(align - 1)) - base;
        let requested = len.saturating_mul(size_of::<T>());
        let end = start.saturating_add(requested);
        if end > capacity {
            return Err(WorkspaceError::Exhausted {
                requested,
                available: capacity.saturating_sub(start),
            });
        }
        self.offset.set(end);

        if requested == 0 {
            return Ok(ScratchSlice {
                ptr: NonNull::dangling().as_ptr(),
                len,
                _marker: PhantomData,
            });
        }

        // SAFETY: `start..end` lies inside the buffer and was not handed out
        // before (the bump offset only grows until `reset`, which needs
        // `&mut self`). `start` is aligned for `T` and every element is
        // initialised before the slice becomes observable.
        let ptr = unsafe {
            let ptr = UnsafeCell::raw_get(self.buffer.as_ptr().add(start)) as *mut T;
            for i in 0..len {
                ptr.add(i).write(T::ZERO);
            }
            ptr
        };
        Ok(ScratchSlice {
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    /// Release every carved region.
    pub fn reset(&mut self) {
        self.offset.set(0);
    }

    /// Bytes currently carved, including alignment padding.
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}

/// A typed region carved from a [`Workspace`]; indexing is bounds-checked
/// through the slice it derefs to.
pub struct ScratchSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T> Deref for ScratchSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr is valid and initialised for len elements while the
        // workspace borrow 'a is alive; the region is disjoint from others.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> DerefMut for ScratchSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and this handle is the only one for the region.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ScratchSlice<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
