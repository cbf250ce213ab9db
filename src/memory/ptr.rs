use std::fmt;
use std::marker::PhantomData;

use super::heap::{self, Header};

/// Weak handle to a heap cell.
///
/// A `Ptr` does not keep the payload alive: any collection cycle may
/// destroy the payload of a cell that is not reachable from a root. The
/// handle itself stays usable — it keeps the cell *header* alive so
/// [`Ptr::valid`] can report whether the payload still exists.
///
/// Dereferencing an invalid handle is a fault in the embedding code, not
/// a script error, and panics.
pub struct Ptr<T> {
    header: *mut Header,
    _marker: PhantomData<*const T>,
}

impl<T> Ptr<T> {
    /// The null handle; always invalid.
    pub fn null() -> Self {
        Self {
            header: std::ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    pub(super) fn from_header(header: *mut Header) -> Self {
        if !header.is_null() {
            unsafe {
                let ptrs = &(*header).ptrs;
                ptrs.set(ptrs.get() + 1);
            }
        }
        Self {
            header,
            _marker: PhantomData,
        }
    }

    pub(super) fn header(&self) -> *mut Header {
        self.header
    }

    /// Returns whether the payload behind this handle still exists.
    pub fn valid(&self) -> bool {
        !self.header.is_null() && unsafe { (*self.header).valid.get() }
    }

    /// Returns a reference to the payload.
    ///
    /// # Panics
    ///
    /// Panics if the handle is null or the payload has been collected.
    pub fn get(&self) -> &T {
        assert!(self.valid(), "invalid handle access");
        unsafe { &*heap::payload::<T>(self.header) }
    }

    /// Returns a mutable reference to the payload.
    ///
    /// The caller must not hold any other reference into the same cell
    /// for the duration of the borrow.
    ///
    /// # Panics
    ///
    /// Panics if the handle is null or the payload has been collected.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut T {
        assert!(self.valid(), "invalid handle access");
        unsafe { &mut *heap::payload::<T>(self.header) }
    }

    /// Identity comparison: two handles are equal when they refer to the
    /// same cell.
    pub fn ptr_eq(&self, other: &Ptr<T>) -> bool {
        self.header == other.header
    }

    /// A stable integer identity for the cell, usable as a hash.
    pub fn address(&self) -> usize {
        self.header as usize
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        Self::from_header(self.header)
    }
}

impl<T> Drop for Ptr<T> {
    fn drop(&mut self) {
        if !self.header.is_null() {
            unsafe {
                let ptrs = &(*self.header).ptrs;
                ptrs.set(ptrs.get() - 1);
            }
        }
    }
}

impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr({:#x})", self.header as usize)
    }
}
