use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::trace::{Trace, Tracer};

/// Intrusive doubly-linked list of active roots, owned (boxed) by the
/// heap so that nodes can detach themselves with no access to the heap.
pub(super) struct RootList {
    head: Cell<*mut RootNode>,
}

impl RootList {
    pub(super) fn new() -> Box<Self> {
        Box::new(Self {
            head: Cell::new(std::ptr::null_mut()),
        })
    }

    pub(super) fn trace_all(&self, tracer: &mut Tracer) {
        let mut node = self.head.get();
        while !node.is_null() {
            unsafe {
                ((*node).trace)(node, tracer);
                node = (*node).next.get();
            }
        }
    }
}

pub(super) struct RootNode {
    prev: Cell<*mut RootNode>,
    next: Cell<*mut RootNode>,
    list: *const RootList,
    trace: unsafe fn(*const RootNode, &mut Tracer),
}

// The node must come first so a node pointer doubles as a box pointer.
#[repr(C)]
struct RootBox<T> {
    node: RootNode,
    value: T,
}

unsafe fn trace_root<T: Trace>(node: *const RootNode, tracer: &mut Tracer) {
    let root = node as *const RootBox<T>;
    (*root).value.trace(tracer);
}

/// RAII guard registering a traceable value with the collector.
///
/// While a `Root` is alive, every handle reachable from its value stays
/// valid across collections. Roots are meant to be short-lived and
/// stack-scoped; cells must not contain roots. A root must not outlive
/// the heap that created it.
pub struct Root<T: Trace> {
    raw: NonNull<RootBox<T>>,
}

impl<T: Trace> Root<T> {
    pub(super) fn new(list: &RootList, value: T) -> Self {
        let raw = Box::into_raw(Box::new(RootBox {
            node: RootNode {
                prev: Cell::new(std::ptr::null_mut()),
                next: Cell::new(list.head.get()),
                list,
                trace: trace_root::<T>,
            },
            value,
        }));
        unsafe {
            let node = raw as *mut RootNode;
            let old_head = list.head.get();
            if !old_head.is_null() {
                (*old_head).prev.set(node);
            }
            list.head.set(node);
            Self {
                raw: NonNull::new_unchecked(raw),
            }
        }
    }

    /// Consumes the root and returns the contained value. Anything the
    /// value reaches is unprotected from that point on.
    pub fn into_inner(self) -> T {
        unsafe {
            Self::detach(self.raw.as_ptr() as *mut RootNode);
            let boxed = Box::from_raw(self.raw.as_ptr());
            std::mem::forget(self);
            boxed.value
        }
    }

    unsafe fn detach(node: *mut RootNode) {
        let prev = (*node).prev.get();
        let next = (*node).next.get();
        if prev.is_null() {
            (*(*node).list).head.set(next);
        } else {
            (*prev).next.set(next);
        }
        if !next.is_null() {
            (*next).prev.set(prev);
        }
    }
}

impl<T: Trace> Drop for Root<T> {
    fn drop(&mut self) {
        unsafe {
            Self::detach(self.raw.as_ptr() as *mut RootNode);
            drop(Box::from_raw(self.raw.as_ptr()));
        }
    }
}

impl<T: Trace> Deref for Root<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &self.raw.as_ref().value }
    }
}

impl<T: Trace> DerefMut for Root<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut self.raw.as_mut().value }
    }
}
