use std::collections::HashMap;

use super::heap::Header;
use super::ptr::Ptr;

/// Visitor passed to [`Trace`] implementations during the mark phase.
///
/// Visiting a handle marks its cell and queues it so the collector can
/// trace whatever the cell's payload reaches in turn.
pub struct Tracer {
    queue: Vec<*mut Header>,
}

impl Tracer {
    pub(super) fn new() -> Self {
        Self { queue: Vec::new() }
    }

    /// Marks the cell behind `ptr` as reachable and schedules it for tracing.
    pub fn visit<T>(&mut self, ptr: &Ptr<T>) {
        let header = ptr.header();
        if header.is_null() {
            return;
        }
        // A marked cell is either queued or already traced, never both.
        unsafe {
            if !(*header).marked.get() {
                (*header).marked.set(true);
                self.queue.push(header);
            }
        }
    }

    pub(super) fn pop(&mut self) -> Option<*mut Header> {
        self.queue.pop()
    }
}

/// Tracing contract for values stored in cells or roots.
///
/// Implementations forward the tracer over every directly reachable
/// [`Ptr`] and nothing else. Leaving a handle out makes the collector
/// free cells that are still in use.
pub trait Trace {
    fn trace(&self, tracer: &mut Tracer);
}

impl<T> Trace for Ptr<T> {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit(self);
    }
}

macro_rules! impl_trace_leaf {
    ($($t:ty),* $(,)?) => {
        $(impl Trace for $t {
            fn trace(&self, _tracer: &mut Tracer) {}
        })*
    };
}

impl_trace_leaf!((), bool, char, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, String);

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, tracer: &mut Tracer) {
        for x in self {
            x.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, tracer: &mut Tracer) {
        if let Some(x) = self {
            x.trace(tracer);
        }
    }
}

impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&self, tracer: &mut Tracer) {
        (**self).trace(tracer);
    }
}

impl<K: Trace, V: Trace> Trace for HashMap<K, V> {
    fn trace(&self, tracer: &mut Tracer) {
        for (k, v) in self {
            k.trace(tracer);
            v.trace(tracer);
        }
    }
}
