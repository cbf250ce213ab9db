use std::collections::HashMap;

use crate::memory::{Heap, Ptr, Root, Trace, Tracer};
use crate::value::{Class, Value};

/// Handles to the bootstrapped primitive classes. All null until
/// [`crate::builtins::load_builtins`] runs.
#[derive(Debug, Default)]
pub struct Classes {
    pub object: Ptr<Class>,
    pub class: Ptr<Class>,
    pub nil: Ptr<Class>,
    pub boolean: Ptr<Class>,
    pub int: Ptr<Class>,
    pub string: Ptr<Class>,
    pub array: Ptr<Class>,
    pub function: Ptr<Class>,
}

impl Trace for Classes {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit(&self.object);
        tracer.visit(&self.class);
        tracer.visit(&self.nil);
        tracer.visit(&self.boolean);
        tracer.visit(&self.int);
        tracer.visit(&self.string);
        tracer.visit(&self.array);
        tracer.visit(&self.function);
    }
}

/// The shared runtime context: the heap together with the builtin
/// bindings and the primitive class registry, both of which are
/// permanent roots. All mutable runtime state threads through a
/// `Context`; there are no process-wide globals.
pub struct Context {
    // Field order matters: the roots detach themselves from the heap's
    // root list when dropped, so they must go first.
    builtins: Root<HashMap<String, Value>>,
    classes: Root<Classes>,
    heap: Heap,
}

impl Context {
    pub fn new() -> Self {
        let heap = Heap::new();
        let builtins = heap.root(HashMap::new());
        let classes = heap.root(Classes::default());
        Self {
            builtins,
            classes,
            heap,
        }
    }

    /// Moves `value` into a fresh heap cell; see [`Heap::alloc`].
    pub fn alloc<T: Trace>(&self, value: T) -> Root<Ptr<T>> {
        self.heap.alloc(value)
    }

    /// Registers `value` with the collector; see [`Heap::root`].
    pub fn root<T: Trace>(&self, value: T) -> Root<T> {
        self.heap.root(value)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Values the compiler pre-binds at the start of every main
    /// function, keyed by the variable name scripts see.
    pub fn builtins(&self) -> &HashMap<String, Value> {
        &self.builtins
    }

    pub fn define_builtin(&mut self, name: &str, value: Value) {
        self.builtins.insert(name.to_owned(), value);
    }

    pub fn classes(&self) -> &Classes {
        &self.classes
    }

    pub(crate) fn classes_mut(&mut self) -> &mut Classes {
        &mut self.classes
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
