use std::any::Any;
use std::collections::HashMap;

use super::class::Class;
use super::Value;
use crate::memory::{Ptr, Trace, Tracer};

/// A native compound object: a property bag tied to a class.
///
/// Every runtime value behaves like an object, but this type is the one
/// scripts create through `allocate` and extend with properties.
#[derive(Debug)]
pub struct Object {
    pub properties: HashMap<String, Value>,
    pub class: Ptr<Class>,
}

impl Object {
    pub fn new(class: Ptr<Class>) -> Self {
        Self {
            properties: HashMap::new(),
            class,
        }
    }

    /// Reads an own property. Properties are not looked up along the
    /// class chain; inheritance applies to methods only.
    pub fn get_prop(&self, name: &str) -> Option<Value> {
        self.properties.get(name).cloned()
    }

    pub fn set_prop(&mut self, name: &str, value: Value) {
        self.properties.insert(name.to_owned(), value);
    }
}

impl Trace for Object {
    fn trace(&self, tracer: &mut Tracer) {
        self.properties.trace(tracer);
        tracer.visit(&self.class);
    }
}

/// An opaque host payload with a class, so foreign state can participate
/// in method dispatch.
///
/// The payload is not traced; it must not contain handles into the heap.
/// Host state that needs to reach managed values belongs in foreign
/// function captures instead.
pub struct ForeignObject {
    pub class: Ptr<Class>,
    payload: Box<dyn Any>,
}

impl ForeignObject {
    pub fn new<T: Any>(class: Ptr<Class>, payload: T) -> Self {
        Self {
            class,
            payload: Box::new(payload),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut()
    }
}

impl Trace for ForeignObject {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit(&self.class);
    }
}

impl std::fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignObject {{ class: {:?} }}", self.class)
    }
}
