use std::fmt;
use std::rc::Rc;

use super::Value;
use crate::memory::{Root, Trace, Tracer};
use crate::vm::{Vm, VmError};

/// Result type foreign callbacks produce: a rooted value, or a
/// [`VmError::Exception`] to throw into the running script.
pub type ForeignResult = Result<Root<Value>, VmError>;

type Callback = Rc<dyn Fn(&mut Vm<'_>, &[Value], &[Value]) -> ForeignResult>;

/// A host function callable from scripts.
///
/// Captured values live in `captures`, which the collector traces; the
/// callback itself must not smuggle handles through its environment.
/// Callbacks receive the running vm, their captures and the call
/// arguments (which the vm keeps rooted for the duration of the call).
pub struct ForeignFunction {
    pub nargs: usize,
    captures: Vec<Value>,
    fun: Callback,
}

impl ForeignFunction {
    /// A plain function without captures.
    pub fn lambda<F>(nargs: usize, fun: F) -> Self
    where
        F: Fn(&mut Vm<'_>, &[Value]) -> ForeignResult + 'static,
    {
        Self {
            nargs,
            captures: Vec::new(),
            fun: Rc::new(move |vm, _captures, args| fun(vm, args)),
        }
    }

    /// A function closed over GC-managed values.
    pub fn with_captures<F>(nargs: usize, captures: Vec<Value>, fun: F) -> Self
    where
        F: Fn(&mut Vm<'_>, &[Value], &[Value]) -> ForeignResult + 'static,
    {
        Self {
            nargs,
            captures,
            fun: Rc::new(fun),
        }
    }

    /// A method: a one-argument function which binds its receiver and
    /// returns a fresh closure taking the remaining arguments.
    ///
    /// `method(n, f)` called as `m(self)(x_1, .., x_n)` invokes
    /// `f(vm, self, [x_1, .., x_n])`.
    pub fn method<F>(nargs: usize, fun: F) -> Self
    where
        F: Fn(&mut Vm<'_>, &Value, &[Value]) -> ForeignResult + 'static,
    {
        let fun = Rc::new(fun);
        Self {
            nargs: 1,
            captures: Vec::new(),
            fun: Rc::new(move |vm, _captures, args| {
                let fun = fun.clone();
                let bound = ForeignFunction {
                    nargs,
                    captures: vec![args[0].clone()],
                    fun: Rc::new(move |vm, captures, args| fun(vm, &captures[0], args)),
                };
                let bound = vm.ctx().alloc(bound);
                Ok(vm.ctx().root(Value::Foreign(bound.clone())))
            }),
        }
    }

    pub fn invoke(&self, vm: &mut Vm<'_>, args: &[Value]) -> ForeignResult {
        (self.fun)(vm, &self.captures, args)
    }
}

impl Trace for ForeignFunction {
    fn trace(&self, tracer: &mut Tracer) {
        self.captures.trace(tracer);
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignFunction {{ nargs: {} }}", self.nargs)
    }
}
