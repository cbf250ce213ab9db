//! rill: an embeddable class-based scripting runtime.
//!
//! The crate compiles an expression tree into stack-machine bytecode and
//! executes it on a virtual machine whose values live in a precise
//! mark-and-sweep heap. Hosts embed the runtime through [`Context`]
//! (allocation, builtins) and [`vm::Vm`] (execution entry points), and
//! extend it with foreign functions and classes.

#![warn(rust_2018_idioms)]

pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod context;
mod debug;
pub mod memory;
pub mod strings;
pub mod value;
pub mod vm;

pub use context::Context;
pub use memory::{Heap, Ptr, Root, Trace, Tracer};
pub use value::Value;
