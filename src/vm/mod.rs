//! The stack-based virtual machine and its error channels.

use thiserror::Error;

use crate::value::Value;

mod frames;
#[allow(clippy::module_inception)]
mod vm;

pub use vm::Vm;

pub type Result<T> = std::result::Result<T, VmError>;

/// Errors surfaced by vm entry points.
#[derive(Debug, Error)]
pub enum VmError {
    /// A script exception that no handler caught. Carries the thrown
    /// value; it is no longer rooted, so hosts should copy what they
    /// need out of it before allocating again.
    ///
    /// Foreign functions also use this variant to throw: returning it
    /// re-enters the ordinary unwind path of the running vm.
    #[error("uncaught exception: {}", .0.inspect())]
    Exception(Value),

    /// A violation of the vm's own invariants: a bug in the embedding or
    /// in generated bytecode, never in script behavior. Not catchable by
    /// scripts.
    #[error(transparent)]
    Fault(#[from] Fault),
}

#[derive(Debug, Error)]
pub enum Fault {
    #[error("data stack underflow")]
    StackUnderflow,

    #[error("no call frame")]
    NoCallFrame,

    #[error("instruction pointer out of range")]
    InstructionOutOfRange,

    #[error("exception stack underflow")]
    ExceptionUnderflow,

    #[error("variable index out of range")]
    VariableOutOfRange,

    #[error("upvalue index out of range")]
    UpvalueOutOfRange,

    #[error("constant index out of range")]
    ConstantOutOfRange,

    #[error("malformed bytecode: {0}")]
    Malformed(&'static str),
}
