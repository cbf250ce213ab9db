use crate::memory::{Ptr, Trace, Tracer};
use crate::value::{Function, Upvalue, Value};

/// One slot of the data stack. The optional back-reference points at the
/// open upvalue observing this slot; it is kept accurate whenever the
/// slot moves and consumed (closing the upvalue) when the slot dies.
pub(super) struct DataFrame {
    pub value: Value,
    pub upvalue: Option<Ptr<Upvalue>>,
}

impl DataFrame {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            upvalue: None,
        }
    }
}

impl Trace for DataFrame {
    fn trace(&self, tracer: &mut Tracer) {
        self.value.trace(tracer);
        self.upvalue.trace(tracer);
    }
}

/// One active call. `data_bottom` indexes the first local of the frame;
/// `exception_bottom` is where the exception stack gets truncated when
/// the frame returns.
#[derive(Clone)]
pub(super) struct CallFrame {
    pub func: Ptr<Function>,
    pub ip: usize,
    pub data_bottom: usize,
    pub exception_bottom: usize,
}

/// An installed exception handler: the stack heights to restore and the
/// address execution resumes at with the thrown value on top.
pub(super) struct ExceptionFrame {
    pub data_bottom: usize,
    pub call_bottom: usize,
    pub address: usize,
}

/// Entry-point bookkeeping, saved and restored around reentrant host
/// calls into the vm.
pub(super) struct SavedState {
    pub data_bottom: usize,
    pub call_bottom: usize,
    pub exception_bottom: usize,
}
