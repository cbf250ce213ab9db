use std::collections::HashMap;
use std::fmt::Write as _;

use super::instruction::{Instruction, Opcode};
use super::Value;
use crate::memory::{Ptr, Trace, Tracer};

/// Storage for a variable captured by a closure.
///
/// While the original local is still on the data stack the upvalue is
/// *open* and holds the slot's absolute index; the slot carries a
/// back-reference so the vm can keep the index accurate. When the slot
/// is removed the upvalue is *closed* over the value itself, shared by
/// every closure that captured it.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl Trace for Upvalue {
    fn trace(&self, tracer: &mut Tracer) {
        match self {
            Upvalue::Open(_) => {}
            Upvalue::Closed(value) => value.trace(tracer),
        }
    }
}

/// The constant part of a function, shared between closures and never
/// mutated after compilation.
#[derive(Debug, Default)]
pub struct FunctionProto {
    pub nargs: usize,
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
}

impl FunctionProto {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Trace for FunctionProto {
    fn trace(&self, tracer: &mut Tracer) {
        self.constants.trace(tracer);
    }
}

/// A function closure: shared proto plus captured upvalues.
#[derive(Debug)]
pub struct Function {
    pub proto: Ptr<FunctionProto>,
    pub upvalues: Vec<Ptr<Upvalue>>,
}

impl Function {
    pub fn new(proto: Ptr<FunctionProto>) -> Self {
        Self {
            proto,
            upvalues: Vec::new(),
        }
    }
}

impl Trace for Function {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.visit(&self.proto);
        self.upvalues.trace(tracer);
    }
}

impl Function {
    /// Returns a human-readable listing of the function's bytecode,
    /// including the protos of every function in its constant pool.
    /// Handles are printed with small labels stable within one listing.
    pub fn dump(&self) -> String {
        let mut buffer = String::new();
        let mut labels = HashMap::new();
        let mut label = move |address: usize| -> usize {
            let next = labels.len();
            *labels.entry(address).or_insert(next)
        };
        self.dump_rec(&mut buffer, &mut label);
        buffer
    }

    fn dump_rec(&self, buffer: &mut String, label: &mut dyn FnMut(usize) -> usize) {
        let proto = self.proto.get();
        let _ = writeln!(buffer, "Function#{}", label(self.proto.address()));
        let _ = writeln!(buffer, "nargs: {}", proto.nargs);
        let _ = writeln!(buffer, "nconstants: {}", proto.constants.len());
        let _ = writeln!(buffer, "code:");
        let width = proto.code.len().to_string().len();
        for (i, instr) in proto.code.iter().enumerate() {
            let _ = write!(buffer, "  {:width$}  {}", i, instr, width = width);
            if instr.op() == Opcode::GetConst {
                let value = &proto.constants[instr.index()];
                let text = match (value, value.cell_address()) {
                    (Value::Str(_), _) | (_, None) => value.inspect(),
                    // Functions are labeled by their shared proto, the
                    // same key the nested listings below use.
                    (Value::Function(func), _) => {
                        format!("Function#{}", label(func.get().proto.address()))
                    }
                    (_, Some(address)) => {
                        let inspected = value.inspect();
                        let kind = inspected.split('#').next().unwrap_or(&inspected);
                        format!("{}#{}", kind, label(address))
                    }
                };
                let _ = write!(buffer, " ({})", text);
            }
            let _ = writeln!(buffer);
        }
        for value in &proto.constants {
            if let Value::Function(func) = value {
                let _ = writeln!(buffer);
                func.get().dump_rec(buffer, label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn dump_lists_code_and_nested_functions() {
        let ctx = Context::new();
        let inner_proto = ctx.alloc(FunctionProto {
            nargs: 1,
            code: vec![
                Instruction::new(Opcode::GetVar, 0),
                Instruction::plain(Opcode::Return),
            ],
            constants: vec![],
        });
        let inner = ctx.alloc(Function::new(inner_proto.clone()));
        let outer_proto = ctx.alloc(FunctionProto {
            nargs: 0,
            code: vec![
                Instruction::new(Opcode::GetConst, 0),
                Instruction::plain(Opcode::Return),
            ],
            constants: vec![Value::Function(inner.clone())],
        });
        let outer = ctx.alloc(Function::new(outer_proto.clone()));

        let listing = outer.get().dump();
        assert!(listing.contains("Function#0"), "listing:\n{}", listing);
        assert!(
            listing.contains("GetConst 0 (Function#1)"),
            "listing:\n{}",
            listing
        );
        assert!(listing.contains("nargs: 1"), "listing:\n{}", listing);
        assert!(listing.contains("Return"), "listing:\n{}", listing);
    }

    #[test]
    fn upvalues_trace_their_closed_values() {
        let ctx = Context::new();
        let cell = ctx.alloc("captured".to_owned());
        let upvalue = ctx.alloc(Upvalue::Closed(Value::Str(cell.clone())));
        let kept: crate::memory::Ptr<String> = cell.clone();
        drop(cell);
        // The string is now reachable only through the upvalue root.
        ctx.heap().collect();
        assert!(kept.valid());
        drop(upvalue);
        ctx.heap().collect();
        assert!(!kept.valid());
    }
}
