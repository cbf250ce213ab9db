use colored::Colorize;

use super::frames::{CallFrame, DataFrame, ExceptionFrame, SavedState};
use super::{Fault, Result, VmError};
use crate::context::Context;
use crate::debug::TRACE_EXECUTION;
use crate::memory::{Ptr, Root, Trace, Tracer};
use crate::value::{ForeignFunction, Function, FunctionProto, Instruction, Opcode, Upvalue, Value};

/// The bytecode interpreter.
///
/// A vm owns three stacks: the data stack of values (doubling as local
/// variable storage), the call stack of active frames, and the exception
/// stack of installed handlers. Entry points may be re-entered from
/// foreign functions; the current entry bottoms are saved and restored
/// around every such call, so a nested script runs isolated from the
/// frames of its caller.
///
/// Construct with [`Vm::new`], which roots the vm so the collector can
/// see everything its stacks hold.
pub struct Vm<'ctx> {
    ctx: &'ctx Context,
    data: Vec<DataFrame>,
    calls: Vec<CallFrame>,
    exceptions: Vec<ExceptionFrame>,
    data_bottom: usize,
    call_bottom: usize,
    exception_bottom: usize,
    saved: Vec<SavedState>,
    thrown: bool,
    /// Trampoline behind `Send` misses: `(nu, obj, msg) -> nu(obj)(msg)`.
    fallback: Ptr<Function>,
}

impl Trace for Vm<'_> {
    fn trace(&self, tracer: &mut Tracer) {
        for frame in &self.data {
            frame.trace(tracer);
        }
        for frame in &self.calls {
            tracer.visit(&frame.func);
        }
        tracer.visit(&self.fallback);
    }
}

impl<'ctx> Vm<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Root<Vm<'ctx>> {
        let fallback = Self::make_fallback(ctx);
        ctx.root(Vm {
            ctx,
            data: Vec::new(),
            calls: Vec::new(),
            exceptions: Vec::new(),
            data_bottom: 0,
            call_bottom: 0,
            exception_bottom: 0,
            saved: Vec::new(),
            thrown: false,
            fallback: fallback.clone(),
        })
    }

    fn make_fallback(ctx: &Context) -> Root<Ptr<Function>> {
        let mut proto = FunctionProto::new();
        proto.nargs = 3;
        proto.code = vec![
            Instruction::new(Opcode::GetVar, 0),
            Instruction::new(Opcode::GetVar, 1),
            Instruction::new(Opcode::GetConst, 0),
            Instruction::plain(Opcode::Call),
            Instruction::new(Opcode::GetVar, 2),
            Instruction::new(Opcode::GetConst, 0),
            Instruction::plain(Opcode::Call),
            Instruction::plain(Opcode::Return),
        ];
        proto.constants = vec![Value::Int(1)];
        let proto = ctx.alloc(proto);
        ctx.alloc(Function::new(proto.clone()))
    }

    pub fn ctx(&self) -> &'ctx Context {
        self.ctx
    }

    // Entry points. Each saves the current entry bottoms, runs the
    // requested call to completion and restores the outer state, so
    // foreign functions can call back in while the interpreter runs.

    /// Executes a zero-argument function to completion.
    pub fn run(&mut self, main: &Value) -> Result<Root<Value>> {
        self.call(main, &[])
    }

    /// Calls any function value with the given arguments.
    pub fn call(&mut self, func: &Value, args: &[Value]) -> Result<Root<Value>> {
        self.save_state();
        let result = self.call_inner(func, args);
        self.data.truncate(self.data_bottom);
        self.calls.truncate(self.call_bottom);
        self.exceptions.truncate(self.exception_bottom);
        self.restore_state();
        result
    }

    /// Sends a message: resolves `msg` in the receiver's class and calls
    /// the method with the receiver as its sole argument, falling back
    /// to `not_understood` like the `Send` opcode.
    pub fn send(&mut self, obj: &Value, msg: &str) -> Result<Root<Value>> {
        let class = obj.class_of(self.ctx);
        if let Some(method) = class.get_mut().lookup(msg) {
            return self.call(&method, std::slice::from_ref(obj));
        }
        match class.get_mut().lookup("not_understood") {
            Some(nu) => {
                let bound = self.call(&nu, std::slice::from_ref(obj))?;
                let msg_cell = self.ctx.alloc(msg.to_owned());
                self.call(&bound, &[Value::Str(msg_cell.clone())])
            }
            None => {
                let text = format!("message `{}` not understood", msg);
                Err(VmError::Exception(Value::Str(
                    self.ctx.alloc(text).clone(),
                )))
            }
        }
    }

    /// Composes [`Vm::send`] and [`Vm::call`].
    pub fn send_call(&mut self, obj: &Value, msg: &str, args: &[Value]) -> Result<Root<Value>> {
        let method = self.send(obj, msg)?;
        self.call(&method, args)
    }

    fn call_inner(&mut self, func: &Value, args: &[Value]) -> Result<Root<Value>> {
        self.push_data(func.clone());
        for arg in args {
            self.push_data(arg.clone());
        }
        self.push_data(Value::Int(args.len() as i64));
        self.op_call()?;
        self.run_loop()?;
        let value = self.ctx.root(self.pop_data()?);
        if self.thrown {
            self.thrown = false;
            Err(VmError::Exception(value.clone()))
        } else {
            Ok(value)
        }
    }

    fn save_state(&mut self) {
        self.saved.push(SavedState {
            data_bottom: self.data_bottom,
            call_bottom: self.call_bottom,
            exception_bottom: self.exception_bottom,
        });
        self.data_bottom = self.data.len();
        self.call_bottom = self.calls.len();
        self.exception_bottom = self.exceptions.len();
    }

    fn restore_state(&mut self) {
        let saved = self.saved.pop().expect("unbalanced state stack");
        self.data_bottom = saved.data_bottom;
        self.call_bottom = saved.call_bottom;
        self.exception_bottom = saved.exception_bottom;
    }

    // The interpreter loop. Runs until the frames of the current entry
    // are gone, either through the outermost `Return` or through an
    // unhandled throw.

    fn run_loop(&mut self) -> Result<()> {
        while self.calls.len() > self.call_bottom {
            let instr = {
                let frame = self.calls.last_mut().ok_or(Fault::NoCallFrame)?;
                let func = frame.func.clone();
                let proto = func.get().proto.clone();
                let instr = *proto
                    .get()
                    .code
                    .get(frame.ip)
                    .ok_or(Fault::InstructionOutOfRange)?;
                frame.ip += 1;
                instr
            };

            if TRACE_EXECUTION {
                let depth = self.data.len();
                println!("{} {:24} depth={}", "[vm]".green(), instr.to_string(), depth);
            }

            match instr.op() {
                Opcode::Nop => {}
                Opcode::Pop => {
                    self.pop_data()?;
                }
                Opcode::Nip => {
                    self.remove_data(1)?;
                }
                Opcode::Dup => {
                    let value = self.peek_data()?.clone();
                    self.push_data(value);
                }
                Opcode::Nil => self.push_data(Value::Nil),

                Opcode::GetVar => self.op_get_var(instr.index())?,
                Opcode::SetVar => self.op_set_var(instr.index())?,
                Opcode::GetConst => self.op_get_const(instr.index())?,

                Opcode::GetUp => self.op_get_up(instr.index())?,
                Opcode::SetUp => self.op_set_up(instr.index())?,
                Opcode::ResetUp => self.op_reset_up()?,
                Opcode::MakeUp => self.op_make_up(instr.index())?,
                Opcode::CopyUp => self.op_copy_up(instr.index())?,

                Opcode::GetProp => self.op_get_prop()?,
                Opcode::SetProp => self.op_set_prop()?,

                Opcode::Call => self.op_call()?,
                Opcode::Send => self.op_send()?,

                Opcode::Return => self.op_return()?,
                Opcode::Jump => self.op_jump(instr.index())?,
                Opcode::JumpIf => self.op_jump_cond(instr.index(), true)?,
                Opcode::JumpUnless => self.op_jump_cond(instr.index(), false)?,

                Opcode::Throw => self.op_throw()?,
                Opcode::Catch => self.op_catch(instr.index()),
                Opcode::Uncatch => self.op_uncatch()?,
            }
        }
        Ok(())
    }

    // Data stack primitives.

    fn push_data(&mut self, value: Value) {
        self.data.push(DataFrame::new(value));
    }

    fn peek_data(&self) -> Result<&Value> {
        match self.data.last() {
            Some(frame) if self.data.len() > self.data_bottom => Ok(&frame.value),
            _ => Err(Fault::StackUnderflow.into()),
        }
    }

    fn pop_data(&mut self) -> Result<Value> {
        self.remove_data(0)
    }

    /// Removes the value `off` slots below the top, closing its open
    /// upvalue (if any) and re-pointing the back-references of every
    /// slot that shifts down.
    fn remove_data(&mut self, off: usize) -> Result<Value> {
        if self.data.len() < self.data_bottom + off + 1 {
            return Err(Fault::StackUnderflow.into());
        }
        let index = self.data.len() - 1 - off;
        if let Some(upvalue) = self.data[index].upvalue.take() {
            let value = self.data[index].value.clone();
            *upvalue.get_mut() = Upvalue::Closed(value);
        }
        let frame = self.data.remove(index);
        for slot in &self.data[index..] {
            if let Some(upvalue) = &slot.upvalue {
                if let Upvalue::Open(i) = upvalue.get_mut() {
                    *i -= 1;
                }
            }
        }
        Ok(frame.value)
    }

    fn frame(&self) -> Result<&CallFrame> {
        self.calls.last().ok_or_else(|| Fault::NoCallFrame.into())
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame> {
        self.calls
            .last_mut()
            .ok_or_else(|| Fault::NoCallFrame.into())
    }

    // Locals and constants.

    fn op_get_var(&mut self, index: usize) -> Result<()> {
        let index = self.frame()?.data_bottom + index;
        let value = self
            .data
            .get(index)
            .ok_or(Fault::VariableOutOfRange)?
            .value
            .clone();
        self.push_data(value);
        Ok(())
    }

    fn op_set_var(&mut self, index: usize) -> Result<()> {
        let index = self.frame()?.data_bottom + index;
        let value = self.pop_data()?;
        self.data
            .get_mut(index)
            .ok_or(Fault::VariableOutOfRange)?
            .value = value;
        Ok(())
    }

    fn op_get_const(&mut self, index: usize) -> Result<()> {
        let func = self.frame()?.func.clone();
        let value = func
            .get()
            .proto
            .get()
            .constants
            .get(index)
            .ok_or(Fault::ConstantOutOfRange)?
            .clone();
        self.push_data(value);
        Ok(())
    }

    // Upvalues.

    fn current_upvalue(&self, index: usize) -> Result<Ptr<Upvalue>> {
        let func = self.frame()?.func.clone();
        let upvalue = func
            .get()
            .upvalues
            .get(index)
            .ok_or(Fault::UpvalueOutOfRange)?
            .clone();
        Ok(upvalue)
    }

    fn op_get_up(&mut self, index: usize) -> Result<()> {
        let upvalue = self.current_upvalue(index)?;
        let value = match upvalue.get() {
            Upvalue::Open(slot) => {
                self.data
                    .get(*slot)
                    .ok_or(Fault::VariableOutOfRange)?
                    .value
                    .clone()
            }
            Upvalue::Closed(value) => value.clone(),
        };
        self.push_data(value);
        Ok(())
    }

    fn op_set_up(&mut self, index: usize) -> Result<()> {
        let upvalue = self.current_upvalue(index)?;
        let value = self.pop_data()?;
        match upvalue.get_mut() {
            Upvalue::Open(slot) => {
                let slot = *slot;
                self.data
                    .get_mut(slot)
                    .ok_or(Fault::VariableOutOfRange)?
                    .value = value;
            }
            Upvalue::Closed(cell) => *cell = value,
        }
        Ok(())
    }

    fn op_reset_up(&mut self) -> Result<()> {
        let value = self.pop_data()?;
        let Value::Function(func) = value else {
            return Err(Fault::Malformed("upvalue reset on a non-function").into());
        };
        // Keep the original reachable across the allocation below.
        let guard = self.ctx.root(Value::Function(func));
        let func = match &*guard {
            Value::Function(func) => func,
            _ => unreachable!(),
        };
        let clone = self.ctx.alloc(Function::new(func.get().proto.clone()));
        self.push_data(Value::Function(clone.clone()));
        Ok(())
    }

    fn op_make_up(&mut self, index: usize) -> Result<()> {
        let index = self.frame()?.data_bottom + index;
        if index >= self.data.len() {
            return Err(Fault::VariableOutOfRange.into());
        }
        if self.data[index].upvalue.is_none() {
            let upvalue = self.ctx.alloc(Upvalue::Open(index));
            self.data[index].upvalue = Some(upvalue.clone());
        }
        let upvalue = match &self.data[index].upvalue {
            Some(upvalue) => upvalue.clone(),
            None => unreachable!(),
        };
        match self.peek_data()? {
            Value::Function(func) => {
                func.get_mut().upvalues.push(upvalue);
                Ok(())
            }
            _ => Err(Fault::Malformed("upvalue capture on a non-function").into()),
        }
    }

    fn op_copy_up(&mut self, index: usize) -> Result<()> {
        let upvalue = self.current_upvalue(index)?;
        match self.peek_data()? {
            Value::Function(func) => {
                func.get_mut().upvalues.push(upvalue);
                Ok(())
            }
            _ => Err(Fault::Malformed("upvalue copy on a non-function").into()),
        }
    }

    // Properties.

    fn op_get_prop(&mut self) -> Result<()> {
        let name = self.pop_data()?;
        let obj = self.pop_data()?;
        let Value::Str(name) = name else {
            return Err(Fault::Malformed("property name must be a string").into());
        };
        let prop = match &obj {
            Value::Object(obj) => obj.get().get_prop(name.get()),
            Value::Class(class) => class.get().object.get_prop(name.get()),
            _ => return self.throw_message("only objects have properties"),
        };
        match prop {
            Some(value) => {
                self.push_data(value);
                Ok(())
            }
            None => {
                let text = format!("undefined property `{}`", name.get());
                self.throw_message(&text)
            }
        }
    }

    fn op_set_prop(&mut self) -> Result<()> {
        let value = self.pop_data()?;
        let name = self.pop_data()?;
        let obj = self.pop_data()?;
        let Value::Str(name) = name else {
            return Err(Fault::Malformed("property name must be a string").into());
        };
        match &obj {
            Value::Object(obj) => {
                obj.get_mut().set_prop(name.get(), value);
                Ok(())
            }
            Value::Class(class) => {
                class.get_mut().object.set_prop(name.get(), value);
                Ok(())
            }
            _ => self.throw_message("cannot set a property on this value"),
        }
    }

    // Calls.

    fn op_call(&mut self) -> Result<()> {
        let count = match self.pop_data()? {
            Value::Int(n) if n >= 0 => n as usize,
            _ => return Err(Fault::Malformed("call expects an argument count").into()),
        };
        let func = self.remove_data(count)?;
        let guard = self.ctx.root(func);
        match &*guard {
            Value::Function(func) => self.call_native(func.clone(), count),
            Value::Foreign(func) => self.call_foreign(func.clone(), count),
            _ => self.throw_message("cannot call a non-function value"),
        }
    }

    fn call_native(&mut self, func: Ptr<Function>, count: usize) -> Result<()> {
        if func.get().proto.get().nargs != count {
            return self.throw_message("wrong number of arguments");
        }
        self.calls.push(CallFrame {
            func,
            ip: 0,
            data_bottom: self.data.len() - count,
            exception_bottom: self.exceptions.len(),
        });
        Ok(())
    }

    fn call_foreign(&mut self, func: Ptr<ForeignFunction>, count: usize) -> Result<()> {
        if func.get().nargs != count {
            return self.throw_message("wrong number of arguments");
        }
        let mut args = vec![Value::Nil; count];
        for i in (0..count).rev() {
            args[i] = self.pop_data()?;
        }
        let args = self.ctx.root(args);
        match func.get().invoke(self, &args) {
            Ok(value) => {
                self.push_data(value.clone());
                Ok(())
            }
            Err(VmError::Exception(value)) => {
                self.push_data(value);
                self.op_throw()
            }
            Err(fault) => Err(fault),
        }
    }

    fn op_send(&mut self) -> Result<()> {
        let msg = self.pop_data()?;
        let obj = self.pop_data()?;
        let name = match &msg {
            Value::Str(name) => name.clone(),
            _ => return Err(Fault::Malformed("message must be a string").into()),
        };
        let class = obj.class_of(self.ctx);
        if let Some(method) = class.get_mut().lookup(name.get()) {
            self.push_data(method);
            self.push_data(obj);
            self.push_data(Value::Int(1));
            return self.op_call();
        }
        match class.get_mut().lookup("not_understood") {
            Some(nu) => {
                self.push_data(Value::Function(self.fallback.clone()));
                self.push_data(nu);
                self.push_data(obj);
                self.push_data(msg);
                self.push_data(Value::Int(3));
                self.op_call()
            }
            None => {
                let text = format!("message `{}` not understood", name.get());
                self.throw_message(&text)
            }
        }
    }

    // Flow control.

    fn op_return(&mut self) -> Result<()> {
        let frame = self.frame()?.clone();
        let value = self.pop_data()?;
        while self.data.len() > frame.data_bottom {
            self.pop_data()?;
        }
        self.push_data(value);
        self.exceptions.truncate(frame.exception_bottom);
        self.calls.pop();
        Ok(())
    }

    fn op_jump(&mut self, address: usize) -> Result<()> {
        self.frame_mut()?.ip = address;
        Ok(())
    }

    fn op_jump_cond(&mut self, address: usize, want: bool) -> Result<()> {
        match self.pop_data()? {
            Value::Bool(b) => {
                if b == want {
                    self.frame_mut()?.ip = address;
                }
                Ok(())
            }
            _ => self.throw_message("expected a bool in conditional"),
        }
    }

    // Exceptions.

    fn op_throw(&mut self) -> Result<()> {
        if self.exceptions.len() == self.exception_bottom {
            // No handler at this entry level: strip everything and hand
            // the value to the host.
            let value = self.pop_data()?;
            while self.data.len() > self.data_bottom {
                self.pop_data()?;
            }
            self.push_data(value);
            self.calls.truncate(self.call_bottom);
            self.thrown = true;
            Ok(())
        } else {
            let handler = self.exceptions.pop().ok_or(Fault::ExceptionUnderflow)?;
            let value = self.pop_data()?;
            while self.data.len() > handler.data_bottom {
                self.pop_data()?;
            }
            self.push_data(value);
            self.calls.truncate(handler.call_bottom);
            self.frame_mut()?.ip = handler.address;
            Ok(())
        }
    }

    /// Throws a freshly allocated string: the construction path for the
    /// vm's own script-visible errors.
    fn throw_message(&mut self, message: &str) -> Result<()> {
        let value = Value::Str(self.ctx.alloc(message.to_owned()).clone());
        self.push_data(value);
        self.op_throw()
    }

    fn op_catch(&mut self, address: usize) {
        self.exceptions.push(ExceptionFrame {
            data_bottom: self.data.len(),
            call_bottom: self.calls.len(),
            address,
        });
    }

    fn op_uncatch(&mut self) -> Result<()> {
        if self.exceptions.len() <= self.exception_bottom {
            return Err(Fault::ExceptionUnderflow.into());
        }
        self.exceptions.pop();
        Ok(())
    }
}
