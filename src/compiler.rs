//! Single-pass compiler from the expression tree to stack-machine
//! bytecode.
//!
//! The compiler simulates the operand stack depth of every function it
//! compiles; that simulated depth is the single source of truth for
//! local variable indices, capture targets and deferral relocation. Each
//! `compile_*` routine leaves the simulation exactly one value deeper,
//! mirroring the one-result-per-expression rule of the language.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::ast::{Branch, Expression};
use crate::context::Context;
use crate::memory::{Ptr, Root, Trace, Tracer};
use crate::value::{Function, FunctionProto, Instruction, Opcode, Value};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("variable `{0}` not found")]
    UnresolvedVariable(String),

    #[error("`break` and `continue` can only be used inside a loop")]
    LoopControlOutsideLoop,

    #[error("`break` and `continue` cannot leave a defer body")]
    LoopControlAcrossDefer,

    #[error("`return` cannot be used inside a defer body")]
    ReturnInsideDefer,

    #[error("bytecode argument out of range")]
    ArgumentOverflow,
}

type Result<T> = std::result::Result<T, CompileError>;

/// Jump argument emitted before the target is known.
const PLACEHOLDER: usize = Instruction::MAX_ARG as usize;

/// A compiled defer body, kept so block exits can splice a relocated
/// copy of it inline.
#[derive(Debug, Clone)]
struct Deferral {
    /// Simulated stack depth at the first template instruction (the
    /// exception value sits just below it).
    bottom: usize,
    /// Address the template was originally compiled at.
    address: usize,
    code: Vec<Instruction>,
}

#[derive(Debug, Default)]
struct LoopBlock {
    /// Jump sites joined before the condition re-test.
    continue_jumps: Vec<usize>,
    /// Jump sites joined at loop exit.
    break_jumps: Vec<usize>,
}

#[derive(Debug)]
enum BlockKind {
    Plain,
    Loop(LoopBlock),
    /// Crossing such a block on the way out removes its handler.
    Try,
    /// A defer body; loop control and `return` may not leave it.
    Defer,
}

#[derive(Debug)]
struct BlockEnv {
    /// Index of the first local used by the block.
    bottom: usize,
    /// Currently active defers, in registration order.
    deferrals: Vec<Deferral>,
    /// The currently visible binding for each name.
    definitions: HashMap<String, usize>,
    /// Slots reserved by the pre-pass for future `let` bindings. A queue
    /// per name implements shadowing.
    declarations: HashMap<String, VecDeque<usize>>,
    kind: BlockKind,
}

#[derive(Debug)]
struct FunctionEnv {
    proto: FunctionProto,
    /// Simulated number of values on the function's data stack.
    locals: usize,
    /// Lexical blocks, outermost first.
    blocks: Vec<BlockEnv>,
    /// Captured names and their upvalue indices.
    upvalues: HashMap<String, usize>,
}

impl FunctionEnv {
    fn new() -> Self {
        Self {
            proto: FunctionProto::new(),
            locals: 0,
            blocks: Vec::new(),
            upvalues: HashMap::new(),
        }
    }
}

/// Compiles expression sequences into executable functions.
///
/// The compiler allocates strings and function protos while it works, so
/// hosts should register it as a root (`ctx.root(Compiler::new(&ctx))`)
/// to protect in-flight constant pools across collections.
pub struct Compiler<'ctx> {
    ctx: &'ctx Context,
    /// Functions being compiled, outermost first.
    functions: Vec<FunctionEnv>,
}

impl Trace for Compiler<'_> {
    fn trace(&self, tracer: &mut Tracer) {
        for func in &self.functions {
            func.proto.trace(tracer);
        }
    }
}

impl<'ctx> Compiler<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            functions: Vec::new(),
        }
    }

    /// Compiles a sequence of expressions into the main function.
    pub fn compile(&mut self, body: &[Expression]) -> Result<Root<Ptr<Function>>> {
        self.compile_main(body)
    }

    // Environment plumbing.

    fn func(&mut self) -> &mut FunctionEnv {
        self.functions.last_mut().expect("no function being compiled")
    }

    fn proto(&mut self) -> &mut FunctionProto {
        &mut self.func().proto
    }

    fn push_func(&mut self) {
        self.functions.push(FunctionEnv::new());
    }

    fn pop_func(&mut self) -> FunctionEnv {
        self.functions.pop().expect("no function being compiled")
    }

    fn push_block(&mut self, kind: BlockKind) {
        let bottom = self.func().locals;
        self.func().blocks.push(BlockEnv {
            bottom,
            deferrals: Vec::new(),
            definitions: HashMap::new(),
            declarations: HashMap::new(),
            kind,
        });
    }

    fn pop_block(&mut self) {
        let func = self.func();
        let block = func.blocks.pop().expect("no open block");
        func.locals = block.bottom;
    }

    fn block(&mut self) -> &mut BlockEnv {
        self.func().blocks.last_mut().expect("no open block")
    }

    fn push_local(&mut self) {
        self.func().locals += 1;
    }

    fn pop_local(&mut self) {
        let func = self.func();
        debug_assert!(func.locals > 0, "stack simulation underflow");
        func.locals -= 1;
    }

    fn locals(&mut self) -> usize {
        self.func().locals
    }

    fn address(&mut self) -> usize {
        self.proto().code.len()
    }

    // Emission.

    fn emit(&mut self, op: Opcode) {
        self.proto().code.push(Instruction::plain(op));
    }

    fn emit_arg(&mut self, op: Opcode, arg: usize) -> Result<()> {
        if arg > Instruction::MAX_ARG as usize {
            return Err(CompileError::ArgumentOverflow);
        }
        self.proto().code.push(Instruction::new(op, arg as u32));
        Ok(())
    }

    fn patch(&mut self, at: usize, target: usize) -> Result<()> {
        if target > Instruction::MAX_ARG as usize {
            return Err(CompileError::ArgumentOverflow);
        }
        let op = self.proto().code[at].op();
        self.proto().code[at] = Instruction::new(op, target as u32);
        Ok(())
    }

    // Constants and literals.

    fn compile_constant(&mut self, value: Value) -> Result<()> {
        let slot = self.proto().constants.len();
        self.proto().constants.push(value);
        self.emit_arg(Opcode::GetConst, slot)?;
        self.push_local();
        Ok(())
    }

    fn compile_string(&mut self, string: &str) -> Result<()> {
        self.compile_constant(Value::Str(self.ctx.alloc(string.to_owned()).clone()))
    }

    fn compile_int(&mut self, n: i64) -> Result<()> {
        self.compile_constant(Value::Int(n))
    }

    fn compile_nil(&mut self) {
        self.emit(Opcode::Nil);
        self.push_local();
    }

    // Variables.

    fn lookup_local(&mut self, name: &str) -> Option<usize> {
        for block in self.func().blocks.iter().rev() {
            if let Some(&index) = block.definitions.get(name) {
                return Some(index);
            }
        }
        None
    }

    fn lookup_upvalue(&mut self, name: &str) -> Option<usize> {
        self.lookup_upvalue_rec(self.functions.len() - 1, name)
    }

    /// Resolves `name` as an upvalue of function `level`, creating the
    /// whole capture chain through enclosing functions on demand. The
    /// upvalue-creation instructions land in the enclosing functions'
    /// code, right after the `ResetUp` of the closure being built there.
    fn lookup_upvalue_rec(&mut self, level: usize, name: &str) -> Option<usize> {
        if !self.functions[level].upvalues.contains_key(name) && level > 0 {
            if let Some(index) = self.lookup_origin(level - 1, name) {
                self.functions[level - 1]
                    .proto
                    .code
                    .push(Instruction::new(Opcode::MakeUp, index as u32));
                let next = self.functions[level].upvalues.len();
                self.functions[level].upvalues.insert(name.to_owned(), next);
            } else if let Some(index) = self.lookup_upvalue_rec(level - 1, name) {
                self.functions[level - 1]
                    .proto
                    .code
                    .push(Instruction::new(Opcode::CopyUp, index as u32));
                let next = self.functions[level].upvalues.len();
                self.functions[level].upvalues.insert(name.to_owned(), next);
            }
        }
        self.functions[level].upvalues.get(name).copied()
    }

    /// A local of function `level` that can be captured: either a live
    /// definition or a slot predeclared for a later `let`. The latter
    /// makes recursive bindings (`let f = fn() { f() }`) capture the
    /// slot the binding is about to fill.
    fn lookup_origin(&self, level: usize, name: &str) -> Option<usize> {
        for block in self.functions[level].blocks.iter().rev() {
            if let Some(&index) = block.definitions.get(name) {
                return Some(index);
            }
            if let Some(indices) = block.declarations.get(name) {
                if let Some(&index) = indices.front() {
                    return Some(index);
                }
            }
        }
        None
    }

    fn compile_variable(&mut self, name: &str) -> Result<()> {
        if let Some(index) = self.lookup_local(name) {
            self.emit_arg(Opcode::GetVar, index)?;
        } else if let Some(index) = self.lookup_upvalue(name) {
            self.emit_arg(Opcode::GetUp, index)?;
        } else {
            return Err(CompileError::UnresolvedVariable(name.to_owned()));
        }
        self.push_local();
        Ok(())
    }

    fn compile_let(&mut self, name: &str, value: &Expression) -> Result<()> {
        self.compile_expr(value)?;
        let index = self
            .block()
            .declarations
            .get_mut(name)
            .and_then(|indices| indices.pop_front())
            .expect("let binding was not predeclared");
        self.emit(Opcode::Dup);
        self.emit_arg(Opcode::SetVar, index)?;
        self.block().definitions.insert(name.to_owned(), index);
        Ok(())
    }

    fn compile_assign(&mut self, name: &str, value: &Expression) -> Result<()> {
        self.compile_expr(value)?;
        self.emit(Opcode::Dup);
        if let Some(index) = self.lookup_local(name) {
            self.emit_arg(Opcode::SetVar, index)?;
        } else if let Some(index) = self.lookup_upvalue(name) {
            self.emit_arg(Opcode::SetUp, index)?;
        } else {
            return Err(CompileError::UnresolvedVariable(name.to_owned()));
        }
        Ok(())
    }

    fn define_variable(&mut self, name: &str) {
        let index = self.func().locals;
        self.block().definitions.insert(name.to_owned(), index);
        self.push_local();
    }

    /// The pre-pass reserving stack slots for every `let` a block will
    /// execute, so bindings can be captured and assigned before the
    /// `let` itself runs. Walks exactly the subexpressions that execute
    /// within the current block.
    fn declare_expr(&mut self, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Str(_)
            | Expression::Int(_)
            | Expression::Empty
            | Expression::Variable(_)
            | Expression::Block(_)
            | Expression::If { .. }
            | Expression::While { .. }
            | Expression::Try { .. }
            | Expression::Defer(_)
            | Expression::Lambda { .. }
            | Expression::Method { .. }
            | Expression::Break
            | Expression::Continue
            | Expression::Return(None) => {}
            Expression::Let { name, value } => {
                self.declare_expr(value)?;
                let index = self.func().locals;
                self.block()
                    .declarations
                    .entry(name.clone())
                    .or_default()
                    .push_back(index);
                self.compile_nil();
            }
            Expression::Assign { value, .. } => self.declare_expr(value)?,
            Expression::GetProp { obj, .. } => self.declare_expr(obj)?,
            Expression::SetProp { obj, value, .. } => {
                self.declare_expr(obj)?;
                self.declare_expr(value)?;
            }
            Expression::GetIndex { obj, index } => {
                self.declare_expr(obj)?;
                self.declare_expr(index)?;
            }
            Expression::SetIndex { obj, index, value } => {
                self.declare_expr(obj)?;
                self.declare_expr(index)?;
                self.declare_expr(value)?;
            }
            Expression::Call { func, args } => {
                self.declare_expr(func)?;
                for arg in args {
                    self.declare_expr(arg)?;
                }
            }
            Expression::Send { obj, .. } => self.declare_expr(obj)?,
            Expression::Unary { value, .. } => self.declare_expr(value)?,
            Expression::Binary { lhs, rhs, .. } => {
                self.declare_expr(lhs)?;
                self.declare_expr(rhs)?;
            }
            // Only the left operand runs in this block; the right one
            // gets its own nested block.
            Expression::And { lhs, .. } | Expression::Or { lhs, .. } => self.declare_expr(lhs)?,
            Expression::Return(Some(value)) => self.declare_expr(value)?,
            Expression::Throw(value) => self.declare_expr(value)?,
        }
        Ok(())
    }

    // Block exits.
    //
    // Leaving `nblocks` blocks replays their deferrals (innermost block
    // first, each block's defers in LIFO order) and removes the handler
    // of every try block crossed. The `_pop` and `_nip` variants then
    // drop the blocks' locals; `_nip` preserves the topmost value. All
    // of this is pure emission: the simulated depth is not changed,
    // because these instructions run on paths that leave the code that
    // follows them.

    fn compile_leave(&mut self, nblocks: usize) -> Result<()> {
        let total = self.func().blocks.len();
        for i in (total - nblocks..total).rev() {
            let (templates, is_try) = {
                let block = &self.functions.last().expect("no function").blocks[i];
                (
                    block.deferrals.clone(),
                    matches!(block.kind, BlockKind::Try),
                )
            };
            for deferral in templates.iter().rev() {
                self.emit(Opcode::Uncatch);
                self.replay_deferral(deferral)?;
            }
            if is_try {
                self.emit(Opcode::Uncatch);
            }
        }
        Ok(())
    }

    /// Splices a copy of a defer template at the current address,
    /// shifting its own temporaries to the current stack depth and its
    /// internal jumps to the current code position. Slots below the
    /// template's bottom refer to enclosing locals and stay put.
    fn replay_deferral(&mut self, deferral: &Deferral) -> Result<()> {
        let var_delta = self.locals() as isize - deferral.bottom as isize;
        let addr_delta = self.address() as isize - deferral.address as isize;
        for instr in deferral.code.clone() {
            let op = instr.op();
            let arg = instr.index();
            let arg = match op {
                Opcode::GetVar | Opcode::SetVar | Opcode::MakeUp if arg >= deferral.bottom => {
                    (arg as isize + var_delta) as usize
                }
                Opcode::Jump | Opcode::JumpIf | Opcode::JumpUnless | Opcode::Catch => {
                    (arg as isize + addr_delta) as usize
                }
                _ => arg,
            };
            self.emit_arg(op, arg)?;
        }
        Ok(())
    }

    fn compile_leave_pop(&mut self, nblocks: usize) -> Result<()> {
        self.compile_leave(nblocks)?;
        let target = self.leave_bottom(nblocks);
        for _ in target..self.locals() {
            self.emit(Opcode::Pop);
        }
        Ok(())
    }

    fn compile_leave_nip(&mut self, nblocks: usize) -> Result<()> {
        self.compile_leave(nblocks)?;
        let target = self.leave_bottom(nblocks);
        for _ in target + 1..self.locals() {
            self.emit(Opcode::Nip);
        }
        Ok(())
    }

    fn leave_bottom(&mut self, nblocks: usize) -> usize {
        if nblocks == 0 {
            self.locals()
        } else {
            let total = self.func().blocks.len();
            self.func().blocks[total - nblocks].bottom
        }
    }

    // Compound expressions.

    fn compile_block(&mut self, exprs: &[Expression]) -> Result<()> {
        if exprs.is_empty() {
            self.compile_nil();
            return Ok(());
        }
        self.push_block(BlockKind::Plain);
        for expr in exprs {
            self.declare_expr(expr)?;
        }
        self.compile_expr_chain(exprs)?;
        self.compile_leave_nip(1)?;
        self.pop_block();
        self.push_local();
        Ok(())
    }

    fn compile_expr_chain(&mut self, exprs: &[Expression]) -> Result<()> {
        if exprs.is_empty() {
            self.compile_nil();
            return Ok(());
        }
        let mut first = true;
        for expr in exprs {
            if !first {
                self.emit(Opcode::Pop);
                self.pop_local();
            }
            first = false;
            self.compile_expr(expr)?;
        }
        Ok(())
    }

    fn compile_if(&mut self, branches: &[Branch], otherwise: Option<&[Expression]>) -> Result<()> {
        // Each branch is two nested blocks: one for the predicate, one
        // for the body. The split lets the predicate's bindings exist
        // without predeclaring anything for the body.
        let mut finish_jumps = Vec::new();
        for (cond, body) in branches {
            self.push_block(BlockKind::Plain);
            self.declare_expr(cond)?;
            self.compile_expr(cond)?;
            let next_jump = self.address();
            self.emit_arg(Opcode::JumpUnless, PLACEHOLDER)?;
            self.pop_local();
            // Took the branch: evaluate, drop predicate locals, finish.
            self.compile_block(body)?;
            self.compile_leave_nip(1)?;
            finish_jumps.push(self.address());
            self.emit_arg(Opcode::Jump, PLACEHOLDER)?;
            self.pop_local();
            // Fell through: drop predicate locals, try the next branch.
            let here = self.address();
            self.patch(next_jump, here)?;
            self.compile_leave_pop(1)?;
            self.pop_block();
        }
        match otherwise {
            Some(body) => self.compile_block(body)?,
            None => self.compile_nil(),
        }
        let end = self.address();
        for jump in finish_jumps {
            self.patch(jump, end)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expression, body: &[Expression]) -> Result<()> {
        let start = self.address();
        self.push_block(BlockKind::Loop(LoopBlock::default()));
        self.declare_expr(cond)?;
        self.compile_expr(cond)?;
        let finish_jump = self.address();
        self.emit_arg(Opcode::JumpUnless, PLACEHOLDER)?;
        self.pop_local();
        // Condition held: run the body, drop its result, loop back.
        self.compile_block(body)?;
        self.emit(Opcode::Pop);
        self.pop_local();
        let continue_target = self.address();
        for jump in self.take_loop_jumps(true) {
            self.patch(jump, continue_target)?;
        }
        self.compile_leave_pop(1)?;
        self.emit_arg(Opcode::Jump, start)?;
        // Condition failed (or a break fired): drop condition locals.
        let exit = self.address();
        self.patch(finish_jump, exit)?;
        for jump in self.take_loop_jumps(false) {
            self.patch(jump, exit)?;
        }
        self.compile_leave_pop(1)?;
        self.pop_block();
        self.compile_nil();
        Ok(())
    }

    fn take_loop_jumps(&mut self, continues: bool) -> Vec<usize> {
        match &mut self.block().kind {
            BlockKind::Loop(lp) => {
                if continues {
                    std::mem::take(&mut lp.continue_jumps)
                } else {
                    std::mem::take(&mut lp.break_jumps)
                }
            }
            _ => panic!("expected a loop block"),
        }
    }

    fn compile_try(&mut self, body: &[Expression], error: &str, handler: &[Expression]) -> Result<()> {
        // Install the handler, then run the body inside a try-kind block
        // so exits crossing it know to remove the handler again.
        let catch_at = self.address();
        self.emit_arg(Opcode::Catch, PLACEHOLDER)?;
        self.push_block(BlockKind::Try);
        self.compile_block(body)?;
        self.emit(Opcode::Uncatch);
        self.pop_block();
        self.push_local();
        let finish_jump = self.address();
        self.emit_arg(Opcode::Jump, PLACEHOLDER)?;
        self.pop_local();
        // Thrown: the unwinder pushed the exception; bind it and run the
        // handler in its own scope.
        let here = self.address();
        self.patch(catch_at, here)?;
        self.push_block(BlockKind::Plain);
        self.define_variable(error);
        self.compile_block(handler)?;
        self.compile_leave_nip(1)?;
        self.pop_block();
        let end = self.address();
        self.patch(finish_jump, end)?;
        self.push_local();
        Ok(())
    }

    fn compile_defer(&mut self, body: &[Expression]) -> Result<()> {
        // The exception path: a handler covering the rest of the block
        // runs an inline copy of the body and rethrows. Normal exits
        // replay the same template via the block's deferral list.
        let catch_at = self.address();
        self.emit_arg(Opcode::Catch, PLACEHOLDER)?;
        let around_jump = self.address();
        self.emit_arg(Opcode::Jump, PLACEHOLDER)?;
        let here = self.address();
        self.patch(catch_at, here)?;
        // The unwinder leaves the thrown value on the stack; the
        // template is compiled one slot above it.
        let template_address = self.address();
        self.push_local();
        let bottom = self.locals();
        self.push_block(BlockKind::Defer);
        for expr in body {
            self.declare_expr(expr)?;
        }
        self.compile_expr_chain(body)?;
        self.compile_leave_nip(1)?;
        self.pop_block();
        self.push_local();
        self.emit(Opcode::Pop);
        self.pop_local();
        let code = self.proto().code[template_address..].to_vec();
        self.block().deferrals.push(Deferral {
            bottom,
            address: template_address,
            code,
        });
        self.emit(Opcode::Throw);
        self.pop_local();
        let end = self.address();
        self.patch(around_jump, end)?;
        self.compile_nil();
        Ok(())
    }

    // Calls, sends and their sugar.

    fn compile_call(&mut self, func: &Expression, args: &[Expression]) -> Result<()> {
        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.compile_int(args.len() as i64)?;
        self.emit(Opcode::Call);
        for _ in 0..args.len() + 1 {
            self.pop_local();
        }
        Ok(())
    }

    fn compile_send(&mut self, obj: &Expression, msg: &str) -> Result<()> {
        self.compile_expr(obj)?;
        self.compile_string(msg)?;
        self.emit(Opcode::Send);
        self.pop_local();
        Ok(())
    }

    fn compile_unary(&mut self, op: &str, value: &Expression) -> Result<()> {
        self.compile_send(value, op)
    }

    /// `lhs op rhs` is `(lhs.op)(rhs)`: resolve the operator on the left
    /// operand, then call the bound method with the right one.
    fn compile_binary(&mut self, op: &str, lhs: &Expression, rhs: &Expression) -> Result<()> {
        self.compile_send(lhs, op)?;
        self.compile_expr(rhs)?;
        self.compile_int(1)?;
        self.emit(Opcode::Call);
        self.pop_local();
        self.pop_local();
        Ok(())
    }

    fn compile_get_prop(&mut self, obj: &Expression, name: &str) -> Result<()> {
        self.compile_expr(obj)?;
        self.compile_string(name)?;
        self.emit(Opcode::GetProp);
        self.pop_local();
        Ok(())
    }

    fn compile_set_prop(&mut self, obj: &Expression, name: &str, value: &Expression) -> Result<()> {
        self.compile_expr(obj)?;
        self.compile_string(name)?;
        self.compile_expr(value)?;
        self.emit(Opcode::SetProp);
        self.pop_local();
        self.pop_local();
        self.pop_local();
        self.compile_nil();
        Ok(())
    }

    fn compile_get_index(&mut self, obj: &Expression, index: &Expression) -> Result<()> {
        self.compile_send(obj, "[]")?;
        self.compile_expr(index)?;
        self.compile_int(1)?;
        self.emit(Opcode::Call);
        self.pop_local();
        self.pop_local();
        Ok(())
    }

    fn compile_set_index(
        &mut self,
        obj: &Expression,
        index: &Expression,
        value: &Expression,
    ) -> Result<()> {
        self.compile_send(obj, "[]=")?;
        self.compile_expr(index)?;
        self.compile_expr(value)?;
        self.compile_int(2)?;
        self.emit(Opcode::Call);
        self.pop_local();
        self.pop_local();
        self.pop_local();
        Ok(())
    }

    // Short-circuit operators. The right operand goes into a nested
    // block so its bindings stay scoped to the conditionally executed
    // code.

    fn compile_and(&mut self, lhs: &Expression, rhs: &Expression) -> Result<()> {
        self.compile_expr(lhs)?;
        self.emit(Opcode::Dup);
        self.push_local();
        let end_jump = self.address();
        self.emit_arg(Opcode::JumpUnless, PLACEHOLDER)?;
        self.pop_local();
        self.emit(Opcode::Pop);
        self.pop_local();
        self.compile_block(std::slice::from_ref(rhs))?;
        let end = self.address();
        self.patch(end_jump, end)?;
        Ok(())
    }

    fn compile_or(&mut self, lhs: &Expression, rhs: &Expression) -> Result<()> {
        self.compile_expr(lhs)?;
        self.emit(Opcode::Dup);
        self.push_local();
        let end_jump = self.address();
        self.emit_arg(Opcode::JumpIf, PLACEHOLDER)?;
        self.pop_local();
        self.emit(Opcode::Pop);
        self.pop_local();
        self.compile_block(std::slice::from_ref(rhs))?;
        let end = self.address();
        self.patch(end_jump, end)?;
        Ok(())
    }

    // Functions.

    fn compile_lambda(&mut self, args: &[String], body: &[Expression]) -> Result<()> {
        // Reserve the constant slot now and load it in the outer
        // function; the finished inner function fills it below. Upvalue
        // instructions emitted while the body compiles land right after
        // the ResetUp, where they find the fresh closure on the stack.
        let slot = self.proto().constants.len();
        self.proto().constants.push(Value::Nil);
        self.emit_arg(Opcode::GetConst, slot)?;
        self.emit(Opcode::ResetUp);
        self.push_local();

        self.push_func();
        self.proto().nargs = args.len();
        self.push_block(BlockKind::Plain);
        for arg in args {
            self.define_variable(arg);
        }
        self.push_block(BlockKind::Plain);
        for expr in body {
            self.declare_expr(expr)?;
        }
        self.compile_expr_chain(body)?;
        // Falling off the end is a normal exit of every open block.
        let nblocks = self.func().blocks.len();
        self.compile_leave(nblocks)?;
        self.emit(Opcode::Return);

        // Allocate the cells before popping the function env, so the
        // in-flight constant pool stays traced through both collections
        // the allocations may trigger.
        let proto = self.ctx.alloc(FunctionProto::new());
        let function = self.ctx.alloc(Function::new(proto.clone()));
        let env = self.pop_func();
        *proto.get_mut() = env.proto;
        self.proto().constants[slot] = Value::Function(function.clone());
        Ok(())
    }

    /// A method is a lambda over `self` whose body evaluates to the
    /// actual implementation: `method(a, b) body` compiles as
    /// `fn(self) fn(a, b) body`.
    fn compile_method(&mut self, args: Option<&[String]>, body: &[Expression]) -> Result<()> {
        let self_arg = ["self".to_owned()];
        match args {
            Some(args) => {
                let inner = Expression::Lambda {
                    args: args.to_vec(),
                    body: body.to_vec(),
                };
                self.compile_lambda(&self_arg, std::slice::from_ref(&inner))
            }
            None => self.compile_lambda(&self_arg, body),
        }
    }

    // Control flow escapes.
    //
    // These pretend to produce a value for the benefit of the stack
    // simulation; the instructions that follow them in the same chain
    // are unreachable at runtime.

    fn compile_loop_control(&mut self, continues: bool) -> Result<()> {
        let mut loop_index = None;
        for (i, block) in self.func().blocks.iter().enumerate().rev() {
            match block.kind {
                BlockKind::Defer => return Err(CompileError::LoopControlAcrossDefer),
                BlockKind::Loop(_) => {
                    loop_index = Some(i);
                    break;
                }
                _ => {}
            }
        }
        let loop_index = loop_index.ok_or(CompileError::LoopControlOutsideLoop)?;
        let nblocks = self.func().blocks.len() - 1 - loop_index;
        self.compile_leave_pop(nblocks)?;
        let jump = self.address();
        self.emit_arg(Opcode::Jump, PLACEHOLDER)?;
        match &mut self.func().blocks[loop_index].kind {
            BlockKind::Loop(lp) => {
                if continues {
                    lp.continue_jumps.push(jump);
                } else {
                    lp.break_jumps.push(jump);
                }
            }
            _ => unreachable!("loop index points at a non-loop block"),
        }
        self.push_local();
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expression>) -> Result<()> {
        if self
            .func()
            .blocks
            .iter()
            .any(|block| matches!(block.kind, BlockKind::Defer))
        {
            return Err(CompileError::ReturnInsideDefer);
        }
        match value {
            Some(value) => self.compile_expr(value)?,
            None => self.compile_nil(),
        }
        let nblocks = self.func().blocks.len();
        self.compile_leave(nblocks)?;
        self.emit(Opcode::Return);
        Ok(())
    }

    fn compile_throw(&mut self, value: &Expression) -> Result<()> {
        self.compile_expr(value)?;
        self.emit(Opcode::Throw);
        Ok(())
    }

    // Dispatch.

    fn compile_expr(&mut self, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Str(value) => self.compile_string(value),
            Expression::Int(value) => self.compile_int(*value),
            Expression::Empty => {
                self.compile_nil();
                Ok(())
            }
            Expression::Variable(name) => self.compile_variable(name),
            Expression::Let { name, value } => self.compile_let(name, value),
            Expression::Assign { name, value } => self.compile_assign(name, value),
            Expression::GetProp { obj, name } => self.compile_get_prop(obj, name),
            Expression::SetProp { obj, name, value } => self.compile_set_prop(obj, name, value),
            Expression::GetIndex { obj, index } => self.compile_get_index(obj, index),
            Expression::SetIndex { obj, index, value } => {
                self.compile_set_index(obj, index, value)
            }
            Expression::Call { func, args } => self.compile_call(func, args),
            Expression::Send { obj, msg } => self.compile_send(obj, msg),
            Expression::Unary { op, value } => self.compile_unary(op, value),
            Expression::Binary { op, lhs, rhs } => self.compile_binary(op, lhs, rhs),
            Expression::And { lhs, rhs } => self.compile_and(lhs, rhs),
            Expression::Or { lhs, rhs } => self.compile_or(lhs, rhs),
            Expression::Block(exprs) => self.compile_block(exprs),
            Expression::If {
                branches,
                otherwise,
            } => self.compile_if(branches, otherwise.as_deref()),
            Expression::While { cond, body } => self.compile_while(cond, body),
            Expression::Try {
                body,
                error,
                handler,
            } => self.compile_try(body, error, handler),
            Expression::Defer(body) => self.compile_defer(body),
            Expression::Lambda { args, body } => self.compile_lambda(args, body),
            Expression::Method { args, body } => self.compile_method(args.as_deref(), body),
            Expression::Break => self.compile_loop_control(false),
            Expression::Continue => self.compile_loop_control(true),
            Expression::Return(value) => self.compile_return(value.as_deref()),
            Expression::Throw(value) => self.compile_throw(value),
        }
    }

    fn compile_main(&mut self, body: &[Expression]) -> Result<Root<Ptr<Function>>> {
        self.push_func();
        self.proto().nargs = 0;
        self.push_block(BlockKind::Plain);
        // Builtins become the first locals of main, bound by name.
        let ctx = self.ctx;
        for (name, value) in ctx.builtins() {
            self.compile_constant(value.clone())?;
            self.pop_local();
            self.define_variable(name);
        }
        for expr in body {
            self.declare_expr(expr)?;
        }
        self.compile_expr_chain(body)?;
        let nblocks = self.func().blocks.len();
        self.compile_leave(nblocks)?;
        self.emit(Opcode::Return);
        let proto = self.ctx.alloc(FunctionProto::new());
        let main = self.ctx.alloc(Function::new(proto.clone()));
        let env = self.pop_func();
        *proto.get_mut() = env.proto;
        Ok(main)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ForeignFunction;
    use crate::vm::{Vm, VmError};

    // Expression builders, to keep the scripts below readable.

    fn int(n: i64) -> Expression {
        Expression::Int(n)
    }

    fn var(name: &str) -> Expression {
        Expression::Variable(name.to_owned())
    }

    fn let_(name: &str, value: Expression) -> Expression {
        Expression::Let {
            name: name.to_owned(),
            value: value.boxed(),
        }
    }

    fn assign(name: &str, value: Expression) -> Expression {
        Expression::Assign {
            name: name.to_owned(),
            value: value.boxed(),
        }
    }

    fn call(func: Expression, args: Vec<Expression>) -> Expression {
        Expression::Call {
            func: func.boxed(),
            args,
        }
    }

    fn lambda(args: &[&str], body: Vec<Expression>) -> Expression {
        Expression::Lambda {
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            body,
        }
    }

    fn block(exprs: Vec<Expression>) -> Expression {
        Expression::Block(exprs)
    }

    fn if_(cond: Expression, then: Vec<Expression>) -> Expression {
        Expression::If {
            branches: vec![(cond, then)],
            otherwise: None,
        }
    }

    fn if_else(cond: Expression, then: Vec<Expression>, otherwise: Vec<Expression>) -> Expression {
        Expression::If {
            branches: vec![(cond, then)],
            otherwise: Some(otherwise),
        }
    }

    fn while_(cond: Expression, body: Vec<Expression>) -> Expression {
        Expression::While {
            cond: cond.boxed(),
            body,
        }
    }

    fn try_(body: Vec<Expression>, error: &str, handler: Vec<Expression>) -> Expression {
        Expression::Try {
            body,
            error: error.to_owned(),
            handler,
        }
    }

    fn defer(body: Vec<Expression>) -> Expression {
        Expression::Defer(body)
    }

    fn ret(value: Expression) -> Expression {
        Expression::Return(Some(value.boxed()))
    }

    fn throw(value: Expression) -> Expression {
        Expression::Throw(value.boxed())
    }

    fn init_builtins(ctx: &mut Context) {
        fn define(ctx: &mut Context, name: &str, f: fn(i64, i64) -> Value) {
            let func = ctx.alloc(ForeignFunction::lambda(2, move |vm, args| {
                let (Value::Int(x), Value::Int(y)) = (&args[0], &args[1]) else {
                    panic!("expected ints");
                };
                Ok(vm.ctx().root(f(*x, *y)))
            }));
            let value = Value::Foreign(func.clone());
            ctx.define_builtin(name, value);
        }
        ctx.define_builtin("true", Value::Bool(true));
        ctx.define_builtin("false", Value::Bool(false));
        define(ctx, "==", |x, y| Value::Bool(x == y));
        define(ctx, "!=", |x, y| Value::Bool(x != y));
        define(ctx, "+", |x, y| Value::Int(x + y));
        define(ctx, "-", |x, y| Value::Int(x - y));
        define(ctx, "*", |x, y| Value::Int(x * y));
    }

    fn context() -> Context {
        let mut ctx = Context::new();
        init_builtins(&mut ctx);
        ctx
    }

    fn run(ctx: &Context, body: &[Expression]) -> std::result::Result<Value, VmError> {
        let mut compiler = ctx.root(Compiler::new(ctx));
        let main = compiler.compile(body).expect("compile error");
        let mut vm = Vm::new(ctx);
        let result = vm.run(&Value::Function(main.clone()))?;
        Ok(result.clone())
    }

    #[test]
    fn recursive_functions() {
        // fn main() { ping(10) }
        // fn ping(n) {
        //     if n == 0 { return 0 };
        //     let n = n - 1;
        //     let y = pong(n);
        //     return y + y;
        // }
        // fn pong(n) { if 0 == n { 1 } else { ping(n - 1) + 1 } }
        // main()
        let ctx = context();
        let body = vec![
            let_(
                "main",
                lambda(&[], vec![call(var("ping"), vec![int(10)])]),
            ),
            let_(
                "ping",
                lambda(
                    &["n"],
                    vec![
                        if_(
                            call(var("=="), vec![var("n"), int(0)]),
                            vec![ret(int(0))],
                        ),
                        let_("n", call(var("-"), vec![var("n"), int(1)])),
                        let_("y", call(var("pong"), vec![var("n")])),
                        ret(call(var("+"), vec![var("y"), var("y")])),
                    ],
                ),
            ),
            let_(
                "pong",
                lambda(
                    &["n"],
                    vec![if_else(
                        call(var("=="), vec![int(0), var("n")]),
                        vec![int(1)],
                        vec![call(
                            var("+"),
                            vec![
                                call(var("ping"), vec![call(var("-"), vec![var("n"), int(1)])]),
                                int(1),
                            ],
                        )],
                    )],
                ),
            ),
            call(var("main"), vec![]),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(62)), "got {:?}", result);
    }

    #[test]
    fn try_catch() {
        // try {
        //     try { let x = 2; throw x; x = 0; return x }
        //     catch x { let y = x + 1; y }
        // } catch _ { return 0 }
        let ctx = context();
        let body = vec![try_(
            vec![try_(
                vec![
                    let_("x", int(2)),
                    throw(var("x")),
                    assign("x", int(0)),
                    ret(var("x")),
                ],
                "x",
                vec![
                    let_("y", call(var("+"), vec![var("x"), int(1)])),
                    var("y"),
                ],
            )],
            "_",
            vec![int(0)],
        )];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(3)), "got {:?}", result);
    }

    #[test]
    fn nested_blocks() {
        // {
        //     let x = 2;
        //     let y = 10;
        //     let z = {
        //         let x = 5;
        //         { x = { y = y + 10; y } }
        //         x
        //     };
        //     x = x + (y + z);
        //     x
        // }
        let ctx = context();
        let body = vec![block(vec![
            let_("x", int(2)),
            let_("y", int(10)),
            let_(
                "z",
                block(vec![
                    let_("x", int(5)),
                    block(vec![assign(
                        "x",
                        block(vec![
                            assign("y", call(var("+"), vec![var("y"), int(10)])),
                            var("y"),
                        ]),
                    )]),
                    var("x"),
                ]),
            ),
            assign(
                "x",
                call(
                    var("+"),
                    vec![var("x"), call(var("+"), vec![var("y"), var("z")])],
                ),
            ),
            var("x"),
        ])];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(42)), "got {:?}", result);
    }

    #[test]
    fn fib_iter() {
        // fn fib(n) {
        //     let x = 0;
        //     let y = 1;
        //     while n != 0 { let z = x + y; x = y; y = z; n = n - 1 }
        //     x
        // }
        let ctx = context();
        let fib = |n: i64| {
            vec![
                let_(
                    "fib",
                    lambda(
                        &["n"],
                        vec![
                            let_("x", int(0)),
                            let_("y", int(1)),
                            while_(
                                call(var("!="), vec![var("n"), int(0)]),
                                vec![
                                    let_("z", call(var("+"), vec![var("x"), var("y")])),
                                    assign("x", var("y")),
                                    assign("y", var("z")),
                                    assign("n", call(var("-"), vec![var("n"), int(1)])),
                                ],
                            ),
                            var("x"),
                        ],
                    ),
                ),
                call(var("fib"), vec![int(n)]),
            ]
        };
        for (input, expected) in [(0, 0), (1, 1), (4, 3), (7, 13), (10, 55), (15, 610)] {
            let result = run(&ctx, &fib(input)).unwrap();
            assert!(
                matches!(result, Value::Int(n) if n == expected),
                "fib({}) yields {:?}",
                input,
                result
            );
        }
    }

    #[test]
    fn break_continue() {
        // let x = 0;
        // let i = 0;
        // while true {
        //     let j = 0;
        //     while true {
        //         if j == 3 { break };
        //         j = j + 1;
        //         x = x + 1;
        //     };
        //     if i == 10 { break } else { i = i + 1; continue };
        //     return 0;
        // };
        // return x;
        let ctx = context();
        let body = vec![
            let_("x", int(0)),
            let_("i", int(0)),
            while_(
                var("true"),
                vec![
                    let_("j", int(0)),
                    while_(
                        var("true"),
                        vec![
                            if_(call(var("=="), vec![var("j"), int(3)]), vec![Expression::Break]),
                            assign("j", call(var("+"), vec![var("j"), int(1)])),
                            assign("x", call(var("+"), vec![var("x"), int(1)])),
                        ],
                    ),
                    if_else(
                        call(var("=="), vec![var("i"), int(10)]),
                        vec![Expression::Break],
                        vec![
                            assign("i", call(var("+"), vec![var("i"), int(1)])),
                            Expression::Continue,
                        ],
                    ),
                    ret(int(0)),
                ],
            ),
            ret(var("x")),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(33)), "got {:?}", result);
    }

    #[test]
    fn closure_counter() {
        // let init = 0;
        // let inc = 1;
        // fn main() {
        //     fn make() { let x = init; fn() { x = x + inc; return x } };
        //     let counter = make();
        //     counter(); counter(); counter()
        // }
        // main()
        let ctx = context();
        let body = vec![
            let_("init", int(0)),
            let_("inc", int(1)),
            let_(
                "main",
                lambda(
                    &[],
                    vec![
                        let_(
                            "make",
                            lambda(
                                &[],
                                vec![
                                    let_("x", var("init")),
                                    lambda(
                                        &[],
                                        vec![
                                            assign(
                                                "x",
                                                call(var("+"), vec![var("x"), var("inc")]),
                                            ),
                                            ret(var("x")),
                                        ],
                                    ),
                                ],
                            ),
                        ),
                        let_("counter", call(var("make"), vec![])),
                        call(var("counter"), vec![]),
                        call(var("counter"), vec![]),
                        call(var("counter"), vec![]),
                    ],
                ),
            ),
            call(var("main"), vec![]),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(3)), "got {:?}", result);
    }

    #[test]
    fn closed_upvalues_are_shared() {
        // fn make() {
        //     let k = 0;
        //     let inc = fn() { k = k + 1 };
        //     fn() { inc(); inc(); k }
        // }
        // let f = make();
        // f();
        // f()
        let ctx = context();
        let body = vec![
            let_(
                "make",
                lambda(
                    &[],
                    vec![
                        let_("k", int(0)),
                        let_(
                            "inc",
                            lambda(&[], vec![assign("k", call(var("+"), vec![var("k"), int(1)]))]),
                        ),
                        lambda(
                            &[],
                            vec![call(var("inc"), vec![]), call(var("inc"), vec![]), var("k")],
                        ),
                    ],
                ),
            ),
            let_("f", call(var("make"), vec![])),
            call(var("f"), vec![]),
            call(var("f"), vec![]),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(4)), "got {:?}", result);
    }

    #[test]
    fn defer_ordering_with_break() {
        // let n = 0;
        // let f = fn() {
        //     defer { n = n + 100 };
        //     let i = 0;
        //     while true {
        //         defer { n = n + 1 };
        //         if i == 10 { break };
        //         i = i + 1;
        //     };
        // };
        // f();
        // n
        let ctx = context();
        let body = vec![
            let_("n", int(0)),
            let_(
                "f",
                lambda(
                    &[],
                    vec![
                        defer(vec![assign("n", call(var("+"), vec![var("n"), int(100)]))]),
                        let_("i", int(0)),
                        while_(
                            var("true"),
                            vec![
                                defer(vec![assign("n", call(var("+"), vec![var("n"), int(1)]))]),
                                if_(
                                    call(var("=="), vec![var("i"), int(10)]),
                                    vec![Expression::Break],
                                ),
                                assign("i", call(var("+"), vec![var("i"), int(1)])),
                            ],
                        ),
                    ],
                ),
            ),
            call(var("f"), vec![]),
            var("n"),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(111)), "got {:?}", result);
    }

    #[test]
    fn defer_ordering_with_return() {
        // Defers run outside-in relative to registration: LIFO within a
        // block, inner blocks before outer ones, on explicit return too.
        // let n = 0;
        // let f = fn() {
        //     defer { n = n + 1 };
        //     defer { n = n * 2 };
        //     return 0;
        // };
        // f();
        // n
        let ctx = context();
        let body = vec![
            let_("n", int(3)),
            let_(
                "f",
                lambda(
                    &[],
                    vec![
                        defer(vec![assign("n", call(var("+"), vec![var("n"), int(1)]))]),
                        defer(vec![assign("n", call(var("*"), vec![var("n"), int(2)]))]),
                        ret(int(0)),
                    ],
                ),
            ),
            call(var("f"), vec![]),
            var("n"),
        ];
        // LIFO: first *2 (3 -> 6), then +1 (6 -> 7).
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(7)), "got {:?}", result);
    }

    #[test]
    fn break_out_of_try() {
        // while true { try { break } catch x { throw 2 } };
        // throw 1
        let ctx = context();
        let body = vec![
            while_(
                var("true"),
                vec![try_(vec![Expression::Break], "x", vec![throw(int(2))])],
            ),
            throw(int(1)),
        ];
        match run(&ctx, &body) {
            Err(VmError::Exception(Value::Int(1))) => {}
            other => panic!("expected uncaught 1, got {:?}", other),
        }
    }

    #[test]
    fn defer_runs_while_unwinding() {
        // A throw inside nested blocks runs the pending defers innermost
        // first, then reaches the try handler.
        // let log = 0;
        // try {
        //     { defer { log = log + 1 };
        //       { defer { log = log + 10 }; throw 5 } }
        // } catch x { x + log }
        let ctx = context();
        let body = vec![
            let_("log", int(0)),
            try_(
                vec![block(vec![
                    defer(vec![assign("log", call(var("+"), vec![var("log"), int(1)]))]),
                    block(vec![
                        defer(vec![assign(
                            "log",
                            call(var("+"), vec![var("log"), int(10)]),
                        )]),
                        throw(int(5)),
                    ]),
                ])],
                "x",
                vec![call(var("+"), vec![var("x"), var("log")])],
            ),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(16)), "got {:?}", result);
    }

    #[test]
    fn and_or_short_circuit() {
        // let n = 0;
        // false && { n = n + 1; true };
        // true || { n = n + 10; true };
        // true && { n = n + 100; false };
        // false || { n = n + 1000; false };
        // n
        let ctx = context();
        let and = |lhs: Expression, rhs: Expression| Expression::And {
            lhs: lhs.boxed(),
            rhs: rhs.boxed(),
        };
        let or = |lhs: Expression, rhs: Expression| Expression::Or {
            lhs: lhs.boxed(),
            rhs: rhs.boxed(),
        };
        let body = vec![
            let_("n", int(0)),
            and(
                var("false"),
                block(vec![
                    assign("n", call(var("+"), vec![var("n"), int(1)])),
                    var("true"),
                ]),
            ),
            or(
                var("true"),
                block(vec![
                    assign("n", call(var("+"), vec![var("n"), int(10)])),
                    var("true"),
                ]),
            ),
            and(
                var("true"),
                block(vec![
                    assign("n", call(var("+"), vec![var("n"), int(100)])),
                    var("false"),
                ]),
            ),
            or(
                var("false"),
                block(vec![
                    assign("n", call(var("+"), vec![var("n"), int(1000)])),
                    var("false"),
                ]),
            ),
            var("n"),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(1100)), "got {:?}", result);
    }

    #[test]
    fn shadowing_reserves_separate_slots() {
        // let x = 1;
        // let y = { let x = 2; x };
        // x + y
        let ctx = context();
        let body = vec![
            let_("x", int(1)),
            let_("y", block(vec![let_("x", int(2)), var("x")])),
            call(var("+"), vec![var("x"), var("y")]),
        ];
        let result = run(&ctx, &body).unwrap();
        assert!(matches!(result, Value::Int(3)), "got {:?}", result);
    }

    #[test]
    fn compile_errors() {
        let ctx = context();
        let compile = |body: &[Expression]| {
            let mut compiler = ctx.root(Compiler::new(&ctx));
            compiler.compile(body).map(|_| ())
        };

        assert!(matches!(
            compile(&[var("nope")]),
            Err(CompileError::UnresolvedVariable(name)) if name == "nope"
        ));
        assert!(matches!(
            compile(&[Expression::Break]),
            Err(CompileError::LoopControlOutsideLoop)
        ));
        assert!(matches!(
            compile(&[while_(
                var("true"),
                vec![defer(vec![Expression::Break])]
            )]),
            Err(CompileError::LoopControlAcrossDefer)
        ));
        assert!(matches!(
            compile(&[lambda(&[], vec![defer(vec![ret(int(1))])])]),
            Err(CompileError::ReturnInsideDefer)
        ));
    }
}
