/**
 * Copyright 2022 - Jahred Love
 *
 * Redistribution and use in source and binary forms, with or without modification,
 * are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 * list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice, this
 * list of conditions and the following disclaimer in the documentation and/or other
 * materials provided with the distribution.
 *
 * 3. Neither the name of the copyright holder nor the names of its contributors may
 * be used to endorse or promote products derived from this software without specific
 * prior written permission.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS “AS IS” AND
 * ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE IMPLIED
 * WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE DISCLAIMED.
 * IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT,
 * INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT
 * NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
 * PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
 * WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE)
 * ARISING IN ANY WAY OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE
 * POSSIBILITY OF SUCH DAMAGE.
 */

// The bytecode machine. One register window per activation; a call saves the
// caller's window in its frame and the callee gets a fresh one. Two stacks:
// call frames and handler frames.
//
// Failure splits two ways. A type error becomes an error-tagged value and
// halts the run as the program result; broken code or stack invariants are
// `VmError` and never surface to the language.

pub mod emit;
pub mod ops;

use std::io;

use tracing::trace;

use crate::builtins::NativeCtx;
use crate::error::{TypeError, VmError};
use crate::ir::BlockId;
use crate::table::Table;
use crate::value::{value_eq, Tag, Value};
use emit::{tag_from_code, Program};
use ops::Opcode;

/// Caller state saved across a call. `locals` is the caller's whole register
/// window; `index` the code offset to resume at.
struct CallFrame {
    index: usize,
    nargs: usize,
    outreg: usize,
    locals: Vec<Value>,
}

/// An installed handler. `locals` snapshots the installer's window at install
/// time; resume and exit re-enter the installer's blocks with that snapshot,
/// the handler's value bound to the target block's parameter and mirrored in
/// `outreg`. `depth` is the call-stack height at install, restored on both
/// paths. `running` marks a frame whose handler body is currently executing,
/// so nested dispatch skips it.
struct HandlerFrame {
    entry: BlockId,
    outreg: usize,
    locals: Vec<Value>,
    resume: BlockId,
    exit: BlockId,
    depth: usize,
    running: bool,
}

pub struct Vm<'io> {
    program: Program,
    out: Box<dyn io::Write + 'io>,
    regs: Vec<Value>,
    ip: usize,
    calls: Vec<CallFrame>,
    handlers: Vec<HandlerFrame>,
}

enum ArithKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Vm<'static> {
    pub fn new(program: Program) -> Vm<'static> {
        Vm::with_output(program, io::stdout())
    }
}

impl<'io> Vm<'io> {
    /// Build a machine whose `putchar` and `print` output goes to `out`.
    pub fn with_output(program: Program, out: impl io::Write + 'io) -> Vm<'io> {
        Vm {
            program,
            out: Box::new(out),
            regs: Vec::new(),
            ip: 0,
            calls: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Execute from `entry` until the program exits or returns off the top of
    /// the call stack. Type errors halt with an error-tagged value as the
    /// result; `Err` is reserved for malformed code and broken stacks.
    pub fn run(&mut self, entry: BlockId, args: &[Value]) -> Result<Value, VmError> {
        self.regs = vec![Value::Nil; self.program.window];
        self.calls.clear();
        self.handlers.clear();
        self.enter(entry, args.to_vec())?;

        loop {
            let at = self.ip;
            let word = self.fetch()?;
            let op = Opcode::from_word(word).ok_or(VmError::BadOpcode(word, at))?;
            trace!(ip = at, op = op.name(), "step");

            match op {
                Opcode::Exit => {
                    let v = self.reg()?;
                    return Ok(v);
                }
                Opcode::FunDone => return Err(VmError::TruncatedCode(at)),

                Opcode::StoreReg => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    self.regs[dst] = v;
                }
                Opcode::StoreNone => {
                    let dst = self.slot()?;
                    self.regs[dst] = Value::Nil;
                }
                Opcode::StoreBool => {
                    let dst = self.slot()?;
                    let b = self.fetch()?;
                    self.regs[dst] = Value::Bool(b != 0);
                }
                Opcode::StoreInt => {
                    let dst = self.slot()?;
                    let code = self.fetch()?;
                    let tag = tag_from_code(code).ok_or(VmError::BadOpcode(code, at))?;
                    let bits = self.fetch()?;
                    self.regs[dst] = decode_int(tag, bits);
                }
                Opcode::StoreFun => {
                    let dst = self.slot()?;
                    let b = self.fetch()?;
                    self.regs[dst] = Value::Fun(BlockId(b as u32));
                }

                Opcode::Equal | Opcode::EqualNum => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    self.regs[dst] = Value::Bool(value_eq(&a, &b));
                }
                Opcode::NotEqual | Opcode::NotEqualNum => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    self.regs[dst] = Value::Bool(!value_eq(&a, &b));
                }
                Opcode::Less | Opcode::LessNum => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    match num_lt(&a, &b) {
                        Ok(r) => self.regs[dst] = Value::Bool(r),
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::Greater | Opcode::GreaterNum => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    match num_lt(&b, &a) {
                        Ok(r) => self.regs[dst] = Value::Bool(r),
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::LessThanEqual | Opcode::LessThanEqualNum => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    match num_le(&a, &b) {
                        Ok(r) => self.regs[dst] = Value::Bool(r),
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::GreaterThanEqual | Opcode::GreaterThanEqualNum => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    match num_le(&b, &a) {
                        Ok(r) => self.regs[dst] = Value::Bool(r),
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }

                Opcode::Jump => {
                    self.ip = self.fetch()? as usize;
                }
                Opcode::BranchFalse => {
                    let cond = self.reg()?;
                    let target = self.fetch()? as usize;
                    if !cond.truthy() {
                        self.ip = target;
                    }
                }
                Opcode::BranchTrue => {
                    let cond = self.reg()?;
                    let target = self.fetch()? as usize;
                    if cond.truthy() {
                        self.ip = target;
                    }
                }
                Opcode::BranchEqual | Opcode::BranchEqualNum => {
                    let a = self.reg()?;
                    let b = self.reg()?;
                    let target = self.fetch()? as usize;
                    if value_eq(&a, &b) {
                        self.ip = target;
                    }
                }
                Opcode::BranchNotEqual | Opcode::BranchNotEqualNum => {
                    let a = self.reg()?;
                    let b = self.reg()?;
                    let target = self.fetch()? as usize;
                    if !value_eq(&a, &b) {
                        self.ip = target;
                    }
                }
                Opcode::BranchLess | Opcode::BranchLessNum => {
                    let a = self.reg()?;
                    let b = self.reg()?;
                    let target = self.fetch()? as usize;
                    match num_lt(&a, &b) {
                        Ok(true) => self.ip = target,
                        Ok(false) => {}
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::BranchGreater | Opcode::BranchGreaterNum => {
                    let a = self.reg()?;
                    let b = self.reg()?;
                    let target = self.fetch()? as usize;
                    match num_lt(&b, &a) {
                        Ok(true) => self.ip = target,
                        Ok(false) => {}
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::BranchLessThanEqual | Opcode::BranchLessThanEqualNum => {
                    let a = self.reg()?;
                    let b = self.reg()?;
                    let target = self.fetch()? as usize;
                    match num_le(&a, &b) {
                        Ok(true) => self.ip = target,
                        Ok(false) => {}
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::BranchGreaterThanEqual | Opcode::BranchGreaterThanEqualNum => {
                    let a = self.reg()?;
                    let b = self.reg()?;
                    let target = self.fetch()? as usize;
                    match num_le(&b, &a) {
                        Ok(true) => self.ip = target,
                        Ok(false) => {}
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }

                Opcode::Inc | Opcode::IncNum => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    match step(&v, 1) {
                        Ok(r) => self.regs[dst] = r,
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::Dec | Opcode::DecNum => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    match step(&v, -1) {
                        Ok(r) => self.regs[dst] = r,
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::Add | Opcode::AddNum => {
                    if let Some(halt) = self.binary(ArithKind::Add)? {
                        return Ok(halt);
                    }
                }
                Opcode::Sub | Opcode::SubNum => {
                    if let Some(halt) = self.binary(ArithKind::Sub)? {
                        return Ok(halt);
                    }
                }
                Opcode::Mul | Opcode::MulNum => {
                    if let Some(halt) = self.binary(ArithKind::Mul)? {
                        return Ok(halt);
                    }
                }
                Opcode::Div | Opcode::DivNum => {
                    if let Some(halt) = self.binary(ArithKind::Div)? {
                        return Ok(halt);
                    }
                }
                Opcode::Mod | Opcode::ModNum => {
                    if let Some(halt) = self.binary(ArithKind::Mod)? {
                        return Ok(halt);
                    }
                }
                Opcode::Concat => {
                    let dst = self.slot()?;
                    let a = self.reg()?;
                    let b = self.reg()?;
                    match concat(&a, &b) {
                        Ok(r) => self.regs[dst] = r,
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }

                Opcode::StaticCall0 | Opcode::StaticCall1 | Opcode::StaticCall2 => {
                    let n = op as usize - Opcode::StaticCall0 as usize;
                    let dst = self.slot()?;
                    let f = BlockId(self.fetch()? as u32);
                    let argv = self.argv(n)?;
                    if let Some(halt) = self.call(dst, Value::Fun(f), argv, false)? {
                        return Ok(halt);
                    }
                }
                Opcode::StaticCall => {
                    let dst = self.slot()?;
                    let f = BlockId(self.fetch()? as u32);
                    let n = self.fetch()? as usize;
                    let argv = self.argv(n)?;
                    if let Some(halt) = self.call(dst, Value::Fun(f), argv, false)? {
                        return Ok(halt);
                    }
                }
                Opcode::Call0 | Opcode::Call1 | Opcode::Call2 => {
                    let n = op as usize - Opcode::Call0 as usize;
                    let dst = self.slot()?;
                    let f = self.reg()?;
                    let argv = self.argv(n)?;
                    if let Some(halt) = self.call(dst, f, argv, false)? {
                        return Ok(halt);
                    }
                }
                Opcode::Call => {
                    let dst = self.slot()?;
                    let f = self.reg()?;
                    let n = self.fetch()? as usize;
                    let argv = self.argv(n)?;
                    if let Some(halt) = self.call(dst, f, argv, false)? {
                        return Ok(halt);
                    }
                }
                Opcode::TailCall0 | Opcode::TailCall1 | Opcode::TailCall2 => {
                    let n = op as usize - Opcode::TailCall0 as usize;
                    let f = self.reg()?;
                    let argv = self.argv(n)?;
                    if let Some(halt) = self.call(0, f, argv, true)? {
                        return Ok(halt);
                    }
                }
                Opcode::TailCall => {
                    let f = self.reg()?;
                    let n = self.fetch()? as usize;
                    let argv = self.argv(n)?;
                    if let Some(halt) = self.call(0, f, argv, true)? {
                        return Ok(halt);
                    }
                }
                Opcode::Return => {
                    let v = self.reg()?;
                    if let Some(halt) = self.ret(v) {
                        return Ok(halt);
                    }
                }

                Opcode::Putchar => {
                    let v = self.reg()?;
                    match v.to_i64() {
                        Ok(n) => self
                            .out
                            .write_all(&[n as u8])
                            .map_err(|e| VmError::Io(e.to_string()))?,
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }

                Opcode::RefNew | Opcode::BoxNew => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    let mut t = Table::new();
                    t.set(Value::I32(0), v);
                    self.regs[dst] = Value::table(t);
                }
                Opcode::StringNew => {
                    let dst = self.slot()?;
                    let idx = self.fetch()? as usize;
                    let v = self
                        .program
                        .consts
                        .get(idx)
                        .ok_or(VmError::BadConst(idx))?
                        .clone();
                    self.regs[dst] = v;
                }
                Opcode::ArrayNew => {
                    let dst = self.slot()?;
                    let n = self.fetch()? as usize;
                    let argv = self.argv(n)?;
                    let mut t = Table::new();
                    for (i, v) in argv.into_iter().enumerate() {
                        t.set(Value::I32(i as i32 + 1), v);
                    }
                    self.regs[dst] = Value::table(t);
                }
                Opcode::MapNew => {
                    let dst = self.slot()?;
                    self.regs[dst] = Value::table(Table::new());
                }
                Opcode::RefGet | Opcode::BoxGet => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    match &v {
                        Value::Table(t) => {
                            let cell = t.borrow().get_pair(&Value::I32(0)).val;
                            self.regs[dst] = cell;
                        }
                        _ => {
                            return Ok(Value::error(format!(
                                "cannot dereference a {} value",
                                v.tag().name()
                            )))
                        }
                    }
                }
                Opcode::BoxSet => {
                    let b = self.reg()?;
                    let v = self.reg()?;
                    match &b {
                        Value::Table(t) => t.borrow_mut().set(Value::I32(0), v),
                        _ => {
                            return Ok(Value::error(format!(
                                "cannot store into a {} value",
                                b.tag().name()
                            )))
                        }
                    }
                }
                Opcode::Length => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    match length(&v) {
                        Ok(r) => self.regs[dst] = r,
                        Err(e) => return Ok(Value::error(e.message)),
                    }
                }
                Opcode::IndexGet => {
                    let dst = self.slot()?;
                    let obj = self.reg()?;
                    let key = self.reg()?;
                    match &obj {
                        Value::Table(t) => {
                            let v = t.borrow().get_pair(&key).val;
                            self.regs[dst] = v;
                        }
                        // Closures index like arrays: 0 is the function,
                        // 1..=n the captured values.
                        Value::Closure(c) => {
                            self.regs[dst] = match key.to_i64() {
                                Ok(0) => Value::Fun(c.entry),
                                Ok(n) if n >= 1 && n as usize <= c.captured.len() => {
                                    c.captured[n as usize - 1].clone()
                                }
                                _ => Value::Nil,
                            };
                        }
                        _ => {
                            return Ok(Value::error(format!(
                                "cannot index a {} value",
                                obj.tag().name()
                            )))
                        }
                    }
                }
                Opcode::IndexSet => {
                    let obj = self.reg()?;
                    let key = self.reg()?;
                    let val = self.reg()?;
                    match &obj {
                        Value::Table(t) => {
                            if matches!(key, Value::Nil) {
                                return Ok(Value::error("nil table key"));
                            }
                            t.borrow_mut().set(key, val);
                        }
                        _ => {
                            return Ok(Value::error(format!(
                                "cannot index a {} value",
                                obj.tag().name()
                            )))
                        }
                    }
                }
                Opcode::Type => {
                    let dst = self.slot()?;
                    let v = self.reg()?;
                    self.regs[dst] = Value::I32(v.tag() as i32);
                }

                Opcode::SetHandler => {
                    let entry = BlockId(self.fetch()? as u32);
                    let dst = self.slot()?;
                    let resume = BlockId(self.fetch()? as u32);
                    let exit = BlockId(self.fetch()? as u32);
                    self.handlers.push(HandlerFrame {
                        entry,
                        outreg: dst,
                        locals: self.regs.clone(),
                        resume,
                        exit,
                        depth: self.calls.len(),
                        running: false,
                    });
                }
                Opcode::CallHandler => {
                    let n = self.fetch()? as usize;
                    let argv = self.argv(n)?;
                    // Innermost handler not already running.
                    let idx = self
                        .handlers
                        .iter()
                        .rposition(|h| !h.running)
                        .ok_or(VmError::HandlerUnderflow)?;
                    self.handlers[idx].running = true;
                    let entry = self.handlers[idx].entry;
                    // The invoker never resumes here; its window is dead.
                    self.regs = vec![Value::Nil; self.program.window];
                    self.enter(entry, argv)?;
                }
                Opcode::ReturnHandler => {
                    let v = self.reg()?;
                    self.leave_handler(v, false)?;
                }
                Opcode::ExitHandler => {
                    let v = self.reg()?;
                    self.leave_handler(v, true)?;
                }

                Opcode::Exec => {
                    let dst = self.slot()?;
                    let f = self.reg()?;
                    let n = self.fetch()? as usize;
                    let argv = self.argv(n)?;
                    match f {
                        Value::Ffi(native) => {
                            if let Some(halt) = self.native(dst, native, argv, false)? {
                                return Ok(halt);
                            }
                        }
                        other => {
                            return Ok(Value::error(format!(
                                "exec needs a native function, got {}",
                                other.tag().name()
                            )))
                        }
                    }
                }
            }
        }
    }

    fn fetch(&mut self) -> Result<u64, VmError> {
        let w = *self
            .program
            .code
            .get(self.ip)
            .ok_or(VmError::TruncatedCode(self.ip))?;
        self.ip += 1;
        Ok(w)
    }

    fn slot(&mut self) -> Result<usize, VmError> {
        let at = self.ip;
        let s = self.fetch()? as usize;
        if s >= self.regs.len() {
            return Err(VmError::RegOutOfRange(s, at));
        }
        Ok(s)
    }

    fn reg(&mut self) -> Result<Value, VmError> {
        let s = self.slot()?;
        Ok(self.regs[s].clone())
    }

    fn argv(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.reg()?);
        }
        Ok(out)
    }

    /// Jump into a function-entry block, binding `argv` to its parameters.
    /// Missing arguments read as nil; extras are dropped.
    fn enter(&mut self, entry: BlockId, argv: Vec<Value>) -> Result<(), VmError> {
        let info = self
            .program
            .info(entry)
            .filter(|i| i.isfunc)
            .ok_or(VmError::BadFunction(entry))?;
        let offset = info.offset;
        let params = info.params.clone();
        for (i, &p) in params.iter().enumerate() {
            let v = argv.get(i).cloned().unwrap_or(Value::Nil);
            let p = p as usize;
            if p >= self.regs.len() {
                return Err(VmError::RegOutOfRange(p, offset));
            }
            self.regs[p] = v;
        }
        self.ip = offset;
        Ok(())
    }

    /// Shared call path. Closures prepend themselves as argument zero; tail
    /// calls reuse the current frame instead of pushing one. Returns the halt
    /// value if the call ends the whole run.
    fn call(
        &mut self,
        dst: usize,
        callee: Value,
        mut argv: Vec<Value>,
        tail: bool,
    ) -> Result<Option<Value>, VmError> {
        let entry = match callee {
            Value::Fun(b) => b,
            Value::Closure(ref c) => {
                let entry = c.entry;
                argv.insert(0, callee.clone());
                entry
            }
            Value::Ffi(native) => return self.native(dst, native, argv, tail),
            other => {
                return Ok(Some(Value::error(format!(
                    "cannot call a {} value",
                    other.tag().name()
                ))))
            }
        };

        if tail {
            self.regs.fill(Value::Nil);
        } else {
            let locals = std::mem::replace(&mut self.regs, vec![Value::Nil; self.program.window]);
            trace!(depth = self.calls.len(), nargs = argv.len(), "call");
            self.calls.push(CallFrame {
                index: self.ip,
                nargs: argv.len(),
                outreg: dst,
                locals,
            });
        }
        self.enter(entry, argv)
            .map(|()| None)
    }

    fn native(
        &mut self,
        dst: usize,
        f: crate::value::NativeFn,
        argv: Vec<Value>,
        tail: bool,
    ) -> Result<Option<Value>, VmError> {
        let mut buf = argv;
        if buf.is_empty() {
            buf.push(Value::Nil);
        }
        let mut ctx = NativeCtx {
            out: &mut *self.out,
            halt: None,
        };
        f(&mut ctx, &mut buf);
        if let Some(v) = ctx.halt {
            return Ok(Some(v));
        }
        // ABI: slot 0 holds the one meaningful result.
        let result = buf.swap_remove(0);
        if tail {
            Ok(self.ret(result))
        } else {
            self.regs[dst] = result;
            Ok(None)
        }
    }

    /// Pop a call frame and deliver `v`. With no frame left the run is over
    /// and `v` is the program result.
    fn ret(&mut self, v: Value) -> Option<Value> {
        match self.calls.pop() {
            None => Some(v),
            Some(frame) => {
                trace!(depth = self.calls.len(), nargs = frame.nargs, "return");
                self.regs = frame.locals;
                self.regs[frame.outreg] = v;
                self.ip = frame.index;
                None
            }
        }
    }

    /// Finish the innermost running handler: restore the installer's window
    /// and call depth, then continue at its resume or exit block with `v`
    /// bound to that block's parameter (and mirrored in the frame's output
    /// register). Frames installed above it are gone with its dynamic extent.
    fn leave_handler(&mut self, v: Value, exit: bool) -> Result<(), VmError> {
        let idx = self
            .handlers
            .iter()
            .rposition(|h| h.running)
            .ok_or(VmError::HandlerUnderflow)?;
        let frame = self.handlers.swap_remove(idx);
        self.handlers.truncate(idx);
        self.calls.truncate(frame.depth);
        self.regs = frame.locals;

        let target = if exit { frame.exit } else { frame.resume };
        let info = self
            .program
            .info(target)
            .ok_or(VmError::BadFunction(target))?;
        let offset = info.offset;
        let params = info.params.clone();
        self.ip = offset;
        for &p in &params {
            let p = p as usize;
            if p >= self.regs.len() {
                return Err(VmError::RegOutOfRange(p, offset));
            }
            self.regs[p] = v.clone();
        }
        if frame.outreg < self.regs.len() {
            self.regs[frame.outreg] = v;
        }
        Ok(())
    }

    fn binary(&mut self, kind: ArithKind) -> Result<Option<Value>, VmError> {
        let dst = self.slot()?;
        let a = self.reg()?;
        let b = self.reg()?;
        match arith(kind, &a, &b) {
            Ok(v) => {
                self.regs[dst] = v;
                Ok(None)
            }
            Err(e) => Ok(Some(Value::error(e.message))),
        }
    }
}

fn decode_int(tag: Tag, bits: u64) -> Value {
    match tag {
        Tag::I8 => Value::I8(bits as i8),
        Tag::I16 => Value::I16(bits as i16),
        Tag::I32 => Value::I32(bits as i32),
        Tag::I64 => Value::I64(bits as i64),
        Tag::F32 => Value::F32(f32::from_bits(bits as u32)),
        _ => Value::F64(f64::from_bits(bits)),
    }
}

fn order_error(a: &Value, b: &Value) -> TypeError {
    TypeError::new(format!(
        "cannot order a {} value against a {} value",
        a.tag().name(),
        b.tag().name()
    ))
}

/// Strict less-than. Operands must share a numeric tag; float comparisons
/// follow IEEE semantics (false against NaN).
fn num_lt(a: &Value, b: &Value) -> Result<bool, TypeError> {
    match (a, b) {
        (Value::I8(x), Value::I8(y)) => Ok(x < y),
        (Value::I16(x), Value::I16(y)) => Ok(x < y),
        (Value::I32(x), Value::I32(y)) => Ok(x < y),
        (Value::I64(x), Value::I64(y)) => Ok(x < y),
        (Value::F32(x), Value::F32(y)) => Ok(x < y),
        (Value::F64(x), Value::F64(y)) => Ok(x < y),
        _ => Err(order_error(a, b)),
    }
}

fn num_le(a: &Value, b: &Value) -> Result<bool, TypeError> {
    match (a, b) {
        (Value::I8(x), Value::I8(y)) => Ok(x <= y),
        (Value::I16(x), Value::I16(y)) => Ok(x <= y),
        (Value::I32(x), Value::I32(y)) => Ok(x <= y),
        (Value::I64(x), Value::I64(y)) => Ok(x <= y),
        (Value::F32(x), Value::F32(y)) => Ok(x <= y),
        (Value::F64(x), Value::F64(y)) => Ok(x <= y),
        _ => Err(order_error(a, b)),
    }
}

/// Integer arithmetic in i64, wrapped back to the operand width by the
/// caller. Division and remainder by zero are type errors, not faults.
fn int_arith(kind: &ArithKind, x: i64, y: i64) -> Result<i64, TypeError> {
    Ok(match kind {
        ArithKind::Add => x.wrapping_add(y),
        ArithKind::Sub => x.wrapping_sub(y),
        ArithKind::Mul => x.wrapping_mul(y),
        ArithKind::Div => {
            if y == 0 {
                return Err(TypeError::new("division by zero"));
            }
            x.wrapping_div(y)
        }
        ArithKind::Mod => {
            if y == 0 {
                return Err(TypeError::new("division by zero"));
            }
            x.wrapping_rem(y)
        }
    })
}

fn float_arith(kind: &ArithKind, x: f64, y: f64) -> f64 {
    match kind {
        ArithKind::Add => x + y,
        ArithKind::Sub => x - y,
        ArithKind::Mul => x * y,
        ArithKind::Div => x / y,
        ArithKind::Mod => x % y,
    }
}

/// Generic arithmetic: both operands must share a numeric tag, and the
/// result keeps it. Integer overflow wraps at the operand width.
fn arith(kind: ArithKind, a: &Value, b: &Value) -> Result<Value, TypeError> {
    match (a, b) {
        (Value::I8(x), Value::I8(y)) => {
            Ok(Value::I8(int_arith(&kind, *x as i64, *y as i64)? as i8))
        }
        (Value::I16(x), Value::I16(y)) => {
            Ok(Value::I16(int_arith(&kind, *x as i64, *y as i64)? as i16))
        }
        (Value::I32(x), Value::I32(y)) => {
            Ok(Value::I32(int_arith(&kind, *x as i64, *y as i64)? as i32))
        }
        (Value::I64(x), Value::I64(y)) => Ok(Value::I64(int_arith(&kind, *x, *y)?)),
        (Value::F32(x), Value::F32(y)) => {
            Ok(Value::F32(float_arith(&kind, *x as f64, *y as f64) as f32))
        }
        (Value::F64(x), Value::F64(y)) => Ok(Value::F64(float_arith(&kind, *x, *y))),
        _ => Err(TypeError::new(format!(
            "cannot combine a {} value with a {} value",
            a.tag().name(),
            b.tag().name()
        ))),
    }
}

/// Increment/decrement by `delta`, keeping the operand's tag.
fn step(v: &Value, delta: i64) -> Result<Value, TypeError> {
    match v {
        Value::I8(x) => Ok(Value::I8(x.wrapping_add(delta as i8))),
        Value::I16(x) => Ok(Value::I16(x.wrapping_add(delta as i16))),
        Value::I32(x) => Ok(Value::I32(x.wrapping_add(delta as i32))),
        Value::I64(x) => Ok(Value::I64(x.wrapping_add(delta))),
        Value::F32(x) => Ok(Value::F32(x + delta as f32)),
        Value::F64(x) => Ok(Value::F64(x + delta as f64)),
        _ => Err(TypeError::new(format!(
            "cannot count a {} value",
            v.tag().name()
        ))),
    }
}

/// Concatenation renders strings, numerics and booleans; anything else is a
/// type error.
pub(crate) fn concat(a: &Value, b: &Value) -> Result<Value, TypeError> {
    fn piece(v: &Value) -> Result<String, TypeError> {
        match v {
            Value::Str(_) | Value::Error(_) | Value::Bool(_) | Value::Nil => Ok(v.to_string()),
            _ if v.is_numeric() => Ok(v.to_string()),
            _ => Err(TypeError::new(format!(
                "cannot concatenate a {} value",
                v.tag().name()
            ))),
        }
    }
    Ok(Value::str(format!("{}{}", piece(a)?, piece(b)?)))
}

fn length(v: &Value) -> Result<Value, TypeError> {
    match v {
        Value::Table(t) => Ok(Value::I32(t.borrow().len() as i32)),
        Value::Str(s) => Ok(Value::I32(s.len() as i32)),
        Value::Buffer(b) => Ok(Value::I32(b.borrow().len() as i32)),
        _ => Err(TypeError::new(format!(
            "a {} value has no length",
            v.tag().name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_keeps_the_operand_tag() {
        let v = arith(ArithKind::Add, &Value::I8(120), &Value::I8(10)).unwrap();
        assert!(value_eq(&v, &Value::I8(-126)));
        let v = arith(ArithKind::Mul, &Value::F32(1.5), &Value::F32(2.0)).unwrap();
        assert!(value_eq(&v, &Value::F32(3.0)));
    }

    #[test]
    fn arith_rejects_mixed_tags() {
        assert!(arith(ArithKind::Add, &Value::I32(1), &Value::I64(1)).is_err());
        assert!(arith(ArithKind::Add, &Value::str("a"), &Value::I32(1)).is_err());
    }

    #[test]
    fn division_by_zero_is_a_type_error() {
        assert!(arith(ArithKind::Div, &Value::I32(1), &Value::I32(0)).is_err());
        assert!(arith(ArithKind::Mod, &Value::I64(1), &Value::I64(0)).is_err());
        // Float division by zero follows IEEE instead.
        let v = arith(ArithKind::Div, &Value::F64(1.0), &Value::F64(0.0)).unwrap();
        assert!(matches!(v, Value::F64(x) if x.is_infinite()));
    }

    #[test]
    fn ordering_is_tag_strict() {
        assert!(num_lt(&Value::I32(1), &Value::I32(2)).unwrap());
        assert!(num_lt(&Value::I32(1), &Value::I64(2)).is_err());
        assert!(!num_lt(&Value::F64(f64::NAN), &Value::F64(0.0)).unwrap());
    }

    #[test]
    fn concat_renders_numbers_and_strings() {
        let v = concat(&Value::str("n = "), &Value::I32(7)).unwrap();
        assert!(value_eq(&v, &Value::str("n = 7")));
        assert!(concat(&Value::str("x"), &Value::table(Table::new())).is_err());
    }
}
