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

// Lowers allocated blocks to the flat code buffer the interpreter runs.
// Registers are physical slots by the time blocks arrive here; literals are
// materialized through STORE_* / STRING_NEW into per-instruction scratch
// slots above the register file. Branch-argument passing becomes a move
// sequence scheduled so no source is read after its slot is written; forward
// targets are back-patched once every block has an offset.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use super::ops::Opcode;
use crate::error::EmitError;
use crate::ir::{Arg, Block, BlockId, Blocks, BranchOp, Instr, InstrOp, Lit};
use crate::value::{Tag, Value};

/// Per-block metadata the interpreter needs at call and jump boundaries.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub offset: usize,
    /// Post-allocation parameter slots, in declaration order.
    pub params: Vec<u32>,
    pub isfunc: bool,
}

/// An emitted program: the code buffer, its constant pool, and the block
/// info table (indexed by block id; forwarding aliases have no entry).
#[derive(Clone, Debug)]
pub struct Program {
    pub code: Vec<u64>,
    pub consts: Vec<Value>,
    infos: Vec<Option<BlockInfo>>,
    /// Register window size for every activation: the largest physical
    /// register count of any block, plus the scratch area.
    pub window: usize,
    /// First scratch slot; slots below this hold allocated registers.
    pub scratch_base: usize,
}

impl Program {
    pub fn info(&self, id: BlockId) -> Option<&BlockInfo> {
        self.infos.get(id.0 as usize).and_then(|i| i.as_ref())
    }
}

/// Numeric tag codes carried by STORE_INT words.
fn tag_code(tag: Tag) -> u64 {
    tag as u64
}

pub fn tag_from_code(code: u64) -> Option<Tag> {
    match code {
        c if c == Tag::I8 as u64 => Some(Tag::I8),
        c if c == Tag::I16 as u64 => Some(Tag::I16),
        c if c == Tag::I32 as u64 => Some(Tag::I32),
        c if c == Tag::I64 as u64 => Some(Tag::I64),
        c if c == Tag::F32 as u64 => Some(Tag::F32),
        c if c == Tag::F64 as u64 => Some(Tag::F64),
        _ => None,
    }
}

struct Emitter<'a> {
    blocks: &'a Blocks,
    code: Vec<u64>,
    consts: Vec<Value>,
    interned: HashMap<String, usize>,
    infos: Vec<Option<BlockInfo>>,
    fixups: Vec<(usize, BlockId)>,
    scratch_base: usize,
}

pub fn emit(blocks: &Blocks) -> Result<Program, EmitError> {
    let mut max_regs = 0u32;
    let mut scratch = 2usize;
    for (i, block) in blocks.blocks.iter().enumerate() {
        if block.id.0 as usize != i {
            continue;
        }
        max_regs = max_regs.max(block.nregs);
        for instr in &block.instrs {
            let lits = instr.args.iter().filter(|a| matches!(a, Arg::Lit(_))).count();
            scratch = scratch.max(lits);
        }
    }

    let mut e = Emitter {
        blocks,
        code: Vec::new(),
        consts: Vec::new(),
        interned: HashMap::new(),
        infos: vec![None; blocks.len()],
        fixups: Vec::new(),
        scratch_base: max_regs as usize,
    };

    for (i, block) in blocks.blocks.iter().enumerate() {
        if block.id.0 as usize != i {
            continue;
        }
        e.infos[i] = Some(BlockInfo {
            offset: e.code.len(),
            params: block.args.clone(),
            isfunc: block.isfunc,
        });
        e.block(block)?;
        debug!(block = block.id.0, words = e.code.len(), "emitted block");
    }
    // Guard word: running past the end of any emitted block is a bug.
    e.code.push(Opcode::FunDone as u64);

    for (pos, target) in e.fixups {
        let info = e.infos[target.0 as usize]
            .as_ref()
            .ok_or(EmitError::MissingTarget(target.0))?;
        e.code[pos] = info.offset as u64;
    }

    Ok(Program {
        code: e.code,
        consts: e.consts,
        infos: e.infos,
        window: max_regs as usize + scratch,
        scratch_base: max_regs as usize,
    })
}

impl<'a> Emitter<'a> {
    fn op(&mut self, op: Opcode) {
        self.code.push(op as u64);
    }

    fn intern(&mut self, s: &str) -> u64 {
        if let Some(&idx) = self.interned.get(s) {
            return idx as u64;
        }
        let idx = self.consts.len();
        self.consts.push(Value::str(s));
        self.interned.insert(s.to_string(), idx);
        idx as u64
    }

    /// Resolve a forwarding alias to its canonical block.
    fn resolve(&self, id: BlockId) -> Result<BlockId, EmitError> {
        let block = self
            .blocks
            .blocks
            .get(id.0 as usize)
            .ok_or(EmitError::MissingTarget(id.0))?;
        Ok(block.id)
    }

    /// Emit a placeholder word to be patched with `target`'s offset.
    fn fixup(&mut self, target: BlockId) -> Result<(), EmitError> {
        let resolved = self.resolve(target)?;
        self.fixups.push((self.code.len(), resolved));
        self.code.push(0);
        Ok(())
    }

    /// Store a literal into `slot`.
    fn materialize(&mut self, lit: &Lit, slot: u64) -> Result<(), EmitError> {
        match lit {
            Lit::Nil => {
                self.op(Opcode::StoreNone);
                self.code.push(slot);
            }
            Lit::Bool(b) => {
                self.op(Opcode::StoreBool);
                self.code.push(slot);
                self.code.push(*b as u64);
            }
            Lit::I8(n) => self.store_int(slot, Tag::I8, *n as i64 as u64),
            Lit::I16(n) => self.store_int(slot, Tag::I16, *n as i64 as u64),
            Lit::I32(n) => self.store_int(slot, Tag::I32, *n as i64 as u64),
            Lit::I64(n) => self.store_int(slot, Tag::I64, *n as u64),
            Lit::F32(n) => self.store_int(slot, Tag::F32, n.to_bits() as u64),
            Lit::F64(n) => self.store_int(slot, Tag::F64, n.to_bits()),
            Lit::Str(s) => {
                let idx = self.intern(s);
                self.op(Opcode::StringNew);
                self.code.push(slot);
                self.code.push(idx);
            }
            Lit::Fun(b) => {
                let resolved = self.resolve(*b)?;
                self.op(Opcode::StoreFun);
                self.code.push(slot);
                self.code.push(resolved.0 as u64);
            }
        }
        Ok(())
    }

    fn store_int(&mut self, slot: u64, tag: Tag, bits: u64) {
        self.op(Opcode::StoreInt);
        self.code.push(slot);
        self.code.push(tag_code(tag));
        self.code.push(bits);
    }

    /// Bring an operand into a register slot, materializing literals into the
    /// scratch area. `scratch_idx` advances per materialized literal so the
    /// operands of one instruction never collide.
    fn operand(&mut self, arg: &Arg, scratch_idx: &mut usize) -> Result<u64, EmitError> {
        match arg {
            Arg::Reg(r) => Ok(*r as u64),
            Arg::Lit(lit) => {
                let slot = (self.scratch_base + *scratch_idx) as u64;
                *scratch_idx += 1;
                self.materialize(lit, slot)?;
                Ok(slot)
            }
        }
    }

    fn block(&mut self, block: &Block) -> Result<(), EmitError> {
        for instr in &block.instrs {
            self.instr(block, instr)?;
        }
        self.branch(block)
    }

    fn instr(&mut self, block: &Block, instr: &Instr) -> Result<(), EmitError> {
        let discard = self.scratch_base as u64;
        let dst = instr.out.map(|o| o as u64).unwrap_or(discard);
        let mut scratch = 0usize;

        match instr.op {
            InstrOp::Move => {
                // Dead moves have no destination and no side effects.
                let Some(out) = instr.out else { return Ok(()) };
                match &instr.args[0] {
                    Arg::Lit(lit) => self.materialize(lit, out as u64)?,
                    Arg::Reg(r) => {
                        let src = *r as u64;
                        self.op(Opcode::StoreReg);
                        self.code.push(out as u64);
                        self.code.push(src);
                    }
                }
            }
            InstrOp::Inc | InstrOp::Dec => {
                let num = matches!(&instr.args[0], Arg::Lit(l) if l.is_numeric());
                let src = self.operand(&instr.args[0], &mut scratch)?;
                let op = match (instr.op, num) {
                    (InstrOp::Inc, false) => Opcode::Inc,
                    (InstrOp::Inc, true) => Opcode::IncNum,
                    (InstrOp::Dec, false) => Opcode::Dec,
                    (_, true) => Opcode::DecNum,
                    _ => unreachable!(),
                };
                self.op(op);
                self.code.push(dst);
                self.code.push(src);
            }
            InstrOp::Add | InstrOp::Sub | InstrOp::Mul | InstrOp::Div | InstrOp::Mod => {
                let num = instr.args.len() == 2 && same_num_tag(&instr.args[0], &instr.args[1]);
                let a = self.operand(&instr.args[0], &mut scratch)?;
                let b = self.operand(&instr.args[1], &mut scratch)?;
                let op = match (instr.op, num) {
                    (InstrOp::Add, false) => Opcode::Add,
                    (InstrOp::Add, true) => Opcode::AddNum,
                    (InstrOp::Sub, false) => Opcode::Sub,
                    (InstrOp::Sub, true) => Opcode::SubNum,
                    (InstrOp::Mul, false) => Opcode::Mul,
                    (InstrOp::Mul, true) => Opcode::MulNum,
                    (InstrOp::Div, false) => Opcode::Div,
                    (InstrOp::Div, true) => Opcode::DivNum,
                    (InstrOp::Mod, false) => Opcode::Mod,
                    (InstrOp::Mod, true) => Opcode::ModNum,
                    _ => unreachable!(),
                };
                self.op(op);
                self.code.push(dst);
                self.code.push(a);
                self.code.push(b);
            }
            InstrOp::Concat => {
                let a = self.operand(&instr.args[0], &mut scratch)?;
                let b = self.operand(&instr.args[1], &mut scratch)?;
                self.op(Opcode::Concat);
                self.code.push(dst);
                self.code.push(a);
                self.code.push(b);
            }
            InstrOp::Call => {
                let (callee, args) = instr
                    .args
                    .split_first()
                    .ok_or_else(|| EmitError::Malformed(block.id.0, "call without callee".into()))?;
                // Operands materialize first: a literal store emitted after
                // the opcode word would land inside the operand list.
                if let Arg::Lit(Lit::Fun(f)) = callee {
                    let resolved = self.resolve(*f)?;
                    let mut slots = Vec::with_capacity(args.len());
                    for a in args {
                        slots.push(self.operand(a, &mut scratch)?);
                    }
                    let op = match args.len() {
                        0 => Opcode::StaticCall0,
                        1 => Opcode::StaticCall1,
                        2 => Opcode::StaticCall2,
                        _ => Opcode::StaticCall,
                    };
                    self.op(op);
                    self.code.push(dst);
                    self.code.push(resolved.0 as u64);
                    if args.len() > 2 {
                        self.code.push(args.len() as u64);
                    }
                    self.code.extend(slots);
                } else {
                    let f = self.operand(callee, &mut scratch)?;
                    let mut slots = Vec::with_capacity(args.len());
                    for a in args {
                        slots.push(self.operand(a, &mut scratch)?);
                    }
                    let op = match args.len() {
                        0 => Opcode::Call0,
                        1 => Opcode::Call1,
                        2 => Opcode::Call2,
                        _ => Opcode::Call,
                    };
                    self.op(op);
                    self.code.push(dst);
                    self.code.push(f);
                    if args.len() > 2 {
                        self.code.push(args.len() as u64);
                    }
                    self.code.extend(slots);
                }
            }
            InstrOp::TailCall => {
                let (callee, args) = instr.args.split_first().ok_or_else(|| {
                    EmitError::Malformed(block.id.0, "tail call without callee".into())
                })?;
                let f = self.operand(callee, &mut scratch)?;
                let mut slots = Vec::with_capacity(args.len());
                for a in args {
                    slots.push(self.operand(a, &mut scratch)?);
                }
                let op = match args.len() {
                    0 => Opcode::TailCall0,
                    1 => Opcode::TailCall1,
                    2 => Opcode::TailCall2,
                    _ => Opcode::TailCall,
                };
                self.op(op);
                self.code.push(f);
                if args.len() > 2 {
                    self.code.push(args.len() as u64);
                }
                self.code.extend(slots);
            }
            InstrOp::RefNew | InstrOp::BoxNew => {
                let src = self.operand(&instr.args[0], &mut scratch)?;
                self.op(if instr.op == InstrOp::RefNew {
                    Opcode::RefNew
                } else {
                    Opcode::BoxNew
                });
                self.code.push(dst);
                self.code.push(src);
            }
            InstrOp::StrNew => match &instr.args[0] {
                Arg::Lit(Lit::Str(s)) => {
                    let idx = self.intern(s);
                    self.op(Opcode::StringNew);
                    self.code.push(dst);
                    self.code.push(idx);
                }
                _ => {
                    return Err(EmitError::Malformed(
                        block.id.0,
                        "string_new needs a string literal".into(),
                    ))
                }
            },
            InstrOp::ArrNew => {
                let mut slots = Vec::with_capacity(instr.args.len());
                for a in &instr.args {
                    slots.push(self.operand(a, &mut scratch)?);
                }
                self.op(Opcode::ArrayNew);
                self.code.push(dst);
                self.code.push(slots.len() as u64);
                self.code.extend(slots);
            }
            InstrOp::MapNew => {
                self.op(Opcode::MapNew);
                self.code.push(dst);
            }
            InstrOp::RefGet | InstrOp::BoxGet => {
                let src = self.operand(&instr.args[0], &mut scratch)?;
                self.op(if instr.op == InstrOp::RefGet {
                    Opcode::RefGet
                } else {
                    Opcode::BoxGet
                });
                self.code.push(dst);
                self.code.push(src);
            }
            InstrOp::BoxSet => {
                let b = self.operand(&instr.args[0], &mut scratch)?;
                let v = self.operand(&instr.args[1], &mut scratch)?;
                self.op(Opcode::BoxSet);
                self.code.push(b);
                self.code.push(v);
            }
            InstrOp::Len => {
                let src = self.operand(&instr.args[0], &mut scratch)?;
                self.op(Opcode::Length);
                self.code.push(dst);
                self.code.push(src);
            }
            InstrOp::Get => {
                let obj = self.operand(&instr.args[0], &mut scratch)?;
                let key = self.operand(&instr.args[1], &mut scratch)?;
                self.op(Opcode::IndexGet);
                self.code.push(dst);
                self.code.push(obj);
                self.code.push(key);
            }
            InstrOp::Set => {
                let obj = self.operand(&instr.args[0], &mut scratch)?;
                let key = self.operand(&instr.args[1], &mut scratch)?;
                let val = self.operand(&instr.args[2], &mut scratch)?;
                self.op(Opcode::IndexSet);
                self.code.push(obj);
                self.code.push(key);
                self.code.push(val);
            }
            InstrOp::Type => {
                let src = self.operand(&instr.args[0], &mut scratch)?;
                self.op(Opcode::Type);
                self.code.push(dst);
                self.code.push(src);
            }
            InstrOp::Putchar => {
                let src = self.operand(&instr.args[0], &mut scratch)?;
                self.op(Opcode::Putchar);
                self.code.push(src);
            }
            InstrOp::SetHandler => {
                let (entry, resume, exit) = match instr.args.as_slice() {
                    [Arg::Lit(Lit::Fun(h)), Arg::Lit(Lit::Fun(r)), Arg::Lit(Lit::Fun(x))] => {
                        (*h, *r, *x)
                    }
                    _ => {
                        return Err(EmitError::Malformed(
                            block.id.0,
                            "set_handler needs three block references".into(),
                        ))
                    }
                };
                // Resume and exit travel as block ids, not code offsets: the
                // interpreter binds the handler's value to the target block's
                // parameter, which only the block info table knows.
                let entry = self.resolve(entry)?;
                let resume = self.resolve(resume)?;
                let exit = self.resolve(exit)?;
                self.op(Opcode::SetHandler);
                self.code.push(entry.0 as u64);
                self.code.push(dst);
                self.code.push(resume.0 as u64);
                self.code.push(exit.0 as u64);
            }
            InstrOp::CallHandler => {
                let mut slots = Vec::with_capacity(instr.args.len());
                for a in &instr.args {
                    slots.push(self.operand(a, &mut scratch)?);
                }
                self.op(Opcode::CallHandler);
                self.code.push(slots.len() as u64);
                self.code.extend(slots);
            }
            InstrOp::Exec => {
                let (callee, args) = instr
                    .args
                    .split_first()
                    .ok_or_else(|| EmitError::Malformed(block.id.0, "exec without callee".into()))?;
                let f = self.operand(callee, &mut scratch)?;
                let mut slots = Vec::with_capacity(args.len());
                for a in args {
                    slots.push(self.operand(a, &mut scratch)?);
                }
                self.op(Opcode::Exec);
                self.code.push(dst);
                self.code.push(f);
                self.code.push(args.len() as u64);
                self.code.extend(slots);
            }
        }
        Ok(())
    }

    /// Emit the moves that feed a successor's parameters, then the jump.
    /// Register moves are scheduled so no source is read after its slot is
    /// written, breaking cycles through the first scratch slot; literal
    /// stores follow, after every source has been read.
    fn pass_and_jump(&mut self, block: &Block, arm: usize) -> Result<(), EmitError> {
        let target = block.branch.targets[arm]
            .ok_or_else(|| EmitError::Malformed(block.id.0, "branch arm without target".into()))?;
        let resolved = self.resolve(target)?;
        let params = &self
            .blocks
            .get(resolved)
            .ok_or(EmitError::MissingTarget(resolved.0))?
            .args;
        if params.len() != block.branch.pass[arm].len() {
            return Err(EmitError::Malformed(
                block.id.0,
                format!(
                    "pass list length {} does not match block .{} parameters",
                    block.branch.pass[arm].len(),
                    resolved.0
                ),
            ));
        }

        let mut reg_moves: BTreeMap<u64, u64> = BTreeMap::new();
        let mut lit_moves: Vec<(u64, Lit)> = Vec::new();
        for (arg, &param) in block.branch.pass[arm].iter().zip(params.iter()) {
            let dst = param as u64;
            match arg {
                Arg::Reg(r) => {
                    if *r as u64 != dst {
                        reg_moves.insert(dst, *r as u64);
                    }
                }
                Arg::Lit(l) => lit_moves.push((dst, l.clone())),
            }
        }

        for (dst, src) in schedule_moves(reg_moves, self.scratch_base as u64) {
            self.op(Opcode::StoreReg);
            self.code.push(dst);
            self.code.push(src);
        }
        for (dst, lit) in lit_moves {
            self.materialize(&lit, dst)?;
        }

        self.op(Opcode::Jump);
        self.fixup(resolved)
    }

    fn branch(&mut self, block: &Block) -> Result<(), EmitError> {
        let mut scratch = 0usize;
        let arg = |e: &mut Self, scratch: &mut usize, i: usize| -> Result<u64, EmitError> {
            let a = block.branch.args[i].as_ref().ok_or_else(|| {
                EmitError::Malformed(block.id.0, "branch missing an operand".into())
            })?;
            e.operand(a, scratch)
        };

        match block.branch.op {
            BranchOp::Jump => self.pass_and_jump(block, 0),
            BranchOp::Bool => {
                let cond = arg(self, &mut scratch, 0)?;
                self.op(Opcode::BranchTrue);
                self.code.push(cond);
                let patch = self.code.len();
                self.code.push(0);
                self.pass_and_jump(block, 1)?;
                self.code[patch] = self.code.len() as u64;
                self.pass_and_jump(block, 0)
            }
            BranchOp::Eq | BranchOp::Lt | BranchOp::Le => {
                let num = match (&block.branch.args[0], &block.branch.args[1]) {
                    (Some(x), Some(y)) => same_num_tag(x, y),
                    _ => false,
                };
                let a = arg(self, &mut scratch, 0)?;
                let b = arg(self, &mut scratch, 1)?;
                let op = match (block.branch.op, num) {
                    (BranchOp::Eq, false) => Opcode::BranchEqual,
                    (BranchOp::Eq, true) => Opcode::BranchEqualNum,
                    (BranchOp::Lt, false) => Opcode::BranchLess,
                    (BranchOp::Lt, true) => Opcode::BranchLessNum,
                    (BranchOp::Le, false) => Opcode::BranchLessThanEqual,
                    (_, true) => Opcode::BranchLessThanEqualNum,
                    _ => unreachable!(),
                };
                self.op(op);
                self.code.push(a);
                self.code.push(b);
                let patch = self.code.len();
                self.code.push(0);
                self.pass_and_jump(block, 1)?;
                self.code[patch] = self.code.len() as u64;
                self.pass_and_jump(block, 0)
            }
            BranchOp::Ret => {
                let src = arg(self, &mut scratch, 0)?;
                self.op(Opcode::Return);
                self.code.push(src);
                Ok(())
            }
            BranchOp::Exit => {
                let src = match &block.branch.args[0] {
                    Some(a) => self.operand(a, &mut scratch)?,
                    None => {
                        let slot = self.scratch_base as u64;
                        self.op(Opcode::StoreNone);
                        self.code.push(slot);
                        slot
                    }
                };
                self.op(Opcode::Exit);
                self.code.push(src);
                Ok(())
            }
            BranchOp::HandlerRet => {
                let src = arg(self, &mut scratch, 0)?;
                self.op(Opcode::ReturnHandler);
                self.code.push(src);
                Ok(())
            }
            BranchOp::HandlerExit => {
                let src = arg(self, &mut scratch, 0)?;
                self.op(Opcode::ExitHandler);
                self.code.push(src);
                Ok(())
            }
        }
    }
}

/// Numeric tag of a literal operand; `None` for registers and non-numerics.
fn lit_tag(arg: &Arg) -> Option<Tag> {
    match arg {
        Arg::Lit(Lit::I8(_)) => Some(Tag::I8),
        Arg::Lit(Lit::I16(_)) => Some(Tag::I16),
        Arg::Lit(Lit::I32(_)) => Some(Tag::I32),
        Arg::Lit(Lit::I64(_)) => Some(Tag::I64),
        Arg::Lit(Lit::F32(_)) => Some(Tag::F32),
        Arg::Lit(Lit::F64(_)) => Some(Tag::F64),
        _ => None,
    }
}

/// The `*_NUM` precondition: both operands are numeric literals of one tag.
fn same_num_tag(a: &Arg, b: &Arg) -> bool {
    match (lit_tag(a), lit_tag(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Order a set of parallel moves (dst <- src) so no source is clobbered
/// before it is read, using `temp` to break cycles. Deterministic: the
/// result never depends on hash iteration order.
fn schedule_moves(mut map: BTreeMap<u64, u64>, temp: u64) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::new();

    while !map.is_empty() {
        // Drain every move whose destination no pending move still reads.
        loop {
            let ready = map.iter().find_map(|(&d, &s)| {
                if map.values().all(|&other| other != d) {
                    Some((d, s))
                } else {
                    None
                }
            });
            if let Some((d, s)) = ready {
                out.push((d, s));
                map.remove(&d);
            } else {
                break;
            }
        }

        if map.is_empty() {
            break;
        }

        // Break a cycle deterministically (pick smallest dst).
        let start = *map.keys().next().expect("non-empty");
        out.push((temp, start));

        let mut d = start;
        loop {
            let s = *map.get(&d).expect("cycle must have mapping");
            map.remove(&d);
            if s == start {
                out.push((d, temp));
                break;
            } else {
                out.push((d, s));
                d = s;
            }
        }
    }

    out
}

/// Render the code buffer one instruction per line, for debugging.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    let code = &program.code;
    let mut i = 0;
    while i < code.len() {
        let Some(op) = Opcode::from_word(code[i]) else {
            let _ = writeln!(out, "{:6}  ??? {}", i, code[i]);
            i += 1;
            continue;
        };
        let _ = write!(out, "{:6}  {}", i, op.name());
        // Variadic opcodes carry their own count word.
        let width = match op {
            Opcode::StaticCall | Opcode::Call => 3 + code.get(i + 3).copied().unwrap_or(0) as usize,
            Opcode::TailCall => 2 + code.get(i + 2).copied().unwrap_or(0) as usize,
            Opcode::CallHandler => 1 + code.get(i + 1).copied().unwrap_or(0) as usize,
            Opcode::ArrayNew => 2 + code.get(i + 2).copied().unwrap_or(0) as usize,
            Opcode::Exec => 3 + code.get(i + 3).copied().unwrap_or(0) as usize,
            _ => arity_fixed(op),
        };
        for k in 0..width {
            if let Some(w) = code.get(i + 1 + k) {
                let _ = write!(out, " {}", w);
            }
        }
        let _ = writeln!(out);
        i += 1 + width;
    }
    out
}

/// Operand word count for fixed-arity opcodes.
fn arity_fixed(op: Opcode) -> usize {
    match op {
        Opcode::FunDone => 0,
        Opcode::Exit
        | Opcode::Return
        | Opcode::Putchar
        | Opcode::ReturnHandler
        | Opcode::ExitHandler
        | Opcode::Jump
        | Opcode::StoreNone => 1,
        Opcode::StoreReg
        | Opcode::StoreBool
        | Opcode::StoreFun
        | Opcode::Inc
        | Opcode::IncNum
        | Opcode::Dec
        | Opcode::DecNum
        | Opcode::RefNew
        | Opcode::BoxNew
        | Opcode::StringNew
        | Opcode::RefGet
        | Opcode::BoxGet
        | Opcode::BoxSet
        | Opcode::Length
        | Opcode::Type
        | Opcode::BranchFalse
        | Opcode::BranchTrue => 2,
        Opcode::MapNew => 1,
        Opcode::StoreInt
        | Opcode::Equal
        | Opcode::EqualNum
        | Opcode::NotEqual
        | Opcode::NotEqualNum
        | Opcode::Less
        | Opcode::LessNum
        | Opcode::Greater
        | Opcode::GreaterNum
        | Opcode::LessThanEqual
        | Opcode::LessThanEqualNum
        | Opcode::GreaterThanEqual
        | Opcode::GreaterThanEqualNum
        | Opcode::Add
        | Opcode::AddNum
        | Opcode::Sub
        | Opcode::SubNum
        | Opcode::Mul
        | Opcode::MulNum
        | Opcode::Div
        | Opcode::DivNum
        | Opcode::Mod
        | Opcode::ModNum
        | Opcode::Concat
        | Opcode::IndexGet
        | Opcode::BranchEqual
        | Opcode::BranchEqualNum
        | Opcode::BranchNotEqual
        | Opcode::BranchNotEqualNum
        | Opcode::BranchLess
        | Opcode::BranchLessNum
        | Opcode::BranchGreater
        | Opcode::BranchGreaterNum
        | Opcode::BranchLessThanEqual
        | Opcode::BranchLessThanEqualNum
        | Opcode::BranchGreaterThanEqual
        | Opcode::BranchGreaterThanEqualNum => 3,
        Opcode::IndexSet | Opcode::SetHandler => 4,
        Opcode::StaticCall0 | Opcode::Call0 => 2,
        Opcode::StaticCall1 | Opcode::Call1 => 3,
        Opcode::StaticCall2 | Opcode::Call2 => 4,
        Opcode::TailCall0 => 1,
        Opcode::TailCall1 => 2,
        Opcode::TailCall2 => 3,
        Opcode::StaticCall | Opcode::Call | Opcode::TailCall | Opcode::CallHandler
        | Opcode::ArrayNew | Opcode::Exec => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BlockBuilder;
    use pretty_assertions::assert_eq;

    fn moves(pairs: &[(u64, u64)], temp: u64) -> Vec<(u64, u64)> {
        schedule_moves(pairs.iter().copied().collect(), temp)
    }

    #[test]
    fn chain_moves_run_far_end_first() {
        // r2 <- r1 must happen before r1 <- r0 overwrites its source.
        assert_eq!(moves(&[(1, 0), (2, 1)], 9), vec![(2, 1), (1, 0)]);
    }

    #[test]
    fn swap_breaks_through_the_temp() {
        assert_eq!(moves(&[(0, 1), (1, 0)], 9), vec![(9, 0), (0, 1), (1, 9)]);
    }

    #[test]
    fn three_cycle_uses_one_temp() {
        let out = moves(&[(0, 1), (1, 2), (2, 0)], 9);
        assert_eq!(out, vec![(9, 0), (0, 1), (1, 2), (2, 9)]);
    }

    #[test]
    fn exit_with_literal_materializes_into_scratch() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        b.set_branch(crate::ir::Branch::exit(Some(Arg::Lit(Lit::I32(42)))));
        b.finish();

        let p = emit(&blocks).unwrap();
        // No registers, so scratch slot 0 holds the literal.
        assert_eq!(p.scratch_base, 0);
        assert_eq!(p.window, 2);
        assert_eq!(
            p.code,
            vec![
                Opcode::StoreInt as u64,
                0,
                Tag::I32 as u64,
                42,
                Opcode::Exit as u64,
                0,
                Opcode::FunDone as u64,
            ]
        );
    }

    #[test]
    fn aligned_pass_lists_emit_no_moves() {
        // After allocation the pass argument and the surviving target
        // parameter share a slot, so the jump carries no move sequence.
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let r0 = b.new_reg();
        let r1 = b.new_reg();
        let t = b.new_block();
        b.add_param(t, r0);
        b.add_param(t, r1);
        b.set_branch(crate::ir::Branch::jump(t, vec![Arg::Reg(r1), Arg::Reg(r0)]));
        b.set_block(t);
        b.set_branch(crate::ir::Branch::ret(Arg::Reg(r0)));
        b.finish();
        crate::regalloc::allocate(&mut blocks).unwrap();

        let p = emit(&blocks).unwrap();
        assert_eq!(p.scratch_base, 2);
        assert_eq!(
            p.code,
            vec![
                Opcode::Jump as u64,
                2,
                Opcode::Return as u64,
                0,
                Opcode::FunDone as u64,
            ]
        );
        assert_eq!(p.info(BlockId(1)).unwrap().offset, 2);
    }

    #[test]
    fn call_literal_arguments_materialize_before_the_opcode() {
        let mut blocks = Blocks::new();
        let mut f = BlockBuilder::function(&mut blocks);
        let x = f.new_reg();
        f.add_param(f.entry(), x);
        f.set_branch(crate::ir::Branch::ret(Arg::Reg(x)));
        let identity = f.finish();

        let mut m = BlockBuilder::function(&mut blocks);
        let r = m.new_reg();
        m.emit(
            InstrOp::Call,
            Some(r),
            vec![Arg::Lit(Lit::Fun(identity)), Arg::Lit(Lit::I32(41))],
        );
        m.set_branch(crate::ir::Branch::exit(Some(Arg::Reg(r))));
        let main = m.finish();
        crate::regalloc::allocate(&mut blocks).unwrap();

        let p = emit(&blocks).unwrap();
        // The literal store precedes the call word; the operand list holds
        // only register slots.
        assert_eq!(p.info(main).unwrap().offset, 2);
        assert_eq!(
            &p.code[2..],
            &[
                Opcode::StoreInt as u64, 1, Tag::I32 as u64, 41,
                Opcode::StaticCall1 as u64, 0, 0, 1,
                Opcode::Exit as u64, 0,
                Opcode::FunDone as u64,
            ]
        );
    }

    #[test]
    fn num_specialization_needs_one_literal_tag() {
        let build = |rhs: Lit| {
            let mut blocks = Blocks::new();
            let mut b = BlockBuilder::function(&mut blocks);
            let r = b.new_reg();
            b.emit(InstrOp::Add, Some(r), vec![Arg::Lit(Lit::I32(1)), Arg::Lit(rhs)]);
            b.set_branch(crate::ir::Branch::ret(Arg::Reg(r)));
            b.finish();
            crate::regalloc::allocate(&mut blocks).unwrap();
            emit(&blocks).unwrap()
        };

        // Two stores of four words each, then the arithmetic word.
        let p = build(Lit::I32(2));
        assert_eq!(p.code[8], Opcode::AddNum as u64);
        let p = build(Lit::F64(2.0));
        assert_eq!(p.code[8], Opcode::Add as u64);
    }

    #[test]
    fn string_constants_are_interned_once() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let r0 = b.new_reg();
        let r1 = b.new_reg();
        b.emit(InstrOp::StrNew, Some(r0), vec![Arg::Lit(Lit::Str("hi".into()))]);
        b.emit(InstrOp::StrNew, Some(r1), vec![Arg::Lit(Lit::Str("hi".into()))]);
        b.set_branch(crate::ir::Branch::ret(Arg::Reg(r1)));
        b.finish();

        let p = emit(&blocks).unwrap();
        assert_eq!(p.consts.len(), 1);
    }

    #[test]
    fn conditional_else_arm_comes_first() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let r0 = b.new_reg();
        let then = b.new_block();
        let other = b.new_block();
        b.set_branch(crate::ir::Branch::bool(Arg::Reg(r0), then, other));
        b.set_block(then);
        b.set_branch(crate::ir::Branch::ret(Arg::Lit(Lit::Bool(true))));
        b.set_block(other);
        b.set_branch(crate::ir::Branch::ret(Arg::Lit(Lit::Bool(false))));
        b.finish();

        let p = emit(&blocks).unwrap();
        assert_eq!(p.code[0], Opcode::BranchTrue as u64);
        assert_eq!(p.code[1], 0);
        // Fallthrough path jumps to the else block; the patched word skips it.
        let taken = p.code[2] as usize;
        assert_eq!(p.code[3], Opcode::Jump as u64);
        assert_eq!(p.code[4] as usize, p.info(BlockId(2)).unwrap().offset);
        assert_eq!(p.code[taken], Opcode::Jump as u64);
        assert_eq!(p.code[taken + 1] as usize, p.info(BlockId(1)).unwrap().offset);
    }

    #[test]
    fn pass_arity_mismatch_is_rejected() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let r0 = b.new_reg();
        let t = b.new_block();
        b.add_param(t, r0);
        b.set_branch(crate::ir::Branch::jump(t, Vec::new()));
        b.set_block(t);
        b.set_branch(crate::ir::Branch::ret(Arg::Reg(r0)));
        b.finish();

        assert!(matches!(emit(&blocks), Err(EmitError::Malformed(0, _))));
    }
}
