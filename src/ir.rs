// IR model: basic blocks with parameter lists (phi-like block arguments),
// ordered instruction lists, and a two-way branch terminator that can pass
// values to either successor's parameters.
//
// Virtual registers are plain u32 ids in [0, nregs). After register
// allocation the same fields hold physical slot ids; args are never re-typed,
// only re-numbered.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// A literal operand. Strings and function references are resolved to the
/// constant pool / block info table at emission.
#[derive(Clone, Debug, PartialEq)]
pub enum Lit {
    Nil,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Fun(BlockId),
}

impl Lit {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Lit::I8(_) | Lit::I16(_) | Lit::I32(_) | Lit::I64(_) | Lit::F32(_) | Lit::F64(_)
        )
    }
}

/// A tagged operand: a register reference or a literal.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Reg(u32),
    Lit(Lit),
}

impl Arg {
    pub fn reg(&self) -> Option<u32> {
        match self {
            Arg::Reg(r) => Some(*r),
            Arg::Lit(_) => None,
        }
    }
}

/// Instruction opcodes. Operands live in the instruction's `args` list, the
/// optional destination in `out`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrOp {
    /// Copy args[0] to out.
    Move,
    /// out = args[0] + 1 / - 1.
    Inc,
    Dec,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// String concatenation of args[0] and args[1].
    Concat,
    /// args[0] is the callee; the rest are call arguments.
    Call,
    /// As Call, but reuses the current frame. Must be the last instruction of
    /// its block; the branch after it never runs.
    TailCall,
    /// Single-cell aggregates (all table-backed).
    RefNew,
    BoxNew,
    /// out = string literal args[0].
    StrNew,
    /// out = table with args as elements at keys 1..=n.
    ArrNew,
    /// out = empty table.
    MapNew,
    RefGet,
    BoxGet,
    /// args[0] is the box, args[1] the value.
    BoxSet,
    /// Occupied-slot count of a table.
    Len,
    /// out = args[0][args[1]].
    Get,
    /// args[0][args[1]] = args[2].
    Set,
    /// out = tag of args[0], as i32.
    Type,
    /// Write one byte of args[0] to the output sink.
    Putchar,
    /// Install a handler frame. args: handler entry, resume block, exit block
    /// (all Lit::Fun); out receives the handler's value on resume/exit.
    SetHandler,
    /// Invoke the innermost installed handler with args. Control continues at
    /// the installer's resume or exit block, never here.
    CallHandler,
    /// Foreign-call escape: args[0] must be a native function, the rest are
    /// its arguments.
    Exec,
}

impl InstrOp {
    pub fn name(self) -> &'static str {
        match self {
            InstrOp::Move => "move",
            InstrOp::Inc => "inc",
            InstrOp::Dec => "dec",
            InstrOp::Add => "add",
            InstrOp::Sub => "sub",
            InstrOp::Mul => "mul",
            InstrOp::Div => "div",
            InstrOp::Mod => "mod",
            InstrOp::Concat => "concat",
            InstrOp::Call => "call",
            InstrOp::TailCall => "tail_call",
            InstrOp::RefNew => "ref_new",
            InstrOp::BoxNew => "box_new",
            InstrOp::StrNew => "string_new",
            InstrOp::ArrNew => "array_new",
            InstrOp::MapNew => "map_new",
            InstrOp::RefGet => "ref_get",
            InstrOp::BoxGet => "box_get",
            InstrOp::BoxSet => "box_set",
            InstrOp::Len => "length",
            InstrOp::Get => "index_get",
            InstrOp::Set => "index_set",
            InstrOp::Type => "type",
            InstrOp::Putchar => "putchar",
            InstrOp::SetHandler => "set_handler",
            InstrOp::CallHandler => "call_handler",
            InstrOp::Exec => "exec",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub op: InstrOp,
    pub out: Option<u32>,
    pub args: Vec<Arg>,
}

/// Branch tests. Target 0 is taken when the test holds; comparisons test
/// args[0] against args[1].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchOp {
    /// Unconditional jump to target 0.
    Jump,
    /// Taken when args[0] is truthy.
    Bool,
    Eq,
    Lt,
    Le,
    /// Return args[0] to the caller. No targets.
    Ret,
    /// Halt with args[0] as the program result (nil when absent). No targets.
    Exit,
    /// Pop the matching handler frame and continue at its resume block,
    /// writing args[0] to its output register. No targets.
    HandlerRet,
    /// As HandlerRet, but continue at the exit block, unwinding every call
    /// frame pushed since installation.
    HandlerExit,
}

impl BranchOp {
    pub fn name(self) -> &'static str {
        match self {
            BranchOp::Jump => "jump",
            BranchOp::Bool => "bb",
            BranchOp::Eq => "beq",
            BranchOp::Lt => "blt",
            BranchOp::Le => "ble",
            BranchOp::Ret => "ret",
            BranchOp::Exit => "exit",
            BranchOp::HandlerRet => "hret",
            BranchOp::HandlerExit => "hexit",
        }
    }
}

/// Two-way terminator. `pass[i]` forwards values to `targets[i]`'s block
/// parameters; its length must equal the target's parameter count.
#[derive(Clone, Debug)]
pub struct Branch {
    pub op: BranchOp,
    pub targets: [Option<BlockId>; 2],
    pub pass: [Vec<Arg>; 2],
    pub args: [Option<Arg>; 2],
}

impl Branch {
    pub fn jump(target: BlockId, pass: Vec<Arg>) -> Branch {
        Branch {
            op: BranchOp::Jump,
            targets: [Some(target), None],
            pass: [pass, Vec::new()],
            args: [None, None],
        }
    }

    pub fn bool(cond: Arg, then: BlockId, other: BlockId) -> Branch {
        Branch {
            op: BranchOp::Bool,
            targets: [Some(then), Some(other)],
            pass: [Vec::new(), Vec::new()],
            args: [Some(cond), None],
        }
    }

    pub fn cmp(op: BranchOp, lhs: Arg, rhs: Arg, then: BlockId, other: BlockId) -> Branch {
        Branch {
            op,
            targets: [Some(then), Some(other)],
            pass: [Vec::new(), Vec::new()],
            args: [Some(lhs), Some(rhs)],
        }
    }

    pub fn ret(value: Arg) -> Branch {
        Branch {
            op: BranchOp::Ret,
            targets: [None, None],
            pass: [Vec::new(), Vec::new()],
            args: [Some(value), None],
        }
    }

    pub fn exit(value: Option<Arg>) -> Branch {
        Branch {
            op: BranchOp::Exit,
            targets: [None, None],
            pass: [Vec::new(), Vec::new()],
            args: [value, None],
        }
    }

    pub fn handler_ret(value: Arg) -> Branch {
        Branch {
            op: BranchOp::HandlerRet,
            targets: [None, None],
            pass: [Vec::new(), Vec::new()],
            args: [Some(value), None],
        }
    }

    pub fn handler_exit(value: Arg) -> Branch {
        Branch {
            op: BranchOp::HandlerExit,
            targets: [None, None],
            pass: [Vec::new(), Vec::new()],
            args: [Some(value), None],
        }
    }
}

/// A basic block. `id` equal to the block's index in the owning table marks
/// it canonical; other entries are forwarding aliases and are skipped by the
/// allocator and the emitter.
#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    /// Block parameters: virtual register ids before allocation, physical
    /// slots after.
    pub args: Vec<u32>,
    pub instrs: Vec<Instr>,
    pub branch: Branch,
    /// Function entry block: callable, gets its own frame.
    pub isfunc: bool,
    /// Virtual register count; upper bound on the physical slots used.
    pub nregs: u32,
}

/// Flat block table. The front-end appends fresh blocks here ("compile more");
/// the allocator and emitter walk it by index.
#[derive(Clone, Debug, Default)]
pub struct Blocks {
    pub blocks: Vec<Block>,
    /// Entry block of the most recently compiled chunk.
    pub entry: BlockId,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0 as usize)
    }

    /// Append a fresh empty block and return its id.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            args: Vec::new(),
            instrs: Vec::new(),
            branch: Branch::exit(None),
            isfunc: false,
            nregs: 0,
        });
        id
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }
}

/// Builder over one function's worth of blocks, for front-ends and tests.
pub struct BlockBuilder<'a> {
    blocks: &'a mut Blocks,
    cur: BlockId,
    next_reg: u32,
    owned: Vec<BlockId>,
}

impl<'a> BlockBuilder<'a> {
    /// Start a new function entry block.
    pub fn function(blocks: &'a mut Blocks) -> BlockBuilder<'a> {
        let cur = blocks.new_block();
        blocks.block_mut(cur).isfunc = true;
        BlockBuilder {
            blocks,
            cur,
            next_reg: 0,
            owned: vec![cur],
        }
    }

    pub fn entry(&self) -> BlockId {
        self.owned[0]
    }

    pub fn cur_block(&self) -> BlockId {
        self.cur
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = self.blocks.new_block();
        self.owned.push(id);
        id
    }

    pub fn set_block(&mut self, id: BlockId) {
        self.cur = id;
    }

    pub fn new_reg(&mut self) -> u32 {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    /// Declare `reg` as a parameter of `block`.
    pub fn add_param(&mut self, block: BlockId, reg: u32) {
        self.blocks.block_mut(block).args.push(reg);
    }

    pub fn emit(&mut self, op: InstrOp, out: Option<u32>, args: Vec<Arg>) {
        let cur = self.cur;
        self.blocks.block_mut(cur).instrs.push(Instr { op, out, args });
    }

    pub fn set_branch(&mut self, branch: Branch) {
        let cur = self.cur;
        self.blocks.block_mut(cur).branch = branch;
    }

    /// Stamp the final virtual register count onto every block built here.
    pub fn finish(self) -> BlockId {
        for id in &self.owned {
            self.blocks.block_mut(*id).nregs = self.next_reg;
        }
        self.owned[0]
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Reg(r) => write!(f, "r{}", r),
            Arg::Lit(Lit::Nil) => write!(f, "nil"),
            Arg::Lit(Lit::Bool(b)) => write!(f, "{}", b),
            Arg::Lit(Lit::I8(n)) => write!(f, "{}i8", n),
            Arg::Lit(Lit::I16(n)) => write!(f, "{}i16", n),
            Arg::Lit(Lit::I32(n)) => write!(f, "{}", n),
            Arg::Lit(Lit::I64(n)) => write!(f, "{}i64", n),
            Arg::Lit(Lit::F32(n)) => write!(f, "{}f32", n),
            Arg::Lit(Lit::F64(n)) => write!(f, "{}f64", n),
            Arg::Lit(Lit::Str(s)) => write!(f, "{:?}", s),
            Arg::Lit(Lit::Fun(b)) => write!(f, ".{}", b.0),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.isfunc {
            write!(f, "func ")?;
        }
        write!(f, ".{}(", self.id.0)?;
        for (i, a) in self.args.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "r{}", a)?;
        }
        writeln!(f, ")")?;
        for instr in &self.instrs {
            write!(f, "  ")?;
            if let Some(out) = instr.out {
                write!(f, "r{} <- ", out)?;
            }
            write!(f, "{}", instr.op.name())?;
            for a in &instr.args {
                write!(f, " {}", a)?;
            }
            writeln!(f)?;
        }
        write!(f, "  {}", self.branch.op.name())?;
        for a in self.branch.args.iter().flatten() {
            write!(f, " {}", a)?;
        }
        for (i, t) in self.branch.targets.iter().enumerate() {
            let Some(t) = t else { continue };
            write!(f, " .{}(", t.0)?;
            for (j, a) in self.branch.pass[i].iter().enumerate() {
                if j != 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", a)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_numbers_blocks_canonically() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let next = b.new_block();
        b.set_branch(Branch::jump(next, Vec::new()));
        b.set_block(next);
        b.set_branch(Branch::exit(None));
        b.finish();
        for (i, block) in blocks.blocks.iter().enumerate() {
            assert_eq!(block.id.0 as usize, i);
        }
        assert!(blocks.blocks[0].isfunc);
        assert!(!blocks.blocks[1].isfunc);
    }

    #[test]
    fn finish_stamps_nregs_on_all_blocks() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let r0 = b.new_reg();
        let r1 = b.new_reg();
        let next = b.new_block();
        b.emit(InstrOp::Add, Some(r1), vec![Arg::Reg(r0), Arg::Reg(r0)]);
        b.set_branch(Branch::jump(next, vec![Arg::Reg(r1)]));
        b.set_block(next);
        b.finish();
        assert_eq!(blocks.blocks[0].nregs, 2);
        assert_eq!(blocks.blocks[1].nregs, 2);
    }

    #[test]
    fn display_shows_params_and_branch() {
        let mut blocks = Blocks::new();
        let mut b = BlockBuilder::function(&mut blocks);
        let r0 = b.new_reg();
        b.add_param(b.entry(), r0);
        b.set_branch(Branch::ret(Arg::Reg(r0)));
        b.finish();
        let s = blocks.blocks[0].to_string();
        assert!(s.contains("func .0(r0)"));
        assert!(s.contains("ret r0"));
    }
}
