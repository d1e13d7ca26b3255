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

// The opcode set. Numeric values are the wire contract between the emitter
// and the interpreter: previously compiled code stays valid only if this
// numbering never changes. The low tier ends at `MAX1`; values up to
// `MAX2P` (128) are reserved for a second tier.
//
// `*_NUM` forms exist so the interpreter can skip tag dispatch when the
// compiler already proved both operands share a numeric tag. The generic
// form always tag-checks and raises a type error on mismatch; the
// specialized form assumes the precondition.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Exit = 0,
    StoreReg,
    StoreNone,
    StoreBool,
    StoreInt,
    StoreFun,
    FunDone,
    Equal,
    EqualNum,
    NotEqual,
    NotEqualNum,
    Less,
    LessNum,
    Greater,
    GreaterNum,
    LessThanEqual,
    LessThanEqualNum,
    GreaterThanEqual,
    GreaterThanEqualNum,
    Jump,
    BranchFalse,
    BranchTrue,
    BranchEqual,
    BranchEqualNum,
    BranchNotEqual,
    BranchNotEqualNum,
    BranchLess,
    BranchLessNum,
    BranchGreater,
    BranchGreaterNum,
    BranchLessThanEqual,
    BranchLessThanEqualNum,
    BranchGreaterThanEqual,
    BranchGreaterThanEqualNum,
    Inc,
    IncNum,
    Dec,
    DecNum,
    Add,
    AddNum,
    Sub,
    SubNum,
    Mul,
    MulNum,
    Div,
    DivNum,
    Mod,
    ModNum,
    Concat,
    StaticCall0,
    StaticCall1,
    StaticCall2,
    StaticCall,
    TailCall0,
    TailCall1,
    TailCall2,
    TailCall,
    Call0,
    Call1,
    Call2,
    Call,
    Return,
    Putchar,
    RefNew,
    BoxNew,
    StringNew,
    ArrayNew,
    MapNew,
    RefGet,
    BoxGet,
    BoxSet,
    Length,
    IndexGet,
    IndexSet,
    Type,
    CallHandler,
    SetHandler,
    ReturnHandler,
    ExitHandler,
    Exec,
}

/// One past the last low-tier opcode.
pub const MAX1: u8 = Opcode::Exec as u8 + 1;
/// Start of the reserved second tier.
pub const MAX2P: u8 = 128;

const OPCODES: [Opcode; MAX1 as usize] = [
    Opcode::Exit,
    Opcode::StoreReg,
    Opcode::StoreNone,
    Opcode::StoreBool,
    Opcode::StoreInt,
    Opcode::StoreFun,
    Opcode::FunDone,
    Opcode::Equal,
    Opcode::EqualNum,
    Opcode::NotEqual,
    Opcode::NotEqualNum,
    Opcode::Less,
    Opcode::LessNum,
    Opcode::Greater,
    Opcode::GreaterNum,
    Opcode::LessThanEqual,
    Opcode::LessThanEqualNum,
    Opcode::GreaterThanEqual,
    Opcode::GreaterThanEqualNum,
    Opcode::Jump,
    Opcode::BranchFalse,
    Opcode::BranchTrue,
    Opcode::BranchEqual,
    Opcode::BranchEqualNum,
    Opcode::BranchNotEqual,
    Opcode::BranchNotEqualNum,
    Opcode::BranchLess,
    Opcode::BranchLessNum,
    Opcode::BranchGreater,
    Opcode::BranchGreaterNum,
    Opcode::BranchLessThanEqual,
    Opcode::BranchLessThanEqualNum,
    Opcode::BranchGreaterThanEqual,
    Opcode::BranchGreaterThanEqualNum,
    Opcode::Inc,
    Opcode::IncNum,
    Opcode::Dec,
    Opcode::DecNum,
    Opcode::Add,
    Opcode::AddNum,
    Opcode::Sub,
    Opcode::SubNum,
    Opcode::Mul,
    Opcode::MulNum,
    Opcode::Div,
    Opcode::DivNum,
    Opcode::Mod,
    Opcode::ModNum,
    Opcode::Concat,
    Opcode::StaticCall0,
    Opcode::StaticCall1,
    Opcode::StaticCall2,
    Opcode::StaticCall,
    Opcode::TailCall0,
    Opcode::TailCall1,
    Opcode::TailCall2,
    Opcode::TailCall,
    Opcode::Call0,
    Opcode::Call1,
    Opcode::Call2,
    Opcode::Call,
    Opcode::Return,
    Opcode::Putchar,
    Opcode::RefNew,
    Opcode::BoxNew,
    Opcode::StringNew,
    Opcode::ArrayNew,
    Opcode::MapNew,
    Opcode::RefGet,
    Opcode::BoxGet,
    Opcode::BoxSet,
    Opcode::Length,
    Opcode::IndexGet,
    Opcode::IndexSet,
    Opcode::Type,
    Opcode::CallHandler,
    Opcode::SetHandler,
    Opcode::ReturnHandler,
    Opcode::ExitHandler,
    Opcode::Exec,
];

/// Mnemonics, for the disassembler and trace output.
const NAMES: [&str; MAX1 as usize] = [
    "exit",
    "store_reg",
    "store_none",
    "store_bool",
    "store_int",
    "store_fun",
    "fun_done",
    "equal",
    "equal_num",
    "not_equal",
    "not_equal_num",
    "less",
    "less_num",
    "greater",
    "greater_num",
    "less_than_equal",
    "less_than_equal_num",
    "greater_than_equal",
    "greater_than_equal_num",
    "jump",
    "branch_false",
    "branch_true",
    "branch_equal",
    "branch_equal_num",
    "branch_not_equal",
    "branch_not_equal_num",
    "branch_less",
    "branch_less_num",
    "branch_greater",
    "branch_greater_num",
    "branch_less_than_equal",
    "branch_less_than_equal_num",
    "branch_greater_than_equal",
    "branch_greater_than_equal_num",
    "inc",
    "inc_num",
    "dec",
    "dec_num",
    "add",
    "add_num",
    "sub",
    "sub_num",
    "mul",
    "mul_num",
    "div",
    "div_num",
    "mod",
    "mod_num",
    "concat",
    "static_call0",
    "static_call1",
    "static_call2",
    "static_call",
    "tail_call0",
    "tail_call1",
    "tail_call2",
    "tail_call",
    "call0",
    "call1",
    "call2",
    "call",
    "return",
    "putchar",
    "ref_new",
    "box_new",
    "string_new",
    "array_new",
    "map_new",
    "ref_get",
    "box_get",
    "box_set",
    "length",
    "index_get",
    "index_set",
    "type",
    "call_handler",
    "set_handler",
    "return_handler",
    "exit_handler",
    "exec",
];

impl Opcode {
    pub fn from_word(word: u64) -> Option<Opcode> {
        OPCODES.get(word as usize).copied()
    }

    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_matches_the_wire_contract() {
        // Spot checks against the frozen numbering.
        assert_eq!(Opcode::Exit as u8, 0);
        assert_eq!(Opcode::StoreInt as u8, 4);
        assert_eq!(Opcode::Jump as u8, 19);
        assert_eq!(Opcode::Add as u8, 38);
        assert_eq!(Opcode::Concat as u8, 48);
        assert_eq!(Opcode::Return as u8, 61);
        assert_eq!(Opcode::Type as u8, 74);
        assert_eq!(Opcode::Exec as u8, 79);
        assert!(MAX1 <= MAX2P);
    }

    #[test]
    fn round_trips_through_words() {
        for i in 0..MAX1 {
            let op = Opcode::from_word(i as u64).unwrap();
            assert_eq!(op as u8, i);
        }
        assert!(Opcode::from_word(MAX1 as u64).is_none());
    }

    #[test]
    fn names_cover_every_opcode() {
        assert_eq!(Opcode::Exit.name(), "exit");
        assert_eq!(Opcode::AddNum.name(), "add_num");
        assert_eq!(Opcode::Exec.name(), "exec");
    }
}
