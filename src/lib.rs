/*
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

//! Execution core for a small dynamically-typed language: tagged runtime
//! values over an open-addressed table, a basic-block IR with branch-argument
//! passing, a backward first-fit register allocator, and a register-windowed
//! bytecode machine with call and effect-handler frames.
//!
//! A front-end builds [`ir::Blocks`], [`compile`] lowers them to a
//! [`vm::emit::Program`], and [`vm::Vm::run`] executes an entry block.

pub mod builtins;
pub mod error;
pub mod ir;
pub mod regalloc;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{AllocError, EmitError, TypeError, VmError};
pub use ir::{Arg, BlockBuilder, BlockId, Blocks, Branch, BranchOp, InstrOp, Lit};
pub use table::Table;
pub use value::{Tag, Value};
pub use vm::emit::Program;
pub use vm::Vm;

/// Allocate registers for every canonical block, then emit bytecode.
pub fn compile(blocks: &mut Blocks) -> Result<Program, VmError> {
    regalloc::allocate(blocks)?;
    Ok(vm::emit::emit(blocks)?)
}

#[cfg(test)]
mod tests;
