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

// Error taxonomy. Two classes with different propagation rules:
//
// - `TypeError` is a user-program condition. It becomes an error-tagged
//   `Value` and flows through the language (assert, handlers); it is never a
//   Rust-level failure past the opcode that raised it.
// - `AllocError` and `VmError` are core bugs or malformed input to the core.
//   They propagate as `Result` errors and must never be converted into a
//   language-level value.

use thiserror::Error;

use crate::ir::BlockId;

/// An operation observed an operand tag outside its accepted set.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TypeError {
    pub message: String,
}

impl TypeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Register allocator precondition broken. Fatal: a wrong assignment would
/// corrupt all subsequent execution.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("block .{block}: register r{reg} out of range (nregs = {nregs})")]
    RegOutOfRange { block: u32, reg: u32, nregs: u32 },
    #[error(
        "block .{block}: branch passes {passed} values to block .{target} which takes {expected}"
    )]
    PassArityMismatch {
        block: u32,
        target: u32,
        passed: usize,
        expected: usize,
    },
    #[error("block .{0}: branch target .{1} out of range")]
    BadTarget(u32, u32),
}

/// Emission rejected malformed input. The emitter validates shape, not
/// semantics: wrong operand kinds and dangling targets stop here, everything
/// else is the allocator's or interpreter's problem.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("block .{0}: {1}")]
    Malformed(u32, String),
    #[error("branch target .{0} was never emitted")]
    MissingTarget(u32),
}

/// Fatal interpreter conditions. These indicate a compiler or core bug, not a
/// user-program condition, and are unreachable from language-level handlers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("handler opcode with no installed handler frame")]
    HandlerUnderflow,
    #[error("unknown opcode {0} at index {1}")]
    BadOpcode(u64, usize),
    #[error("truncated instruction at index {0}")]
    TruncatedCode(usize),
    #[error("register slot {0} out of range at index {1}")]
    RegOutOfRange(usize, usize),
    #[error("constant index {0} out of range")]
    BadConst(usize),
    #[error("output error: {0}")]
    Io(String),
    #[error("block .{} has no enterable code", (.0).0)]
    BadFunction(BlockId),
    #[error("register allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("emission failed: {0}")]
    Emit(#[from] EmitError),
}
