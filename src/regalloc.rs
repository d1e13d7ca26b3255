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

// Per-block register allocation. Renames every virtual register used in a
// block to the lowest free physical slot, driven by a single backward scan:
//
//   1. seed slots from branch pass arguments (live at the end of the block)
//      and the branch's own test operands;
//   2. walk the instructions last to first: a destination whose register was
//      never observed is dropped (dead store), an observed one is rewritten
//      and its slot freed; operands allocate (or reuse) slots;
//   3. block parameters with no slot under the final mapping are dead on
//      entry and dropped; survivors keep their relative order.
//
// Sound without cross-block dataflow because values never outlive the block
// that defines or receives them: control only leaves through the branch, and
// all cross-block values are explicit parameters or pass arguments.

use tracing::debug;

use crate::error::AllocError;
use crate::ir::{Arg, Block, Blocks};

/// First-fit slot map over one block's registers. Capacity is the block's
/// virtual register count: an upper bound on simultaneous liveness, so a
/// free slot always exists.
struct Slots {
    /// Virtual register -> assigned physical slot.
    regs: Vec<Option<u32>>,
    used: Vec<bool>,
}

impl Slots {
    fn new(nregs: u32) -> Slots {
        Slots {
            regs: vec![None; nregs as usize],
            used: vec![false; nregs as usize],
        }
    }

    fn lookup(&self, reg: u32) -> Option<u32> {
        self.regs[reg as usize]
    }

    /// Assign the lowest-numbered free slot, or reuse the existing one.
    fn alloc(&mut self, reg: u32) -> u32 {
        if let Some(slot) = self.regs[reg as usize] {
            return slot;
        }
        let slot = self
            .used
            .iter()
            .position(|u| !u)
            .expect("at most nregs slots live");
        self.used[slot] = true;
        self.regs[reg as usize] = Some(slot as u32);
        slot as u32
    }

    /// A definition ends the register's live range going backward.
    fn free(&mut self, reg: u32) {
        if let Some(slot) = self.regs[reg as usize].take() {
            self.used[slot as usize] = false;
        }
    }
}

fn check_reg(block: &Block, reg: u32) -> Result<(), AllocError> {
    if reg >= block.nregs {
        return Err(AllocError::RegOutOfRange {
            block: block.id.0,
            reg,
            nregs: block.nregs,
        });
    }
    Ok(())
}

/// Allocate one canonical block in place. Returns the survival mask of the
/// original block parameters so the driver can compact predecessor pass
/// lists to match.
fn alloc_block(block: &mut Block) -> Result<Vec<bool>, AllocError> {
    let mut slots = Slots::new(block.nregs);

    // Branch pass arguments are live at the end of the block; they must hold
    // slots before the backward scan begins.
    for i in 0..2 {
        for arg in &mut block.branch.pass[i] {
            if let Arg::Reg(r) = arg {
                if *r >= block.nregs {
                    return Err(AllocError::RegOutOfRange {
                        block: block.id.0,
                        reg: *r,
                        nregs: block.nregs,
                    });
                }
                *r = slots.alloc(*r);
            }
        }
    }
    for arg in block.branch.args.iter_mut().flatten() {
        if let Arg::Reg(r) = arg {
            if *r >= block.nregs {
                return Err(AllocError::RegOutOfRange {
                    block: block.id.0,
                    reg: *r,
                    nregs: block.nregs,
                });
            }
            *r = slots.alloc(*r);
        }
    }

    for instr in block.instrs.iter_mut().rev() {
        if let Some(r) = instr.out {
            if r >= block.nregs {
                return Err(AllocError::RegOutOfRange {
                    block: block.id.0,
                    reg: r,
                    nregs: block.nregs,
                });
            }
            match slots.lookup(r) {
                // Never observed by anything after this point: dead store.
                // The instruction stays for its side effects.
                None => instr.out = None,
                Some(slot) => {
                    instr.out = Some(slot);
                    slots.free(r);
                }
            }
        }
        for arg in &mut instr.args {
            if let Arg::Reg(r) = arg {
                if *r >= block.nregs {
                    return Err(AllocError::RegOutOfRange {
                        block: block.id.0,
                        reg: *r,
                        nregs: block.nregs,
                    });
                }
                *r = slots.alloc(*r);
            }
        }
    }

    // Parameters with no slot under the final mapping were never read inside
    // the block nor forwarded through the branch: dead on entry.
    let mut mask = Vec::with_capacity(block.args.len());
    let mut write = Vec::with_capacity(block.args.len());
    for &param in &block.args {
        check_reg(block, param)?;
        match slots.lookup(param) {
            Some(slot) => {
                write.push(slot);
                mask.push(true);
            }
            None => mask.push(false),
        }
    }
    debug!(
        block = block.id.0,
        params = write.len(),
        dropped = mask.iter().filter(|m| !**m).count(),
        "allocated registers"
    );
    block.args = write;
    Ok(mask)
}

/// Allocate every canonical block exactly once. Entries whose stored id does
/// not equal their index are forwarding aliases and are skipped. Pass lists
/// are validated against their target's parameter count up front and
/// compacted afterwards to match dropped target parameters.
pub fn allocate(blocks: &mut Blocks) -> Result<(), AllocError> {
    let n = blocks.len();

    // Pre-allocation parameter counts, for arity validation.
    let orig_nargs: Vec<usize> = blocks.blocks.iter().map(|b| b.args.len()).collect();

    for i in 0..n {
        let block = &blocks.blocks[i];
        if block.id.0 as usize != i {
            continue;
        }
        for k in 0..2 {
            let Some(target) = block.branch.targets[k] else {
                continue;
            };
            if target.0 as usize >= n {
                return Err(AllocError::BadTarget(block.id.0, target.0));
            }
            let resolved = blocks.blocks[target.0 as usize].id;
            if resolved.0 as usize >= n {
                return Err(AllocError::BadTarget(block.id.0, resolved.0));
            }
            let expected = orig_nargs[resolved.0 as usize];
            if block.branch.pass[k].len() != expected {
                return Err(AllocError::PassArityMismatch {
                    block: block.id.0,
                    target: resolved.0,
                    passed: block.branch.pass[k].len(),
                    expected,
                });
            }
        }
    }

    let mut masks: Vec<Option<Vec<bool>>> = vec![None; n];
    for i in 0..n {
        if blocks.blocks[i].id.0 as usize != i {
            continue;
        }
        masks[i] = Some(alloc_block(&mut blocks.blocks[i])?);
    }

    // Compact pass lists to the surviving parameters of their targets.
    for i in 0..n {
        if blocks.blocks[i].id.0 as usize != i {
            continue;
        }
        for k in 0..2 {
            let Some(target) = blocks.blocks[i].branch.targets[k] else {
                continue;
            };
            let resolved = blocks.blocks[target.0 as usize].id;
            let Some(mask) = masks[resolved.0 as usize].clone() else {
                continue;
            };
            let block = &mut blocks.blocks[i];
            let old = std::mem::take(&mut block.branch.pass[k]);
            block.branch.pass[k] = old
                .into_iter()
                .zip(mask.iter())
                .filter(|(_, keep)| **keep)
                .map(|(a, _)| a)
                .collect();
        }
    }

    Ok(())
}
