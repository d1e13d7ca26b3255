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

// End-to-end runs: build blocks with the builder, allocate and emit, execute.

use pretty_assertions::assert_eq;

use crate::builtins;
use crate::compile;
use crate::error::VmError;
use crate::ir::{Arg, BlockBuilder, BlockId, Blocks, Branch, BranchOp, InstrOp, Lit};
use crate::value::{value_eq, Value};
use crate::vm::Vm;

fn run(blocks: &mut Blocks, entry: BlockId, args: &[Value]) -> (Result<Value, VmError>, String) {
    let program = compile(blocks).unwrap();
    let mut out = Vec::new();
    let result = {
        let mut vm = Vm::with_output(program, &mut out);
        vm.run(entry, args)
    };
    (result, String::from_utf8(out).unwrap())
}

#[test]
fn exit_with_a_literal() {
    let mut blocks = Blocks::new();
    let mut b = BlockBuilder::function(&mut blocks);
    b.set_branch(Branch::exit(Some(Arg::Lit(Lit::I32(42)))));
    let entry = b.finish();

    let (result, _) = run(&mut blocks, entry, &[]);
    assert!(value_eq(&result.unwrap(), &Value::I32(42)));
}

#[test]
fn loop_sums_through_block_parameters() {
    // acc, i start at 0, 1; loop while i <= 5 adding i into acc.
    let mut blocks = Blocks::new();
    let mut b = BlockBuilder::function(&mut blocks);
    let acc = b.new_reg();
    let i = b.new_reg();
    let head = b.new_block();
    let body = b.new_block();
    let done = b.new_block();

    b.set_branch(Branch::jump(
        head,
        vec![Arg::Lit(Lit::I32(0)), Arg::Lit(Lit::I32(1))],
    ));

    b.set_block(head);
    b.add_param(head, acc);
    b.add_param(head, i);
    b.set_branch(Branch {
        op: BranchOp::Le,
        targets: [Some(body), Some(done)],
        pass: [vec![Arg::Reg(acc), Arg::Reg(i)], vec![Arg::Reg(acc)]],
        args: [Some(Arg::Reg(i)), Some(Arg::Lit(Lit::I32(5)))],
    });

    b.set_block(body);
    let acc2 = b.new_reg();
    let i2 = b.new_reg();
    b.add_param(body, acc2);
    b.add_param(body, i2);
    let acc3 = b.new_reg();
    let i3 = b.new_reg();
    b.emit(InstrOp::Add, Some(acc3), vec![Arg::Reg(acc2), Arg::Reg(i2)]);
    b.emit(InstrOp::Add, Some(i3), vec![Arg::Reg(i2), Arg::Lit(Lit::I32(1))]);
    b.set_branch(Branch::jump(head, vec![Arg::Reg(acc3), Arg::Reg(i3)]));

    b.set_block(done);
    let total = b.new_reg();
    b.add_param(done, total);
    b.set_branch(Branch::ret(Arg::Reg(total)));
    let entry = b.finish();

    let (result, _) = run(&mut blocks, entry, &[]);
    assert!(value_eq(&result.unwrap(), &Value::I32(15)));
}

#[test]
fn static_call_delivers_into_the_output_register() {
    let mut blocks = Blocks::new();

    let mut f = BlockBuilder::function(&mut blocks);
    let x = f.new_reg();
    f.add_param(f.entry(), x);
    let y = f.new_reg();
    f.emit(InstrOp::Add, Some(y), vec![Arg::Reg(x), Arg::Lit(Lit::I32(1))]);
    f.set_branch(Branch::ret(Arg::Reg(y)));
    let add_one = f.finish();

    let mut m = BlockBuilder::function(&mut blocks);
    let r = m.new_reg();
    m.emit(
        InstrOp::Call,
        Some(r),
        vec![Arg::Lit(Lit::Fun(add_one)), Arg::Lit(Lit::I32(41))],
    );
    m.set_branch(Branch::exit(Some(Arg::Reg(r))));
    let main = m.finish();

    let (result, _) = run(&mut blocks, main, &[]);
    assert!(value_eq(&result.unwrap(), &Value::I32(42)));
}

#[test]
fn tail_recursion_counts_down_in_constant_frames() {
    let mut blocks = Blocks::new();
    let mut b = BlockBuilder::function(&mut blocks);
    let n = b.new_reg();
    b.add_param(b.entry(), n);
    let again = b.new_block();
    let stop = b.new_block();
    b.set_branch(Branch {
        op: BranchOp::Le,
        targets: [Some(stop), Some(again)],
        pass: [Vec::new(), vec![Arg::Reg(n)]],
        args: [Some(Arg::Reg(n)), Some(Arg::Lit(Lit::I32(0)))],
    });

    b.set_block(again);
    let n2 = b.new_reg();
    b.add_param(again, n2);
    let m = b.new_reg();
    b.emit(InstrOp::Sub, Some(m), vec![Arg::Reg(n2), Arg::Lit(Lit::I32(1))]);
    let entry = b.entry();
    b.emit(
        InstrOp::TailCall,
        None,
        vec![Arg::Lit(Lit::Fun(entry)), Arg::Reg(m)],
    );
    // Never reached; the tail call replaces this activation.
    b.set_branch(Branch::ret(Arg::Lit(Lit::I32(-1))));

    b.set_block(stop);
    b.set_branch(Branch::ret(Arg::Lit(Lit::I32(0))));
    let entry = b.finish();

    let (result, _) = run(&mut blocks, entry, &[Value::I32(100_000)]);
    assert!(value_eq(&result.unwrap(), &Value::I32(0)));
}

#[test]
fn exec_honors_the_native_abi() {
    let mut blocks = Blocks::new();
    let mut b = BlockBuilder::function(&mut blocks);
    let f = b.new_reg();
    b.add_param(b.entry(), f);
    let r = b.new_reg();
    b.emit(
        InstrOp::Exec,
        Some(r),
        vec![Arg::Reg(f), Arg::Lit(Lit::Str("hello".into())), Arg::Lit(Lit::I32(7))],
    );
    b.set_branch(Branch::exit(Some(Arg::Reg(r))));
    let entry = b.finish();

    let (result, out) = run(&mut blocks, entry, &[Value::Ffi(builtins::print)]);
    assert_eq!(out, "hello 7\n");
    assert!(matches!(result.unwrap(), Value::Nil));
}

#[test]
fn closures_prepend_themselves_and_expose_captures() {
    let mut blocks = Blocks::new();

    // body(self, x) = self[1] + x
    let mut f = BlockBuilder::function(&mut blocks);
    let me = f.new_reg();
    let x = f.new_reg();
    f.add_param(f.entry(), me);
    f.add_param(f.entry(), x);
    let c1 = f.new_reg();
    f.emit(InstrOp::Get, Some(c1), vec![Arg::Reg(me), Arg::Lit(Lit::I32(1))]);
    let s = f.new_reg();
    f.emit(InstrOp::Add, Some(s), vec![Arg::Reg(c1), Arg::Reg(x)]);
    f.set_branch(Branch::ret(Arg::Reg(s)));
    let body = f.finish();

    let mut m = BlockBuilder::function(&mut blocks);
    let mk = m.new_reg();
    m.add_param(m.entry(), mk);
    let c = m.new_reg();
    m.emit(
        InstrOp::Exec,
        Some(c),
        vec![Arg::Reg(mk), Arg::Lit(Lit::Fun(body)), Arg::Lit(Lit::I32(100))],
    );
    let r = m.new_reg();
    m.emit(InstrOp::Call, Some(r), vec![Arg::Reg(c), Arg::Lit(Lit::I32(1))]);
    m.set_branch(Branch::exit(Some(Arg::Reg(r))));
    let main = m.finish();

    let (result, _) = run(&mut blocks, main, &[Value::Ffi(builtins::closure)]);
    assert!(value_eq(&result.unwrap(), &Value::I32(101)));
}

#[test]
fn nested_handlers_dispatch_innermost_first() {
    let mut blocks = Blocks::new();

    // Outer handler: value + 10. Inner handler: always 2.
    let mut h = BlockBuilder::function(&mut blocks);
    let p = h.new_reg();
    h.add_param(h.entry(), p);
    let q = h.new_reg();
    h.emit(InstrOp::Add, Some(q), vec![Arg::Reg(p), Arg::Lit(Lit::I32(10))]);
    h.set_branch(Branch::handler_ret(Arg::Reg(q)));
    let outer = h.finish();

    let mut h = BlockBuilder::function(&mut blocks);
    h.set_branch(Branch::handler_ret(Arg::Lit(Lit::I32(2))));
    let inner = h.finish();

    let mut m = BlockBuilder::function(&mut blocks);
    let ra = m.new_reg();
    let rb = m.new_reg();
    let resume1 = m.new_block();
    let resume2 = m.new_block();
    let bad = m.new_block();
    m.emit(
        InstrOp::SetHandler,
        Some(ra),
        vec![
            Arg::Lit(Lit::Fun(outer)),
            Arg::Lit(Lit::Fun(resume1)),
            Arg::Lit(Lit::Fun(bad)),
        ],
    );
    m.emit(
        InstrOp::SetHandler,
        Some(rb),
        vec![
            Arg::Lit(Lit::Fun(inner)),
            Arg::Lit(Lit::Fun(resume2)),
            Arg::Lit(Lit::Fun(bad)),
        ],
    );
    m.emit(InstrOp::CallHandler, None, Vec::new());
    m.set_branch(Branch::exit(Some(Arg::Lit(Lit::I32(-99)))));

    // First dispatch lands here with the inner handler's 2; send it to the
    // remaining (outer) handler.
    m.set_block(resume2);
    let v2 = m.new_reg();
    m.add_param(resume2, v2);
    m.emit(InstrOp::CallHandler, None, vec![Arg::Reg(v2)]);
    m.set_branch(Branch::exit(Some(Arg::Lit(Lit::I32(-98)))));

    m.set_block(resume1);
    let v1 = m.new_reg();
    m.add_param(resume1, v1);
    m.set_branch(Branch::exit(Some(Arg::Reg(v1))));

    m.set_block(bad);
    m.set_branch(Branch::exit(Some(Arg::Lit(Lit::I32(-1)))));
    let main = m.finish();

    let (result, _) = run(&mut blocks, main, &[]);
    assert!(value_eq(&result.unwrap(), &Value::I32(12)));
}

#[test]
fn handler_exit_unwinds_calls_made_after_install() {
    let mut blocks = Blocks::new();

    let mut h = BlockBuilder::function(&mut blocks);
    h.set_branch(Branch::handler_exit(Arg::Lit(Lit::Str("bail".into()))));
    let handler = h.finish();

    // A function whose body raises to the installed handler.
    let mut d = BlockBuilder::function(&mut blocks);
    d.emit(InstrOp::CallHandler, None, Vec::new());
    d.set_branch(Branch::ret(Arg::Lit(Lit::I32(0))));
    let deep = d.finish();

    let mut m = BlockBuilder::function(&mut blocks);
    let rh = m.new_reg();
    let resume = m.new_block();
    let escape = m.new_block();
    m.emit(
        InstrOp::SetHandler,
        Some(rh),
        vec![
            Arg::Lit(Lit::Fun(handler)),
            Arg::Lit(Lit::Fun(resume)),
            Arg::Lit(Lit::Fun(escape)),
        ],
    );
    let rd = m.new_reg();
    m.emit(InstrOp::Call, Some(rd), vec![Arg::Lit(Lit::Fun(deep))]);
    m.set_branch(Branch::exit(Some(Arg::Lit(Lit::I32(-2)))));

    m.set_block(resume);
    m.set_branch(Branch::exit(Some(Arg::Lit(Lit::I32(-3)))));

    m.set_block(escape);
    let ve = m.new_reg();
    m.add_param(escape, ve);
    m.set_branch(Branch::exit(Some(Arg::Reg(ve))));
    let main = m.finish();

    let (result, _) = run(&mut blocks, main, &[]);
    assert!(value_eq(&result.unwrap(), &Value::str("bail")));
}

#[test]
fn type_errors_halt_with_an_error_value() {
    let mut blocks = Blocks::new();
    let mut b = BlockBuilder::function(&mut blocks);
    let r = b.new_reg();
    b.emit(
        InstrOp::Add,
        Some(r),
        vec![Arg::Lit(Lit::I32(1)), Arg::Lit(Lit::Str("x".into()))],
    );
    b.set_branch(Branch::exit(Some(Arg::Reg(r))));
    let entry = b.finish();

    let (result, _) = run(&mut blocks, entry, &[]);
    assert!(matches!(result.unwrap(), Value::Error(_)));
}

#[test]
fn tables_share_by_reference_across_calls() {
    let mut blocks = Blocks::new();

    // poke(t) writes t["k"] = 9 and returns nil.
    let mut f = BlockBuilder::function(&mut blocks);
    let t = f.new_reg();
    f.add_param(f.entry(), t);
    f.emit(
        InstrOp::Set,
        None,
        vec![
            Arg::Reg(t),
            Arg::Lit(Lit::Str("k".into())),
            Arg::Lit(Lit::I32(9)),
        ],
    );
    f.set_branch(Branch::ret(Arg::Lit(Lit::Nil)));
    let poke = f.finish();

    let mut m = BlockBuilder::function(&mut blocks);
    let tm = m.new_reg();
    m.emit(InstrOp::MapNew, Some(tm), Vec::new());
    let ignored = m.new_reg();
    m.emit(
        InstrOp::Call,
        Some(ignored),
        vec![Arg::Lit(Lit::Fun(poke)), Arg::Reg(tm)],
    );
    let r = m.new_reg();
    m.emit(
        InstrOp::Get,
        Some(r),
        vec![Arg::Reg(tm), Arg::Lit(Lit::Str("k".into()))],
    );
    m.set_branch(Branch::exit(Some(Arg::Reg(r))));
    let main = m.finish();

    let (result, _) = run(&mut blocks, main, &[]);
    assert!(value_eq(&result.unwrap(), &Value::I32(9)));
}

#[test]
fn call_handler_without_a_frame_is_fatal() {
    let mut blocks = Blocks::new();
    let mut b = BlockBuilder::function(&mut blocks);
    b.emit(InstrOp::CallHandler, None, Vec::new());
    b.set_branch(Branch::exit(None));
    let entry = b.finish();

    let (result, _) = run(&mut blocks, entry, &[]);
    assert_eq!(result.unwrap_err(), VmError::HandlerUnderflow);
}

#[test]
fn running_a_non_function_block_is_fatal() {
    let mut blocks = Blocks::new();
    let id = blocks.new_block();

    let (result, _) = run(&mut blocks, id, &[]);
    assert_eq!(result.unwrap_err(), VmError::BadFunction(id));
}
