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

// The native-function surface. Every builtin follows one ABI: arguments come
// in through a mutable slice, the single result goes back into slot 0, and
// no other slot means anything after the call. A builtin that wants to stop
// the whole run sets `ctx.halt` instead of writing a result.

use std::io;
use std::rc::Rc;

use crate::value::{Closure, NativeFn, Value};

/// What a native function sees of the machine: the output sink, and a way to
/// end the run.
pub struct NativeCtx<'a> {
    pub out: &'a mut dyn io::Write,
    /// Set to halt the run with this value as the program result.
    pub halt: Option<Value>,
}

/// Render every argument and write them to the output sink, newline after.
/// Output failures are swallowed; print has no language-level error path.
pub fn print(ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    let mut line = String::new();
    for (i, v) in args.iter().enumerate() {
        if i != 0 {
            line.push(' ');
        }
        line.push_str(&v.to_string());
    }
    line.push('\n');
    let _ = ctx.out.write_all(line.as_bytes());
    args[0] = Value::Nil;
}

pub fn tostring(_ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    args[0] = Value::str(args[0].to_string());
}

/// The `type` builtin: a coarse name, numerics grouped as "number".
pub fn type_of(_ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    args[0] = Value::str(args[0].type_name());
}

/// Falsy first argument produces an error value carrying the second argument
/// as the message; truthy passes the value through.
pub fn assert(_ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    if !args[0].truthy() {
        let msg = match args.get(1) {
            Some(m) => m.to_string(),
            None => "assertion failed".to_string(),
        };
        args[0] = Value::error(msg);
    }
}

/// Fold concatenation over every argument.
pub fn concat(_ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    let mut acc = args[0].clone();
    for v in &args[1..] {
        match crate::vm::concat(&acc, v) {
            Ok(next) => acc = next,
            Err(e) => {
                args[0] = Value::error(e.message);
                return;
            }
        }
    }
    args[0] = acc;
}

/// Build a closure from a function reference and its captured values. Calling
/// the result passes the closure itself as argument zero; captures read back
/// through indices 1..=n.
pub fn closure(_ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    let entry = match args[0] {
        Value::Fun(b) => b,
        _ => {
            args[0] = Value::error(format!(
                "closure needs a function, got {}",
                args[0].tag().name()
            ));
            return;
        }
    };
    let captured = args[1..].to_vec();
    args[0] = Value::Closure(Rc::new(Closure { entry, captured }));
}

/// End the run immediately. The first argument becomes the program result.
pub fn os_exit(ctx: &mut NativeCtx<'_>, args: &mut [Value]) {
    ctx.halt = Some(args[0].clone());
}

/// Name-to-function table for front-ends resolving builtin references.
pub fn registry() -> Vec<(&'static str, NativeFn)> {
    vec![
        ("print", print as NativeFn),
        ("tostring", tostring),
        ("type", type_of),
        ("assert", assert),
        ("concat", concat),
        ("closure", closure),
        ("os.exit", os_exit),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_eq;

    fn call(f: NativeFn, mut args: Vec<Value>) -> (Value, Vec<u8>, Option<Value>) {
        let mut out = Vec::new();
        let mut ctx = NativeCtx {
            out: &mut out,
            halt: None,
        };
        if args.is_empty() {
            args.push(Value::Nil);
        }
        f(&mut ctx, &mut args);
        let halt = ctx.halt;
        (args.swap_remove(0), out, halt)
    }

    #[test]
    fn print_writes_all_arguments() {
        let (result, out, _) = call(print, vec![Value::str("x ="), Value::I32(3)]);
        assert_eq!(out, b"x = 3\n");
        assert!(matches!(result, Value::Nil));
    }

    #[test]
    fn result_always_lands_in_slot_zero() {
        let (r, _, _) = call(tostring, vec![Value::I64(12), Value::I64(99)]);
        assert!(value_eq(&r, &Value::str("12")));
        let (r, _, _) = call(type_of, vec![Value::F32(1.0)]);
        assert!(value_eq(&r, &Value::str("number")));
    }

    #[test]
    fn assert_passes_truthy_and_errors_falsy() {
        let (r, _, _) = call(assert, vec![Value::I32(0)]);
        assert!(value_eq(&r, &Value::I32(0)));
        let (r, _, _) = call(assert, vec![Value::Bool(false), Value::str("boom")]);
        assert!(matches!(r, Value::Error(m) if &*m == "boom"));
    }

    #[test]
    fn concat_folds_left_to_right() {
        let (r, _, _) = call(
            concat,
            vec![Value::str("a"), Value::I32(1), Value::str("b")],
        );
        assert!(value_eq(&r, &Value::str("a1b")));
    }

    #[test]
    fn closure_keeps_captures_in_order() {
        let (r, _, _) = call(
            closure,
            vec![
                Value::Fun(crate::ir::BlockId(4)),
                Value::I32(10),
                Value::I32(20),
            ],
        );
        match r {
            Value::Closure(c) => {
                assert_eq!(c.entry, crate::ir::BlockId(4));
                assert!(value_eq(&c.captured[0], &Value::I32(10)));
                assert!(value_eq(&c.captured[1], &Value::I32(20)));
            }
            other => panic!("expected a closure, got {:?}", other),
        }
    }

    #[test]
    fn os_exit_requests_a_halt() {
        let (_, _, halt) = call(os_exit, vec![Value::I32(2)]);
        assert!(value_eq(&halt.unwrap(), &Value::I32(2)));
    }
}
