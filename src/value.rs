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

// Tagged runtime values. One enum carries both the tag and the payload, so the
// two can never disagree; `Tag` names the discriminants for code that only
// cares about the kind of a value (equality fast path, TYPE opcode).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::TypeError;
use crate::ir::BlockId;
use crate::table::{Table, TableRef};

/// Native-function ABI: arguments in, result written back to slot 0.
/// No slot other than 0 is meaningful after the call returns.
pub type NativeFn = fn(&mut crate::builtins::NativeCtx<'_>, &mut [Value]);

/// A closure record: a function reference plus its captured values.
#[derive(Clone, Debug)]
pub struct Closure {
    pub entry: BlockId,
    pub captured: Vec<Value>,
}

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Immutable byte string.
    Str(Rc<str>),
    /// Mutable byte buffer.
    Buffer(Rc<RefCell<Vec<u8>>>),
    Table(TableRef),
    Closure(Rc<Closure>),
    /// A compiled function, by entry block id.
    Fun(BlockId),
    Ffi(NativeFn),
    /// A language-level error carrying its message.
    Error(Rc<str>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Nil,
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Buffer,
    Table,
    Closure,
    Fun,
    Ffi,
    Error,
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Nil => Tag::Nil,
            Value::Bool(_) => Tag::Bool,
            Value::I8(_) => Tag::I8,
            Value::I16(_) => Tag::I16,
            Value::I32(_) => Tag::I32,
            Value::I64(_) => Tag::I64,
            Value::F32(_) => Tag::F32,
            Value::F64(_) => Tag::F64,
            Value::Str(_) => Tag::Str,
            Value::Buffer(_) => Tag::Buffer,
            Value::Table(_) => Tag::Table,
            Value::Closure(_) => Tag::Closure,
            Value::Fun(_) => Tag::Fun,
            Value::Ffi(_) => Tag::Ffi,
            Value::Error(_) => Tag::Error,
        }
    }

    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn error(msg: impl Into<Rc<str>>) -> Value {
        Value::Error(msg.into())
    }

    pub fn table(t: Table) -> Value {
        Value::Table(Rc::new(RefCell::new(t)))
    }

    pub fn is_numeric(&self) -> bool {
        self.tag().is_numeric()
    }

    /// True for values the language treats as false: nil and false.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Narrow/widen a numeric value to i64. Any non-numeric tag is a type error.
    pub fn to_i64(&self) -> Result<i64, TypeError> {
        match *self {
            Value::I8(n) => Ok(n as i64),
            Value::I16(n) => Ok(n as i64),
            Value::I32(n) => Ok(n as i64),
            Value::I64(n) => Ok(n),
            Value::F32(n) => Ok(n as i64),
            Value::F64(n) => Ok(n as i64),
            _ => Err(TypeError::new(format!(
                "cannot convert a {} value to an integer",
                self.tag().name()
            ))),
        }
    }

    /// Construct a numeric value of the requested tag from an i64, truncating
    /// as needed.
    pub fn from_i64(tag: Tag, n: i64) -> Result<Value, TypeError> {
        match tag {
            Tag::I8 => Ok(Value::I8(n as i8)),
            Tag::I16 => Ok(Value::I16(n as i16)),
            Tag::I32 => Ok(Value::I32(n as i32)),
            Tag::I64 => Ok(Value::I64(n)),
            Tag::F32 => Ok(Value::F32(n as f32)),
            Tag::F64 => Ok(Value::F64(n as f64)),
            _ => Err(TypeError::new(format!(
                "cannot make a {} value from an integer",
                tag.name()
            ))),
        }
    }

    /// Classification used by the `type` builtin.
    pub fn type_name(&self) -> &'static str {
        match self.tag() {
            Tag::Nil => "nil",
            Tag::Bool => "boolean",
            Tag::I8 | Tag::I16 | Tag::I32 | Tag::I64 | Tag::F32 | Tag::F64 => "number",
            Tag::Str => "string",
            Tag::Buffer => "buffer",
            Tag::Table => "table",
            Tag::Closure | Tag::Fun | Tag::Ffi => "function",
            Tag::Error => "string",
        }
    }
}

impl Tag {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Tag::I8 | Tag::I16 | Tag::I32 | Tag::I64 | Tag::F32 | Tag::F64
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Nil => "nil",
            Tag::Bool => "bool",
            Tag::I8 => "i8",
            Tag::I16 => "i16",
            Tag::I32 => "i32",
            Tag::I64 => "i64",
            Tag::F32 => "f32",
            Tag::F64 => "f64",
            Tag::Str => "string",
            Tag::Buffer => "buffer",
            Tag::Table => "table",
            Tag::Closure => "closure",
            Tag::Fun => "fun",
            Tag::Ffi => "ffi",
            Tag::Error => "error",
        }
    }
}

/// Value equality. Tag-strict: values of different tags are never equal, even
/// across numeric widths (an I32 5 is not an I64 5). Strings and errors
/// compare by bytes; tables, buffers and closures by identity; native
/// functions by function pointer.
pub fn value_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::I8(a), Value::I8(b)) => a == b,
        (Value::I16(a), Value::I16(b)) => a == b,
        (Value::I32(a), Value::I32(b)) => a == b,
        (Value::I64(a), Value::I64(b)) => a == b,
        (Value::F32(a), Value::F32(b)) => a == b,
        (Value::F64(a), Value::F64(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Buffer(a), Value::Buffer(b)) => Rc::ptr_eq(a, b),
        (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
        (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
        (Value::Fun(a), Value::Fun(b)) => a == b,
        (Value::Ffi(a), Value::Ffi(b)) => *a as usize == *b as usize,
        (Value::Error(a), Value::Error(b)) => a == b,
        _ => false,
    }
}

/// Hash consistent with `value_eq`, used by the table's open addressing.
/// Floats hash by bit pattern; identity-compared values hash by address.
pub fn value_hash(v: &Value) -> u64 {
    // FNV-1a over a tag byte and the payload bytes.
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    fn mix(mut h: u64, bytes: &[u8]) -> u64 {
        for &b in bytes {
            h ^= b as u64;
            h = h.wrapping_mul(PRIME);
        }
        h
    }

    let h = mix(OFFSET, &[v.tag() as u8]);
    match v {
        Value::Nil => h,
        Value::Bool(b) => mix(h, &[*b as u8]),
        Value::I8(n) => mix(h, &n.to_le_bytes()),
        Value::I16(n) => mix(h, &n.to_le_bytes()),
        Value::I32(n) => mix(h, &n.to_le_bytes()),
        Value::I64(n) => mix(h, &n.to_le_bytes()),
        Value::F32(n) => mix(h, &n.to_bits().to_le_bytes()),
        Value::F64(n) => mix(h, &n.to_bits().to_le_bytes()),
        Value::Str(s) => mix(h, s.as_bytes()),
        Value::Error(s) => mix(h, s.as_bytes()),
        Value::Buffer(b) => mix(h, &(Rc::as_ptr(b) as usize).to_le_bytes()),
        Value::Table(t) => mix(h, &(Rc::as_ptr(t) as usize).to_le_bytes()),
        Value::Closure(c) => mix(h, &(Rc::as_ptr(c) as usize).to_le_bytes()),
        Value::Fun(b) => mix(h, &b.0.to_le_bytes()),
        Value::Ffi(f) => mix(h, &(*f as usize).to_le_bytes()),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I8(n) => write!(f, "{}i8", n),
            Value::I16(n) => write!(f, "{}i16", n),
            Value::I32(n) => write!(f, "{}i32", n),
            Value::I64(n) => write!(f, "{}i64", n),
            Value::F32(n) => write!(f, "{}f32", n),
            Value::F64(n) => write!(f, "{}f64", n),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Buffer(b) => write!(f, "<buffer: {:p}>", Rc::as_ptr(b)),
            Value::Table(t) => write!(f, "<table: {:p}>", Rc::as_ptr(t)),
            Value::Closure(c) => write!(f, "<function: {:p}>", Rc::as_ptr(c)),
            Value::Fun(b) => write!(f, "<code: .{}>", b.0),
            Value::Ffi(p) => write!(f, "<function: {:p}>", *p as *const ()),
            Value::Error(s) => write!(f, "error({:?})", s),
        }
    }
}

/// The `tostring` rendering: scalars print plainly, heap values by kind and
/// address.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::I8(n) => write!(f, "{}", n),
            Value::I16(n) => write!(f, "{}", n),
            Value::I32(n) => write!(f, "{}", n),
            Value::I64(n) => write!(f, "{}", n),
            Value::F32(n) => write!(f, "{}", n),
            Value::F64(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Buffer(b) => write!(f, "<buffer: {:p}>", Rc::as_ptr(b)),
            Value::Table(t) => write!(f, "<table: {:p}>", Rc::as_ptr(t)),
            Value::Closure(c) => write!(f, "<function: {:p}>", Rc::as_ptr(c)),
            Value::Fun(b) => write!(f, "<code: .{}>", b.0),
            Value::Ffi(p) => write!(f, "<function: {:p}>", *p as *const ()),
            Value::Error(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_tag_strict() {
        assert!(value_eq(&Value::I32(5), &Value::I32(5)));
        assert!(!value_eq(&Value::I32(5), &Value::I64(5)));
        assert!(!value_eq(&Value::I32(0), &Value::Nil));
        assert!(value_eq(&Value::str("abc"), &Value::str("abc")));
        assert!(!value_eq(&Value::str("abc"), &Value::str("abd")));
    }

    #[test]
    fn tables_compare_by_identity() {
        let a = Value::table(Table::new());
        let b = Value::table(Table::new());
        assert!(value_eq(&a, &a.clone()));
        assert!(!value_eq(&a, &b));
    }

    #[test]
    fn to_i64_narrows_and_widens() {
        assert_eq!(Value::I8(-3).to_i64().unwrap(), -3);
        assert_eq!(Value::F64(7.9).to_i64().unwrap(), 7);
        assert!(Value::str("x").to_i64().is_err());
    }

    #[test]
    fn from_i64_truncates() {
        let v = Value::from_i64(Tag::I8, 0x1_7f).unwrap();
        assert!(value_eq(&v, &Value::I8(0x7f)));
        assert!(Value::from_i64(Tag::Str, 0).is_err());
    }

    #[test]
    fn hash_agrees_with_eq_for_strings() {
        let a = Value::str("key");
        let b = Value::str("key");
        assert_eq!(value_hash(&a), value_hash(&b));
    }

    #[test]
    fn type_names_group_numerics() {
        assert_eq!(Value::I16(1).type_name(), "number");
        assert_eq!(Value::F32(1.0).type_name(), "number");
        assert_eq!(Value::Fun(BlockId(0)).type_name(), "function");
        assert_eq!(Value::Nil.type_name(), "nil");
    }
}
