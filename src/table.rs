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

// Open-addressed table keyed and valued by runtime values. The sole heap
// aggregate of the language: records, arrays, boxes and reference cells are
// all tables. Shared by reference; a table is never copied on assignment.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::{value_eq, value_hash, Value};

/// Shared handle to a table. Mutation through one handle is immediately
/// visible through every other handle.
pub type TableRef = Rc<RefCell<Table>>;

/// A key/value slot. A pair whose key is `Nil` marks an empty slot; an
/// occupied slot never has a `Nil` key.
#[derive(Clone, Debug)]
pub struct Pair {
    pub key: Value,
    pub val: Value,
}

impl Pair {
    fn empty() -> Pair {
        Pair {
            key: Value::Nil,
            val: Value::Nil,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self.key, Value::Nil)
    }
}

/// Capacity for a size-class index. The sequence doubles and never shrinks.
fn class_cap(alloc: u8) -> usize {
    8usize << alloc
}

#[derive(Clone, Debug, Default)]
pub struct Table {
    pairs: Vec<Pair>,
    used: u32,
    alloc: u8,
}

impl Table {
    pub fn new() -> Table {
        Table {
            pairs: Vec::new(),
            used: 0,
            alloc: 0,
        }
    }

    pub fn with_ref(self) -> TableRef {
        Rc::new(RefCell::new(self))
    }

    /// Number of occupied slots.
    pub fn len(&self) -> u32 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Slot capacity of the current size class.
    pub fn capacity(&self) -> usize {
        self.pairs.len()
    }

    /// Probe for `key`. A miss is absence, never an error.
    pub fn get(&self, key: &Value) -> Option<&Pair> {
        if self.pairs.is_empty() || matches!(key, Value::Nil) {
            return None;
        }
        let cap = self.pairs.len();
        let start = value_hash(key) as usize % cap;
        for i in 0..cap {
            let slot = &self.pairs[(start + i) % cap];
            if slot.is_empty() {
                return None;
            }
            if value_eq(&slot.key, key) {
                return Some(slot);
            }
        }
        None
    }

    /// Insert or overwrite. Overwrites in place on key match; otherwise takes
    /// the first empty slot, growing and rehashing first if the table is full.
    /// A grow invalidates any previously probed slot; callers must re-probe
    /// after a set that could have grown the table.
    ///
    /// A `Nil` key is a caller bug; the VM rejects it before reaching here.
    pub fn set(&mut self, key: Value, val: Value) {
        debug_assert!(!matches!(key, Value::Nil), "nil table key");
        if self.pairs.is_empty() || self.used as usize == self.pairs.len() {
            self.grow();
        }
        let cap = self.pairs.len();
        let start = value_hash(&key) as usize % cap;
        for i in 0..cap {
            let idx = (start + i) % cap;
            if self.pairs[idx].is_empty() {
                self.pairs[idx] = Pair { key, val };
                self.used += 1;
                return;
            }
            if value_eq(&self.pairs[idx].key, &key) {
                self.pairs[idx].val = val;
                return;
            }
        }
        // Full tables grow before probing, so an insert always finds a slot.
        unreachable!("table probe exhausted");
    }

    /// Bulk variant for opcodes that already hold a constructed pair.
    pub fn set_pair(&mut self, pair: Pair) {
        self.set(pair.key, pair.val);
    }

    /// Bulk lookup: returns the stored pair for `key`, or a pair with a nil
    /// value when absent.
    pub fn get_pair(&self, key: &Value) -> Pair {
        match self.get(key) {
            Some(p) => p.clone(),
            None => Pair {
                key: key.clone(),
                val: Value::Nil,
            },
        }
    }

    fn grow(&mut self) {
        let next = if self.pairs.is_empty() { 0 } else { self.alloc + 1 };
        let cap = class_cap(next);
        let old = std::mem::replace(&mut self.pairs, vec![Pair::empty(); cap]);
        self.alloc = next;
        self.used = 0;
        for pair in old {
            if !pair.is_empty() {
                self.set(pair.key, pair.val);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_eq;

    #[test]
    fn set_then_get_is_last_write_wins() {
        let mut t = Table::new();
        t.set(Value::str("a"), Value::I32(1));
        t.set(Value::str("a"), Value::I32(2));
        let p = t.get(&Value::str("a")).unwrap();
        assert!(value_eq(&p.val, &Value::I32(2)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn miss_is_absence() {
        let mut t = Table::new();
        assert!(t.get(&Value::str("missing")).is_none());
        t.set(Value::I32(1), Value::Bool(true));
        assert!(t.get(&Value::I32(2)).is_none());
        // Tag-strict keys: an i64 1 is a different key from an i32 1.
        assert!(t.get(&Value::I64(1)).is_none());
    }

    #[test]
    fn growth_preserves_content() {
        // Cross several size-class boundaries (8, 16, 32, 64, 128).
        let mut t = Table::new();
        for i in 0..200i32 {
            t.set(Value::I32(i), Value::I32(i * 3));
        }
        assert_eq!(t.len(), 200);
        for i in 0..200i32 {
            let p = t.get(&Value::I32(i)).unwrap();
            assert!(value_eq(&p.val, &Value::I32(i * 3)), "key {}", i);
        }
    }

    #[test]
    fn capacity_advances_through_size_classes() {
        let mut t = Table::new();
        t.set(Value::I32(0), Value::Nil);
        assert_eq!(t.capacity(), 8);
        for i in 1..9i32 {
            t.set(Value::I32(i), Value::Nil);
        }
        assert_eq!(t.capacity(), 16);
    }

    #[test]
    fn get_pair_fills_nil_for_absent_keys() {
        let t = Table::new();
        let p = t.get_pair(&Value::str("k"));
        assert!(value_eq(&p.key, &Value::str("k")));
        assert!(matches!(p.val, Value::Nil));
    }

    #[test]
    fn mixed_key_tags_coexist() {
        let mut t = Table::new();
        t.set(Value::str("1"), Value::I32(10));
        t.set(Value::I32(1), Value::I32(20));
        t.set(Value::Bool(true), Value::I32(30));
        assert!(value_eq(&t.get(&Value::str("1")).unwrap().val, &Value::I32(10)));
        assert!(value_eq(&t.get(&Value::I32(1)).unwrap().val, &Value::I32(20)));
        assert!(value_eq(&t.get(&Value::Bool(true)).unwrap().val, &Value::I32(30)));
    }
}
