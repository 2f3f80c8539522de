//! Access and mutate families: tables, metatables, user values
//!
//! The `get_*`/`set_*` entries go through the tag-method-aware kernels
//! and may therefore run script code; the `raw_*` entries touch the
//! table alone.

use crate::exec::stack;
use crate::gc::collector;
use crate::gc::header::ObjBody;
use crate::object::{Table, TableKey, Userdata};
use crate::tm;
use crate::value::{ObjKind, Type, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

impl Vm {
    /// Push `globals[name]` (may invoke `__index`).
    pub fn get_global(&mut self, t: ThreadId, name: &str) -> Flow<()> {
        let gt = Value::Object(self.globals_ref());
        let key = Value::Object(self.new_str(t, name)?);
        stack::reserve(self, t, 1)?;
        let res = self.th(t).top;
        let th = self.th_mut(t);
        th.stack[res] = Value::Nil;
        th.top += 1;
        crate::interp::ops::get_in(self, t, gt, key, res)
    }

    /// `globals[name] = pop()` (may invoke `__newindex`).
    pub fn set_global(&mut self, t: ThreadId, name: &str) -> Flow<()> {
        debug_assert!(self.th(t).frame_height() >= 1);
        let gt = Value::Object(self.globals_ref());
        let key = Value::Object(self.new_str(t, name)?);
        let v = self.sv(t, self.th(t).top - 1);
        crate::interp::ops::set_in(self, t, gt, key, v)?;
        self.th_mut(t).top -= 1;
        Ok(())
    }

    /// `top-1 = (idx)[top-1]` (may invoke `__index`).
    pub fn get_table(&mut self, t: ThreadId, idx: i32) -> Flow<()> {
        let tv = self.index_value(t, idx).unwrap_or(Value::Nil);
        let keyslot = self.th(t).top - 1;
        let key = self.sv(t, keyslot);
        crate::interp::ops::get_in(self, t, tv, key, keyslot)
    }

    /// Push `(idx)[k]` (may invoke `__index`).
    pub fn get_field(&mut self, t: ThreadId, idx: i32, k: &str) -> Flow<()> {
        let tv = self.index_value(t, idx).unwrap_or(Value::Nil);
        let key = Value::Object(self.new_str(t, k)?);
        stack::reserve(self, t, 1)?;
        let res = self.th(t).top;
        let th = self.th_mut(t);
        th.stack[res] = Value::Nil;
        th.top += 1;
        crate::interp::ops::get_in(self, t, tv, key, res)
    }

    /// `(idx)[top-2] = top-1`, popping both (may invoke `__newindex`).
    pub fn set_table(&mut self, t: ThreadId, idx: i32) -> Flow<()> {
        debug_assert!(self.th(t).frame_height() >= 2);
        let tv = self.index_value(t, idx).unwrap_or(Value::Nil);
        let top = self.th(t).top;
        let key = self.sv(t, top - 2);
        let val = self.sv(t, top - 1);
        crate::interp::ops::set_in(self, t, tv, key, val)?;
        self.th_mut(t).top -= 2;
        Ok(())
    }

    /// `(idx)[k] = pop()` (may invoke `__newindex`).
    pub fn set_field(&mut self, t: ThreadId, idx: i32, k: &str) -> Flow<()> {
        debug_assert!(self.th(t).frame_height() >= 1);
        let tv = self.index_value(t, idx).unwrap_or(Value::Nil);
        let key = Value::Object(self.new_str(t, k)?);
        let val = self.sv(t, self.th(t).top - 1);
        crate::interp::ops::set_in(self, t, tv, key, val)?;
        self.th_mut(t).top -= 1;
        Ok(())
    }

    /// `top-1 = raw (idx)[top-1]`.
    pub fn raw_get(&mut self, t: ThreadId, idx: i32) {
        let Some(tref) = self.table_at(t, idx) else { return };
        let keyslot = self.th(t).top - 1;
        let key = self.sv(t, keyslot);
        let v = match self.g.heap.make_key(&key) {
            Ok(k) => self.g.heap.table(tref).get_key(&k),
            Err(_) => Value::Nil,
        };
        self.set_sv(t, keyslot, v);
    }

    /// Push raw `(idx)[n]`.
    pub fn raw_geti(&mut self, t: ThreadId, idx: i32, n: i64) {
        let Some(tref) = self.table_at(t, idx) else { return };
        let v = self.g.heap.table(tref).get_int(n);
        self.push(t, v);
    }

    /// Push raw `(idx)[p]` for a light-userdata key.
    pub fn raw_getp(&mut self, t: ThreadId, idx: i32, p: usize) {
        let Some(tref) = self.table_at(t, idx) else { return };
        let v = self.g.heap.table(tref).get_key(&TableKey::LightUserdata(p));
        self.push(t, v);
    }

    /// Raw `(idx)[top-2] = top-1`, popping both. Flushes the table's
    /// tag-method cache.
    pub fn raw_set(&mut self, t: ThreadId, idx: i32) {
        debug_assert!(self.th(t).frame_height() >= 2);
        let Some(tref) = self.table_at(t, idx) else { return };
        let top = self.th(t).top;
        let key = self.sv(t, top - 2);
        let val = self.sv(t, top - 1);
        if let Ok(k) = self.g.heap.make_key(&key) {
            let table = self.g.heap.table_mut(tref);
            table.flags = 0;
            table.set_key(k, val);
        }
        self.th_mut(t).top -= 2;
    }

    /// Raw `(idx)[n] = pop()`.
    pub fn raw_seti(&mut self, t: ThreadId, idx: i32, n: i64) {
        debug_assert!(self.th(t).frame_height() >= 1);
        let Some(tref) = self.table_at(t, idx) else { return };
        let val = self.sv(t, self.th(t).top - 1);
        let table = self.g.heap.table_mut(tref);
        table.flags = 0;
        table.set_int(n, val);
        self.th_mut(t).top -= 1;
    }

    /// Raw `(idx)[p] = pop()` for a light-userdata key.
    pub fn raw_setp(&mut self, t: ThreadId, idx: i32, p: usize) {
        debug_assert!(self.th(t).frame_height() >= 1);
        let Some(tref) = self.table_at(t, idx) else { return };
        let val = self.sv(t, self.th(t).top - 1);
        let table = self.g.heap.table_mut(tref);
        table.flags = 0;
        table.set_key(TableKey::LightUserdata(p), val);
        self.th_mut(t).top -= 1;
    }

    /// Push a fresh table with size hints.
    pub fn create_table(&mut self, t: ThreadId, narr: usize, nrec: usize) -> Flow<()> {
        self.check_gc();
        let r = self.alloc_obj(t, ObjBody::Table(Table::new(narr, nrec)))?;
        self.push(t, Value::Object(r));
        Ok(())
    }

    /// Push a fresh userdata blob of `size` zeroed bytes.
    pub fn new_userdata(&mut self, t: ThreadId, size: usize) -> Flow<()> {
        self.check_gc();
        let r = self.alloc_obj(t, ObjBody::Userdata(Userdata::new(size)))?;
        self.push(t, Value::Object(r));
        Ok(())
    }

    /// Push the metatable governing the value at `idx`; false (and no
    /// push) when there is none.
    pub fn get_metatable(&mut self, t: ThreadId, idx: i32) -> bool {
        let v = self.index_value(t, idx).unwrap_or(Value::Nil);
        match tm::metatable_of(self, v) {
            Some(mt) => {
                self.push(t, Value::Object(mt));
                true
            }
            None => false,
        }
    }

    /// `(idx).metatable = pop()`. A nil pop clears it. Setting a
    /// metatable that already carries `__gc` links the object for
    /// finalization; later mutations of the metatable do not.
    pub fn set_metatable(&mut self, t: ThreadId, idx: i32) {
        debug_assert!(self.th(t).frame_height() >= 1);
        let obj = self.index_value(t, idx).unwrap_or(Value::Nil);
        let top = self.th(t).top;
        let mtv = self.sv(t, top - 1);
        let mt = match mtv {
            Value::Nil => None,
            Value::Object(r) if r.kind == ObjKind::Table => Some(r),
            _ => {
                debug_assert!(false, "table or nil expected for a metatable");
                None
            }
        };
        match obj {
            Value::Object(r) if r.kind == ObjKind::Table => {
                self.g.heap.table_mut(r).metatable = mt;
                if let Some(mt) = mt {
                    collector::check_finalizer(&mut self.g, r, mt);
                }
            }
            Value::Object(r) if r.kind == ObjKind::Userdata => {
                self.g.heap.userdata_mut(r).metatable = mt;
                if let Some(mt) = mt {
                    collector::check_finalizer(&mut self.g, r, mt);
                }
            }
            other => {
                let ty = other.type_of();
                if ty != Type::None {
                    self.g.mt[ty as i8 as usize] = mt;
                }
            }
        }
        self.th_mut(t).top -= 1;
    }

    /// Push the user value (associated table) of the userdata at `idx`,
    /// or nil.
    pub fn get_uservalue(&mut self, t: ThreadId, idx: i32) {
        let v = self.index_value(t, idx).unwrap_or(Value::Nil);
        let uv = match v.as_kind(ObjKind::Userdata) {
            Some(r) => self
                .g
                .heap
                .userdata(r)
                .uservalue
                .map(Value::Object)
                .unwrap_or(Value::Nil),
            None => {
                debug_assert!(false, "userdata expected");
                Value::Nil
            }
        };
        self.push(t, uv);
    }

    /// `(idx).uservalue = pop()`; a nil pop clears it.
    pub fn set_uservalue(&mut self, t: ThreadId, idx: i32) {
        debug_assert!(self.th(t).frame_height() >= 1);
        let v = self.index_value(t, idx).unwrap_or(Value::Nil);
        let top = self.th(t).top;
        let uvv = self.sv(t, top - 1);
        if let Some(r) = v.as_kind(ObjKind::Userdata) {
            self.g.heap.userdata_mut(r).uservalue = match uvv {
                Value::Nil => None,
                Value::Object(tr) if tr.kind == ObjKind::Table => Some(tr),
                _ => {
                    debug_assert!(false, "table or nil expected for a user value");
                    None
                }
            };
        } else {
            debug_assert!(false, "userdata expected");
        }
        self.th_mut(t).top -= 1;
    }

    /// Table traversal: pops a key, pushes the next key/value pair.
    /// Returns false (popping the key) when traversal is complete.
    pub fn next(&mut self, t: ThreadId, idx: i32) -> Flow<bool> {
        debug_assert!(self.th(t).frame_height() >= 1);
        let Some(tref) = self.table_at(t, idx) else {
            return Err(self.run_error(t, "table expected"));
        };
        let keyslot = self.th(t).top - 1;
        let prev = self.sv(t, keyslot);
        let cursor = if prev.is_nil() {
            0
        } else {
            let k = match self.g.heap.make_key(&prev) {
                Ok(k) => k,
                Err(_) => return Err(self.run_error(t, "invalid key to 'next'")),
            };
            match self.g.heap.table(tref).cursor_after(&k) {
                Some(c) => c,
                None => return Err(self.run_error(t, "invalid key to 'next'")),
            }
        };
        match self.g.heap.table(tref).next_entry(cursor) {
            Some((_, key, value)) => {
                let kv = match self.g.heap.key_to_value(&key) {
                    Ok(v) => v,
                    Err(_) => return Err(self.throw(t, crate::Status::MemErr)),
                };
                stack::reserve(self, t, 1)?;
                self.set_sv(t, keyslot, kv);
                let th = self.th_mut(t);
                th.stack[th.top] = value;
                th.top += 1;
                Ok(true)
            }
            None => {
                self.th_mut(t).top -= 1;
                Ok(false)
            }
        }
    }

    /// The table at `idx`, for raw operations.
    fn table_at(&self, t: ThreadId, idx: i32) -> Option<crate::value::ObjRef> {
        let v = self.index_value(t, idx)?;
        let r = v.as_kind(ObjKind::Table);
        debug_assert!(r.is_some(), "table expected");
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_set_get_roundtrip() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.create_table(t, 0, 0).unwrap();
        vm.push_string(t, "k").unwrap();
        vm.push_number(t, 5.0);
        vm.raw_set(t, 1);
        vm.push_string(t, "k").unwrap();
        vm.raw_get(t, 1);
        assert_eq!(vm.index_value(t, -1), Some(Value::Number(5.0)));
    }

    #[test]
    fn test_raw_geti_seti(){
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.create_table(t, 4, 0).unwrap();
        vm.push_number(t, 11.0);
        vm.raw_seti(t, 1, 1);
        vm.raw_geti(t, 1, 1);
        assert_eq!(vm.index_value(t, -1), Some(Value::Number(11.0)));
        vm.raw_geti(t, 1, 2);
        assert!(vm.index_value(t, -1).unwrap().is_nil());
    }

    #[test]
    fn test_rawgetp_rawsetp() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.create_table(t, 0, 0).unwrap();
        vm.push_bool(t, true);
        vm.raw_setp(t, 1, 0xabc);
        vm.raw_getp(t, 1, 0xabc);
        assert_eq!(vm.index_value(t, -1), Some(Value::Boolean(true)));
    }

    #[test]
    fn test_metatable_roundtrip() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.create_table(t, 0, 0).unwrap(); // object
        assert!(!vm.get_metatable(t, 1));
        vm.create_table(t, 0, 0).unwrap(); // metatable
        vm.set_metatable(t, 1);
        assert_eq!(vm.get_top(t), 1);
        assert!(vm.get_metatable(t, 1));
        assert_eq!(vm.type_of(t, -1), Type::Table);
    }

    #[test]
    fn test_per_type_metatable_shared() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_number(t, 1.0);
        vm.create_table(t, 0, 0).unwrap();
        vm.set_metatable(t, 1); // metatable for ALL numbers
        vm.push_number(t, 99.0);
        assert!(vm.get_metatable(t, -1));
        vm.pop(t, 1);
        // clear it again
        vm.push_nil(t);
        vm.set_metatable(t, 1);
        assert!(!vm.get_metatable(t, 1));
    }

    #[test]
    fn test_uservalue() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.new_userdata(t, 16).unwrap();
        vm.get_uservalue(t, 1);
        assert!(vm.index_value(t, -1).unwrap().is_nil());
        vm.pop(t, 1);
        vm.create_table(t, 0, 0).unwrap();
        vm.set_uservalue(t, 1);
        vm.get_uservalue(t, 1);
        assert_eq!(vm.type_of(t, -1), Type::Table);
    }

    #[test]
    fn test_next_walks_whole_table() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.create_table(t, 0, 0).unwrap();
        for i in 1..=3 {
            vm.push_number(t, (i * 10) as f64);
            vm.raw_seti(t, 1, i);
        }
        vm.push_string(t, "x").unwrap();
        vm.push_bool(t, true);
        vm.raw_set(t, 1);
        let mut count = 0;
        vm.push_nil(t);
        while vm.next(t, 1).unwrap() {
            count += 1;
            vm.pop(t, 1); // drop value, keep key
        }
        assert_eq!(count, 4);
        assert_eq!(vm.get_top(t), 1); // only the table remains
    }

    #[test]
    fn test_userdata_blob() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.new_userdata(t, 4).unwrap();
        {
            let blob = vm.to_userdata(t, 1).unwrap();
            blob[0] = 0xFF;
        }
        assert_eq!(vm.to_userdata(t, 1).unwrap()[0], 0xFF);
        assert_eq!(vm.raw_len(t, 1), 4);
    }
}
