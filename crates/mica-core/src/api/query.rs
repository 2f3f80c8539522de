//! Query family: stack values out to the host

use crate::interp::ops;
use crate::value::{HostFn, ObjKind, Type, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

impl Vm {
    /// Main type at `idx`; `Type::None` for an empty slot.
    pub fn type_of(&self, t: ThreadId, idx: i32) -> Type {
        match self.index_value(t, idx) {
            Some(v) => v.type_of(),
            None => Type::None,
        }
    }

    /// Printable name of a type.
    pub fn type_name(&self, ty: Type) -> &'static str {
        ty.name()
    }

    pub fn is_nil(&self, t: ThreadId, idx: i32) -> bool {
        self.type_of(t, idx) == Type::Nil
    }

    pub fn is_none(&self, t: ThreadId, idx: i32) -> bool {
        self.type_of(t, idx) == Type::None
    }

    pub fn is_none_or_nil(&self, t: ThreadId, idx: i32) -> bool {
        matches!(self.type_of(t, idx), Type::None | Type::Nil)
    }

    pub fn is_boolean(&self, t: ThreadId, idx: i32) -> bool {
        self.type_of(t, idx) == Type::Boolean
    }

    pub fn is_table(&self, t: ThreadId, idx: i32) -> bool {
        self.type_of(t, idx) == Type::Table
    }

    pub fn is_function(&self, t: ThreadId, idx: i32) -> bool {
        self.type_of(t, idx) == Type::Function
    }

    pub fn is_thread(&self, t: ThreadId, idx: i32) -> bool {
        self.type_of(t, idx) == Type::Thread
    }

    /// True for numbers and numeric strings.
    pub fn is_number(&self, t: ThreadId, idx: i32) -> bool {
        self.index_value(t, idx)
            .map(|v| ops::to_number(self, v).is_some())
            .unwrap_or(false)
    }

    /// True for strings and numbers (which convert implicitly).
    pub fn is_string(&self, t: ThreadId, idx: i32) -> bool {
        matches!(self.type_of(t, idx), Type::String | Type::Number)
    }

    /// True for light or full userdata.
    pub fn is_userdata(&self, t: ThreadId, idx: i32) -> bool {
        matches!(self.type_of(t, idx), Type::Userdata | Type::LightUserdata)
    }

    /// True for host callables (bare pointer or host closure).
    pub fn is_cfunction(&self, t: ThreadId, idx: i32) -> bool {
        match self.index_value(t, idx) {
            Some(Value::HostFn(_)) => true,
            Some(Value::Object(r)) => r.kind == ObjKind::HostClosure,
            _ => false,
        }
    }

    /// Number conversion with an explicit success flag.
    pub fn to_numberx(&self, t: ThreadId, idx: i32) -> Option<f64> {
        self.index_value(t, idx).and_then(|v| ops::to_number(self, v))
    }

    pub fn to_number(&self, t: ThreadId, idx: i32) -> f64 {
        self.to_numberx(t, idx).unwrap_or(0.0)
    }

    pub fn to_integerx(&self, t: ThreadId, idx: i32) -> Option<i64> {
        self.to_numberx(t, idx).map(|n| n as i64)
    }

    pub fn to_unsignedx(&self, t: ThreadId, idx: i32) -> Option<u64> {
        self.to_numberx(t, idx).map(|n| n as i64 as u64)
    }

    /// Truthiness of the value (only nil and false are falsy).
    pub fn to_boolean(&self, t: ThreadId, idx: i32) -> bool {
        self.index_value(t, idx)
            .map(|v| v.is_truthy())
            .unwrap_or(false)
    }

    /// String conversion. Numbers are converted **in place** (the slot
    /// becomes a string), strings are returned as-is, anything else is
    /// `None`.
    pub fn to_lstring(&mut self, t: ThreadId, idx: i32) -> Flow<Option<String>> {
        let Some(v) = self.index_value(t, idx) else { return Ok(None) };
        match v {
            Value::Object(r) if r.kind == ObjKind::Str => {
                Ok(Some(self.g.heap.str_(r).as_str().to_string()))
            }
            Value::Number(n) => {
                let s = ops::number_to_str(n);
                let r = self.new_str(t, &s)?;
                let place = self.index_place(t, idx);
                self.place_store(t, place, Value::Object(r));
                Ok(Some(s))
            }
            _ => Ok(None),
        }
    }

    /// Raw length: string bytes, userdata blob size, table border;
    /// 0 otherwise. No metamethods.
    pub fn raw_len(&self, t: ThreadId, idx: i32) -> usize {
        match self.index_value(t, idx) {
            Some(Value::Object(r)) => match r.kind {
                ObjKind::Str => self.g.heap.str_(r).len(),
                ObjKind::Userdata => self.g.heap.userdata(r).data.len(),
                ObjKind::Table => self.g.heap.table(r).raw_len(),
                _ => 0,
            },
            _ => 0,
        }
    }

    /// The host function behind a callable, if any.
    pub fn to_cfunction(&self, t: ThreadId, idx: i32) -> Option<HostFn> {
        match self.index_value(t, idx)? {
            Value::HostFn(f) => Some(f),
            Value::Object(r) if r.kind == ObjKind::HostClosure => {
                Some(self.g.heap.host_closure(r).f)
            }
            _ => None,
        }
    }

    /// Userdata bytes: the blob of a full userdata, or `None`.
    pub fn to_userdata(&mut self, t: ThreadId, idx: i32) -> Option<&mut [u8]> {
        match self.index_value(t, idx)? {
            Value::Object(r) if r.kind == ObjKind::Userdata => {
                Some(&mut self.g.heap.userdata_mut(r).data)
            }
            _ => None,
        }
    }

    /// Light-userdata cookie value, or `None`.
    pub fn to_light_userdata(&self, t: ThreadId, idx: i32) -> Option<usize> {
        match self.index_value(t, idx)? {
            Value::LightUserdata(p) => Some(p),
            _ => None,
        }
    }

    /// The thread at `idx`, if it is one.
    pub fn to_thread(&self, t: ThreadId, idx: i32) -> Option<ThreadId> {
        self.index_value(t, idx).and_then(|v| self.thread_of(v))
    }

    /// Stable identity cookie for heap values, host functions, and
    /// light userdata; 0 for everything else.
    pub fn to_pointer(&self, t: ThreadId, idx: i32) -> usize {
        match self.index_value(t, idx) {
            Some(Value::Object(r)) => (r.kind as usize) << 32 | (r.index as usize + 1),
            Some(Value::HostFn(f)) => f as usize,
            Some(Value::LightUserdata(p)) => p,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_queries() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_string(t, "12.5").unwrap();
        vm.push_number(t, 4.0);
        vm.push_bool(t, false);
        assert!(vm.is_string(t, 1));
        assert!(vm.is_number(t, 1)); // numeric string
        assert!(vm.is_string(t, 2)); // numbers convert
        assert!(!vm.is_number(t, 3));
        assert!(vm.is_none(t, 10));
        assert_eq!(vm.type_of(t, 10), Type::None);
    }

    #[test]
    fn test_to_number_conversions() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_string(t, " 0x10 ").unwrap();
        assert_eq!(vm.to_numberx(t, 1), Some(16.0));
        assert_eq!(vm.to_integerx(t, 1), Some(16));
        vm.push_bool(t, true);
        assert_eq!(vm.to_numberx(t, 2), None);
        assert_eq!(vm.to_number(t, 2), 0.0);
    }

    #[test]
    fn test_to_lstring_converts_in_place() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_number(t, 2.5);
        assert_eq!(vm.to_lstring(t, 1).unwrap(), Some("2.5".to_string()));
        assert_eq!(vm.type_of(t, 1), Type::String);
    }

    #[test]
    fn test_raw_len() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_string(t, "abcde").unwrap();
        assert_eq!(vm.raw_len(t, 1), 5);
        vm.push_number(t, 1.0);
        assert_eq!(vm.raw_len(t, 2), 0);
    }

    #[test]
    fn test_to_boolean() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_nil(t);
        vm.push_number(t, 0.0);
        assert!(!vm.to_boolean(t, 1));
        assert!(vm.to_boolean(t, 2)); // zero is truthy
        assert!(!vm.to_boolean(t, 99)); // no value
    }
}
