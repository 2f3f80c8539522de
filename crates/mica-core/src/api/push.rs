//! Push family: host values onto the stack

use crate::gc::header::ObjBody;
use crate::object::{HostClosure, ScriptClosure, Upvalue};
use crate::state::MAX_UPVAL;
use crate::value::{HostFn, ObjRef, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

impl Vm {
    pub fn push_nil(&mut self, t: ThreadId) {
        self.push(t, Value::Nil);
    }

    pub fn push_bool(&mut self, t: ThreadId, b: bool) {
        self.push(t, Value::Boolean(b));
    }

    pub fn push_number(&mut self, t: ThreadId, n: f64) {
        self.push(t, Value::Number(n));
    }

    pub fn push_integer(&mut self, t: ThreadId, n: i64) {
        self.push(t, Value::Number(n as f64));
    }

    pub fn push_unsigned(&mut self, t: ThreadId, n: u64) {
        self.push(t, Value::Number(n as f64));
    }

    /// Push a string. Interns short contents; raises *MemoryError* when
    /// the governor refuses.
    pub fn push_string(&mut self, t: ThreadId, s: &str) -> Flow<()> {
        self.check_gc();
        let r = self.new_str(t, s)?;
        self.push(t, Value::Object(r));
        Ok(())
    }

    /// Push formatted text (the `push_fstring` entry).
    pub fn push_fstring(&mut self, t: ThreadId, args: std::fmt::Arguments<'_>) -> Flow<()> {
        let s = std::fmt::format(args);
        self.push_string(t, &s)
    }

    pub fn push_light_userdata(&mut self, t: ThreadId, p: usize) {
        self.push(t, Value::LightUserdata(p));
    }

    /// Push a host callable. With `n == 0` this is a bare function
    /// pointer; otherwise the top `n` values are captured as the host
    /// closure's upvalue cells, in push order.
    pub fn push_cclosure(&mut self, t: ThreadId, f: HostFn, n: usize) -> Flow<()> {
        if n == 0 {
            self.push(t, Value::HostFn(f));
            return Ok(());
        }
        debug_assert!(self.th(t).frame_height() >= n);
        debug_assert!(n <= MAX_UPVAL, "upvalue index too large");
        self.check_gc();
        let th = self.th(t);
        let first = th.top - n;
        let upvals: Vec<Value> = (0..n).map(|i| th.stack[first + i]).collect();
        let r = self.alloc_obj(t, ObjBody::HostClosure(HostClosure { f, upvals }))?;
        let th = self.th_mut(t);
        th.top -= n;
        th.stack[th.top] = Value::Object(r);
        th.top += 1;
        Ok(())
    }

    /// Push this thread itself; true when it is the main thread.
    pub fn push_thread(&mut self, t: ThreadId) -> bool {
        let obj = self.th(t).obj;
        self.push(t, Value::Object(obj));
        t == self.main_thread()
    }

    /// Push a script closure over `proto`, its upvalues fresh cells
    /// closed over nil (bind them with `set_upvalue` / `upvalue_join`).
    /// No collection point runs before the closure anchors the
    /// prototype on the stack.
    pub fn push_script_closure(&mut self, t: ThreadId, proto: ObjRef) -> Flow<()> {
        let nup = self.g.heap.proto(proto).upvalues.len();
        let mut upvals = Vec::with_capacity(nup);
        for _ in 0..nup {
            upvals.push(self.alloc_obj(t, ObjBody::Upvalue(Upvalue::Closed(Value::Nil)))?);
        }
        let r = self.alloc_obj(t, ObjBody::Closure(ScriptClosure { proto, upvals }))?;
        self.push(t, Value::Object(r));
        Ok(())
    }

    /// Allocate a prototype object from a host-assembled description.
    /// The reference is unanchored: push a closure over it (or store it
    /// into a reachable object) before the next allocation point.
    pub fn new_proto(&mut self, t: ThreadId, proto: crate::object::Proto) -> Flow<ObjRef> {
        self.alloc_obj(t, ObjBody::Proto(proto))
    }

    /// Intern a string and hand back the value without pushing it, for
    /// assembling prototype constant pools. Same anchoring caveat as
    /// [`Vm::new_proto`].
    pub fn string_value(&mut self, t: ThreadId, s: &str) -> Flow<Value> {
        Ok(Value::Object(self.new_str(t, s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Type;

    fn noop(_vm: &mut Vm, _t: ThreadId) -> Flow<u32> {
        Ok(0)
    }

    #[test]
    fn test_push_primitives() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_nil(t);
        vm.push_bool(t, true);
        vm.push_number(t, 1.5);
        vm.push_integer(t, -3);
        vm.push_light_userdata(t, 0xbeef);
        assert_eq!(vm.get_top(t), 5);
        assert_eq!(vm.type_of(t, 1), Type::Nil);
        assert_eq!(vm.type_of(t, 2), Type::Boolean);
        assert_eq!(vm.type_of(t, 3), Type::Number);
        assert_eq!(vm.index_value(t, 4), Some(Value::Number(-3.0)));
        assert_eq!(vm.type_of(t, 5), Type::LightUserdata);
    }

    #[test]
    fn test_push_string_interned() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_string(t, "hello").unwrap();
        vm.push_string(t, "hello").unwrap();
        let a = vm.index_value(t, 1).unwrap();
        let b = vm.index_value(t, 2).unwrap();
        assert!(a.raw_eq(&b));
    }

    #[test]
    fn test_push_cclosure_captures_in_order(){
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_number(t, 10.0);
        vm.push_number(t, 20.0);
        vm.push_cclosure(t, noop, 2).unwrap();
        assert_eq!(vm.get_top(t), 1);
        let r = vm.index_value(t, 1).unwrap().as_object().unwrap();
        let cl = vm.g.heap.host_closure(r);
        assert_eq!(cl.upvals, vec![Value::Number(10.0), Value::Number(20.0)]);
    }

    #[test]
    fn test_push_fstring() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.push_fstring(t, format_args!("{}-{}", 1, "x")).unwrap();
        assert_eq!(vm.value_str(vm.index_value(t, -1).unwrap()), Some("1-x"));
    }

    #[test]
    fn test_push_thread_reports_main() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        assert!(vm.push_thread(t));
        let co = vm.new_thread(t).unwrap();
        assert!(!vm.push_thread(co));
    }
}
