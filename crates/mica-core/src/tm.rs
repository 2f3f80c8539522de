//! Tag methods
//!
//! Tag methods make the primitive operations polymorphic: every lookup
//! goes through the object's metatable (own metatable for tables and
//! userdata, the shared per-type metatable otherwise). The names are
//! interned once at startup, pinned, and compared by identity; tables
//! cache the *absence* of the first six methods in their flag byte so
//! the common no-metamethod case stays O(1).

use crate::exec::{call, stack};
use crate::gc::heap::AllocError;
use crate::object::TableKey;
use crate::value::{ObjKind, ObjRef, Type, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

/// The recognized tag methods, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagMethod {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Lt,
    Le,
    Concat,
    Call,
}

/// Total number of tag methods.
pub const TM_COUNT: usize = 17;

/// The first six are fast-access: their absence is cached per table.
pub const FAST_TM_COUNT: usize = TagMethod::Eq as usize + 1;

const EVENT_NAMES: [&str; TM_COUNT] = [
    "__index",
    "__newindex",
    "__gc",
    "__mode",
    "__len",
    "__eq",
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__mod",
    "__pow",
    "__unm",
    "__lt",
    "__le",
    "__concat",
    "__call",
];

impl TagMethod {
    /// Event name, including the leading underscores.
    pub fn name(self) -> &'static str {
        EVENT_NAMES[self as usize]
    }

    /// Tag method for a binary arithmetic operator, by operator index
    /// (0 = add .. 6 = unm).
    pub fn arith(op: usize) -> TagMethod {
        match op {
            0 => TagMethod::Add,
            1 => TagMethod::Sub,
            2 => TagMethod::Mul,
            3 => TagMethod::Div,
            4 => TagMethod::Mod,
            5 => TagMethod::Pow,
            _ => TagMethod::Unm,
        }
    }
}

/// Intern and pin the tag-method names into the global state.
pub(crate) fn init_names(vm: &mut Vm) -> Result<(), AllocError> {
    vm.g.tm_names.clear();
    for name in EVENT_NAMES {
        let r = vm.g.heap.try_new_str(name)?;
        vm.g.heap.fix(r);
        vm.g.tm_names.push(r);
    }
    Ok(())
}

/// The metatable governing a value, if any.
pub(crate) fn metatable_of(vm: &Vm, o: Value) -> Option<ObjRef> {
    match o {
        Value::Object(r) if r.kind == ObjKind::Table => vm.g.heap.table(r).metatable,
        Value::Object(r) if r.kind == ObjKind::Userdata => vm.g.heap.userdata(r).metatable,
        _ => {
            let ty = o.type_of();
            if ty == Type::None {
                None
            } else {
                vm.g.mt[ty as i8 as usize]
            }
        }
    }
}

/// Look `ev` up in a metatable, caching absence for fast-access methods.
pub(crate) fn get_tm(vm: &mut Vm, events: ObjRef, ev: TagMethod) -> Value {
    let name = vm.g.tm_names[ev as usize];
    let v = vm.g.heap.table(events).get_key(&TableKey::IStr(name));
    if v.is_nil() && (ev as usize) < FAST_TM_COUNT {
        vm.g.heap.table_mut(events).flags |= 1 << (ev as u8);
    }
    v
}

/// O(1) fast path for a fast-access tag method on a table: when the
/// absence bit is set the answer is nil without touching the metatable.
pub(crate) fn fast_tm(vm: &mut Vm, events: ObjRef, ev: TagMethod) -> Value {
    debug_assert!((ev as usize) < FAST_TM_COUNT);
    if vm.g.heap.table(events).flags & (1 << (ev as u8)) != 0 {
        return Value::Nil;
    }
    get_tm(vm, events, ev)
}

/// Tag method `ev` for a value, through its governing metatable.
pub(crate) fn get_tm_by_obj(vm: &mut Vm, o: Value, ev: TagMethod) -> Value {
    match metatable_of(vm, o) {
        Some(mt) => {
            let name = vm.g.tm_names[ev as usize];
            vm.g.heap.table(mt).get_key(&TableKey::IStr(name))
        }
        None => Value::Nil,
    }
}

/// Invoke a tag method expecting one result, stored into stack slot
/// `res`. Metamethods called from script frames may yield; on a yield
/// the result placement is completed by `finish_op` after resume.
pub(crate) fn call_tm_res(
    vm: &mut Vm,
    t: ThreadId,
    f: Value,
    p1: Value,
    p2: Value,
    res: usize,
) -> Flow<()> {
    stack::reserve(vm, t, 3)?;
    let th = vm.th_mut(t);
    let func = th.top;
    th.stack[func] = f;
    th.stack[func + 1] = p1;
    th.stack[func + 2] = p2;
    th.top = func + 3;
    let allow_yield = vm.th(t).ci().is_script();
    call::do_call(vm, t, func, 1, allow_yield)?;
    let th = vm.th_mut(t);
    th.top -= 1;
    let v = th.stack[th.top];
    th.stack[res] = v;
    Ok(())
}

/// Invoke a tag method with three arguments and no result.
pub(crate) fn call_tm_nores(
    vm: &mut Vm,
    t: ThreadId,
    f: Value,
    p1: Value,
    p2: Value,
    p3: Value,
) -> Flow<()> {
    stack::reserve(vm, t, 4)?;
    let th = vm.th_mut(t);
    let func = th.top;
    th.stack[func] = f;
    th.stack[func + 1] = p1;
    th.stack[func + 2] = p2;
    th.stack[func + 3] = p3;
    th.top = func + 4;
    let allow_yield = vm.th(t).ci().is_script();
    call::do_call(vm, t, func, 0, allow_yield)
}

/// Binary-operator dispatch: try `ev` on the first operand, then the
/// second. Returns false when neither has a handler.
pub(crate) fn call_bin_tm(
    vm: &mut Vm,
    t: ThreadId,
    p1: Value,
    p2: Value,
    res: usize,
    ev: TagMethod,
) -> Flow<bool> {
    let mut tm = get_tm_by_obj(vm, p1, ev);
    if tm.is_nil() {
        tm = get_tm_by_obj(vm, p2, ev);
    }
    if tm.is_nil() {
        return Ok(false);
    }
    call_tm_res(vm, t, tm, p1, p2, res)?;
    Ok(true)
}

/// Comparison dispatch: like [`call_bin_tm`] but the handler's result is
/// collapsed to a boolean.
pub(crate) fn call_order_tm(
    vm: &mut Vm,
    t: ThreadId,
    p1: Value,
    p2: Value,
    ev: TagMethod,
) -> Flow<Option<bool>> {
    stack::reserve(vm, t, 1)?;
    let res = vm.th(t).top;
    if !call_bin_tm(vm, t, p1, p2, res, ev)? {
        return Ok(None);
    }
    Ok(Some(vm.sv(t, res).is_truthy()))
}

/// Raise the canonical "attempt to <op> a <type> value" error.
pub(crate) fn type_error(vm: &mut Vm, t: ThreadId, o: Value, op: &str) -> crate::Control {
    let ty = o.type_of().name();
    vm.run_error(t, &format!("attempt to {} a {} value", op, ty))
}

/// Raise an ordering error between two values.
pub(crate) fn order_error(vm: &mut Vm, t: ThreadId, a: Value, b: Value) -> crate::Control {
    let ta = a.type_of().name();
    let tb = b.type_of().name();
    if ta == tb {
        vm.run_error(t, &format!("attempt to compare two {} values", ta))
    } else {
        vm.run_error(t, &format!("attempt to compare {} with {}", ta, tb))
    }
}

/// Raise an arithmetic error, blaming the non-coercible operand.
pub(crate) fn arith_error(vm: &mut Vm, t: ThreadId, a: Value, b: Value) -> crate::Control {
    let bad = if crate::interp::ops::to_number(vm, a).is_none() { a } else { b };
    type_error(vm, t, bad, "perform arithmetic on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order() {
        assert_eq!(TagMethod::Index as usize, 0);
        assert_eq!(TagMethod::Eq as usize, 5);
        assert_eq!(TagMethod::Call as usize, 16);
        assert_eq!(TagMethod::Call.name(), "__call");
        assert_eq!(FAST_TM_COUNT, 6);
    }

    #[test]
    fn test_names_interned_and_pinned() {
        let vm = Vm::new();
        assert_eq!(vm.g.tm_names.len(), TM_COUNT);
        for (i, r) in vm.g.tm_names.iter().enumerate() {
            assert_eq!(vm.g.heap.str_(*r).as_str(), EVENT_NAMES[i]);
        }
    }

    #[test]
    fn test_absence_cache_set_on_miss() {
        let mut vm = Vm::new();
        let mt = vm
            .g
            .heap
            .try_alloc(crate::gc::ObjBody::Table(crate::object::Table::new(0, 0)))
            .unwrap();
        assert!(fast_tm(&mut vm, mt, TagMethod::Index).is_nil());
        assert_ne!(vm.g.heap.table(mt).flags & 1, 0);
        // cached: the next probe answers without a lookup
        assert!(fast_tm(&mut vm, mt, TagMethod::Index).is_nil());
    }

    #[test]
    fn test_arith_event_mapping() {
        assert_eq!(TagMethod::arith(0), TagMethod::Add);
        assert_eq!(TagMethod::arith(5), TagMethod::Pow);
        assert_eq!(TagMethod::arith(6), TagMethod::Unm);
    }
}
