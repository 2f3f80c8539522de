//! Polymorphic operation kernels
//!
//! The arithmetic, comparison, indexing, length, and concatenation
//! kernels shared by the interpreter and the embedding API. Each first
//! tries the primitive semantics (with string/number coercion where the
//! language defines it) and falls back to tag-method dispatch.

use crate::object::Upvalue;
use crate::state::MAX_TAG_LOOP;
use crate::tm::{self, TagMethod};
use crate::value::{ObjKind, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

use super::ArithOp;

/// Convert to a number, accepting numeric strings.
pub(crate) fn to_number(vm: &Vm, v: Value) -> Option<f64> {
    match v {
        Value::Number(n) => Some(n),
        Value::Object(r) if r.kind == ObjKind::Str => str_to_number(vm.g.heap.str_(r).as_str()),
        _ => None,
    }
}

/// Parse a numeric string: optional surrounding whitespace, decimal
/// floats, or `0x` hexadecimal integers.
pub(crate) fn str_to_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let n = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()? as f64
    } else {
        body.parse::<f64>().ok()?
    };
    Some(if neg { -n } else { n })
}

/// Render a number the way the runtime prints it: up to 14 significant
/// digits, positional notation for moderate exponents, scientific
/// otherwise.
pub(crate) fn number_to_str(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf".to_string() } else { "inf".to_string() };
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let exp = n.abs().log10().floor() as i32;
    if !(-5..14).contains(&exp) {
        let mantissa = format!("{:.13e}", n);
        let (m, e) = mantissa.split_once('e').expect("exponent form");
        let m = m.trim_end_matches('0').trim_end_matches('.');
        let e: i32 = e.parse().expect("numeric exponent");
        let sign = if e < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", m, sign, e.abs())
    } else {
        let decimals = (13 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, n);
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    }
}

/// Plain numeric arithmetic.
pub(crate) fn raw_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => {
            let m = a % b;
            if m != 0.0 && (m < 0.0) != (b < 0.0) {
                m + b
            } else {
                m
            }
        }
        ArithOp::Pow => a.powf(b),
        ArithOp::Unm => -a,
    }
}

/// Arithmetic with coercion and tag-method fallback; the result lands
/// in stack slot `res`.
pub(crate) fn arith(
    vm: &mut Vm,
    t: ThreadId,
    res: usize,
    va: Value,
    vb: Value,
    op: ArithOp,
) -> Flow<()> {
    if let (Some(a), Some(b)) = (to_number(vm, va), to_number(vm, vb)) {
        vm.set_sv(t, res, Value::Number(raw_arith(op, a, b)));
        return Ok(());
    }
    let ev = TagMethod::arith(op as usize);
    if !tm::call_bin_tm(vm, t, va, vb, res, ev)? {
        return Err(tm::arith_error(vm, t, va, vb));
    }
    Ok(())
}

fn str_bytes<'a>(vm: &'a Vm, v: Value) -> Option<&'a str> {
    v.as_kind(ObjKind::Str).map(|r| vm.g.heap.str_(r).as_str())
}

/// `a < b` with number/string primitives and `__lt` fallback.
pub(crate) fn less_than(vm: &mut Vm, t: ThreadId, a: Value, b: Value) -> Flow<bool> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Ok(x < y);
    }
    if let (Some(x), Some(y)) = (str_bytes(vm, a), str_bytes(vm, b)) {
        return Ok(x < y);
    }
    match tm::call_order_tm(vm, t, a, b, TagMethod::Lt)? {
        Some(res) => Ok(res),
        None => Err(tm::order_error(vm, t, a, b)),
    }
}

/// `a <= b`: primitives, `__le`, then `not (b < a)` through `__lt`.
pub(crate) fn less_equal(vm: &mut Vm, t: ThreadId, a: Value, b: Value) -> Flow<bool> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Ok(x <= y);
    }
    if let (Some(x), Some(y)) = (str_bytes(vm, a), str_bytes(vm, b)) {
        return Ok(x <= y);
    }
    if let Some(res) = tm::call_order_tm(vm, t, a, b, TagMethod::Le)? {
        return Ok(res);
    }
    match tm::call_order_tm(vm, t, b, a, TagMethod::Lt)? {
        Some(res) => Ok(!res),
        None => Err(tm::order_error(vm, t, a, b)),
    }
}

/// Full equality: raw equality, then `__eq` when both operands are
/// tables or both userdata and their metatables agree on a handler.
pub(crate) fn equal_obj(vm: &mut Vm, t: ThreadId, a: Value, b: Value) -> Flow<bool> {
    if a.raw_eq(&b) {
        return Ok(true);
    }
    let (x, y) = match (a, b) {
        (Value::Object(x), Value::Object(y))
            if x.kind == y.kind && (x.kind == ObjKind::Table || x.kind == ObjKind::Userdata) =>
        {
            (x, y)
        }
        _ => return Ok(false),
    };
    let tm1 = match tm::metatable_of(vm, Value::Object(x)) {
        Some(mt) => tm::fast_tm(vm, mt, TagMethod::Eq),
        None => Value::Nil,
    };
    if tm1.is_nil() {
        return Ok(false);
    }
    let tm2 = match tm::metatable_of(vm, Value::Object(y)) {
        Some(mt) => tm::fast_tm(vm, mt, TagMethod::Eq),
        None => Value::Nil,
    };
    if !tm1.raw_eq(&tm2) {
        return Ok(false);
    }
    crate::exec::stack::reserve(vm, t, 1)?;
    let res = vm.th(t).top;
    tm::call_tm_res(vm, t, tm1, a, b, res)?;
    Ok(vm.sv(t, res).is_truthy())
}

/// Indexed read with the `__index` chain; result lands in `res`.
pub(crate) fn get_in(vm: &mut Vm, t: ThreadId, obj: Value, key: Value, res: usize) -> Flow<()> {
    let mut tv = obj;
    for _ in 0..MAX_TAG_LOOP {
        if let Some(tref) = tv.as_kind(ObjKind::Table) {
            let raw = match vm.g.heap.make_key(&key) {
                Ok(k) => vm.g.heap.table(tref).get_key(&k),
                Err(_) => Value::Nil, // nil/NaN cannot be present
            };
            if !raw.is_nil() {
                vm.set_sv(t, res, raw);
                return Ok(());
            }
            let handler = match vm.g.heap.table(tref).metatable {
                Some(mt) => tm::fast_tm(vm, mt, TagMethod::Index),
                None => Value::Nil,
            };
            if handler.is_nil() {
                vm.set_sv(t, res, Value::Nil);
                return Ok(());
            }
            if handler.is_function() {
                return tm::call_tm_res(vm, t, handler, tv, key, res);
            }
            tv = handler;
        } else {
            let handler = tm::get_tm_by_obj(vm, tv, TagMethod::Index);
            if handler.is_nil() {
                return Err(tm::type_error(vm, t, tv, "index"));
            }
            if handler.is_function() {
                return tm::call_tm_res(vm, t, handler, tv, key, res);
            }
            tv = handler;
        }
    }
    Err(vm.run_error(t, "loop in gettable"))
}

/// Indexed write with the `__newindex` chain. A raw store flushes the
/// table's tag-method cache.
pub(crate) fn set_in(vm: &mut Vm, t: ThreadId, obj: Value, key: Value, val: Value) -> Flow<()> {
    let mut tv = obj;
    for _ in 0..MAX_TAG_LOOP {
        if let Some(tref) = tv.as_kind(ObjKind::Table) {
            let existing = match vm.g.heap.make_key(&key) {
                Ok(k) => vm.g.heap.table(tref).get_key(&k),
                Err(_) => Value::Nil,
            };
            let handler = if existing.is_nil() {
                match vm.g.heap.table(tref).metatable {
                    Some(mt) => tm::fast_tm(vm, mt, TagMethod::NewIndex),
                    None => Value::Nil,
                }
            } else {
                Value::Nil
            };
            if handler.is_nil() {
                // raw store
                let k = match vm.g.heap.make_key(&key) {
                    Ok(k) => k,
                    Err(crate::gc::KeyError::Nil) => {
                        return Err(vm.run_error(t, "table index is nil"))
                    }
                    Err(crate::gc::KeyError::NaN) => {
                        return Err(vm.run_error(t, "table index is NaN"))
                    }
                };
                let table = vm.g.heap.table_mut(tref);
                table.flags = 0;
                table.set_key(k, val);
                return Ok(());
            }
            if handler.is_function() {
                return tm::call_tm_nores(vm, t, handler, tv, key, val);
            }
            tv = handler;
        } else {
            let handler = tm::get_tm_by_obj(vm, tv, TagMethod::NewIndex);
            if handler.is_nil() {
                return Err(tm::type_error(vm, t, tv, "index"));
            }
            if handler.is_function() {
                return tm::call_tm_nores(vm, t, handler, tv, key, val);
            }
            tv = handler;
        }
    }
    Err(vm.run_error(t, "loop in settable"))
}

fn stringable(v: Value) -> bool {
    matches!(v, Value::Number(_)) || v.as_kind(ObjKind::Str).is_some()
}

fn coerce_str(vm: &Vm, v: Value) -> String {
    match v {
        Value::Number(n) => number_to_str(n),
        Value::Object(r) if r.kind == ObjKind::Str => vm.g.heap.str_(r).as_str().to_string(),
        _ => unreachable!("caller checked stringable"),
    }
}

/// Concatenate the top `total` stack values, folding maximal runs of
/// strings/numbers and dispatching `__concat` otherwise. The result
/// replaces the operands at the base of the run.
pub(crate) fn concat(vm: &mut Vm, t: ThreadId, total: usize) -> Flow<()> {
    debug_assert!(vm.th(t).frame_height() >= total);
    let mut total = total;
    while total > 1 {
        let top = vm.th(t).top;
        let v2 = vm.sv(t, top - 2);
        let v1 = vm.sv(t, top - 1);
        let n;
        if stringable(v2) && stringable(v1) {
            let mut count = 2;
            while count < total && stringable(vm.sv(t, top - count - 1)) {
                count += 1;
            }
            let mut buf = String::new();
            for i in 0..count {
                buf.push_str(&coerce_str(vm, vm.sv(t, top - count + i)));
            }
            let r = vm.new_str(t, &buf)?;
            vm.set_sv(t, top - count, Value::Object(r));
            n = count;
        } else {
            if !tm::call_bin_tm(vm, t, v2, v1, top - 2, TagMethod::Concat)? {
                let bad = if stringable(v2) { v1 } else { v2 };
                return Err(tm::type_error(vm, t, bad, "concatenate"));
            }
            n = 2;
        }
        total -= n - 1;
        vm.th_mut(t).top -= n - 1;
    }
    Ok(())
}

/// Length: string length, `__len` when present, raw table border
/// otherwise; result lands in `res`.
pub(crate) fn obj_len(vm: &mut Vm, t: ThreadId, res: usize, v: Value) -> Flow<()> {
    if let Some(r) = v.as_kind(ObjKind::Str) {
        let n = vm.g.heap.str_(r).len();
        vm.set_sv(t, res, Value::Number(n as f64));
        return Ok(());
    }
    if let Some(tref) = v.as_kind(ObjKind::Table) {
        let handler = match vm.g.heap.table(tref).metatable {
            Some(mt) => tm::fast_tm(vm, mt, TagMethod::Len),
            None => Value::Nil,
        };
        if handler.is_nil() {
            let n = vm.g.heap.table(tref).raw_len();
            vm.set_sv(t, res, Value::Number(n as f64));
            return Ok(());
        }
        return tm::call_tm_res(vm, t, handler, v, v, res);
    }
    let handler = tm::get_tm_by_obj(vm, v, TagMethod::Len);
    if handler.is_nil() {
        return Err(tm::type_error(vm, t, v, "get length of"));
    }
    tm::call_tm_res(vm, t, handler, v, v, res)
}

/// Read through an upvalue cell: open cells alias a live stack slot.
pub(crate) fn read_upvalue(vm: &Vm, up: crate::value::ObjRef) -> Value {
    match vm.g.heap.upvalue(up) {
        Upvalue::Closed(v) => *v,
        Upvalue::Open { thread, slot } => vm.th(*thread).stack[*slot],
    }
}

/// Write through an upvalue cell.
pub(crate) fn write_upvalue(vm: &mut Vm, up: crate::value::ObjRef, v: Value) {
    match vm.g.heap.upvalue(up) {
        Upvalue::Closed(_) => *vm.g.heap.upvalue_mut(up) = Upvalue::Closed(v),
        Upvalue::Open { thread, slot } => {
            let (thread, slot) = (*thread, *slot);
            vm.th_mut(thread).stack[slot] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_to_str_integers() {
        assert_eq!(number_to_str(0.0), "0");
        assert_eq!(number_to_str(42.0), "42");
        assert_eq!(number_to_str(-7.0), "-7");
    }

    #[test]
    fn test_number_to_str_fractions() {
        assert_eq!(number_to_str(3.14), "3.14");
        assert_eq!(number_to_str(-0.5), "-0.5");
        assert_eq!(number_to_str(0.1), "0.1");
    }

    #[test]
    fn test_number_to_str_scientific() {
        assert_eq!(number_to_str(1e20), "1e+20");
        assert_eq!(number_to_str(1e-7), "1e-07");
    }

    #[test]
    fn test_str_to_number() {
        assert_eq!(str_to_number("42"), Some(42.0));
        assert_eq!(str_to_number("  3.5  "), Some(3.5));
        assert_eq!(str_to_number("-0x10"), Some(-16.0));
        assert_eq!(str_to_number("0xff"), Some(255.0));
        assert_eq!(str_to_number(""), None);
        assert_eq!(str_to_number("x"), None);
        assert_eq!(str_to_number("1 2"), None);
    }

    #[test]
    fn test_raw_arith_mod_sign() {
        assert_eq!(raw_arith(ArithOp::Mod, 5.0, 3.0), 2.0);
        assert_eq!(raw_arith(ArithOp::Mod, -5.0, 3.0), 1.0);
        assert_eq!(raw_arith(ArithOp::Mod, 5.0, -3.0), -1.0);
    }

    #[test]
    fn test_raw_arith_basics() {
        assert_eq!(raw_arith(ArithOp::Add, 2.0, 3.0), 5.0);
        assert_eq!(raw_arith(ArithOp::Pow, 2.0, 10.0), 1024.0);
        assert_eq!(raw_arith(ArithOp::Unm, 9.0, 9.0), -9.0);
    }
}
