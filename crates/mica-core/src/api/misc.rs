//! Miscellaneous entries: comparisons, arithmetic, upvalue surgery,
//! allocator governor, collector control, hooks

use crate::exec::stack;
use crate::gc::heap::AllocFn;
use crate::interp::{ops, ArithOp, CompareOp};
use crate::object::Upvalue;
use crate::state::{GcKind, HookFn};
use crate::value::{ObjKind, ObjRef, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

/// Collector commands of the `gc` API entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCmd {
    /// Stop automatic collection
    Stop,
    /// Restart automatic collection
    Restart,
    /// Run one full collection now
    Collect,
    /// Heap footprint in KiB
    Count,
    /// Remainder of the footprint modulo 1 KiB
    CountB,
    /// Run a step sized `KiB` of debt
    Step(i32),
    /// Swap the pause parameter, returning the old value
    SetPause(i32),
    /// Swap the major-collection increment, returning the old value
    SetMajorInc(i32),
    /// Swap the step multiplier, returning the old value
    SetStepMul(i32),
    /// Is automatic collection running?
    IsRunning,
    /// Switch to generational mode
    Generational,
    /// Switch to incremental mode
    Incremental,
}

impl Vm {
    /// Raw equality of two indexed values: no metamethods.
    pub fn raw_equal(&self, t: ThreadId, i: i32, j: i32) -> bool {
        match (self.index_value(t, i), self.index_value(t, j)) {
            (Some(a), Some(b)) => a.raw_eq(&b),
            _ => false,
        }
    }

    /// Compare two indexed values, possibly through `__eq`/`__lt`/`__le`.
    pub fn compare(&mut self, t: ThreadId, i: i32, j: i32, op: CompareOp) -> Flow<bool> {
        let (Some(a), Some(b)) = (self.index_value(t, i), self.index_value(t, j)) else {
            return Ok(false);
        };
        match op {
            CompareOp::Eq => ops::equal_obj(self, t, a, b),
            CompareOp::Lt => ops::less_than(self, t, a, b),
            CompareOp::Le => ops::less_equal(self, t, a, b),
        }
    }

    /// Arithmetic over the top stack values: two operands (one for
    /// unary minus, with a synthetic duplicate normalizing dispatch),
    /// replaced by the single result.
    pub fn arith(&mut self, t: ThreadId, op: ArithOp) -> Flow<()> {
        if op != ArithOp::Unm {
            debug_assert!(self.th(t).frame_height() >= 2);
        } else {
            debug_assert!(self.th(t).frame_height() >= 1);
            let th = self.th_mut(t);
            th.stack[th.top] = th.stack[th.top - 1];
            th.top += 1;
        }
        let top = self.th(t).top;
        let a = self.sv(t, top - 2);
        let b = self.sv(t, top - 1);
        ops::arith(self, t, top - 2, a, b, op)?;
        self.th_mut(t).top -= 1;
        Ok(())
    }

    /// Concatenate the top `n` values: 0 pushes the empty string, 1
    /// leaves the value unchanged.
    pub fn concat(&mut self, t: ThreadId, n: usize) -> Flow<()> {
        debug_assert!(self.th(t).frame_height() >= n);
        if n >= 2 {
            self.check_gc();
            ops::concat(self, t, n)?;
        } else if n == 0 {
            self.push_string(t, "")?;
        }
        Ok(())
    }

    /// Push the length of the value at `idx` (may invoke `__len`).
    pub fn len(&mut self, t: ThreadId, idx: i32) -> Flow<()> {
        let v = self.index_value(t, idx).unwrap_or(Value::Nil);
        stack::reserve(self, t, 1)?;
        let res = self.th(t).top;
        let th = self.th_mut(t);
        th.stack[res] = Value::Nil;
        th.top += 1;
        ops::obj_len(self, t, res, v)
    }

    // ========================================================================
    // Allocator governor
    // ========================================================================

    /// The installed allocation governor and its user datum.
    pub fn get_allocf(&self) -> (AllocFn, usize) {
        (self.g.heap.alloc, self.g.heap.alloc_ud)
    }

    /// Replace the allocation governor.
    pub fn set_allocf(&mut self, f: AllocFn, ud: usize) {
        self.g.heap.alloc = f;
        self.g.heap.alloc_ud = ud;
    }

    // ========================================================================
    // Upvalues of closures on the stack
    // ========================================================================

    /// Push the `n`-th (1-based) upvalue of the closure at `funcindex`.
    /// Returns the upvalue's name ("" when unnamed) or `None` when out
    /// of range.
    pub fn get_upvalue(&mut self, t: ThreadId, funcindex: i32, n: usize) -> Option<String> {
        let v = self.index_value(t, funcindex)?;
        match v {
            Value::Object(r) if r.kind == ObjKind::HostClosure => {
                let cl = self.g.heap.host_closure(r);
                let uv = *cl.upvals.get(n.checked_sub(1)?)?;
                self.push(t, uv);
                Some(String::new())
            }
            Value::Object(r) if r.kind == ObjKind::Closure => {
                let up = *self.g.heap.closure(r).upvals.get(n.checked_sub(1)?)?;
                let name = {
                    let proto = self.g.heap.proto(self.g.heap.closure(r).proto);
                    proto
                        .upvalues
                        .get(n - 1)
                        .and_then(|d| d.name.as_ref().map(|s| s.to_string()))
                        .unwrap_or_default()
                };
                let uv = ops::read_upvalue(self, up);
                self.push(t, uv);
                Some(name)
            }
            _ => None,
        }
    }

    /// Pop the top value into the `n`-th upvalue of the closure at
    /// `funcindex`. Returns the upvalue's name, or `None` (no pop) when
    /// out of range.
    pub fn set_upvalue(&mut self, t: ThreadId, funcindex: i32, n: usize) -> Option<String> {
        debug_assert!(self.th(t).frame_height() >= 1);
        let v = self.index_value(t, funcindex)?;
        let top = self.th(t).top;
        let val = self.sv(t, top - 1);
        match v {
            Value::Object(r) if r.kind == ObjKind::HostClosure => {
                let cl = self.g.heap.host_closure_mut(r);
                let slot = cl.upvals.get_mut(n.checked_sub(1)?)?;
                *slot = val;
                self.th_mut(t).top -= 1;
                Some(String::new())
            }
            Value::Object(r) if r.kind == ObjKind::Closure => {
                let up = *self.g.heap.closure(r).upvals.get(n.checked_sub(1)?)?;
                let name = {
                    let proto = self.g.heap.proto(self.g.heap.closure(r).proto);
                    proto
                        .upvalues
                        .get(n - 1)
                        .and_then(|d| d.name.as_ref().map(|s| s.to_string()))
                        .unwrap_or_default()
                };
                ops::write_upvalue(self, up, val);
                self.th_mut(t).top -= 1;
                Some(name)
            }
            _ => None,
        }
    }

    /// Identity of the storage behind an upvalue: equal ids mean the
    /// two closures share the cell.
    pub fn upvalue_id(&self, t: ThreadId, funcindex: i32, n: usize) -> Option<u64> {
        let v = self.index_value(t, funcindex)?;
        match v {
            Value::Object(r) if r.kind == ObjKind::Closure => {
                let up = self.g.heap.closure(r).upvals.get(n.checked_sub(1)?)?;
                Some(up.index as u64)
            }
            Value::Object(r) if r.kind == ObjKind::HostClosure => {
                if n == 0 || n > self.g.heap.host_closure(r).upvals.len() {
                    return None;
                }
                // inline cells: identity is (closure, slot)
                Some(((r.index as u64) << 16) | 0x8000_0000_0000_0000 | n as u64)
            }
            _ => None,
        }
    }

    /// Make upvalue `n1` of the script closure at `f1` refer to the
    /// same cell as upvalue `n2` of the script closure at `f2`.
    pub fn upvalue_join(&mut self, t: ThreadId, f1: i32, n1: usize, f2: i32, n2: usize) {
        let Some(c1) = self
            .index_value(t, f1)
            .and_then(|v| v.as_kind(ObjKind::Closure))
        else {
            debug_assert!(false, "script closure expected");
            return;
        };
        let Some(c2) = self
            .index_value(t, f2)
            .and_then(|v| v.as_kind(ObjKind::Closure))
        else {
            debug_assert!(false, "script closure expected");
            return;
        };
        let Some(&cell) = self.g.heap.closure(c2).upvals.get(n2.wrapping_sub(1)) else {
            debug_assert!(false, "invalid upvalue index");
            return;
        };
        if let Some(slot) = self.g.heap.closure_mut(c1).upvals.get_mut(n1.wrapping_sub(1)) {
            *slot = cell;
        } else {
            debug_assert!(false, "invalid upvalue index");
        }
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Install a debug hook with an event mask (see
    /// [`crate::state::hookmask`]) and a count-hook period.
    pub fn set_hook(&mut self, t: ThreadId, hook: Option<HookFn>, mask: u8, count: i32) {
        let th = self.th_mut(t);
        if hook.is_none() || mask == 0 {
            th.hook = None;
            th.hookmask = 0;
        } else {
            th.hook = hook;
            th.hookmask = mask;
        }
        th.basehookcount = count;
        th.reset_hookcount();
    }

    pub fn get_hook_mask(&self, t: ThreadId) -> u8 {
        self.th(t).hookmask
    }

    pub fn get_hook_count(&self, t: ThreadId) -> i32 {
        self.th(t).basehookcount
    }

    // ========================================================================
    // Collector control
    // ========================================================================

    /// Collector commands. Parameter setters return the old value;
    /// `Step` reports end-of-cycle, `Count`/`CountB` report footprint.
    pub fn gc(&mut self, cmd: GcCmd) -> i32 {
        match cmd {
            GcCmd::Stop => {
                self.g.gcrunning = false;
                0
            }
            GcCmd::Restart => {
                self.g.heap.set_debt(0);
                self.g.gcrunning = true;
                0
            }
            GcCmd::Collect => {
                self.full_gc_cycle();
                0
            }
            GcCmd::Count => (self.g.heap.total_bytes() >> 10) as i32,
            GcCmd::CountB => (self.g.heap.total_bytes() & 0x3ff) as i32,
            GcCmd::Step(kib) => {
                if self.g.gckind == GcKind::Generational {
                    let res = (self.g.estimate == 0) as i32;
                    self.full_gc_cycle();
                    res
                } else {
                    let mut debt = kib as isize * 1024;
                    if self.g.gcrunning {
                        debt += self.g.heap.gcdebt;
                    }
                    self.g.heap.set_debt(debt);
                    self.full_gc_cycle();
                    // a full sweep always ends the cycle
                    1
                }
            }
            GcCmd::SetPause(p) => {
                let old = self.g.gcpause;
                self.g.gcpause = p;
                old
            }
            GcCmd::SetMajorInc(p) => {
                let old = self.g.gcmajorinc;
                self.g.gcmajorinc = p;
                old
            }
            GcCmd::SetStepMul(p) => {
                let old = self.g.gcstepmul;
                self.g.gcstepmul = p;
                old
            }
            GcCmd::IsRunning => self.g.gcrunning as i32,
            GcCmd::Generational => {
                self.g.gckind = GcKind::Generational;
                0
            }
            GcCmd::Incremental => {
                self.g.gckind = GcKind::Incremental;
                0
            }
        }
    }

    /// Is the upvalue cell behind this reference still open?
    pub fn upvalue_is_open(&self, up: ObjRef) -> bool {
        matches!(self.g.heap.upvalue(up), Upvalue::Open { .. })
    }
}
