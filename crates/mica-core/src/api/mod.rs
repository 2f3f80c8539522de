//! Embedding API
//!
//! Host programs drive the runtime through these entries. Stack slots
//! are addressed by signed indices: positive from the current frame's
//! function slot, negative from the top, with the registry and the
//! current host closure's upvalues behind pseudo-indices below
//! [`crate::state::REGISTRY_INDEX`].
//!
//! Invalid indices and frame-top overflows are host programming errors:
//! they are asserted in debug builds and answered with the no-value
//! sentinel (or ignored) in release builds.

pub mod access;
pub mod exec;
pub mod misc;
pub mod push;
pub mod query;
pub mod stack;

use crate::state::{MAX_UPVAL, REGISTRY_INDEX};
use crate::value::{ObjKind, ObjRef, Value};
use crate::vm::{ThreadId, Vm};

/// Resolved write target of a stack index.
pub(crate) enum Place {
    /// Absolute stack slot
    Stack(usize),
    /// The registry pseudo-slot
    Registry,
    /// Upvalue cell `n` (0-based) of the current host closure
    Upvalue(ObjRef, usize),
    /// Unacceptable index
    Invalid,
}

impl Vm {
    /// Read the value at an acceptable index. `None` is the no-value
    /// sentinel: a position between `top` and the frame ceiling, a
    /// missing upvalue, or (in release builds) an invalid index.
    pub(crate) fn index_value(&self, t: ThreadId, idx: i32) -> Option<Value> {
        let th = self.th(t);
        let ci = th.ci();
        if idx > 0 {
            let o = ci.func + idx as usize;
            debug_assert!(
                idx as usize <= ci.top - (ci.func + 1),
                "unacceptable index {}",
                idx
            );
            if o >= th.top {
                None
            } else {
                Some(th.stack[o])
            }
        } else if idx > REGISTRY_INDEX {
            debug_assert!(
                idx != 0 && (-idx) as usize <= th.top - (ci.func + 1),
                "invalid index {}",
                idx
            );
            if idx == 0 || (-idx) as usize > th.top - (ci.func + 1) {
                return None;
            }
            Some(th.stack[(th.top as i64 + idx as i64) as usize])
        } else if idx == REGISTRY_INDEX {
            Some(self.g.registry)
        } else {
            let n = (REGISTRY_INDEX - idx) as usize;
            debug_assert!(n <= MAX_UPVAL + 1, "upvalue index too large");
            match th.stack[ci.func] {
                Value::Object(r) if r.kind == ObjKind::HostClosure => {
                    self.g.heap.host_closure(r).upvals.get(n - 1).copied()
                }
                // light host function: no upvalues
                _ => None,
            }
        }
    }

    /// Resolve an index to a writable place.
    pub(crate) fn index_place(&self, t: ThreadId, idx: i32) -> Place {
        let th = self.th(t);
        let ci = th.ci();
        if idx > 0 {
            let o = ci.func + idx as usize;
            if o < th.top {
                Place::Stack(o)
            } else {
                debug_assert!(false, "unacceptable index {}", idx);
                Place::Invalid
            }
        } else if idx > REGISTRY_INDEX {
            if idx != 0 && (-idx) as usize <= th.top - (ci.func + 1) {
                Place::Stack((th.top as i64 + idx as i64) as usize)
            } else {
                debug_assert!(false, "invalid index {}", idx);
                Place::Invalid
            }
        } else if idx == REGISTRY_INDEX {
            Place::Registry
        } else {
            let n = (REGISTRY_INDEX - idx) as usize;
            match th.stack[ci.func] {
                Value::Object(r) if r.kind == ObjKind::HostClosure => {
                    if n - 1 < self.g.heap.host_closure(r).upvals.len() {
                        Place::Upvalue(r, n - 1)
                    } else {
                        Place::Invalid
                    }
                }
                _ => Place::Invalid,
            }
        }
    }

    /// Store a value at a resolved place. Writes to upvalue cells go
    /// through the host closure; writes to the registry replace the
    /// registry value itself (the collector rescans it, so no write
    /// barrier is involved there).
    pub(crate) fn place_store(&mut self, t: ThreadId, place: Place, v: Value) {
        match place {
            Place::Stack(i) => self.set_sv(t, i, v),
            Place::Registry => self.g.registry = v,
            Place::Upvalue(cl, n) => self.g.heap.host_closure_mut(cl).upvals[n] = v,
            Place::Invalid => {}
        }
    }
}
