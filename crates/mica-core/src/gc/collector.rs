//! Mark & sweep collection over the arena
//!
//! Stop-the-world tracing: roots are the registry, the per-type
//! metatables, the pinned names, and every thread that is either the
//! main thread or currently inside a call or protected scope (a thread
//! that is merely suspended stays collectable, like any other object).
//! Finalizable objects are separated on first unreachability,
//! resurrected for one cycle, and have `__gc` run before they are freed
//! for good.

use crate::error::Status;
use crate::exec::{call, protect, stack};
use crate::gc::header::ObjBody;
use crate::object::{TableKey, Upvalue};
use crate::state::{GlobalState, ThreadState};
use crate::tm::TagMethod;
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

/// One full collection cycle: mark, separate finalizable garbage,
/// sweep. Does not run finalizers (script code); see [`run_finalizers`].
pub(crate) fn collect(g: &mut GlobalState, threads: &mut Vec<Option<Box<ThreadState>>>) {
    clear_marks(g);
    mark_roots(g, threads);
    separate_finalizable(g, threads);
    sweep(g, threads);
}

fn clear_marks(g: &mut GlobalState) {
    for i in 0..g.heap.slot_count() {
        if let Some(b) = g.heap.slot_mut(i) {
            b.header.marked = false;
        }
    }
}

fn mark_roots(g: &mut GlobalState, threads: &[Option<Box<ThreadState>>]) {
    let mut work: Vec<ObjRef> = Vec::new();
    let registry = g.registry;
    mark_value(g, &mut work, registry);
    let metatables = g.mt;
    for r in metatables.into_iter().flatten() {
        mark_ref(g, &mut work, r);
    }
    let names: Vec<ObjRef> = g.tm_names.clone();
    for r in names {
        mark_ref(g, &mut work, r);
    }
    if let Some(r) = g.memerrmsg {
        mark_ref(g, &mut work, r);
    }
    // pinned objects and threads with live activations
    for i in 0..g.heap.slot_count() {
        let root = match g.heap.slot(i) {
            Some(b) if b.header.fixed => Some(b.header.kind),
            Some(b) => match b.body {
                ObjBody::Thread(tid) => {
                    let active = threads
                        .get(tid.0 as usize)
                        .and_then(|s| s.as_ref())
                        .map(|th| th.ncalls > 0 || th.nprotected > 0)
                        .unwrap_or(false);
                    if active {
                        Some(b.header.kind)
                    } else {
                        None
                    }
                }
                _ => None,
            },
            None => None,
        };
        if let Some(kind) = root {
            mark_ref(g, &mut work, ObjRef { kind, index: i as u32 });
        }
    }
    // pending finalizers stay alive until they have run
    let pending: Vec<ObjRef> = g.heap.tobefnz.clone();
    for r in pending {
        mark_ref(g, &mut work, r);
    }
    propagate(g, threads, &mut work);
}

fn mark_value(g: &mut GlobalState, work: &mut Vec<ObjRef>, v: Value) {
    if let Value::Object(r) = v {
        mark_ref(g, work, r);
    }
}

fn mark_ref(g: &mut GlobalState, work: &mut Vec<ObjRef>, r: ObjRef) {
    if let Some(b) = g.heap.boxed_mut(r) {
        if b.header.kind == r.kind && !b.header.marked {
            b.header.marked = true;
            work.push(r);
        }
    }
}

fn propagate(g: &mut GlobalState, threads: &[Option<Box<ThreadState>>], work: &mut Vec<ObjRef>) {
    while let Some(r) = work.pop() {
        let children = gather(g, threads, r);
        for c in children {
            mark_ref(g, work, c);
        }
    }
}

/// References held by one object. Open upvalues contribute nothing of
/// their own: their storage is a stack slot, marked with the thread.
fn gather(g: &GlobalState, threads: &[Option<Box<ThreadState>>], r: ObjRef) -> Vec<ObjRef> {
    fn push_val(out: &mut Vec<ObjRef>, v: Value) {
        if let Value::Object(c) = v {
            out.push(c);
        }
    }
    let mut out = Vec::new();
    let Some(b) = g.heap.boxed(r) else { return out };
    match &b.body {
        ObjBody::Str(_) => {}
        ObjBody::Table(t) => {
            if let Some(mt) = t.metatable {
                out.push(mt);
            }
            let mut cursor = 0;
            while let Some((next, key, v)) = t.next_entry(cursor) {
                match key {
                    TableKey::IStr(k) | TableKey::Obj(k) => out.push(k),
                    _ => {}
                }
                push_val(&mut out, v);
                cursor = next;
            }
        }
        ObjBody::Userdata(u) => {
            if let Some(mt) = u.metatable {
                out.push(mt);
            }
            if let Some(uv) = u.uservalue {
                out.push(uv);
            }
        }
        ObjBody::Proto(p) => {
            for v in &p.k {
                push_val(&mut out, *v);
            }
            out.extend(p.protos.iter().copied());
            if let Some(src) = p.source {
                out.push(src);
            }
        }
        ObjBody::Closure(c) => {
            out.push(c.proto);
            out.extend(c.upvals.iter().copied());
        }
        ObjBody::HostClosure(c) => {
            for v in &c.upvals {
                push_val(&mut out, *v);
            }
        }
        ObjBody::Upvalue(u) => {
            if let Upvalue::Closed(v) = u {
                push_val(&mut out, *v);
            }
        }
        ObjBody::Thread(tid) => {
            if let Some(th) = threads.get(tid.0 as usize).and_then(|s| s.as_ref()) {
                for i in 0..th.top {
                    push_val(&mut out, th.stack[i]);
                }
                out.extend(th.openupval.iter().copied());
            }
        }
    }
    out
}

/// Move unreachable finalizable objects to the pending list and
/// resurrect them (and what they reference) for this cycle.
fn separate_finalizable(g: &mut GlobalState, threads: &[Option<Box<ThreadState>>]) {
    let finobj = std::mem::take(&mut g.heap.finobj);
    let mut kept = Vec::with_capacity(finobj.len());
    let mut work: Vec<ObjRef> = Vec::new();
    for r in finobj {
        let dead = matches!(g.heap.boxed(r), Some(b) if !b.header.marked);
        if dead {
            if let Some(b) = g.heap.boxed_mut(r) {
                b.header.in_finobj = false;
            }
            g.heap.tobefnz.push(r);
            mark_ref(g, &mut work, r);
        } else if g.heap.boxed(r).is_some() {
            kept.push(r);
        }
    }
    propagate(g, threads, &mut work);
    g.heap.finobj = kept;
}

fn sweep(g: &mut GlobalState, threads: &mut Vec<Option<Box<ThreadState>>>) {
    for i in 0..g.heap.slot_count() {
        let dead = matches!(g.heap.slot(i), Some(b) if !b.header.marked && !b.header.fixed);
        if !dead {
            continue;
        }
        if let Some(ObjBody::Thread(tid)) = g.heap.free_slot(i as u32) {
            free_thread(g, threads, tid);
        }
    }
}

/// Free a dead thread's state, first closing any of its open upvalues
/// that survive it.
fn free_thread(
    g: &mut GlobalState,
    threads: &mut Vec<Option<Box<ThreadState>>>,
    tid: crate::vm::ThreadId,
) {
    let Some(th) = threads.get_mut(tid.0 as usize).and_then(|s| s.take()) else {
        return;
    };
    for upref in &th.openupval {
        if let Some(b) = g.heap.boxed_mut(*upref) {
            if let ObjBody::Upvalue(u) = &mut b.body {
                if let Upvalue::Open { slot, .. } = *u {
                    *u = Upvalue::Closed(th.stack[slot]);
                }
            }
        }
    }
}

/// Record a finalizer at `set_metatable` time: only a metatable that
/// already carries a non-nil `__gc` links the object for finalization,
/// and only once.
pub(crate) fn check_finalizer(g: &mut GlobalState, obj: ObjRef, mt: ObjRef) {
    let already = match g.heap.boxed(obj) {
        Some(b) => b.header.in_finobj || b.header.finalized,
        None => return,
    };
    if already {
        return;
    }
    let gc_name = g.tm_names[TagMethod::Gc as usize];
    let has_gc = !g
        .heap
        .table(mt)
        .get_key(&TableKey::IStr(gc_name))
        .is_nil();
    if !has_gc {
        return;
    }
    if let Some(b) = g.heap.boxed_mut(obj) {
        b.header.in_finobj = true;
    }
    g.heap.finobj.push(obj);
}

/// Run pending finalizers on the main thread, each under a protected,
/// non-yieldable scope with hooks disabled. Errors in finalizers are
/// swallowed.
pub(crate) fn run_finalizers(vm: &mut Vm) {
    while let Some(obj) = vm.g.heap.tobefnz.pop() {
        if let Some(b) = vm.g.heap.boxed_mut(obj) {
            b.header.finalized = true;
        } else {
            continue;
        }
        let tm = crate::tm::get_tm_by_obj(vm, Value::Object(obj), TagMethod::Gc);
        if !tm.is_function() {
            continue;
        }
        let t = vm.main_thread();
        let old_top = vm.th(t).top;
        let old_allowhook = vm.th(t).allowhook;
        vm.th_mut(t).allowhook = false;
        vm.th_mut(t).nny += 1;
        let status = protect::raw_run_protected(vm, t, |vm, t| {
            stack::reserve(vm, t, 2)?;
            let th = vm.th_mut(t);
            let func = th.top;
            th.stack[th.top] = tm;
            th.top += 1;
            th.stack[th.top] = Value::Object(obj);
            th.top += 1;
            call::do_call(vm, t, func, 0, false)
        });
        let th = vm.th_mut(t);
        th.nny -= 1;
        th.allowhook = old_allowhook;
        if status != Status::Ok {
            th.top = old_top;
        }
    }
}

/// Close-time sweep: every object still linked for finalization gets its
/// finalizer, reachable or not, then the heap is dropped with the
/// runtime.
pub(crate) fn finalize_all(vm: &mut Vm) {
    vm.g.gcrunning = false;
    let finobj = std::mem::take(&mut vm.g.heap.finobj);
    for r in finobj {
        if let Some(b) = vm.g.heap.boxed_mut(r) {
            b.header.in_finobj = false;
        }
        vm.g.heap.tobefnz.push(r);
    }
    run_finalizers(vm);
}
