//! The interpreter loop
//!
//! One `execute` activation drives script frames until the frame it
//! entered on returns. Script-to-script calls stay inside the same
//! activation (the callee frame is tagged `REENTRY`); host boundaries
//! return to their caller. Suspensions unwind through here as plain
//! control propagation — the frame's saved pc carries the resume point,
//! and `finish_op` completes an instruction whose metamethod call was
//! interrupted.

use crate::error::{Control, Status};
use crate::exec::{call, stack};
use crate::gc::header::ObjBody;
use crate::object::{ScriptClosure, Table};
use crate::state::{callstatus, hookmask, FrameKind, HookEvent, MULTRET};
use crate::value::{ObjKind, ObjRef, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

use super::ops;
use super::{CompareOp, Instr};

/// Count/line hook delivery before an instruction, including the
/// yield-from-hook protocol: a hook that suspended sets `HOOKYIELD`,
/// rewinds the pc so the instruction re-executes on resume, and unwinds.
fn trace_exec(vm: &mut Vm, t: ThreadId, pc: usize, proto_ref: ObjRef) -> Flow<()> {
    {
        let th = vm.th_mut(t);
        if th.ci().callstatus & callstatus::HOOKYIELD != 0 {
            // re-execution after a hook yield: skip hooks this once
            th.ci_mut().callstatus &= !callstatus::HOOKYIELD;
            th.oldpc = pc;
            return Ok(());
        }
    }
    let mask = vm.th(t).hookmask;
    if mask & hookmask::COUNT != 0 {
        let fire = {
            let th = vm.th_mut(t);
            th.hookcount -= 1;
            if th.hookcount == 0 {
                th.reset_hookcount();
                true
            } else {
                false
            }
        };
        if fire {
            call::do_hook(vm, t, HookEvent::Count, -1)?;
        }
    }
    if mask & hookmask::LINE != 0 {
        let (line, changed) = {
            let proto = vm.g.heap.proto(proto_ref);
            let line = proto.line_at(pc) as i32;
            let oldpc = vm.th(t).oldpc;
            (line, pc <= oldpc || line != proto.line_at(oldpc) as i32)
        };
        if changed {
            call::do_hook(vm, t, HookEvent::Line, line)?;
        }
    }
    vm.th_mut(t).oldpc = pc;
    if vm.th(t).status == Status::Yield {
        // the hook yielded: the script frame itself carries the
        // suspension point
        let ci = vm.th_mut(t).ci_mut();
        ci.callstatus |= callstatus::HOOKYIELD;
        ci.set_savedpc(pc);
        return Err(Control::Yield);
    }
    Ok(())
}

/// Run the current script frame (and any script frames it calls) until
/// the frame this activation entered on returns.
pub(crate) fn execute(vm: &mut Vm, t: ThreadId) -> Flow<()> {
    'newframe: loop {
        let (base, proto_ref, cl_ref) = {
            let th = vm.th(t);
            let ci = th.ci();
            debug_assert!(ci.is_script(), "interpreter entered on a host frame");
            let cl = th.stack[ci.func]
                .as_kind(ObjKind::Closure)
                .expect("script frame without a script closure");
            (ci.base(), vm.g.heap.closure(cl).proto, cl)
        };
        loop {
            let pc = vm.th(t).ci().savedpc();
            if vm.th(t).hookmask & (hookmask::LINE | hookmask::COUNT) != 0 {
                trace_exec(vm, t, pc, proto_ref)?;
            }
            let instr = vm.g.heap.proto(proto_ref).code[pc];
            vm.th_mut(t).ci_mut().set_savedpc(pc + 1);
            match instr {
                Instr::Move { a, b } => {
                    let v = vm.sv(t, base + b as usize);
                    vm.set_sv(t, base + a as usize, v);
                }
                Instr::LoadK { a, k } => {
                    let v = vm.g.heap.proto(proto_ref).k[k as usize];
                    vm.set_sv(t, base + a as usize, v);
                }
                Instr::LoadBool { a, b, skip } => {
                    vm.set_sv(t, base + a as usize, Value::Boolean(b));
                    if skip {
                        let th = vm.th_mut(t);
                        let pc = th.ci().savedpc();
                        th.ci_mut().set_savedpc(pc + 1);
                    }
                }
                Instr::LoadNil { a, n } => {
                    for i in 0..=n as usize {
                        vm.set_sv(t, base + a as usize + i, Value::Nil);
                    }
                }
                Instr::GetUpval { a, b } => {
                    let up = vm.g.heap.closure(cl_ref).upvals[b as usize];
                    let v = ops::read_upvalue(vm, up);
                    vm.set_sv(t, base + a as usize, v);
                }
                Instr::SetUpval { a, b } => {
                    let up = vm.g.heap.closure(cl_ref).upvals[b as usize];
                    let v = vm.sv(t, base + a as usize);
                    ops::write_upvalue(vm, up, v);
                }
                Instr::GetTabUp { a, b, k } => {
                    let up = vm.g.heap.closure(cl_ref).upvals[b as usize];
                    let table = ops::read_upvalue(vm, up);
                    let key = vm.g.heap.proto(proto_ref).k[k as usize];
                    ops::get_in(vm, t, table, key, base + a as usize)?;
                }
                Instr::SetTabUp { a, k, b } => {
                    let up = vm.g.heap.closure(cl_ref).upvals[a as usize];
                    let table = ops::read_upvalue(vm, up);
                    let key = vm.g.heap.proto(proto_ref).k[k as usize];
                    let val = vm.sv(t, base + b as usize);
                    ops::set_in(vm, t, table, key, val)?;
                }
                Instr::GetTable { a, b, c } => {
                    let tv = vm.sv(t, base + b as usize);
                    let key = vm.sv(t, base + c as usize);
                    ops::get_in(vm, t, tv, key, base + a as usize)?;
                }
                Instr::SetTable { a, b, c } => {
                    let tv = vm.sv(t, base + a as usize);
                    let key = vm.sv(t, base + b as usize);
                    let val = vm.sv(t, base + c as usize);
                    ops::set_in(vm, t, tv, key, val)?;
                }
                Instr::NewTable { a, narr, nrec } => {
                    let r = vm.alloc_obj(
                        t,
                        ObjBody::Table(Table::new(narr as usize, nrec as usize)),
                    )?;
                    vm.set_sv(t, base + a as usize, Value::Object(r));
                    vm.check_gc();
                }
                Instr::Arith { op, a, b, c } => {
                    let rb = vm.sv(t, base + b as usize);
                    let rc = if op == super::ArithOp::Unm {
                        rb
                    } else {
                        vm.sv(t, base + c as usize)
                    };
                    if let (Value::Number(x), Value::Number(y)) = (rb, rc) {
                        vm.set_sv(t, base + a as usize, Value::Number(ops::raw_arith(op, x, y)));
                    } else {
                        ops::arith(vm, t, base + a as usize, rb, rc, op)?;
                    }
                }
                Instr::Not { a, b } => {
                    let v = vm.sv(t, base + b as usize);
                    vm.set_sv(t, base + a as usize, Value::Boolean(!v.is_truthy()));
                }
                Instr::Len { a, b } => {
                    let v = vm.sv(t, base + b as usize);
                    ops::obj_len(vm, t, base + a as usize, v)?;
                }
                Instr::Concat { a, b, c } => {
                    vm.th_mut(t).top = base + c as usize + 1;
                    ops::concat(vm, t, (c - b + 1) as usize)?;
                    let v = vm.sv(t, base + b as usize);
                    vm.set_sv(t, base + a as usize, v);
                    vm.check_gc();
                    let top = vm.th(t).ci().top;
                    vm.th_mut(t).top = top;
                }
                Instr::Jmp { offset } => {
                    let th = vm.th_mut(t);
                    let pc = th.ci().savedpc() as i64;
                    th.ci_mut().set_savedpc((pc + offset as i64) as usize);
                }
                Instr::Cmp { op, expect, b, c } => {
                    let vb = vm.sv(t, base + b as usize);
                    let vc = vm.sv(t, base + c as usize);
                    let res = match op {
                        CompareOp::Eq => ops::equal_obj(vm, t, vb, vc)?,
                        CompareOp::Lt => ops::less_than(vm, t, vb, vc)?,
                        CompareOp::Le => ops::less_equal(vm, t, vb, vc)?,
                    };
                    if res != expect {
                        let th = vm.th_mut(t);
                        let pc = th.ci().savedpc();
                        th.ci_mut().set_savedpc(pc + 1);
                    }
                }
                Instr::Test { a, expect } => {
                    let v = vm.sv(t, base + a as usize);
                    if v.is_truthy() != expect {
                        let th = vm.th_mut(t);
                        let pc = th.ci().savedpc();
                        th.ci_mut().set_savedpc(pc + 1);
                    }
                }
                Instr::Call { a, b, c } => {
                    let ra = base + a as usize;
                    let nresults = c as i32 - 1;
                    if b != 0 {
                        vm.th_mut(t).top = ra + b as usize;
                    }
                    if call::precall(vm, t, ra, nresults)? {
                        // host call completed in place
                        if nresults >= 0 {
                            let top = vm.th(t).ci().top;
                            vm.th_mut(t).top = top;
                        }
                    } else {
                        vm.th_mut(t).ci_mut().callstatus |= callstatus::REENTRY;
                        continue 'newframe;
                    }
                }
                Instr::TailCall { a, b } => {
                    let ra = base + a as usize;
                    if b != 0 {
                        vm.th_mut(t).top = ra + b as usize;
                    }
                    if call::precall(vm, t, ra, MULTRET)? {
                        // host call already completed; the following
                        // Return ships its results
                    } else {
                        tail_merge_frames(vm, t, proto_ref);
                        continue 'newframe;
                    }
                }
                Instr::Return { a, b } => {
                    let ra = base + a as usize;
                    if b != 0 {
                        vm.th_mut(t).top = ra + b as usize - 1;
                    }
                    if !vm.g.heap.proto(proto_ref).protos.is_empty() {
                        stack::close_upvalues(vm, t, base);
                    }
                    let reentry = vm.th(t).ci().callstatus & callstatus::REENTRY != 0;
                    let fixed = call::postcall(vm, t, ra)?;
                    if !reentry {
                        // this activation's entry frame returned
                        return Ok(());
                    }
                    if fixed != 0 {
                        let top = vm.th(t).ci().top;
                        vm.th_mut(t).top = top;
                    }
                    continue 'newframe;
                }
                Instr::Closure { a, bx } => {
                    let sub = vm.g.heap.proto(proto_ref).protos[bx as usize];
                    let r = instantiate_closure(vm, t, sub, cl_ref, base)?;
                    vm.set_sv(t, base + a as usize, Value::Object(r));
                    vm.check_gc();
                }
                Instr::Vararg { a, b } => {
                    let ra = base + a as usize;
                    let (func, num_params) = {
                        let th = vm.th(t);
                        let func = th.ci().func;
                        let p = vm.g.heap.proto(proto_ref);
                        (func, p.num_params as usize)
                    };
                    let n = base - func - 1 - num_params;
                    let wanted = if b == 0 {
                        stack::reserve(vm, t, n)?;
                        vm.th_mut(t).top = ra + n;
                        n
                    } else {
                        b as usize - 1
                    };
                    for j in 0..wanted {
                        let v = if j < n {
                            vm.sv(t, base - n + j)
                        } else {
                            Value::Nil
                        };
                        vm.set_sv(t, ra + j, v);
                    }
                }
            }
        }
    }
}

/// Instantiate a closure over `sub`, capturing upvalues per its
/// descriptors: open over the current frame's stack, or shared from the
/// enclosing closure.
fn instantiate_closure(
    vm: &mut Vm,
    t: ThreadId,
    sub: ObjRef,
    enclosing: ObjRef,
    base: usize,
) -> Flow<ObjRef> {
    let descs: Vec<(bool, u8)> = vm
        .g
        .heap
        .proto(sub)
        .upvalues
        .iter()
        .map(|d| (d.in_stack, d.index))
        .collect();
    let mut upvals = Vec::with_capacity(descs.len());
    for (in_stack, index) in descs {
        let up = if in_stack {
            stack::find_upvalue(vm, t, base + index as usize)?
        } else {
            vm.g.heap.closure(enclosing).upvals[index as usize]
        };
        upvals.push(up);
    }
    vm.alloc_obj(t, ObjBody::Closure(ScriptClosure { proto: sub, upvals }))
}

/// Tail call to a script function: the callee frame replaces the caller
/// frame, sliding the function and its arguments down over the caller's
/// slot and keeping the caller's expected result count.
fn tail_merge_frames(vm: &mut Vm, t: ThreadId, caller_proto: ObjRef) {
    if !vm.g.heap.proto(caller_proto).protos.is_empty() {
        let caller_base = {
            let th = vm.th(t);
            th.ci[th.ci.len() - 2].base()
        };
        stack::close_upvalues(vm, t, caller_base);
    }
    let callee_params = {
        let th = vm.th(t);
        let nfunc = th.ci().func;
        let cl = th.stack[nfunc]
            .as_kind(ObjKind::Closure)
            .expect("tail call target is a script closure");
        vm.g.heap.proto(vm.g.heap.closure(cl).proto).num_params as usize
    };
    let th = vm.th_mut(t);
    let nci = th.ci.pop().expect("callee frame");
    let nfunc = nci.func;
    let nbase = nci.base();
    let ofunc = th.ci().func;
    let lim = nbase + callee_params;
    let mut aux = 0;
    while nfunc + aux < lim {
        th.stack[ofunc + aux] = th.stack[nfunc + aux];
        aux += 1;
    }
    let new_base = ofunc + (nbase - nfunc);
    let new_top = ofunc + (th.top - nfunc);
    th.top = new_top;
    let ci = th.ci_mut();
    ci.top = new_top;
    ci.frame = FrameKind::Script { base: new_base, savedpc: 0 };
    ci.callstatus |= callstatus::TAIL;
}

/// Complete an instruction whose metamethod call was interrupted by a
/// suspension: materialize the pending result (or finish the pending
/// fold) exactly as the uninterrupted instruction would have.
pub(crate) fn finish_op(vm: &mut Vm, t: ThreadId) -> Flow<()> {
    let (base, proto_ref, pc) = {
        let th = vm.th(t);
        let ci = th.ci();
        debug_assert!(ci.is_script());
        let cl = th.stack[ci.func]
            .as_kind(ObjKind::Closure)
            .expect("script frame without a script closure");
        (ci.base(), vm.g.heap.closure(cl).proto, ci.savedpc())
    };
    let instr = vm.g.heap.proto(proto_ref).code[pc - 1];
    match instr {
        Instr::Arith { a, .. }
        | Instr::GetTabUp { a, .. }
        | Instr::GetTable { a, .. }
        | Instr::Len { a, .. } => {
            let th = vm.th_mut(t);
            th.top -= 1;
            let v = th.stack[th.top];
            th.stack[base + a as usize] = v;
        }
        Instr::Cmp { expect, .. } => {
            let th = vm.th_mut(t);
            th.top -= 1;
            let res = th.stack[th.top].is_truthy();
            debug_assert!(matches!(
                vm.g.heap.proto(proto_ref).code[pc],
                Instr::Jmp { .. }
            ));
            if res != expect {
                let th = vm.th_mut(t);
                th.ci_mut().set_savedpc(pc + 1);
            }
        }
        Instr::Concat { a, b, .. } => {
            let top = vm.th(t).top - 1; // top when the handler was called
            let total = top - 1 - (base + b as usize);
            let v = vm.sv(t, top);
            vm.set_sv(t, top - 2, v);
            if total > 1 {
                vm.th_mut(t).top = top - 1;
                ops::concat(vm, t, total)?;
            }
            let res = vm.sv(t, vm.th(t).top - 1);
            vm.set_sv(t, base + a as usize, res);
            let frame_top = vm.th(t).ci().top;
            vm.th_mut(t).top = frame_top;
        }
        Instr::SetTabUp { .. } | Instr::SetTable { .. } => {}
        Instr::Call { c, .. } => {
            if c != 0 {
                let top = vm.th(t).ci().top;
                vm.th_mut(t).top = top;
            }
        }
        Instr::TailCall { .. } => {}
        other => debug_assert!(false, "no pending completion for {:?}", other),
    }
    Ok(())
}
