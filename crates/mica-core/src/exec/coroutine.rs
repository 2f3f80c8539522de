//! Coroutine scheduler
//!
//! A coroutine is an ordinary heap-managed thread sharing the global
//! state. `resume` transfers control into the target thread under a
//! protected scope; `yield` unwinds back to it by propagating the
//! distinguished yield control. Host frames survive a suspension only
//! through their registered continuation, which is invoked in place of
//! the frame's normal return on the next resume; `unroll` then drives
//! the remainder of the call-info chain to completion, another yield,
//! or another error.

use crate::error::{Control, Status};
use crate::exec::{call, protect, stack};
use crate::interp;
use crate::state::{callstatus, FrameKind, MAX_CCALLS, MULTRET};
use crate::value::Value;
use crate::vm::{ThreadId, Vm};
use crate::Flow;

/// Report an error in the *use* of `resume`: the target's stack is
/// reset to the arguments' base, the message is pushed, and the misuse
/// control unwinds straight to `resume` without touching the target's
/// recovery machinery.
fn resume_error(vm: &mut Vm, t: ThreadId, msg: &str, first_arg: usize) -> Control {
    vm.th_mut(t).top = first_arg;
    match vm.g.heap.try_new_str(msg) {
        Ok(r) => {
            let th = vm.th_mut(t);
            th.stack[th.top] = Value::Object(r);
            th.top += 1;
        }
        Err(_) => return vm.throw(t, Status::MemErr),
    }
    Control::ResumeMisuse
}

/// The protected body of `resume`.
fn resume_body(vm: &mut Vm, t: ThreadId, first_arg: usize) -> Flow<()> {
    if vm.th(t).ncalls >= MAX_CCALLS {
        return Err(resume_error(vm, t, "C stack overflow", first_arg));
    }
    match vm.th(t).status {
        Status::Ok => {
            if vm.th(t).finished {
                return Err(resume_error(vm, t, "cannot resume dead coroutine", first_arg));
            }
            // first resume: the chain must be at the base sentinel
            if !vm.th(t).at_base() {
                return Err(resume_error(
                    vm,
                    t,
                    "cannot resume non-suspended coroutine",
                    first_arg,
                ));
            }
            if !call::precall(vm, t, first_arg - 1, MULTRET)? {
                interp::execute(vm, t)?;
            }
        }
        Status::Yield => {
            vm.th_mut(t).status = Status::Ok;
            // restore the frame's function slot from the saved offset
            let extra = vm.th(t).ci().extra;
            vm.th_mut(t).ci_mut().func = extra;
            if vm.th(t).ci().is_script() {
                // suspension happened inside a hook: continue the
                // interpreter from the saved pc
                interp::execute(vm, t)?;
            } else {
                let mut first = first_arg;
                let k = match &vm.th(t).ci().frame {
                    FrameKind::Host { k, .. } => *k,
                    FrameKind::Script { .. } => unreachable!("checked above"),
                };
                if let Some(k) = k {
                    {
                        let ci = vm.th_mut(t).ci_mut();
                        if let FrameKind::Host { status, .. } = &mut ci.frame {
                            *status = Status::Yield;
                        }
                        ci.callstatus |= callstatus::YIELDED;
                    }
                    let n = k(vm, t)?;
                    debug_assert!((n as usize) <= vm.th(t).frame_height());
                    first = vm.th(t).top - n as usize;
                }
                call::postcall(vm, t, first)?;
            }
            unroll(vm, t)?;
        }
        _ => {
            return Err(resume_error(vm, t, "cannot resume dead coroutine", first_arg));
        }
    }
    Ok(())
}

/// Drive completion after a continuation has run or after an error has
/// been recovered: finish each host frame through its continuation and
/// each script frame through the interpreter, down to the base
/// sentinel. Nested yields and errors propagate out to `resume`'s
/// protection.
pub(crate) fn unroll(vm: &mut Vm, t: ThreadId) -> Flow<()> {
    loop {
        if vm.th(t).at_base() {
            return Ok(()); // coroutine finished normally
        }
        if !vm.th(t).ci().is_script() {
            finish_host_call(vm, t)?;
        } else {
            interp::finish_op(vm, t)?;
            interp::execute(vm, t)?;
        }
    }
}

/// Finish an interrupted `callk`: adjust the frame window, install the
/// default suspension status, run the continuation, and complete the
/// original precall.
fn finish_host_call(vm: &mut Vm, t: ThreadId) -> Flow<()> {
    debug_assert_eq!(vm.th(t).nny, 0);
    let (k, nresults) = {
        let ci = vm.th(t).ci();
        match &ci.frame {
            FrameKind::Host { k, .. } => (k.expect("continuation required"), ci.nresults),
            FrameKind::Script { .. } => unreachable!("host frame expected"),
        }
    };
    call::adjust_results(vm, t, nresults);
    {
        let ci = vm.th_mut(t).ci_mut();
        if ci.callstatus & callstatus::STAT == 0 {
            if let FrameKind::Host { status, .. } = &mut ci.frame {
                *status = Status::Yield;
            }
        }
        ci.callstatus =
            (ci.callstatus & !(callstatus::YPCALL | callstatus::STAT)) | callstatus::YIELDED;
    }
    let n = k(vm, t)?;
    debug_assert!((n as usize) <= vm.th(t).frame_height());
    let first_result = vm.th(t).top - n as usize;
    call::postcall(vm, t, first_result)?;
    Ok(())
}

/// Search the chain for a surviving yieldable protected call and, if
/// one exists, land the error there: restore its saved state, write the
/// error object, and report the status through the frame so its
/// continuation sees it.
fn recover(vm: &mut Vm, t: ThreadId, status: Status) -> bool {
    let Some(idx) = (0..vm.th(t).ci.len())
        .rev()
        .find(|&i| protect::is_recovery_point(vm, t, i))
    else {
        return false;
    };
    let oldtop = vm.th(t).ci[idx].extra;
    stack::close_upvalues(vm, t, oldtop);
    protect::set_error_obj(vm, t, status, oldtop);
    {
        let th = vm.th_mut(t);
        th.ci.truncate(idx + 1);
        let (old_allowhook, old_errfunc) = match &th.ci[idx].frame {
            FrameKind::Host { old_allowhook, old_errfunc, .. } => (*old_allowhook, *old_errfunc),
            FrameKind::Script { .. } => unreachable!("recovery point is a host frame"),
        };
        th.allowhook = old_allowhook;
        th.errfunc = old_errfunc;
        th.nny = 0; // coroutine stays yieldable
        let ci = th.ci_mut();
        ci.callstatus |= callstatus::STAT;
        if let FrameKind::Host { status: st, .. } = &mut ci.frame {
            *st = status;
        }
    }
    stack::shrink_stack(vm, t);
    true
}

/// Resume `target` with `nargs` arguments on its stack. The coroutine
/// inherits the resumer's nesting budget and exits non-yieldable.
pub(crate) fn resume(vm: &mut Vm, target: ThreadId, from: Option<ThreadId>, nargs: u32) -> Status {
    let from_ncalls = from.map(|f| vm.th(f).ncalls).unwrap_or(0);
    {
        let th = vm.th_mut(target);
        th.ncalls = from_ncalls + 1;
        th.nny = 0; // allow yields
        debug_assert!(
            th.frame_height()
                >= nargs as usize + if th.status == Status::Ok { 1 } else { 0 }
        );
    }
    let first_arg = vm.th(target).top - nargs as usize;
    let outcome =
        protect::raw_run_protected_full(vm, target, |vm, t| resume_body(vm, t, first_arg));
    let mut status = match outcome {
        Ok(()) => Status::Ok,
        Err(Control::Yield) => Status::Yield,
        Err(Control::Error(s)) => s,
        Err(Control::ResumeMisuse) => {
            // error in the call to resume itself: never enters the
            // target's recovery path, never kills the target
            let th = vm.th_mut(target);
            th.nny = 1;
            th.ncalls -= 1;
            return Status::RuntimeErr;
        }
    };
    while status.is_error() {
        if recover(vm, target, status) {
            // run the continuation of the recovered frame
            status = protect::raw_run_protected(vm, target, unroll);
        } else {
            // unrecoverable: mark the coroutine dead and expose the
            // error object to the resumer
            vm.th_mut(target).status = status;
            let top = vm.th(target).top;
            protect::set_error_obj(vm, target, status, top);
            let th = vm.th_mut(target);
            let new_top = th.top;
            th.ci_mut().top = new_top;
            break;
        }
    }
    let th = vm.th_mut(target);
    debug_assert!(status == Status::Ok || status == Status::Yield || status == th.status);
    if status == Status::Ok && th.ci.len() == 1 {
        th.finished = true;
    }
    th.nny = 1; // do not allow yields outside a resume
    th.ncalls -= 1;
    debug_assert_eq!(vm.th(target).ncalls, from_ncalls);
    status
}

/// Suspend the current call. Host frames register their continuation
/// and unwind; hook frames return to the hook dispatcher, which carries
/// the suspension through the script frame itself.
pub(crate) fn yieldk(
    vm: &mut Vm,
    t: ThreadId,
    nresults: u32,
    ctx: i64,
    k: Option<crate::value::HostFn>,
) -> Flow<u32> {
    debug_assert!(vm.th(t).frame_height() >= nresults as usize);
    if vm.th(t).nny > 0 {
        if t != vm.main_thread() {
            return Err(vm.run_error(t, "attempt to yield across host-call boundary"));
        }
        return Err(vm.run_error(t, "attempt to yield from outside a coroutine"));
    }
    vm.th_mut(t).status = Status::Yield;
    let func = vm.th(t).ci().func;
    vm.th_mut(t).ci_mut().extra = func;
    if vm.th(t).ci().is_script() {
        // yield from a count/line hook: no continuation is possible;
        // control returns to the hook dispatcher and the interpreter
        // completes the suspension
        debug_assert!(k.is_none(), "hooks cannot continue after yielding");
        return Ok(0);
    }
    {
        let th = vm.th_mut(t);
        let new_func = th.top - nresults as usize - 1;
        let ci = th.ci_mut();
        if k.is_some() {
            if let FrameKind::Host { k: slot, ctx: ctx_slot, .. } = &mut ci.frame {
                *slot = k;
                *ctx_slot = ctx;
            }
        }
        // protect the slots below the results
        ci.func = new_func;
    }
    Err(Control::Yield)
}
