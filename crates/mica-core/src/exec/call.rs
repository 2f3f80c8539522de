//! precall / postcall protocol and the outer call driver
//!
//! Calling a value consumes the function slot plus its arguments and
//! produces the results in the function's original position. Host
//! callables are invoked directly and complete within `precall`; script
//! functions get a frame and are executed by the interpreter. The
//! `__call` tag method splices a real callable under a non-function
//! value and retries.

use crate::error::Status;
use crate::exec::stack;
use crate::interp;
use crate::state::{callstatus, CallInfo, HookEvent, MAX_CCALLS, MIN_STACK, MULTRET};
use crate::state::hookmask;
use crate::tm::{self, TagMethod};
use crate::value::{HostFn, ObjKind, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

/// Grow the current frame's window when a MULTRET call left more values
/// than the frame reserved.
#[inline]
pub(crate) fn adjust_results(vm: &mut Vm, t: ThreadId, nresults: i32) {
    let th = vm.th_mut(t);
    if nresults == MULTRET && th.ci().top < th.top {
        let top = th.top;
        th.ci_mut().top = top;
    }
}

/// Deliver one hook event. The hook runs with hooks disabled, inside a
/// temporarily widened frame; its stack effects are rolled back.
pub(crate) fn do_hook(vm: &mut Vm, t: ThreadId, event: HookEvent, line: i32) -> Flow<()> {
    let Some(hook) = vm.th(t).hook else { return Ok(()) };
    if !vm.th(t).allowhook {
        return Ok(());
    }
    let (saved_top, saved_ci_top) = {
        let th = vm.th(t);
        (th.top, th.ci().top)
    };
    stack::reserve(vm, t, MIN_STACK)?;
    {
        let th = vm.th_mut(t);
        let new_top = th.top + MIN_STACK;
        th.ci_mut().top = new_top;
        debug_assert!(th.ci().top <= th.stack_last);
        th.allowhook = false;
        th.ci_mut().callstatus |= callstatus::HOOKED;
    }
    hook(vm, t, event, line)?;
    let th = vm.th_mut(t);
    debug_assert!(!th.allowhook);
    th.allowhook = true;
    th.ci_mut().top = saved_ci_top;
    th.top = saved_top;
    th.ci_mut().callstatus &= !callstatus::HOOKED;
    Ok(())
}

/// Call-hook delivery for a fresh script frame, with tail-call
/// detection from the caller's last opcode.
fn call_hook(vm: &mut Vm, t: ThreadId) -> Flow<()> {
    let mut event = HookEvent::Call;
    let th = vm.th(t);
    if th.ci.len() >= 2 {
        let prev = &th.ci[th.ci.len() - 2];
        if prev.is_script() {
            let pc = prev.savedpc();
            if pc > 0 {
                let cl = th.stack[prev.func].as_kind(ObjKind::Closure);
                if let Some(cl) = cl {
                    let proto = vm.g.heap.proto(vm.g.heap.closure(cl).proto);
                    if matches!(proto.code.get(pc - 1), Some(interp::Instr::TailCall { .. })) {
                        event = HookEvent::TailCall;
                    }
                }
            }
        }
    }
    if event == HookEvent::TailCall {
        vm.th_mut(t).ci_mut().callstatus |= callstatus::TAIL;
    }
    do_hook(vm, t, event, -1)
}

/// Resolve the host function pointer of a callable, if it is one.
fn host_callable(vm: &Vm, v: Value) -> Option<HostFn> {
    match v {
        Value::HostFn(f) => Some(f),
        Value::Object(r) if r.kind == ObjKind::HostClosure => Some(vm.g.heap.host_closure(r).f),
        _ => None,
    }
}

/// Rotate fixed parameters above the varargs: the fixed parameters move
/// to fresh slots at `top` (their originals nil'ed out) so the variadic
/// portion stays addressable between the function slot and the new base.
fn adjust_varargs(vm: &mut Vm, t: ThreadId, num_params: usize, actual: usize) -> usize {
    let th = vm.th_mut(t);
    debug_assert!(actual >= num_params);
    let fixed = th.top - actual;
    let base = th.top;
    for i in 0..num_params {
        th.stack[th.top] = th.stack[fixed + i];
        th.top += 1;
        th.stack[fixed + i] = Value::Nil;
    }
    base
}

/// Splice the `__call` tag method under a non-function value, shifting
/// the arguments right by one.
fn try_call_tm(vm: &mut Vm, t: ThreadId, func: usize) -> Flow<()> {
    let fv = vm.sv(t, func);
    let tm_v = tm::get_tm_by_obj(vm, fv, TagMethod::Call);
    if !tm_v.is_function() {
        return Err(tm::type_error(vm, t, fv, "call"));
    }
    stack::reserve(vm, t, 1)?;
    let th = vm.th_mut(t);
    let mut p = th.top;
    while p > func {
        th.stack[p] = th.stack[p - 1];
        p -= 1;
    }
    th.top += 1;
    th.stack[func] = tm_v;
    Ok(())
}

/// Prepare (and for host callables, run) a call of the value at stack
/// slot `func`. Returns true when the call already executed (host),
/// false when a script frame was pushed and the interpreter must run.
pub(crate) fn precall(vm: &mut Vm, t: ThreadId, func: usize, nresults: i32) -> Flow<bool> {
    loop {
        let fv = vm.sv(t, func);
        if let Some(f) = host_callable(vm, fv) {
            stack::reserve(vm, t, MIN_STACK)?;
            {
                let th = vm.th_mut(t);
                let ci = CallInfo::host(func, th.top + MIN_STACK, nresults);
                debug_assert!(ci.top <= th.stack_last);
                th.ci.push(ci);
            }
            if vm.th(t).hookmask & hookmask::CALL != 0 {
                do_hook(vm, t, HookEvent::Call, -1)?;
            }
            let n = f(vm, t)?;
            {
                let th = vm.th(t);
                debug_assert!(
                    (n as usize) <= th.top - (th.ci().func + 1),
                    "host function reported more results than it pushed"
                );
            }
            let first_result = vm.th(t).top - n as usize;
            postcall(vm, t, first_result)?;
            return Ok(true);
        }
        if let Some(cl) = fv.as_kind(ObjKind::Closure) {
            let proto_ref = vm.g.heap.closure(cl).proto;
            let (max_stack, num_params, is_vararg) = {
                let p = vm.g.heap.proto(proto_ref);
                (p.max_stack_size as usize, p.num_params as usize, p.is_vararg)
            };
            stack::reserve(vm, t, max_stack + num_params)?;
            {
                let th = vm.th_mut(t);
                let mut n = th.top - func - 1;
                while n < num_params {
                    th.stack[th.top] = Value::Nil;
                    th.top += 1;
                    n += 1;
                }
            }
            let actual = vm.th(t).top - func - 1;
            let base = if !is_vararg {
                func + 1
            } else {
                adjust_varargs(vm, t, num_params, actual)
            };
            {
                let th = vm.th_mut(t);
                let ci = CallInfo::script(func, base, base + max_stack, nresults);
                debug_assert!(ci.top <= th.stack_last);
                let top = ci.top;
                th.ci.push(ci);
                th.top = top;
            }
            if vm.th(t).hookmask & hookmask::CALL != 0 {
                call_hook(vm, t)?;
            }
            return Ok(false);
        }
        // not a function: retry with `__call` spliced in at `func`
        try_call_tm(vm, t, func)?;
    }
}

/// Finish a call: deliver the return hook, slide the results down to
/// the function slot, pad with nil, pop the frame. Returns 0 iff the
/// frame wanted MULTRET (the interpreter must not trim).
pub(crate) fn postcall(vm: &mut Vm, t: ThreadId, first_result: usize) -> Flow<i32> {
    let mut first_result = first_result;
    if vm.th(t).hookmask & (hookmask::RET | hookmask::LINE) != 0 {
        if vm.th(t).hookmask & hookmask::RET != 0 {
            let n_results = vm.th(t).top - first_result;
            do_hook(vm, t, HookEvent::Ret, -1)?;
            first_result = vm.th(t).top - n_results;
        }
        // line tracing in the caller restarts from its saved pc
        let th = vm.th_mut(t);
        if th.ci.len() >= 2 {
            let prev = &th.ci[th.ci.len() - 2];
            if prev.is_script() {
                th.oldpc = prev.savedpc();
            }
        }
    }
    let th = vm.th_mut(t);
    let ci = th.ci.pop().expect("postcall without a frame");
    let mut res = ci.func;
    let wanted = ci.nresults;
    let mut i = wanted;
    while i != 0 && first_result < th.top {
        th.stack[res] = th.stack[first_result];
        res += 1;
        first_result += 1;
        i -= 1;
    }
    while i > 0 {
        th.stack[res] = Value::Nil;
        res += 1;
        i -= 1;
    }
    th.top = res;
    Ok(wanted - MULTRET)
}

/// Call the value at `func` with everything above it as arguments.
/// Checks the nested-call ceiling (with headroom reserved for the
/// error-reporting path itself), tracks yieldability, runs script
/// frames to completion, and ends with a collection step.
pub(crate) fn do_call(
    vm: &mut Vm,
    t: ThreadId,
    func: usize,
    nresults: i32,
    allow_yield: bool,
) -> Flow<()> {
    {
        let th = vm.th_mut(t);
        th.ncalls += 1;
        let ncalls = th.ncalls;
        if ncalls >= MAX_CCALLS {
            if ncalls == MAX_CCALLS {
                return Err(vm.run_error(t, "C stack overflow"));
            } else if ncalls >= MAX_CCALLS + MAX_CCALLS / 8 {
                // error while handling a stack error
                return Err(vm.throw(t, Status::ErrErr));
            }
        }
    }
    if !allow_yield {
        vm.th_mut(t).nny += 1;
    }
    if !precall(vm, t, func, nresults)? {
        interp::execute(vm, t)?;
    }
    let th = vm.th_mut(t);
    if !allow_yield {
        th.nny -= 1;
    }
    th.ncalls -= 1;
    vm.check_gc();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Control;
    use crate::vm::Vm;

    fn add_two(vm: &mut Vm, t: ThreadId) -> Flow<u32> {
        let th = vm.th(t);
        let a = th.stack[th.ci().func + 1].as_number().unwrap_or(0.0);
        let b = th.stack[th.ci().func + 2].as_number().unwrap_or(0.0);
        let th = vm.th_mut(t);
        th.stack[th.top] = Value::Number(a + b);
        th.top += 1;
        Ok(1)
    }

    fn fail(vm: &mut Vm, t: ThreadId) -> Flow<u32> {
        Err(vm.run_error(t, "boom"))
    }

    #[test]
    fn test_precall_host_runs_immediately() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let base = vm.th(t).top;
        vm.push(t, Value::HostFn(add_two));
        vm.push(t, Value::Number(2.0));
        vm.push(t, Value::Number(3.0));
        let ran = precall(&mut vm, t, base, 1).unwrap();
        assert!(ran);
        let th = vm.th(t);
        assert_eq!(th.top, base + 1);
        assert_eq!(th.stack[base], Value::Number(5.0));
    }

    #[test]
    fn test_do_call_multret() {
        fn three(vm: &mut Vm, t: ThreadId) -> Flow<u32> {
            for i in 0..3 {
                let th = vm.th_mut(t);
                th.stack[th.top] = Value::Number(i as f64);
                th.top += 1;
            }
            Ok(3)
        }
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let base = vm.th(t).top;
        vm.push(t, Value::HostFn(three));
        do_call(&mut vm, t, base, MULTRET, false).unwrap();
        let th = vm.th(t);
        assert_eq!(th.top, base + 3);
        assert_eq!(th.stack[base + 2], Value::Number(2.0));
    }

    #[test]
    fn test_do_call_pads_missing_results() {
        fn none(_vm: &mut Vm, _t: ThreadId) -> Flow<u32> {
            Ok(0)
        }
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let base = vm.th(t).top;
        vm.push(t, Value::HostFn(none));
        do_call(&mut vm, t, base, 2, false).unwrap();
        let th = vm.th(t);
        assert_eq!(th.top, base + 2);
        assert!(th.stack[base].is_nil());
        assert!(th.stack[base + 1].is_nil());
    }

    #[test]
    fn test_call_non_function_without_tm_fails() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let base = vm.th(t).top;
        vm.push(t, Value::Number(7.0));
        vm.th_mut(t).nprotected += 1; // absorb the throw
        let r = do_call(&mut vm, t, base, 0, false);
        vm.th_mut(t).nprotected -= 1;
        assert!(matches!(r, Err(Control::Error(Status::RuntimeErr))));
        let msg = vm.value_str(vm.sv(t, vm.th(t).top - 1)).unwrap();
        assert!(msg.contains("attempt to call a number value"), "{}", msg);
    }

    #[test]
    fn test_host_error_propagates() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let base = vm.th(t).top;
        vm.push(t, Value::HostFn(fail));
        vm.th_mut(t).nprotected += 1;
        let r = do_call(&mut vm, t, base, 0, false);
        vm.th_mut(t).nprotected -= 1;
        assert!(matches!(r, Err(Control::Error(Status::RuntimeErr))));
    }
}
