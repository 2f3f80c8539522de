//! Protected execution and error propagation
//!
//! A protected scope is the Rust rendition of the original's long-jump
//! chain: `raw_run_protected` bumps the thread's protection depth, runs
//! the body, restores the depth and the saved nested-call counter, and
//! maps the propagated control back to a status. Raising is linear-time
//! (an `Err` return), each protection level costs O(1), and intervening
//! frames run no cleanup of their own — the boundary restores the call
//! engine's bookkeeping exactly as the original's recovery path does.

use crate::error::{Control, Status};
use crate::exec::{call, stack};
use crate::state::callstatus;
use crate::value::Value;
use crate::vm::{ThreadId, Vm};
use crate::Flow;

/// Run `f` under a fresh protection level, returning the raw control
/// outcome. The thread's `ncalls` is restored whether or not `f`
/// completed.
pub(crate) fn raw_run_protected_full<F>(vm: &mut Vm, t: ThreadId, f: F) -> Result<(), Control>
where
    F: FnOnce(&mut Vm, ThreadId) -> Flow<()>,
{
    let old_ncalls = vm.th(t).ncalls;
    vm.th_mut(t).nprotected += 1;
    let r = f(vm, t);
    let th = vm.th_mut(t);
    th.nprotected -= 1;
    th.ncalls = old_ncalls;
    r
}

/// Like [`raw_run_protected_full`], collapsed to a status. Resume-misuse
/// errors surface as runtime errors.
pub(crate) fn raw_run_protected<F>(vm: &mut Vm, t: ThreadId, f: F) -> Status
where
    F: FnOnce(&mut Vm, ThreadId) -> Flow<()>,
{
    match raw_run_protected_full(vm, t, f) {
        Ok(()) => Status::Ok,
        Err(Control::Yield) => Status::Yield,
        Err(Control::Error(s)) => s,
        Err(Control::ResumeMisuse) => Status::RuntimeErr,
    }
}

/// Materialize the error object for `code` at `oldtop`, truncating
/// everything above it.
pub(crate) fn set_error_obj(vm: &mut Vm, t: ThreadId, code: Status, oldtop: usize) {
    let v = match code {
        Status::MemErr => {
            // preregistered message: this path cannot allocate
            Value::Object(vm.g.memerrmsg.expect("memory-error message interned at startup"))
        }
        Status::ErrErr => match vm.g.heap.try_new_str("error in error handling") {
            Ok(r) => Value::Object(r),
            Err(_) => Value::Object(vm.g.memerrmsg.expect("memory-error message interned at startup")),
        },
        _ => {
            let th = vm.th(t);
            th.stack[th.top - 1]
        }
    };
    let th = vm.th_mut(t);
    th.stack[oldtop] = v;
    th.top = oldtop + 1;
}

/// Protected call of an engine body (the recovery half of `pcall`):
/// saves the frame chain, hook permission, non-yieldable depth, and
/// error function; on failure closes upvalues above `old_top`, writes
/// the error object, restores the saved state, and shrinks the stack.
pub(crate) fn pcall_raw<F>(vm: &mut Vm, t: ThreadId, f: F, old_top: usize, errfunc: usize) -> Status
where
    F: FnOnce(&mut Vm, ThreadId) -> Flow<()>,
{
    let (old_ci, old_allowhook, old_nny, old_errfunc) = {
        let th = vm.th(t);
        (th.ci.len(), th.allowhook, th.nny, th.errfunc)
    };
    vm.th_mut(t).errfunc = errfunc;
    let status = raw_run_protected(vm, t, f);
    if status != Status::Ok {
        stack::close_upvalues(vm, t, old_top);
        set_error_obj(vm, t, status, old_top);
        let th = vm.th_mut(t);
        th.ci.truncate(old_ci);
        th.allowhook = old_allowhook;
        th.nny = old_nny;
        stack::shrink_stack(vm, t);
    }
    vm.th_mut(t).errfunc = old_errfunc;
    status
}

impl Vm {
    /// Raise `code` on thread `t`. With a protected scope active this is
    /// a plain propagation; without one, the thread is marked dead and
    /// the error is handed to the main thread's protection if there is
    /// one, else to the panic callback, else the process aborts.
    pub(crate) fn throw(&mut self, t: ThreadId, code: Status) -> Control {
        if self.th(t).nprotected > 0 {
            return Control::Error(code);
        }
        self.th_mut(t).status = code;
        let main = self.main_thread();
        if t != main && self.th(main).nprotected > 0 {
            // transfer the error object and let the propagation land in
            // the main thread's protected scope
            let v = {
                let th = self.th(t);
                if th.top > 0 { th.stack[th.top - 1] } else { Value::Nil }
            };
            let th = self.th_mut(main);
            th.stack[th.top] = v;
            th.top += 1;
            return Control::Error(code);
        }
        if let Some(panic) = self.g.panic {
            let _ = panic(self, t);
        }
        std::process::abort();
    }

    /// Raise the error object at the top of the stack: run the installed
    /// error-handler function first, then throw a runtime error. A raise
    /// from the handler re-enters this path; the nested-call ceiling in
    /// `do_call` bounds the recursion and escalates to *ErrorInError*.
    pub(crate) fn error_msg(&mut self, t: ThreadId) -> Control {
        let errfunc = self.th(t).errfunc;
        if errfunc != 0 {
            if !self.sv(t, errfunc).is_function() {
                return self.throw(t, Status::ErrErr);
            }
            if let Err(c) = self.call_error_handler(t, errfunc) {
                return c;
            }
        }
        self.throw(t, Status::RuntimeErr)
    }

    fn call_error_handler(&mut self, t: ThreadId, errfunc: usize) -> Flow<()> {
        stack::reserve(self, t, 2)?;
        let handler = self.sv(t, errfunc);
        let th = self.th_mut(t);
        // move the error object up and slide the handler under it
        th.stack[th.top] = th.stack[th.top - 1];
        th.stack[th.top - 1] = handler;
        th.top += 1;
        let func = self.th(t).top - 2;
        call::do_call(self, t, func, 1, false)
    }

    /// Raise a runtime error with a message, prefixed with the current
    /// script location when one is known.
    pub(crate) fn run_error(&mut self, t: ThreadId, msg: &str) -> Control {
        if let Err(c) = stack::reserve(self, t, 1) {
            return c;
        }
        let located = self.location_prefix(t).map(|loc| format!("{}{}", loc, msg));
        let text = located.as_deref().unwrap_or(msg);
        match self.g.heap.try_new_str(text) {
            Ok(r) => {
                // the message must survive the unwind: it becomes the
                // error object
                let th = self.th_mut(t);
                th.stack[th.top] = Value::Object(r);
                th.top += 1;
            }
            Err(_) => return self.throw(t, Status::MemErr),
        }
        self.error_msg(t)
    }

    /// `chunkname:line: ` prefix for the current frame, when it is a
    /// script frame with line information.
    fn location_prefix(&self, t: ThreadId) -> Option<String> {
        let th = self.th(t);
        let ci = th.ci();
        if !ci.is_script() {
            return None;
        }
        let cl = th.stack[ci.func].as_kind(crate::value::ObjKind::Closure)?;
        let proto = self.g.heap.proto(self.g.heap.closure(cl).proto);
        let pc = ci.savedpc().saturating_sub(1);
        let line = proto.line_at(pc);
        let source = proto
            .source
            .map(|s| self.g.heap.str_(s).as_str().to_string())
            .unwrap_or_else(|| "?".to_string());
        Some(format!("{}:{}: ", source, line))
    }

    /// Raise the error at the top of the stack (the `error` API entry).
    pub fn error(&mut self, t: ThreadId) -> Control {
        debug_assert!(self.th(t).frame_height() >= 1, "error object expected on stack");
        self.error_msg(t)
    }
}

/// True when the call-info record at `idx` is a yieldable protected
/// call whose recovery state is still armed.
pub(crate) fn is_recovery_point(vm: &Vm, t: ThreadId, idx: usize) -> bool {
    vm.th(t).ci[idx].callstatus & callstatus::YPCALL != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_run_protected_ok() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let status = raw_run_protected(&mut vm, t, |_, _| Ok(()));
        assert_eq!(status, Status::Ok);
        assert_eq!(vm.th(t).nprotected, 0);
    }

    #[test]
    fn test_raw_run_protected_catches() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let status = raw_run_protected(&mut vm, t, |vm, t| {
            let th = vm.th_mut(t);
            th.stack[th.top] = Value::Boolean(true);
            th.top += 1;
            Err(Control::Error(Status::RuntimeErr))
        });
        assert_eq!(status, Status::RuntimeErr);
        assert_eq!(vm.th(t).nprotected, 0);
    }

    #[test]
    fn test_raw_run_protected_restores_ncalls() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        vm.th_mut(t).ncalls = 7;
        let status = raw_run_protected(&mut vm, t, |vm, t| {
            vm.th_mut(t).ncalls = 50;
            Err(Control::Error(Status::RuntimeErr))
        });
        assert_eq!(status, Status::RuntimeErr);
        assert_eq!(vm.th(t).ncalls, 7);
    }

    #[test]
    fn test_set_error_obj_memerr_uses_preinterned() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let oldtop = vm.th(t).top;
        set_error_obj(&mut vm, t, Status::MemErr, oldtop);
        let th = vm.th(t);
        assert_eq!(th.top, oldtop + 1);
        let msg = vm.value_str(vm.sv(t, oldtop)).unwrap();
        assert_eq!(msg, "not enough memory");
    }

    #[test]
    fn test_pcall_raw_restores_state() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let old_top = vm.th(t).top;
        let status = pcall_raw(
            &mut vm,
            t,
            |vm, t| {
                let th = vm.th_mut(t);
                th.stack[th.top] = Value::Number(1.0);
                th.top += 1;
                let r = vm.new_str(t, "boom")?;
                let th = vm.th_mut(t);
                th.stack[th.top] = Value::Object(r);
                th.top += 1;
                Err(Control::Error(Status::RuntimeErr))
            },
            old_top,
            0,
        );
        assert_eq!(status, Status::RuntimeErr);
        let th = vm.th(t);
        assert_eq!(th.top, old_top + 1);
        assert_eq!(vm.value_str(vm.sv(t, old_top)), Some("boom"));
    }
}
