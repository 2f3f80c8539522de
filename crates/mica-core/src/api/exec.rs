//! Execute family: calls, protected calls, coroutines, chunk I/O

use crate::chunk::{self, Reader, SliceReader, Writer};
use crate::error::Status;
use crate::exec::{call, coroutine, protect};
use crate::state::{callstatus, FrameKind, MULTRET};
use crate::value::HostFn;
use crate::vm::{ThreadId, Vm};
use crate::Flow;

impl Vm {
    /// Call the function at `top - nargs - 1` with `nargs` arguments,
    /// expecting `nresults` results (`None` keeps everything the callee
    /// returns). Unprotected: errors propagate to the enclosing
    /// protected scope, or to the panic path if none exists.
    pub fn call(&mut self, t: ThreadId, nargs: usize, nresults: Option<usize>) -> Flow<()> {
        self.callk(t, nargs, nresults, 0, None)
    }

    /// Like [`Vm::call`], registering a continuation to be invoked in
    /// place of this frame's return if the callee yields through it.
    /// Without a continuation (or with yields blocked anywhere on the
    /// chain) the call runs non-yieldable.
    pub fn callk(
        &mut self,
        t: ThreadId,
        nargs: usize,
        nresults: Option<usize>,
        ctx: i64,
        k: Option<HostFn>,
    ) -> Flow<()> {
        debug_assert!(
            k.is_none() || !self.th(t).ci().is_script(),
            "cannot use continuations inside hooks"
        );
        debug_assert!(self.th(t).frame_height() >= nargs + 1);
        debug_assert_eq!(self.th(t).status, Status::Ok, "cannot call on a non-normal thread");
        let nres = nresults.map(|n| n as i32).unwrap_or(MULTRET);
        self.check_nresults(t, nargs, nres);
        let func = self.th(t).top - (nargs + 1);
        if k.is_some() && self.th(t).nny == 0 {
            {
                let ci = self.th_mut(t).ci_mut();
                if let FrameKind::Host { k: slot, ctx: cslot, .. } = &mut ci.frame {
                    *slot = k;
                    *cslot = ctx;
                }
            }
            call::do_call(self, t, func, nres, true)?;
        } else {
            call::do_call(self, t, func, nres, false)?;
        }
        call::adjust_results(self, t, nres);
        Ok(())
    }

    /// Protected call: on any error the stack is truncated back to the
    /// function slot, the error object takes its place, and the status
    /// is returned. `errfunc` (a stack index, 0 for none) installs an
    /// error-handling function run before unwinding.
    pub fn pcall(
        &mut self,
        t: ThreadId,
        nargs: usize,
        nresults: Option<usize>,
        errfunc: i32,
    ) -> Status {
        match self.pcallk(t, nargs, nresults, errfunc, 0, None) {
            Ok(status) => status,
            // no continuation: the body cannot yield through us
            Err(_) => unreachable!("non-yieldable pcall cannot be interrupted"),
        }
    }

    /// Protected call with a continuation: when the whole chain is
    /// yieldable the protection is deferred to the enclosing `resume`,
    /// which lands errors raised after a suspension back on this frame.
    pub fn pcallk(
        &mut self,
        t: ThreadId,
        nargs: usize,
        nresults: Option<usize>,
        errfunc: i32,
        ctx: i64,
        k: Option<HostFn>,
    ) -> Flow<Status> {
        debug_assert!(
            k.is_none() || !self.th(t).ci().is_script(),
            "cannot use continuations inside hooks"
        );
        debug_assert!(self.th(t).frame_height() >= nargs + 1);
        debug_assert_eq!(self.th(t).status, Status::Ok, "cannot call on a non-normal thread");
        let nres = nresults.map(|n| n as i32).unwrap_or(MULTRET);
        self.check_nresults(t, nargs, nres);
        let efunc = if errfunc == 0 {
            0
        } else {
            match self.index_place(t, errfunc) {
                super::Place::Stack(p) => p,
                _ => {
                    debug_assert!(false, "invalid error-handler index");
                    0
                }
            }
        };
        let func = self.th(t).top - (nargs + 1);
        let status;
        if k.is_none() || self.th(t).nny > 0 {
            // conventional protected call
            status = protect::pcall_raw(
                self,
                t,
                |vm, t| call::do_call(vm, t, func, nres, false),
                func,
                efunc,
            );
        } else {
            // yieldable: record recovery state on this frame and run
            // under the enclosing resume's protection
            let old_allowhook = self.th(t).allowhook;
            let old_errfunc = self.th(t).errfunc;
            {
                let ci = self.th_mut(t).ci_mut();
                if let FrameKind::Host {
                    k: kslot,
                    ctx: cslot,
                    old_errfunc: oe,
                    old_allowhook: oh,
                    ..
                } = &mut ci.frame
                {
                    *kslot = k;
                    *cslot = ctx;
                    *oe = old_errfunc;
                    *oh = old_allowhook;
                }
                ci.extra = func;
                ci.callstatus |= callstatus::YPCALL;
            }
            self.th_mut(t).errfunc = efunc;
            call::do_call(self, t, func, nres, true)?;
            let ci = self.th_mut(t).ci_mut();
            ci.callstatus &= !callstatus::YPCALL;
            self.th_mut(t).errfunc = old_errfunc;
            status = Status::Ok;
        }
        call::adjust_results(self, t, nres);
        Ok(status)
    }

    /// Resume a coroutine with `nargs` arguments on its stack.
    pub fn resume(&mut self, target: ThreadId, from: Option<ThreadId>, nargs: usize) -> Status {
        coroutine::resume(self, target, from, nargs as u32)
    }

    /// Yield with the top `nresults` values, no continuation: the frame
    /// cannot be re-entered, only completed.
    pub fn yield_(&mut self, t: ThreadId, nresults: usize) -> Flow<u32> {
        self.yieldk(t, nresults, 0, None)
    }

    /// Yield with a continuation to run on resume.
    pub fn yieldk(
        &mut self,
        t: ThreadId,
        nresults: usize,
        ctx: i64,
        k: Option<HostFn>,
    ) -> Flow<u32> {
        coroutine::yieldk(self, t, nresults as u32, ctx, k)
    }

    /// Thread status: `Ok` for a normal thread, `Yield` while
    /// suspended, an error status after an unrecovered failure.
    pub fn status(&self, t: ThreadId) -> Status {
        self.th(t).status
    }

    /// Continuation context of the current frame: after a resumption,
    /// the (ctx, status) pair registered at the suspension point.
    pub fn get_ctx(&self, t: ThreadId) -> (Option<i64>, Status) {
        let ci = self.th(t).ci();
        if ci.callstatus & callstatus::YIELDED != 0 {
            match &ci.frame {
                FrameKind::Host { ctx, status, .. } => (Some(*ctx), *status),
                FrameKind::Script { .. } => (None, Status::Ok),
            }
        } else {
            (None, Status::Ok)
        }
    }

    /// Load a chunk from a reader. On success the compiled closure is
    /// at the top of the stack with its environment upvalue bound to
    /// the globals table; on failure the error message is there.
    pub fn load(
        &mut self,
        t: ThreadId,
        reader: &mut dyn Reader,
        chunkname: &str,
        mode: Option<&str>,
    ) -> Status {
        chunk::protected_load(self, t, reader, chunkname, mode)
    }

    /// Load a chunk from an in-memory buffer.
    pub fn load_buffer(
        &mut self,
        t: ThreadId,
        data: &[u8],
        chunkname: &str,
        mode: Option<&str>,
    ) -> Status {
        let mut reader = SliceReader::new(data);
        self.load(t, &mut reader, chunkname, mode)
    }

    /// Serialize the script function at the top of the stack through a
    /// writer. Returns false when the value is not a script function or
    /// the writer failed.
    pub fn dump(&mut self, t: ThreadId, writer: &mut dyn Writer) -> bool {
        chunk::dump(self, t, writer).is_ok()
    }

    fn check_nresults(&self, t: ThreadId, nargs: usize, nres: i32) {
        let th = self.th(t);
        debug_assert!(
            nres == MULTRET || (th.ci().top - th.top) as i64 >= nres as i64 - nargs as i64,
            "results from function overflow current stack size"
        );
        let _ = (nargs, nres, th);
    }
}
