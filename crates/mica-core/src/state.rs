//! Per-thread execution state and the shared global state
//!
//! A thread owns a contiguous value stack and a chain of call-info
//! records; the global state is shared by every thread of one runtime
//! instance. All stack positions are indices into the thread's stack
//! vector, so reallocation never invalidates a saved position.

use crate::error::Status;
use crate::gc::heap::Heap;
use crate::value::{HostFn, ObjRef, Value, NUM_TYPES};
use crate::vm::{ThreadId, Vm};

/// Extra slack at the stack's end, reserved for error handling.
pub const EXTRA_STACK: usize = 5;

/// Minimum number of free slots available to a host function.
pub const MIN_STACK: usize = 20;

/// Initial stack size of a fresh thread.
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;

/// Absolute ceiling for a thread's stack.
pub const MAX_STACK: usize = 1_000_000;

/// Stack size while reporting a stack overflow, giving handlers headroom.
pub const ERROR_STACK_SIZE: usize = MAX_STACK + 200;

/// Ceiling on nested host calls.
pub const MAX_CCALLS: u16 = 200;

/// Maximum upvalue count for a closure.
pub const MAX_UPVAL: usize = 255;

/// Cycle cutoff for chained `__index`/`__newindex` lookups.
pub const MAX_TAG_LOOP: usize = 100;

/// Result-count sentinel: keep however many values the callee returns.
pub const MULTRET: i32 = -1;

/// Pseudo-index of the registry; indices below it address the current
/// host closure's upvalues.
pub const REGISTRY_INDEX: i32 = -(MAX_STACK as i32) - 1000;

/// Registry slot holding the main thread.
pub const RIDX_MAINTHREAD: i64 = 1;
/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 2;
/// Last reserved registry slot.
pub const RIDX_LAST: i64 = RIDX_GLOBALS;

/// Runtime version reported by the API.
pub const VERSION_NUM: f64 = 103.0;

/// Bits in `CallInfo::callstatus`.
pub(crate) mod callstatus {
    /// Frame is running a script function
    pub const SCRIPT: u8 = 1 << 0;
    /// Frame is running a debug hook
    pub const HOOKED: u8 = 1 << 1;
    /// Frame runs on the same interpreter activation as its caller
    pub const REENTRY: u8 = 1 << 2;
    /// Frame re-entered after a suspension
    pub const YIELDED: u8 = 1 << 3;
    /// Frame is a yieldable protected call
    pub const YPCALL: u8 = 1 << 4;
    /// Frame has an error status recorded
    pub const STAT: u8 = 1 << 5;
    /// Frame was tail-called
    pub const TAIL: u8 = 1 << 6;
    /// Last hook called from this frame yielded
    pub const HOOKYIELD: u8 = 1 << 7;
}

/// Hook mask bits.
pub mod hookmask {
    pub const CALL: u8 = 1 << 0;
    pub const RET: u8 = 1 << 1;
    pub const LINE: u8 = 1 << 2;
    pub const COUNT: u8 = 1 << 3;
}

/// Events delivered to a debug hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Ret,
    TailCall,
    Line,
    Count,
}

/// Debug hook. Hooks may push values and may raise; a count/line hook
/// may also yield (the suspension is carried by the script frame).
pub type HookFn = fn(&mut Vm, ThreadId, HookEvent, line: i32) -> crate::Flow<()>;

/// Hook for compiling textual chunks, installable on the global state.
/// Returns the prototype of the compiled chunk.
pub type CompileFn =
    fn(&mut Vm, ThreadId, source: &[u8], chunkname: &str) -> Result<ObjRef, String>;

/// Frame-shape-specific call-info fields.
pub enum FrameKind {
    /// Host callable (light function or host closure)
    Host {
        /// Opaque continuation context
        ctx: i64,
        /// Continuation invoked in place of the frame's return after a
        /// suspension
        k: Option<HostFn>,
        /// Saved error-handler index (yieldable protected calls)
        old_errfunc: usize,
        /// Saved hook permission (yieldable protected calls)
        old_allowhook: bool,
        /// Status delivered to the continuation
        status: Status,
    },
    /// Script function
    Script {
        /// First register (skips the function slot and any varargs)
        base: usize,
        /// Saved program counter
        savedpc: usize,
    },
}

/// One active function call: its stack window, pending results, and
/// status bits.
pub struct CallInfo {
    /// Stack index of the function being run
    pub func: usize,
    /// One past the frame's reserved stack window
    pub top: usize,
    /// Expected result count; `MULTRET` keeps everything
    pub nresults: i32,
    /// `callstatus` bits
    pub callstatus: u8,
    /// Saved `func` offset, used across yield/recover
    pub extra: usize,
    pub frame: FrameKind,
}

impl CallInfo {
    /// Fresh host frame.
    pub fn host(func: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            top,
            nresults,
            callstatus: 0,
            extra: 0,
            frame: FrameKind::Host {
                ctx: 0,
                k: None,
                old_errfunc: 0,
                old_allowhook: true,
                status: Status::Ok,
            },
        }
    }

    /// Fresh script frame.
    pub fn script(func: usize, base: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            top,
            nresults,
            callstatus: callstatus::SCRIPT,
            extra: 0,
            frame: FrameKind::Script { base, savedpc: 0 },
        }
    }

    #[inline]
    pub fn is_script(&self) -> bool {
        self.callstatus & callstatus::SCRIPT != 0
    }

    /// Script-frame base register (callers check `is_script` first).
    #[inline]
    pub fn base(&self) -> usize {
        match &self.frame {
            FrameKind::Script { base, .. } => *base,
            FrameKind::Host { .. } => unreachable!("base of a host frame"),
        }
    }

    #[inline]
    pub fn savedpc(&self) -> usize {
        match &self.frame {
            FrameKind::Script { savedpc, .. } => *savedpc,
            FrameKind::Host { .. } => unreachable!("savedpc of a host frame"),
        }
    }

    #[inline]
    pub fn set_savedpc(&mut self, pc: usize) {
        match &mut self.frame {
            FrameKind::Script { savedpc, .. } => *savedpc = pc,
            FrameKind::Host { .. } => unreachable!("savedpc of a host frame"),
        }
    }
}

/// Per-thread state: the value stack, the call-info chain, suspension
/// bookkeeping, and the hook configuration.
pub struct ThreadState {
    pub(crate) id: ThreadId,
    /// This thread's heap object
    pub(crate) obj: ObjRef,
    pub(crate) status: Status,
    /// Ran to completion: resuming again reports a dead coroutine
    pub(crate) finished: bool,
    /// Value stack; `stack.len()` is the stack size
    pub(crate) stack: Vec<Value>,
    /// First free slot
    pub(crate) top: usize,
    /// Last usable slot (keeps `EXTRA_STACK` slack free)
    pub(crate) stack_last: usize,
    /// Call-info chain; element 0 is the base sentinel, the last element
    /// is the current frame
    pub(crate) ci: Vec<CallInfo>,
    /// Open upvalues over this stack, ordered by slot, highest first
    pub(crate) openupval: Vec<ObjRef>,
    /// Error-handler stack index (0 = none)
    pub(crate) errfunc: usize,
    /// Non-yieldable call depth (0 means yields are permitted)
    pub(crate) nny: u16,
    /// Nested host call counter
    pub(crate) ncalls: u16,
    /// Depth of active protected scopes (the long-jump chain)
    pub(crate) nprotected: u32,
    pub(crate) allowhook: bool,
    pub(crate) hook: Option<HookFn>,
    pub(crate) hookmask: u8,
    pub(crate) basehookcount: i32,
    pub(crate) hookcount: i32,
    /// Last traced pc, for line-hook edge detection
    pub(crate) oldpc: usize,
}

impl ThreadState {
    /// Fresh thread with an initialized stack and base sentinel frame.
    pub fn new(id: ThreadId, obj: ObjRef) -> Self {
        let mut th = ThreadState {
            id,
            obj,
            status: Status::Ok,
            finished: false,
            stack: vec![Value::Nil; BASIC_STACK_SIZE],
            top: 0,
            stack_last: BASIC_STACK_SIZE - EXTRA_STACK,
            ci: Vec::with_capacity(8),
            openupval: Vec::new(),
            errfunc: 0,
            nny: 1,
            ncalls: 0,
            nprotected: 0,
            allowhook: true,
            hook: None,
            hookmask: 0,
            basehookcount: 0,
            hookcount: 0,
            oldpc: 0,
        };
        // sentinel frame: a nil "function" entry at slot 0
        th.stack[0] = Value::Nil;
        th.top = 1;
        th.ci.push(CallInfo::host(0, th.top + MIN_STACK, 0));
        th
    }

    #[inline]
    pub(crate) fn ci(&self) -> &CallInfo {
        self.ci.last().expect("empty call-info chain")
    }

    #[inline]
    pub(crate) fn ci_mut(&mut self) -> &mut CallInfo {
        self.ci.last_mut().expect("empty call-info chain")
    }

    /// Is the current frame the base sentinel?
    #[inline]
    pub(crate) fn at_base(&self) -> bool {
        self.ci.len() == 1
    }

    /// Number of live values in the current frame.
    #[inline]
    pub(crate) fn frame_height(&self) -> usize {
        self.top - (self.ci().func + 1)
    }

    pub(crate) fn reset_hookcount(&mut self) {
        self.hookcount = self.basehookcount;
    }

    /// Largest stack index any live frame may touch.
    pub(crate) fn stack_in_use(&self) -> usize {
        let mut lim = self.top;
        for ci in &self.ci {
            if ci.top > lim {
                lim = ci.top;
            }
        }
        lim
    }
}

/// Garbage collector mode, selected through the `gc` API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Incremental,
    Generational,
}

/// State shared by all threads of one runtime instance.
pub struct GlobalState {
    pub(crate) heap: Heap,
    /// Root table holding the main thread and globals at reserved keys
    pub(crate) registry: Value,
    /// Randomized string-hash seed
    pub(crate) seed: u32,
    /// Per-type metatables for values that do not carry their own
    pub(crate) mt: [Option<ObjRef>; NUM_TYPES],
    /// Interned tag-method names, canonical order, never collected
    pub(crate) tm_names: Vec<ObjRef>,
    /// Preinterned memory-error message
    pub(crate) memerrmsg: Option<ObjRef>,
    /// Called on unprotected errors before aborting
    pub(crate) panic: Option<HostFn>,
    /// The main thread
    pub(crate) mainthread: ThreadId,
    /// Compiler hook for textual chunks
    pub(crate) compiler: Option<CompileFn>,
    // collector controls
    pub(crate) gcrunning: bool,
    pub(crate) gckind: GcKind,
    pub(crate) gcpause: i32,
    pub(crate) gcmajorinc: i32,
    pub(crate) gcstepmul: i32,
    /// Estimate of non-garbage bytes after the last collection
    pub(crate) estimate: usize,
}

impl GlobalState {
    pub(crate) fn new(heap: Heap, mainthread: ThreadId) -> Self {
        GlobalState {
            heap,
            registry: Value::Nil,
            seed: 0,
            mt: [None; NUM_TYPES],
            tm_names: Vec::new(),
            memerrmsg: None,
            panic: None,
            mainthread,
            compiler: None,
            gcrunning: false,
            gckind: GcKind::Incremental,
            gcpause: 200,
            gcmajorinc: 200,
            gcstepmul: 200,
            estimate: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ThreadId;

    #[test]
    fn test_fresh_thread_invariants() {
        let obj = ObjRef { kind: crate::value::ObjKind::Thread, index: 0 };
        let th = ThreadState::new(ThreadId(0), obj);
        assert_eq!(th.top, 1);
        assert_eq!(th.stack.len(), BASIC_STACK_SIZE);
        assert_eq!(th.stack_last, BASIC_STACK_SIZE - EXTRA_STACK);
        assert!(th.at_base());
        assert_eq!(th.frame_height(), 0);
        assert!(th.ci().func < th.ci().top);
        assert_eq!(th.nny, 1);
        assert_eq!(th.status, Status::Ok);
    }

    #[test]
    fn test_stack_in_use_includes_frame_tops() {
        let obj = ObjRef { kind: crate::value::ObjKind::Thread, index: 0 };
        let mut th = ThreadState::new(ThreadId(0), obj);
        assert!(th.stack_in_use() >= th.top);
        th.ci.push(CallInfo::host(1, 30, 0));
        assert_eq!(th.stack_in_use(), 30);
    }

    #[test]
    fn test_registry_index_is_most_negative_non_upvalue() {
        assert!(REGISTRY_INDEX < -(MAX_STACK as i32));
    }
}
