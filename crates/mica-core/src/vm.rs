//! Runtime instance
//!
//! A [`Vm`] is one global state plus its threads. The main thread is
//! created with the instance and owns its lifecycle: closing the
//! instance runs pending finalizers and frees the heap. Coroutines are
//! ordinary collectable objects sharing the global state.
//!
//! Every embedding API entry takes the target thread as its first
//! parameter; the runtime is an explicit context, never thread-local
//! state, so multiple instances can coexist in one host.

use crate::error::Status;
use crate::gc::collector;
use crate::gc::header::ObjBody;
use crate::gc::heap::{default_alloc, AllocError, AllocFn, Heap};
use crate::object::Table;
use crate::state::{GlobalState, ThreadState, RIDX_GLOBALS, RIDX_MAINTHREAD, VERSION_NUM};
use crate::tm;
use crate::value::{HostFn, ObjKind, ObjRef, Value};
use crate::Flow;

/// Identifier of a thread in the runtime's thread slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) u32);

/// One runtime instance: the shared global state and its threads.
pub struct Vm {
    pub(crate) g: GlobalState,
    pub(crate) threads: Vec<Option<Box<ThreadState>>>,
    main: ThreadId,
}

impl Vm {
    /// Create a runtime instance with a custom allocation governor.
    /// Returns `None` when the governor refuses the initial allocations,
    /// mirroring a failed bootstrap.
    pub fn new_state(alloc: AllocFn, alloc_ud: usize) -> Option<Vm> {
        let mut heap = Heap::new(alloc, alloc_ud);
        let main = ThreadId(0);
        let main_obj = heap.try_alloc(ObjBody::Thread(main)).ok()?;
        heap.fix(main_obj);
        let mut vm = Vm {
            g: GlobalState::new(heap, main),
            threads: vec![Some(Box::new(ThreadState::new(main, main_obj)))],
            main,
        };
        vm.g.seed = rand::random::<u32>() | 1;
        if vm.open().is_err() {
            return None;
        }
        vm.g.gcrunning = true;
        Some(vm)
    }

    /// Create a runtime instance with the default (always-approving)
    /// governor.
    pub fn new() -> Vm {
        Vm::new_state(default_alloc, 0).expect("default governor never refuses")
    }

    /// Parts of startup that allocate: the registry with its reserved
    /// slots, the tag-method names, and the memory-error message.
    fn open(&mut self) -> Result<(), AllocError> {
        let registry = self.g.heap.try_alloc(ObjBody::Table(Table::new(2, 0)))?;
        self.g.registry = Value::Object(registry);
        let main_obj = self.th(self.main).obj;
        {
            let reg = self.g.heap.table_mut(registry);
            reg.set_int(RIDX_MAINTHREAD, Value::Object(main_obj));
        }
        let globals = self.g.heap.try_alloc(ObjBody::Table(Table::new(0, 0)))?;
        self.g
            .heap
            .table_mut(registry)
            .set_int(RIDX_GLOBALS, Value::Object(globals));
        tm::init_names(self)?;
        let msg = self.g.heap.try_new_str("not enough memory")?;
        self.g.heap.fix(msg);
        self.g.memerrmsg = Some(msg);
        Ok(())
    }

    /// Close the runtime: run every pending finalizer (unreachable or
    /// not), then drop the heap.
    pub fn close(mut self) {
        collector::finalize_all(&mut self);
    }

    /// The main thread of this instance.
    #[inline]
    pub fn main_thread(&self) -> ThreadId {
        self.main
    }

    /// Interpreter version constant. Shared by every instance.
    pub fn version(&self) -> f64 {
        VERSION_NUM
    }

    /// Install a panic handler for unprotected errors; returns the old
    /// one.
    pub fn at_panic(&mut self, panicf: Option<HostFn>) -> Option<HostFn> {
        std::mem::replace(&mut self.g.panic, panicf)
    }

    /// Install a compiler hook for textual chunks.
    pub fn set_compiler(&mut self, compiler: Option<crate::state::CompileFn>) {
        self.g.compiler = compiler;
    }

    // ========================================================================
    // Threads
    // ========================================================================

    #[inline]
    pub(crate) fn th(&self, t: ThreadId) -> &ThreadState {
        self.threads[t.0 as usize].as_ref().expect("dead thread")
    }

    #[inline]
    pub(crate) fn th_mut(&mut self, t: ThreadId) -> &mut ThreadState {
        self.threads[t.0 as usize].as_mut().expect("dead thread")
    }

    /// Create a coroutine thread sharing this global state. The new
    /// thread object is pushed on `t`'s stack (keeping it reachable) and
    /// the thread id is returned. Hook configuration is inherited.
    pub fn new_thread(&mut self, t: ThreadId) -> Flow<ThreadId> {
        self.check_gc();
        let id = ThreadId(self.threads.len() as u32);
        let obj = self.alloc_obj(t, ObjBody::Thread(id))?;
        let mut th = ThreadState::new(id, obj);
        {
            let parent = self.th(t);
            th.hook = parent.hook;
            th.hookmask = parent.hookmask;
            th.basehookcount = parent.basehookcount;
            th.reset_hookcount();
        }
        self.threads.push(Some(Box::new(th)));
        self.push(t, Value::Object(obj));
        Ok(id)
    }

    /// Thread id of a thread value on the stack.
    pub(crate) fn thread_of(&self, v: Value) -> Option<ThreadId> {
        v.as_kind(ObjKind::Thread).map(|r| self.g.heap.thread_id(r))
    }

    // ========================================================================
    // Raw stack primitives
    // ========================================================================

    /// Push with the frame-top check every API push goes through.
    #[inline]
    pub(crate) fn push(&mut self, t: ThreadId, v: Value) {
        let th = self.th_mut(t);
        debug_assert!(th.top < th.ci().top, "stack overflow (frame top)");
        th.stack[th.top] = v;
        th.top += 1;
    }

    #[inline]
    pub(crate) fn pop_n(&mut self, t: ThreadId, n: usize) {
        let th = self.th_mut(t);
        debug_assert!(th.frame_height() >= n, "not enough elements to pop");
        th.top -= n;
    }

    /// Read an absolute stack slot.
    #[inline]
    pub(crate) fn sv(&self, t: ThreadId, idx: usize) -> Value {
        self.th(t).stack[idx]
    }

    /// Write an absolute stack slot.
    #[inline]
    pub(crate) fn set_sv(&mut self, t: ThreadId, idx: usize, v: Value) {
        self.th_mut(t).stack[idx] = v;
    }

    // ========================================================================
    // Allocation (throwing wrappers)
    // ========================================================================

    /// Allocate a heap object, raising *MemoryError* on refusal.
    pub(crate) fn alloc_obj(&mut self, t: ThreadId, body: ObjBody) -> Flow<ObjRef> {
        match self.g.heap.try_alloc(body) {
            Ok(r) => Ok(r),
            Err(AllocError) => Err(self.throw(t, Status::MemErr)),
        }
    }

    /// Allocate (or find interned) a string, raising *MemoryError* on
    /// refusal.
    pub(crate) fn new_str(&mut self, t: ThreadId, s: &str) -> Flow<ObjRef> {
        match self.g.heap.try_new_str(s) {
            Ok(r) => Ok(r),
            Err(AllocError) => Err(self.throw(t, Status::MemErr)),
        }
    }

    /// Read string contents of a value, if it is a string.
    pub(crate) fn value_str(&self, v: Value) -> Option<&str> {
        v.as_kind(ObjKind::Str).map(|r| self.g.heap.str_(r).as_str())
    }

    // ========================================================================
    // Registry access
    // ========================================================================

    /// The registry table.
    pub(crate) fn registry_ref(&self) -> ObjRef {
        self.g
            .registry
            .as_kind(ObjKind::Table)
            .expect("registry is always a table")
    }

    /// The globals table (registry at the reserved key).
    pub(crate) fn globals_ref(&self) -> ObjRef {
        self.g
            .heap
            .table(self.registry_ref())
            .get_int(RIDX_GLOBALS)
            .as_kind(ObjKind::Table)
            .expect("globals entry is always a table")
    }

    // ========================================================================
    // Collector driver
    // ========================================================================

    /// Run a collection when the debt says one is due. Called at the
    /// same points the original checks (`call` exit, allocation-heavy
    /// API entries).
    pub(crate) fn check_gc(&mut self) {
        if self.g.gcrunning && self.g.heap.gcdebt > 0 {
            self.full_gc_cycle();
        }
    }

    /// One full stop-the-world cycle plus pending finalizers, then
    /// re-arm the debt according to the pause parameter.
    pub(crate) fn full_gc_cycle(&mut self) {
        collector::collect(&mut self.g, &mut self.threads);
        collector::run_finalizers(self);
        let total = self.g.heap.total_bytes() as isize;
        let debt = -total.saturating_mul(self.g.gcpause as isize) / 200;
        self.g.heap.set_debt(debt);
        self.g.estimate = self.g.heap.total_bytes();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
