//! Shared helpers for the integration tests: hand-assembled prototypes
//! and environment binding for chunk-style closures.
#![allow(dead_code)]

use mica_core::{Proto, ThreadId, Vm, REGISTRY_INDEX, RIDX_GLOBALS};

/// Fresh runtime plus its main thread.
pub fn new_vm() -> (Vm, ThreadId) {
    let vm = Vm::new();
    let t = vm.main_thread();
    (vm, t)
}

/// Allocate `proto` and push a closure over it.
pub fn push_chunk(vm: &mut Vm, t: ThreadId, proto: Proto) {
    let p = vm.new_proto(t, proto).expect("proto allocation");
    vm.push_script_closure(t, p).expect("closure allocation");
}

/// Bind the first upvalue of the closure at `func_idx` to the globals
/// table, the way `load` binds a chunk's environment.
pub fn bind_env(vm: &mut Vm, t: ThreadId, func_idx: i32) {
    let abs = vm.abs_index(t, func_idx);
    vm.raw_geti(t, REGISTRY_INDEX, RIDX_GLOBALS);
    vm.set_upvalue(t, abs, 1).expect("environment upvalue");
}
