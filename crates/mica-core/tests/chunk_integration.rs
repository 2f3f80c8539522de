//! Chunk load/dump integration tests
//!
//! Tests validate:
//! - The dump/load round trip preserving behavior
//! - Signature and checksum verification
//! - Mode enforcement ('b'/'t')
//! - The environment upvalue binding on load
//! - The compiler hook for textual chunks
//!
//! # Running Tests
//! ```bash
//! cargo test --test chunk_integration
//! ```

mod common;

use common::{new_vm, push_chunk};
use mica_core::{
    ArithOp, Instr, ObjRef, Proto, Status, ThreadId, Type, UpvalDesc, Value, Vm,
};

/// Chunk computing `_ENV.base + arg` with one environment upvalue.
fn sample_chunk(vm: &mut Vm, t: ThreadId) -> Proto {
    let mut p = Proto::new();
    p.num_params = 1;
    p.max_stack_size = 3;
    p.upvalues = vec![UpvalDesc { name: Some("_ENV".into()), in_stack: false, index: 0 }];
    p.k = vec![vm.string_value(t, "base").unwrap(), Value::Number(100.0)];
    p.line_info = vec![1, 1, 2, 2];
    p.source = vm.string_value(t, "@sample").unwrap().as_object();
    p.code = vec![
        Instr::GetTabUp { a: 1, b: 0, k: 0 },
        Instr::Arith { op: ArithOp::Add, a: 1, b: 1, c: 0 },
        Instr::Return { a: 1, b: 2 },
    ];
    p
}

fn run_with_arg(vm: &mut Vm, t: ThreadId, func_idx: i32, arg: f64) -> f64 {
    vm.push_value(t, func_idx);
    vm.push_number(t, arg);
    vm.call(t, 1, Some(1)).unwrap();
    let out = vm.to_number(t, -1);
    vm.pop(t, 1);
    out
}

// ===== Round trip =====

#[test]
fn test_dump_load_round_trip() {
    let (mut vm, t) = new_vm();
    vm.push_number(t, 100.0);
    vm.set_global(t, "base").unwrap();

    let p = sample_chunk(&mut vm, t);
    push_chunk(&mut vm, t, p);
    common::bind_env(&mut vm, t, -1);

    let mut blob: Vec<u8> = Vec::new();
    assert!(vm.dump(t, &mut blob));
    assert_eq!(blob[0], mica_core::chunk::SIGNATURE_BYTE);

    let status = vm.load_buffer(t, &blob, "=loaded", None);
    assert_eq!(status, Status::Ok);
    assert_eq!(vm.type_of(t, -1), Type::Function);

    // identical behavior, environment bound by load itself
    let from_source = run_with_arg(&mut vm, t, 1, 7.0);
    let from_chunk = run_with_arg(&mut vm, t, 2, 7.0);
    assert_eq!(from_source, 107.0);
    assert_eq!(from_chunk, from_source);
}

#[test]
fn test_dump_rejects_non_script_function() {
    let (mut vm, t) = new_vm();
    vm.push_number(t, 1.0);
    let mut blob: Vec<u8> = Vec::new();
    assert!(!vm.dump(t, &mut blob));
    assert!(blob.is_empty());
}

// ===== Validation =====

#[test]
fn test_load_corrupted_chunk() {
    let (mut vm, t) = new_vm();
    let p = sample_chunk(&mut vm, t);
    push_chunk(&mut vm, t, p);
    let mut blob: Vec<u8> = Vec::new();
    assert!(vm.dump(t, &mut blob));
    let last = blob.len() - 1;
    blob[last] ^= 0xFF;
    let status = vm.load_buffer(t, &blob, "=bad", None);
    assert_eq!(status, Status::SyntaxErr);
    let msg = vm.to_lstring(t, -1).unwrap().unwrap();
    assert!(msg.contains("corrupted"), "{}", msg);
}

#[test]
fn test_load_truncated_chunk() {
    let (mut vm, t) = new_vm();
    let p = sample_chunk(&mut vm, t);
    push_chunk(&mut vm, t, p);
    let mut blob: Vec<u8> = Vec::new();
    assert!(vm.dump(t, &mut blob));
    blob.truncate(8);
    let status = vm.load_buffer(t, &blob, "=trunc", None);
    assert_eq!(status, Status::SyntaxErr);
}

#[test]
fn test_load_empty_chunk() {
    let (mut vm, t) = new_vm();
    let status = vm.load_buffer(t, b"", "=empty", None);
    assert_eq!(status, Status::SyntaxErr);
}

// ===== Mode enforcement =====

#[test]
fn test_mode_rejects_binary() {
    let (mut vm, t) = new_vm();
    let p = sample_chunk(&mut vm, t);
    push_chunk(&mut vm, t, p);
    let mut blob: Vec<u8> = Vec::new();
    assert!(vm.dump(t, &mut blob));
    let status = vm.load_buffer(t, &blob, "=binary", Some("t"));
    assert_eq!(status, Status::SyntaxErr);
    let msg = vm.to_lstring(t, -1).unwrap().unwrap();
    assert!(msg.contains("attempt to load a binary chunk"), "{}", msg);
}

#[test]
fn test_mode_rejects_text() {
    let (mut vm, t) = new_vm();
    let status = vm.load_buffer(t, b"return 1", "=text", Some("b"));
    assert_eq!(status, Status::SyntaxErr);
    let msg = vm.to_lstring(t, -1).unwrap().unwrap();
    assert!(msg.contains("attempt to load a text chunk"), "{}", msg);
}

#[test]
fn test_text_without_compiler_is_syntax_error() {
    let (mut vm, t) = new_vm();
    let status = vm.load_buffer(t, b"return 1", "=text", None);
    assert_eq!(status, Status::SyntaxErr);
}

// ===== Compiler hook =====

fn tiny_compiler(
    vm: &mut Vm,
    t: ThreadId,
    source: &[u8],
    _chunkname: &str,
) -> Result<ObjRef, String> {
    // "compiles" any chunk into `return <len of source>`
    let mut p = Proto::new();
    p.max_stack_size = 2;
    p.upvalues = vec![UpvalDesc { name: Some("_ENV".into()), in_stack: false, index: 0 }];
    p.k = vec![Value::Number(source.len() as f64)];
    p.code = vec![Instr::LoadK { a: 0, k: 0 }, Instr::Return { a: 0, b: 2 }];
    vm.new_proto(t, p).map_err(|_| "out of memory".to_string())
}

#[test]
fn test_compiler_hook_for_text() {
    let (mut vm, t) = new_vm();
    vm.set_compiler(Some(tiny_compiler));
    let status = vm.load_buffer(t, b"12345", "=hooked", Some("t"));
    assert_eq!(status, Status::Ok);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 5.0);
}

#[test]
fn test_loaded_chunk_env_upvalue_is_bound() {
    let (mut vm, t) = new_vm();
    let p = sample_chunk(&mut vm, t);
    push_chunk(&mut vm, t, p);
    let mut blob: Vec<u8> = Vec::new();
    assert!(vm.dump(t, &mut blob));
    vm.pop(t, 1);
    let status = vm.load_buffer(t, &blob, "=env", None);
    assert_eq!(status, Status::Ok);
    // the single upvalue was bound to the globals table by load
    let name = vm.get_upvalue(t, -1, 1).unwrap();
    assert_eq!(name, "_ENV");
    assert_eq!(vm.type_of(t, -1), Type::Table);
}
