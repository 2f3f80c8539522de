//! Script execution integration tests
//!
//! Prototypes are assembled by hand (the compiler is an external
//! collaborator) and exercised through the embedding API. Tests
//! validate:
//! - Parameter padding and frame setup
//! - Globals through the environment upvalue
//! - Upvalue capture, sharing, and closing
//! - Tail calls and deep recursion overflow
//! - Varargs
//!
//! # Running Tests
//! ```bash
//! cargo test --test script_exec_integration
//! ```

mod common;

use common::{bind_env, new_vm, push_chunk};
use mica_core::{ArithOp, CompareOp, Instr, Proto, Status, Type, UpvalDesc, Value};

fn env_desc() -> UpvalDesc {
    UpvalDesc { name: Some("_ENV".into()), in_stack: false, index: 0 }
}

// ===== Basic frames =====

#[test]
fn test_script_addition() {
    let (mut vm, t) = new_vm();
    let mut p = Proto::new();
    p.num_params = 2;
    p.max_stack_size = 3;
    p.code = vec![
        Instr::Arith { op: ArithOp::Add, a: 2, b: 0, c: 1 },
        Instr::Return { a: 2, b: 2 },
    ];
    push_chunk(&mut vm, t, p);
    vm.push_number(t, 30.0);
    vm.push_number(t, 12.0);
    vm.call(t, 2, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 42.0);
}

#[test]
fn test_missing_parameters_pad_nil() {
    let (mut vm, t) = new_vm();
    let mut p = Proto::new();
    p.num_params = 2;
    p.max_stack_size = 3;
    p.code = vec![
        // return whether the second parameter is nil
        Instr::LoadNil { a: 2, n: 0 },
        Instr::Cmp { op: CompareOp::Eq, expect: true, b: 1, c: 2 },
        Instr::Jmp { offset: 2 },
        Instr::LoadBool { a: 0, b: false, skip: false },
        Instr::Return { a: 0, b: 2 },
        Instr::LoadBool { a: 0, b: true, skip: false },
        Instr::Return { a: 0, b: 2 },
    ];
    push_chunk(&mut vm, t, p);
    vm.push_number(t, 1.0); // only the first argument
    vm.call(t, 1, Some(1)).unwrap();
    assert_eq!(vm.to_boolean(t, -1), true);
}

// ===== Globals through _ENV =====

#[test]
fn test_globals_via_environment_upvalue() {
    let (mut vm, t) = new_vm();
    vm.push_number(t, 7.0);
    vm.set_global(t, "seed").unwrap();

    let mut q = Proto::new();
    q.max_stack_size = 3;
    q.upvalues = vec![env_desc()];
    q.code = vec![
        Instr::GetTabUp { a: 0, b: 0, k: 0 }, // r0 = _ENV["seed"]
        Instr::LoadK { a: 1, k: 1 },          // r1 = 2
        Instr::Arith { op: ArithOp::Mul, a: 0, b: 0, c: 1 },
        Instr::SetTabUp { a: 0, k: 2, b: 0 }, // _ENV["out"] = r0
        Instr::Return { a: 0, b: 1 },
    ];
    q.k = vec![
        vm.string_value(t, "seed").unwrap(),
        Value::Number(2.0),
        vm.string_value(t, "out").unwrap(),
    ];
    push_chunk(&mut vm, t, q);
    bind_env(&mut vm, t, -1);
    vm.call(t, 0, Some(0)).unwrap();
    vm.get_global(t, "out").unwrap();
    assert_eq!(vm.to_number(t, -1), 14.0);
}

// ===== Upvalue sharing (closure factory) =====

fn counter_protos(vm: &mut mica_core::Vm, t: mica_core::ThreadId) -> Proto {
    // local x = 0; return function() x = x + 1; return x end,
    //                     function() return x end
    let mut inc = Proto::new();
    inc.max_stack_size = 2;
    inc.upvalues = vec![UpvalDesc { name: Some("x".into()), in_stack: true, index: 0 }];
    inc.k = vec![Value::Number(1.0)];
    inc.code = vec![
        Instr::GetUpval { a: 0, b: 0 },
        Instr::LoadK { a: 1, k: 0 },
        Instr::Arith { op: ArithOp::Add, a: 0, b: 0, c: 1 },
        Instr::SetUpval { a: 0, b: 0 },
        Instr::Return { a: 0, b: 2 },
    ];
    let mut read = Proto::new();
    read.max_stack_size = 2;
    read.upvalues = vec![UpvalDesc { name: Some("x".into()), in_stack: true, index: 0 }];
    read.code = vec![
        Instr::GetUpval { a: 0, b: 0 },
        Instr::Return { a: 0, b: 2 },
    ];
    let inc_ref = vm.new_proto(t, inc).unwrap();
    let read_ref = vm.new_proto(t, read).unwrap();
    let mut outer = Proto::new();
    outer.max_stack_size = 3;
    outer.k = vec![Value::Number(0.0)];
    outer.protos = vec![inc_ref, read_ref];
    outer.code = vec![
        Instr::LoadK { a: 0, k: 0 },   // x = 0
        Instr::Closure { a: 1, bx: 0 },
        Instr::Closure { a: 2, bx: 1 },
        Instr::Return { a: 1, b: 3 },  // return inc, read
    ];
    outer
}

#[test]
fn test_upvalue_sharing_between_closures() {
    let (mut vm, t) = new_vm();
    let outer = counter_protos(&mut vm, t);
    push_chunk(&mut vm, t, outer);
    vm.call(t, 0, Some(2)).unwrap();
    // stack: 1 = incrementer, 2 = reader
    assert_eq!(vm.type_of(t, 1), Type::Function);
    assert_eq!(vm.type_of(t, 2), Type::Function);

    vm.push_value(t, 1);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 1.0);
    vm.pop(t, 1);

    vm.push_value(t, 2);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 1.0);
    vm.pop(t, 1);

    vm.push_value(t, 1);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 2.0);
    vm.pop(t, 1);

    vm.push_value(t, 2);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 2.0);
    vm.pop(t, 1);

    // both closures share one upvalue cell
    let id1 = vm.upvalue_id(t, 1, 1).unwrap();
    let id2 = vm.upvalue_id(t, 2, 1).unwrap();
    assert_eq!(id1, id2);
}

#[test]
fn test_upvalue_join() {
    let (mut vm, t) = new_vm();
    let outer = counter_protos(&mut vm, t);
    push_chunk(&mut vm, t, outer);
    vm.call(t, 0, Some(2)).unwrap();
    // create a second, independent pair
    let outer2 = counter_protos(&mut vm, t);
    push_chunk(&mut vm, t, outer2);
    vm.call(t, 0, Some(2)).unwrap();
    // stack: 1 = inc_a, 2 = read_a, 3 = inc_b, 4 = read_b
    assert_ne!(
        vm.upvalue_id(t, 1, 1).unwrap(),
        vm.upvalue_id(t, 3, 1).unwrap()
    );
    vm.upvalue_join(t, 3, 1, 1, 1); // inc_b now shares inc_a's cell
    assert_eq!(
        vm.upvalue_id(t, 1, 1).unwrap(),
        vm.upvalue_id(t, 3, 1).unwrap()
    );
    vm.push_value(t, 3);
    vm.call(t, 0, Some(1)).unwrap(); // bumps the shared cell
    vm.pop(t, 1);
    vm.push_value(t, 2);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 1.0);
}

// ===== Tail calls =====

#[test]
fn test_tail_call_countdown() {
    let (mut vm, t) = new_vm();
    // F(n): if n <= 0 then return "end" else return F(n - 1)
    let mut f = Proto::new();
    f.num_params = 1;
    f.max_stack_size = 3;
    f.upvalues = vec![UpvalDesc { name: Some("f".into()), in_stack: true, index: 0 }];
    f.k = vec![
        Value::Number(0.0),
        Value::Number(1.0),
        vm.string_value(t, "end").unwrap(),
    ];
    f.code = vec![
        Instr::LoadK { a: 1, k: 0 },                                // r1 = 0
        Instr::Cmp { op: CompareOp::Lt, expect: false, b: 1, c: 0 }, // n > 0 skips the jump
        Instr::Jmp { offset: 4 },                                   // -> 7
        Instr::GetUpval { a: 1, b: 0 },                             // r1 = F
        Instr::LoadK { a: 2, k: 1 },                                // r2 = 1
        Instr::Arith { op: ArithOp::Sub, a: 2, b: 0, c: 2 },        // r2 = n - 1
        Instr::TailCall { a: 1, b: 2 },                             // return F(n-1)
        Instr::LoadK { a: 1, k: 2 },                                // r1 = "end"
        Instr::Return { a: 1, b: 2 },
    ];
    let f_ref = vm.new_proto(t, f).unwrap();
    let mut main = Proto::new();
    main.max_stack_size = 3;
    main.protos = vec![f_ref];
    main.k = vec![Value::Number(50_000.0)];
    main.code = vec![
        Instr::Closure { a: 0, bx: 0 },
        Instr::Move { a: 1, b: 0 },
        Instr::LoadK { a: 2, k: 0 },
        Instr::Call { a: 1, b: 2, c: 2 },
        Instr::Return { a: 1, b: 2 },
    ];
    push_chunk(&mut vm, t, main);
    vm.call(t, 0, Some(1)).unwrap();
    // 50k tail-recursive steps without frame growth
    assert_eq!(vm.to_lstring(t, -1).unwrap().as_deref(), Some("end"));
}

#[test]
fn test_deep_recursion_overflows_cleanly() {
    let (mut vm, t) = new_vm();
    // F(): return F() without a tail call: frames accumulate
    let mut f = Proto::new();
    f.max_stack_size = 120;
    f.upvalues = vec![UpvalDesc { name: Some("f".into()), in_stack: true, index: 0 }];
    f.code = vec![
        Instr::GetUpval { a: 0, b: 0 },
        Instr::Call { a: 0, b: 1, c: 2 },
        Instr::Return { a: 0, b: 2 },
    ];
    let f_ref = vm.new_proto(t, f).unwrap();
    let mut main = Proto::new();
    main.max_stack_size = 2;
    main.protos = vec![f_ref];
    main.code = vec![
        Instr::Closure { a: 0, bx: 0 },
        Instr::Move { a: 1, b: 0 },
        Instr::Call { a: 1, b: 1, c: 1 },
        Instr::Return { a: 0, b: 1 },
    ];
    push_chunk(&mut vm, t, main);
    let status = vm.pcall(t, 0, Some(0), 0);
    assert_eq!(status, Status::RuntimeErr);
    let msg = vm.to_lstring(t, -1).unwrap().unwrap();
    assert!(msg.contains("stack overflow"), "{}", msg);
}

// ===== Varargs =====

#[test]
fn test_vararg_function() {
    let (mut vm, t) = new_vm();
    // F(a, ...) = select second vararg
    let mut f = Proto::new();
    f.num_params = 1;
    f.is_vararg = true;
    f.max_stack_size = 4;
    f.code = vec![
        Instr::Vararg { a: 1, b: 3 }, // r1, r2 = first two varargs
        Instr::Return { a: 2, b: 2 }, // return the second
    ];
    push_chunk(&mut vm, t, f);
    vm.push_number(t, 1.0);
    vm.push_number(t, 2.0);
    vm.push_number(t, 3.0);
    vm.push_number(t, 4.0);
    vm.call(t, 4, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 3.0);
}

#[test]
fn test_vararg_padding() {
    let (mut vm, t) = new_vm();
    let mut f = Proto::new();
    f.num_params = 0;
    f.is_vararg = true;
    f.max_stack_size = 4;
    f.code = vec![
        Instr::Vararg { a: 0, b: 3 }, // wants two, only one supplied
        Instr::Return { a: 1, b: 2 },
    ];
    push_chunk(&mut vm, t, f);
    vm.push_number(t, 5.0);
    vm.call(t, 1, Some(1)).unwrap();
    assert_eq!(vm.type_of(t, -1), Type::Nil);
}

// ===== Concat and length in script =====

#[test]
fn test_script_concat_and_len() {
    let (mut vm, t) = new_vm();
    let mut p = Proto::new();
    p.max_stack_size = 4;
    p.k = vec![
        vm.string_value(t, "ab").unwrap(),
        Value::Number(3.0),
        vm.string_value(t, "c").unwrap(),
    ];
    p.code = vec![
        Instr::LoadK { a: 0, k: 0 },
        Instr::LoadK { a: 1, k: 1 },
        Instr::LoadK { a: 2, k: 2 },
        Instr::Concat { a: 0, b: 0, c: 2 }, // "ab3c"
        Instr::Len { a: 0, b: 0 },
        Instr::Return { a: 0, b: 2 },
    ];
    push_chunk(&mut vm, t, p);
    vm.call(t, 0, Some(1)).unwrap();
    assert_eq!(vm.to_number(t, -1), 4.0);
}
