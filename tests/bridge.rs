//! Compiled-code bridge: native entry points invoked through the executor,
//! intrinsic callbacks reaching back into the store, and trap codes crossing
//! the raw ABI.

mod common;

use common::*;

use reef_wasm::ast::instr::{IBinOp, Instruction as I, IWidth};
use reef_wasm::ast::types::{FuncType, ValType};
use reef_wasm::runtime::FunctionInstance;
use reef_wasm::{ExecutionContext, RawVal, Trap, Value, INTRINSICS};

unsafe extern "C" fn compiled_add(
    _ctx: *mut ExecutionContext,
    args: *const RawVal,
    rets: *mut RawVal,
) -> i32 {
    let a = (*args).lo as u32 as i32;
    let b = (*args.add(1)).lo as u32 as i32;
    (*rets).lo = a.wrapping_add(b) as u32 as u64;
    0
}

unsafe extern "C" fn compiled_call_through(
    _ctx: *mut ExecutionContext,
    args: *const RawVal,
    rets: *mut RawVal,
) -> i32 {
    // Call module function 0 through the intrinsics table, then double it.
    let mut out = [RawVal::ZERO; 1];
    let code = (INTRINSICS.call)(0, args, out.as_mut_ptr());
    if code != 0 {
        return code;
    }
    (*rets).lo = ((out[0].lo as u32 as i32) * 2) as u32 as u64;
    0
}

unsafe extern "C" fn compiled_boom(
    _ctx: *mut ExecutionContext,
    _args: *const RawVal,
    _rets: *mut RawVal,
) -> i32 {
    (INTRINSICS.trap)(Trap::OutOfBounds.code())
}

unsafe extern "C" fn compiled_mem_pages(
    ctx: *mut ExecutionContext,
    _args: *const RawVal,
    rets: *mut RawVal,
) -> i32 {
    assert_eq!((*ctx).memory_count, 1);
    let mut pages = 0u32;
    let code = (INTRINSICS.mem_size)(0, &mut pages);
    if code != 0 {
        return code;
    }
    (*rets).lo = pages as u64;
    0
}

fn host_module() -> (reef_wasm::Executor, reef_wasm::Store, reef_wasm::ModuleAddr) {
    let mut b = ModuleBuilder::new();
    b.memory(2, None);
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let inc = b.func(
        ty,
        vec![],
        vec![I::LocalGet(0), I::I32Const(1), I::IBinop { w: IWidth::W32, op: IBinOp::Add }],
    );
    b.export_func("inc", inc);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    (exec, store, m)
}

#[test]
fn compiled_function_runs_through_the_bridge() {
    let (exec, store, m) = host_module();
    let addr = store.alloc_func(FunctionInstance::compiled(
        FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]),
        m,
        compiled_add,
    ));
    let r = exec.invoke(&store, addr, &[Value::I32(40), Value::I32(2)]).unwrap();
    assert_eq!(r[0].0, Value::I32(42));
}

#[test]
fn intrinsic_call_reenters_the_interpreter() {
    let (exec, store, m) = host_module();
    let addr = store.alloc_func(FunctionInstance::compiled(
        FuncType::new(vec![ValType::I32], vec![ValType::I32]),
        m,
        compiled_call_through,
    ));
    // inc(5) == 6, doubled by the compiled wrapper.
    let r = exec.invoke(&store, addr, &[Value::I32(5)]).unwrap();
    assert_eq!(r[0].0, Value::I32(12));
}

#[test]
fn proxy_trap_codes_surface_as_traps() {
    let (exec, store, m) = host_module();
    let addr = store.alloc_func(FunctionInstance::compiled(
        FuncType::new(vec![], vec![]),
        m,
        compiled_boom,
    ));
    assert!(matches!(
        exec.invoke(&store, addr, &[]),
        Err(Trap::OutOfBounds)
    ));
}

#[test]
fn execution_context_exposes_memories() {
    let (exec, store, m) = host_module();
    let addr = store.alloc_func(FunctionInstance::compiled(
        FuncType::new(vec![], vec![ValType::I32]),
        m,
        compiled_mem_pages,
    ));
    let r = exec.invoke(&store, addr, &[]).unwrap();
    assert_eq!(r[0].0, Value::I32(2));
}

#[test]
fn wasm_calls_into_compiled_code() {
    // A Wasm function call_indirect-ing into a compiled entry placed in its
    // table by the embedder.
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let table = b.table(reef_wasm::ast::types::RefType::FUNCREF, 1, None);
    let caller = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::I32Const(0),
            I::CallIndirect { type_idx: ty, table },
        ],
    );
    b.export_func("call", caller);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let compiled = store.alloc_func(FunctionInstance::compiled(
        FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]),
        m,
        compiled_add,
    ));
    let table_addr = store.module(m).unwrap().tables[0];
    store
        .table(table_addr)
        .unwrap()
        .set(0, reef_wasm::Ref::Func(compiled))
        .unwrap();
    let r = invoke1(&exec, &store, m, "call", &[Value::I32(20), Value::I32(22)]).unwrap();
    assert_eq!(r, Value::I32(42));
}
