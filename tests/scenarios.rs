//! End-to-end interpreter scenarios: arithmetic with defined wrap-around,
//! memory bounds, division traps, saturating truncation, control flow, and
//! the call family.

mod common;

use common::*;

use reef_wasm::ast::instr::{
    BlockType, BrTableTargets, CvtOp, FWidth, IBinOp, IRelOp, Instruction as I, IWidth, MemArg,
    NumType, PackedLoad, Sign,
};
use reef_wasm::ast::types::ValType;
use reef_wasm::{Trap, Value};

fn i32_binop(op: IBinOp) -> Vec<I> {
    vec![
        I::LocalGet(0),
        I::LocalGet(1),
        I::IBinop { w: IWidth::W32, op },
    ]
}

#[test]
fn add_and_wrap_around() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let f = b.func(ty, vec![], i32_binop(IBinOp::Add));
    b.export_func("add", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();

    let r = invoke1(&exec, &store, m, "add", &[Value::I32(2), Value::I32(3)]).unwrap();
    assert_eq!(r, Value::I32(5));

    let r = invoke1(&exec, &store, m, "add", &[Value::I32(0x7FFF_FFFF), Value::I32(1)]).unwrap();
    assert_eq!(r, Value::I32(i32::MIN)); // 0x80000000
}

#[test]
fn memory_load_bounds() {
    let mut b = ModuleBuilder::new();
    let mem = b.memory(1, None);
    let load_ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let store_ty = b.func_type(vec![ValType::I32, ValType::I32], vec![]);
    let load = b.func(
        load_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Load { ty: NumType::I32, packed: None, memarg: MemArg::at(0) },
        ],
    );
    let store_fn = b.func(
        store_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::Store { ty: NumType::I32, bits: None, memarg: MemArg::at(0) },
        ],
    );
    b.export_func("load", load);
    b.export_func("store", store_fn);
    b.export_memory("mem", mem);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();

    // 65533 + 4 bytes crosses the one-page boundary.
    let r = invoke1(&exec, &store, m, "load", &[Value::I32(65533)]);
    assert!(matches!(r, Err(Trap::OutOfBounds)));

    invoke(&exec, &store, m, "store", &[Value::I32(0), Value::I32(0xDEAD_BEEFu32 as i32)])
        .unwrap();
    let r = invoke1(&exec, &store, m, "load", &[Value::I32(0)]).unwrap();
    assert_eq!(r, Value::I32(0xDEAD_BEEFu32 as i32));
}

#[test]
fn sign_extending_loads() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None);
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let set_ty = b.func_type(vec![], vec![]);
    let init = b.func(
        set_ty,
        vec![],
        vec![
            I::I32Const(0),
            I::I32Const(0xFF),
            I::Store { ty: NumType::I32, bits: Some(8), memarg: MemArg::at(0) },
        ],
    );
    let s = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Load {
                ty: NumType::I32,
                packed: Some(PackedLoad { bits: 8, sign: Sign::S }),
                memarg: MemArg::at(0),
            },
        ],
    );
    let u = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Load {
                ty: NumType::I32,
                packed: Some(PackedLoad { bits: 8, sign: Sign::U }),
                memarg: MemArg::at(0),
            },
        ],
    );
    b.export_func("init", init);
    b.export_func("load8_s", s);
    b.export_func("load8_u", u);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    invoke(&exec, &store, m, "init", &[]).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "load8_s", &[Value::I32(0)]).unwrap(), Value::I32(-1));
    assert_eq!(invoke1(&exec, &store, m, "load8_u", &[Value::I32(0)]).unwrap(), Value::I32(255));
}

#[test]
fn division_traps_and_trunc_sat() {
    let mut b = ModuleBuilder::new();
    let bin = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let sat = b.func_type(vec![ValType::F32], vec![ValType::I32]);
    let div_s = b.func(bin, vec![], i32_binop(IBinOp::DivS));
    let div_u = b.func(bin, vec![], i32_binop(IBinOp::DivU));
    let trunc_sat = b.func(
        sat,
        vec![],
        vec![
            I::LocalGet(0),
            I::Cvtop(CvtOp::ITruncSatF { int: IWidth::W32, float: FWidth::W32, sign: Sign::S }),
        ],
    );
    b.export_func("div_s", div_s);
    b.export_func("div_u", div_u);
    b.export_func("trunc_sat", trunc_sat);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();

    let r = invoke1(&exec, &store, m, "div_s", &[Value::I32(i32::MIN), Value::I32(-1)]);
    assert!(matches!(r, Err(Trap::IntegerOverflow)));
    let r = invoke1(&exec, &store, m, "div_u", &[Value::I32(1), Value::I32(0)]);
    assert!(matches!(r, Err(Trap::IntegerDivideByZero)));
    let r = invoke1(&exec, &store, m, "trunc_sat", &[Value::F32(f32::NAN.to_bits())]).unwrap();
    assert_eq!(r, Value::I32(0));
}

#[test]
fn trapping_trunc() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::F64], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Cvtop(CvtOp::ITruncF { int: IWidth::W32, float: FWidth::W64, sign: Sign::S }),
        ],
    );
    b.export_func("trunc", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert!(matches!(
        invoke1(&exec, &store, m, "trunc", &[Value::F64(f64::NAN.to_bits())]),
        Err(Trap::InvalidConversionToInteger)
    ));
    assert!(matches!(
        invoke1(&exec, &store, m, "trunc", &[Value::F64(1e10f64.to_bits())]),
        Err(Trap::IntegerOverflow)
    ));
    assert_eq!(
        invoke1(&exec, &store, m, "trunc", &[Value::F64((-3.7f64).to_bits())]).unwrap(),
        Value::I32(-3)
    );
}

#[test]
fn loop_with_branch() {
    // sum(n) via a loop: local1 = acc, local0 counts down.
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![ValType::I32],
        vec![
            I::Block(BlockType::Empty),
            I::Loop(BlockType::Empty),
            // if local0 == 0, exit
            I::LocalGet(0),
            I::ITestop(IWidth::W32),
            I::BrIf(1),
            // acc += n
            I::LocalGet(1),
            I::LocalGet(0),
            I::IBinop { w: IWidth::W32, op: IBinOp::Add },
            I::LocalSet(1),
            // n -= 1
            I::LocalGet(0),
            I::I32Const(1),
            I::IBinop { w: IWidth::W32, op: IBinOp::Sub },
            I::LocalSet(0),
            I::Br(0),
            I::End,
            I::End,
            I::LocalGet(1),
        ],
    );
    b.export_func("sum", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "sum", &[Value::I32(10)]).unwrap(), Value::I32(55));
    assert_eq!(invoke1(&exec, &store, m, "sum", &[Value::I32(0)]).unwrap(), Value::I32(0));
}

#[test]
fn if_else_and_select() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let branchy = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::If(BlockType::Val(ValType::I32)),
            I::I32Const(10),
            I::Else,
            I::I32Const(20),
            I::End,
        ],
    );
    let selecty = b.func(
        ty,
        vec![],
        vec![I::I32Const(10), I::I32Const(20), I::LocalGet(0), I::Select],
    );
    b.export_func("branchy", branchy);
    b.export_func("selecty", selecty);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    for name in ["branchy", "selecty"] {
        assert_eq!(invoke1(&exec, &store, m, name, &[Value::I32(1)]).unwrap(), Value::I32(10));
        assert_eq!(invoke1(&exec, &store, m, name, &[Value::I32(0)]).unwrap(), Value::I32(20));
    }
}

#[test]
fn br_table_dispatch() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::Block(BlockType::Empty),
            I::Block(BlockType::Empty),
            I::Block(BlockType::Empty),
            I::LocalGet(0),
            I::BrTable(BrTableTargets { targets: vec![0, 1], default: 2 }),
            I::End,
            I::I32Const(100),
            I::Return,
            I::End,
            I::I32Const(200),
            I::Return,
            I::End,
            I::I32Const(300),
        ],
    );
    b.export_func("dispatch", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "dispatch", &[Value::I32(0)]).unwrap(), Value::I32(100));
    assert_eq!(invoke1(&exec, &store, m, "dispatch", &[Value::I32(1)]).unwrap(), Value::I32(200));
    assert_eq!(invoke1(&exec, &store, m, "dispatch", &[Value::I32(9)]).unwrap(), Value::I32(300));
}

#[test]
fn recursion_and_calls() {
    // fac(n) = n == 0 ? 1 : n * fac(n - 1)
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::ITestop(IWidth::W32),
            I::If(BlockType::Val(ValType::I32)),
            I::I32Const(1),
            I::Else,
            I::LocalGet(0),
            I::LocalGet(0),
            I::I32Const(1),
            I::IBinop { w: IWidth::W32, op: IBinOp::Sub },
            I::Call(0),
            I::IBinop { w: IWidth::W32, op: IBinOp::Mul },
            I::End,
        ],
    );
    b.export_func("fac", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "fac", &[Value::I32(5)]).unwrap(), Value::I32(120));
}

#[test]
fn deep_recursion_overflows() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![], vec![]);
    let f = b.func(ty, vec![], vec![I::Call(0)]);
    b.export_func("spin", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert!(matches!(
        invoke(&exec, &store, m, "spin", &[]),
        Err(Trap::StackOverflow)
    ));
}

#[test]
fn tail_call_runs_in_constant_frames() {
    // countdown(n): n == 0 ? 42 : return_call countdown(n - 1)
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::ITestop(IWidth::W32),
            I::If(BlockType::Empty),
            I::I32Const(42),
            I::Return,
            I::End,
            I::LocalGet(0),
            I::I32Const(1),
            I::IBinop { w: IWidth::W32, op: IBinOp::Sub },
            I::ReturnCall(0),
        ],
    );
    b.export_func("countdown", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    // Far more iterations than the frame limit allows for plain calls.
    assert_eq!(
        invoke1(&exec, &store, m, "countdown", &[Value::I32(100_000)]).unwrap(),
        Value::I32(42)
    );
}

#[test]
fn call_indirect_type_checks() {
    let mut b = ModuleBuilder::new();
    let i32_ty = b.func_type(vec![], vec![ValType::I32]);
    let i64_ty = b.func_type(vec![], vec![ValType::I64]);
    let table = b.table(reef_wasm::ast::types::RefType::FUNCREF, 4, None);
    let ret7 = b.func(i32_ty, vec![], vec![I::I32Const(7)]);
    let ret9 = b.func(i64_ty, vec![], vec![I::I64Const(9)]);
    b.active_elem(table, 0, vec![ret7, ret9]);
    let caller_ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let caller = b.func(
        caller_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::CallIndirect { type_idx: i32_ty, table },
        ],
    );
    b.export_func("call", caller);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "call", &[Value::I32(0)]).unwrap(), Value::I32(7));
    // Signature mismatch.
    assert!(matches!(
        invoke1(&exec, &store, m, "call", &[Value::I32(1)]),
        Err(Trap::IndirectCallTypeMismatch)
    ));
    // Uninitialized slot.
    assert!(matches!(
        invoke1(&exec, &store, m, "call", &[Value::I32(2)]),
        Err(Trap::UninitializedElement)
    ));
    // Out of table bounds.
    assert!(matches!(
        invoke1(&exec, &store, m, "call", &[Value::I32(99)]),
        Err(Trap::OutOfBounds)
    ));
}

#[test]
fn float_min_max_semantics() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::F64, ValType::F64], vec![ValType::F64]);
    let fmin = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::FBinop { w: FWidth::W64, op: reef_wasm::ast::instr::FBinOp::Min },
        ],
    );
    b.export_func("min", fmin);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let nan = invoke1(
        &exec,
        &store,
        m,
        "min",
        &[Value::F64(f64::NAN.to_bits()), Value::F64(1.0f64.to_bits())],
    )
    .unwrap();
    assert_eq!(nan, Value::F64(0x7FF8_0000_0000_0000));
    let neg_zero = invoke1(
        &exec,
        &store,
        m,
        "min",
        &[Value::F64(0.0f64.to_bits()), Value::F64((-0.0f64).to_bits())],
    )
    .unwrap();
    assert_eq!(neg_zero, Value::F64((-0.0f64).to_bits()));
}

#[test]
fn comparisons_and_multi_value() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32, ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::IRelop { w: IWidth::W32, op: IRelOp::LtS },
            I::LocalGet(0),
            I::LocalGet(1),
            I::IRelop { w: IWidth::W32, op: IRelOp::LtU },
        ],
    );
    b.export_func("lt_both", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let r = invoke(&exec, &store, m, "lt_both", &[Value::I32(-1), Value::I32(1)]).unwrap();
    // -1 < 1 signed, but 0xFFFFFFFF > 1 unsigned.
    assert_eq!(r, vec![Value::I32(1), Value::I32(0)]);
}

#[test]
fn bulk_memory_ops() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None);
    let data = b.passive_data(vec![1, 2, 3, 4]);
    let run_ty = b.func_type(vec![], vec![ValType::I32]);
    let f = b.func(
        run_ty,
        vec![],
        vec![
            // memory.init: copy the 4 data bytes to offset 16
            I::I32Const(16),
            I::I32Const(0),
            I::I32Const(4),
            I::MemoryInit { data, mem: 0 },
            // memory.copy them to offset 20
            I::I32Const(20),
            I::I32Const(16),
            I::I32Const(4),
            I::MemoryCopy { dst: 0, src: 0 },
            // memory.fill one byte in the middle
            I::I32Const(21),
            I::I32Const(0xAA),
            I::I32Const(1),
            I::MemoryFill(0),
            I::I32Const(20),
            I::Load { ty: NumType::I32, packed: None, memarg: MemArg::at(0) },
        ],
    );
    b.export_func("run", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let r = invoke1(&exec, &store, m, "run", &[]).unwrap();
    assert_eq!(r, Value::I32(i32::from_le_bytes([1, 0xAA, 3, 4])));
}

#[test]
fn data_drop_then_init_traps() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None);
    let data = b.passive_data(vec![1, 2, 3, 4]);
    let ty = b.func_type(vec![], vec![]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::DataDrop(data),
            I::I32Const(0),
            I::I32Const(0),
            I::I32Const(4),
            I::MemoryInit { data, mem: 0 },
        ],
    );
    b.export_func("run", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert!(matches!(invoke(&exec, &store, m, "run", &[]), Err(Trap::OutOfBounds)));
}
