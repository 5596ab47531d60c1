//! Vector instructions through the interpreter: lane construction, lane-wise
//! arithmetic, comparisons, memory traffic, and relaxed variants.

mod common;

use common::*;

use reef_wasm::ast::instr::{
    FShape, Instruction as I, IShape, MemArg, RelaxedOp, Shape, Sign, VFBinOp, VIBinOp, VIRelOp,
    VShiftOp,
};
use reef_wasm::ast::types::ValType;
use reef_wasm::{Trap, Value};

fn v128_from_i32x4(l: [i32; 4]) -> u128 {
    let mut b = [0u8; 16];
    for (i, x) in l.iter().enumerate() {
        b[i * 4..(i + 1) * 4].copy_from_slice(&x.to_le_bytes());
    }
    u128::from_le_bytes(b)
}

#[test]
fn lanewise_add_and_extract() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::V128, ValType::V128], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::VIBinop { shape: IShape::I32x4, op: VIBinOp::Add },
            I::ExtractLane { shape: Shape::I(IShape::I32x4), lane: 2, sign: Sign::S },
        ],
    );
    b.export_func("add_lane2", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let r = invoke1(
        &exec,
        &store,
        m,
        "add_lane2",
        &[
            Value::V128(v128_from_i32x4([1, 2, 30, 4])),
            Value::V128(v128_from_i32x4([10, 20, 12, 40])),
        ],
    )
    .unwrap();
    assert_eq!(r, Value::I32(42));
}

#[test]
fn splat_shift_and_bitmask() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Splat(Shape::I(IShape::I32x4)),
            I::I32Const(31),
            I::VShift { shape: IShape::I32x4, op: VShiftOp::ShrS },
            I::Bitmask(IShape::I32x4),
        ],
    );
    b.export_func("signs", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "signs", &[Value::I32(-5)]).unwrap(), Value::I32(0b1111));
    assert_eq!(invoke1(&exec, &store, m, "signs", &[Value::I32(5)]).unwrap(), Value::I32(0));
}

#[test]
fn v128_memory_round_trip_and_bounds() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None);
    let store_ty = b.func_type(vec![ValType::I32, ValType::V128], vec![]);
    let load_ty = b.func_type(vec![ValType::I32], vec![ValType::V128]);
    let st = b.func(
        store_ty,
        vec![],
        vec![I::LocalGet(0), I::LocalGet(1), I::V128Store(MemArg::at(0))],
    );
    let ld = b.func(load_ty, vec![], vec![I::LocalGet(0), I::V128Load(MemArg::at(0))]);
    b.export_func("store", st);
    b.export_func("load", ld);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let v = v128_from_i32x4([1, -2, 3, -4]);
    invoke(&exec, &store, m, "store", &[Value::I32(64), Value::V128(v)]).unwrap();
    assert_eq!(invoke1(&exec, &store, m, "load", &[Value::I32(64)]).unwrap(), Value::V128(v));
    assert!(matches!(
        invoke1(&exec, &store, m, "load", &[Value::I32(65521)]),
        Err(Trap::OutOfBounds)
    ));
}

#[test]
fn comparisons_produce_lane_masks() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::V128, ValType::V128], vec![ValType::I32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::VIRelop { shape: IShape::I32x4, op: VIRelOp::Lt { sign: Sign::S } },
            I::Bitmask(IShape::I32x4),
        ],
    );
    b.export_func("lt_mask", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let r = invoke1(
        &exec,
        &store,
        m,
        "lt_mask",
        &[
            Value::V128(v128_from_i32x4([1, 5, -3, 0])),
            Value::V128(v128_from_i32x4([2, 4, -3, -1])),
        ],
    )
    .unwrap();
    assert_eq!(r, Value::I32(0b0001));
}

#[test]
fn float_lanes_and_relaxed_madd() {
    // madd(a, b, c) = a * b + c, lane 0 extracted.
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::F32; 3], vec![ValType::F32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Splat(Shape::F(FShape::F32x4)),
            I::LocalGet(1),
            I::Splat(Shape::F(FShape::F32x4)),
            I::LocalGet(2),
            I::Splat(Shape::F(FShape::F32x4)),
            I::Relaxed(RelaxedOp::MaddF32x4),
            I::ExtractLane { shape: Shape::F(FShape::F32x4), lane: 0, sign: Sign::U },
        ],
    );
    b.export_func("madd", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let r = invoke1(
        &exec,
        &store,
        m,
        "madd",
        &[
            Value::F32(3.0f32.to_bits()),
            Value::F32(4.0f32.to_bits()),
            Value::F32(5.0f32.to_bits()),
        ],
    )
    .unwrap();
    assert_eq!(r, Value::F32(17.0f32.to_bits()));
}

#[test]
fn float_min_lane_semantics() {
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![ValType::F32, ValType::F32], vec![ValType::F32]);
    let f = b.func(
        ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::Splat(Shape::F(FShape::F32x4)),
            I::LocalGet(1),
            I::Splat(Shape::F(FShape::F32x4)),
            I::VFBinop { shape: FShape::F32x4, op: VFBinOp::Min },
            I::ExtractLane { shape: Shape::F(FShape::F32x4), lane: 3, sign: Sign::U },
        ],
    );
    b.export_func("vmin", f);
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &b.build()).unwrap();
    let r = invoke1(
        &exec,
        &store,
        m,
        "vmin",
        &[Value::F32(f32::NAN.to_bits()), Value::F32(1.0f32.to_bits())],
    )
    .unwrap();
    assert_eq!(r, Value::F32(0x7FC0_0000));
}
