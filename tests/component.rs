//! Component-model instantiation and the canonical ABI: lifting core
//! functions, lowering component functions back into core imports, and
//! string traffic through `realloc` and the target memory.

mod common;

use std::sync::Arc;

use common::*;

use reef_wasm::ast::component::{
    Alias, Canon, CanonOpts, Component, ComponentExport, ComponentFuncType, ComponentSection,
    ComponentSort, ComponentType, ComponentValType, CoreExportDecl, CoreInstance,
    CoreInstantiateArg, CoreSort,
};
use reef_wasm::ast::instr::{IBinOp, Instruction as I, IWidth};
use reef_wasm::ast::types::{GlobalType, ValType};
use reef_wasm::runtime::component::ComponentValue;

/// Core library module: a memory, a bump `realloc`, `strlen`, and `make`
/// returning a pointer to a preloaded (ptr, len) string descriptor.
fn lib_module() -> Arc<reef_wasm::ast::Module> {
    let mut b = ModuleBuilder::new();
    let mem = b.memory(1, None);
    let bump = b.global(
        GlobalType::new(ValType::I32, true),
        reef_wasm::ast::module::ConstExpr::i32(1024),
    );
    // "hello" at 100, its descriptor at 8, "world" at 200.
    b.active_data(mem, 100, b"hello".to_vec());
    b.active_data(mem, 8, vec![100, 0, 0, 0, 5, 0, 0, 0]);
    b.active_data(mem, 200, b"world".to_vec());

    let realloc_ty =
        b.func_type(vec![ValType::I32; 4], vec![ValType::I32]);
    let realloc = b.func(
        realloc_ty,
        vec![ValType::I32],
        vec![
            I::GlobalGet(bump),
            I::LocalSet(4),
            I::GlobalGet(bump),
            I::LocalGet(3),
            I::IBinop { w: IWidth::W32, op: IBinOp::Add },
            I::GlobalSet(bump),
            I::LocalGet(4),
        ],
    );
    let strlen_ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let strlen = b.func(strlen_ty, vec![], vec![I::LocalGet(1)]);
    let make_ty = b.func_type(vec![], vec![ValType::I32]);
    let make = b.func(make_ty, vec![], vec![I::I32Const(8)]);

    b.export_memory("mem", mem);
    b.export_func("realloc", realloc);
    b.export_func("strlen", strlen);
    b.export_func("make", make);
    b.build()
}

/// Core caller module importing the lowered `strlen` and applying it to a
/// string that lives at offset 200 of the library memory.
fn caller_module() -> Arc<reef_wasm::ast::Module> {
    let mut b = ModuleBuilder::new();
    let import_ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let imported = b.import_func("host", "strlen_lowered", import_ty);
    let ty = b.func_type(vec![], vec![ValType::I32]);
    let f = b.func(ty, vec![], vec![I::I32Const(200), I::I32Const(5), I::Call(imported)]);
    b.export_func("call_it", f);
    b.build()
}

fn string_component() -> Arc<Component> {
    let opts = CanonOpts { memory: Some(0), realloc: Some(0), ..CanonOpts::default() };
    Arc::new(Component {
        sections: vec![
            ComponentSection::CoreModule(lib_module()),
            ComponentSection::CoreInstance(CoreInstance::Instantiate {
                module: 0,
                args: vec![],
            }),
            // core index spaces: memory 0, funcs 0..=2
            ComponentSection::Alias(Alias::CoreInstanceExport {
                instance: 0,
                name: "mem".into(),
                sort: CoreSort::Memory,
            }),
            ComponentSection::Alias(Alias::CoreInstanceExport {
                instance: 0,
                name: "realloc".into(),
                sort: CoreSort::Func,
            }),
            ComponentSection::Alias(Alias::CoreInstanceExport {
                instance: 0,
                name: "strlen".into(),
                sort: CoreSort::Func,
            }),
            ComponentSection::Alias(Alias::CoreInstanceExport {
                instance: 0,
                name: "make".into(),
                sort: CoreSort::Func,
            }),
            ComponentSection::Type(ComponentType::Func(ComponentFuncType {
                params: vec![("s".into(), ComponentValType::String)],
                result: Some(ComponentValType::U32),
            })),
            ComponentSection::Type(ComponentType::Func(ComponentFuncType {
                params: vec![],
                result: Some(ComponentValType::String),
            })),
            ComponentSection::Canon(Canon::Lift { core_func: 1, ty: 0, opts: opts.clone() }),
            ComponentSection::Canon(Canon::Lift { core_func: 2, ty: 1, opts: opts.clone() }),
            // Lower strlen back into a core function (core_funcs[3]).
            ComponentSection::Canon(Canon::Lower { func: 0, opts: opts.clone() }),
            ComponentSection::CoreInstance(CoreInstance::FromExports(vec![CoreExportDecl {
                name: "strlen_lowered".into(),
                sort: CoreSort::Func,
                idx: 3,
            }])),
            ComponentSection::CoreModule(caller_module()),
            ComponentSection::CoreInstance(CoreInstance::Instantiate {
                module: 1,
                args: vec![CoreInstantiateArg { name: "host".into(), instance: 1 }],
            }),
            ComponentSection::Alias(Alias::CoreInstanceExport {
                instance: 2,
                name: "call_it".into(),
                sort: CoreSort::Func,
            }),
            ComponentSection::Type(ComponentType::Func(ComponentFuncType {
                params: vec![],
                result: Some(ComponentValType::U32),
            })),
            ComponentSection::Canon(Canon::Lift { core_func: 4, ty: 2, opts: CanonOpts::default() }),
            ComponentSection::Export(ComponentExport {
                name: "strlen".into(),
                sort: ComponentSort::Func,
                idx: 0,
            }),
            ComponentSection::Export(ComponentExport {
                name: "make".into(),
                sort: ComponentSort::Func,
                idx: 1,
            }),
            ComponentSection::Export(ComponentExport {
                name: "call_it".into(),
                sort: ComponentSort::Func,
                idx: 2,
            }),
        ],
    })
}

#[test]
fn lifted_function_lowers_string_arguments() {
    let (exec, store) = engine();
    let c = exec.instantiate_component(&store, &string_component()).unwrap();
    let comp = store.component(c).unwrap();
    let strlen = comp.export_func("strlen").unwrap();
    let r = exec
        .invoke_component(&store, &strlen, &[ComponentValue::String("hello!".into())])
        .unwrap();
    assert_eq!(r, vec![ComponentValue::U32(6)]);
}

#[test]
fn string_result_comes_back_through_memory() {
    let (exec, store) = engine();
    let c = exec.instantiate_component(&store, &string_component()).unwrap();
    let comp = store.component(c).unwrap();
    let make = comp.export_func("make").unwrap();
    let r = exec.invoke_component(&store, &make, &[]).unwrap();
    assert_eq!(r, vec![ComponentValue::String("hello".into())]);
}

#[test]
fn lowered_function_round_trips_through_core_caller() {
    let (exec, store) = engine();
    let c = exec.instantiate_component(&store, &string_component()).unwrap();
    let comp = store.component(c).unwrap();
    let call_it = comp.export_func("call_it").unwrap();
    let r = exec.invoke_component(&store, &call_it, &[]).unwrap();
    assert_eq!(r, vec![ComponentValue::U32(5)]);
}

#[test]
fn registered_component_is_discoverable() {
    let (exec, store) = engine();
    let c = exec
        .register_component(&store, &string_component(), "strings")
        .unwrap();
    assert_eq!(store.lookup_component_named("strings"), Some(c));
}

#[test]
fn compound_values_flatten_and_lift() {
    // A component function over a record+option signature, backed by a core
    // add that sums the flattened lanes it cares about.
    let mut b = ModuleBuilder::new();
    let core_ty = b.func_type(
        vec![ValType::I32, ValType::I32, ValType::I32, ValType::I32],
        vec![ValType::I32],
    );
    // (x, y, opt_disc, opt_val) -> x + y + (disc != 0 ? val : 0)
    let f = b.func(
        core_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::IBinop { w: IWidth::W32, op: IBinOp::Add },
            I::LocalGet(2),
            I::If(reef_wasm::ast::instr::BlockType::Val(ValType::I32)),
            I::LocalGet(3),
            I::Else,
            I::I32Const(0),
            I::End,
            I::IBinop { w: IWidth::W32, op: IBinOp::Add },
        ],
    );
    b.export_func("sum", f);
    let record = ComponentValType::Record(vec![
        ("x".into(), ComponentValType::S32),
        ("y".into(), ComponentValType::S32),
    ]);
    let comp = Arc::new(Component {
        sections: vec![
            ComponentSection::CoreModule(b.build()),
            ComponentSection::CoreInstance(CoreInstance::Instantiate { module: 0, args: vec![] }),
            ComponentSection::Alias(Alias::CoreInstanceExport {
                instance: 0,
                name: "sum".into(),
                sort: CoreSort::Func,
            }),
            ComponentSection::Type(ComponentType::Func(ComponentFuncType {
                params: vec![
                    ("pair".into(), record.clone()),
                    ("extra".into(), ComponentValType::Option(Box::new(ComponentValType::S32))),
                ],
                result: Some(ComponentValType::S32),
            })),
            ComponentSection::Canon(Canon::Lift { core_func: 0, ty: 0, opts: CanonOpts::default() }),
            ComponentSection::Export(ComponentExport {
                name: "sum".into(),
                sort: ComponentSort::Func,
                idx: 0,
            }),
        ],
    });
    let (exec, store) = engine();
    let c = exec.instantiate_component(&store, &comp).unwrap();
    let sum = store.component(c).unwrap().export_func("sum").unwrap();
    let r = exec
        .invoke_component(
            &store,
            &sum,
            &[
                ComponentValue::Record(vec![
                    ("x".into(), ComponentValue::S32(10)),
                    ("y".into(), ComponentValue::S32(20)),
                ]),
                ComponentValue::Option(Some(Box::new(ComponentValue::S32(12)))),
            ],
        )
        .unwrap();
    assert_eq!(r, vec![ComponentValue::S32(42)]);
    let r = exec
        .invoke_component(
            &store,
            &sum,
            &[
                ComponentValue::Record(vec![
                    ("x".into(), ComponentValue::S32(1)),
                    ("y".into(), ComponentValue::S32(2)),
                ]),
                ComponentValue::Option(None),
            ],
        )
        .unwrap();
    assert_eq!(r, vec![ComponentValue::S32(3)]);
}
