//! Shared-memory atomics across real OS threads: wait/notify handshakes,
//! RMW sequences, alignment traps, and stop liveness.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;

use reef_wasm::ast::instr::{Instruction as I, IWidth, MemArg, RmwOp};
use reef_wasm::ast::types::ValType;
use reef_wasm::{Config, Executor, Store, Trap, Value};

/// Module with a shared memory exporting store/notify/wait/rmw helpers.
fn atomic_module() -> std::sync::Arc<reef_wasm::ast::Module> {
    let mut b = ModuleBuilder::new();
    b.shared_memory(1, 1);
    let store_ty = b.func_type(vec![ValType::I32, ValType::I32], vec![]);
    let wait_ty = b.func_type(vec![ValType::I32, ValType::I32, ValType::I64], vec![ValType::I32]);
    let notify_ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let rmw_ty = b.func_type(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let load_ty = b.func_type(vec![ValType::I32], vec![ValType::I32]);

    let atomic_store = b.func(
        store_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::AtomicStore { w: IWidth::W32, bits: None, memarg: MemArg::at(0) },
        ],
    );
    let wait32 = b.func(
        wait_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::LocalGet(2),
            I::MemoryAtomicWait32(MemArg::at(0)),
        ],
    );
    let notify = b.func(
        notify_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::MemoryAtomicNotify(MemArg::at(0)),
        ],
    );
    let add = b.func(
        rmw_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::LocalGet(1),
            I::AtomicRmw { w: IWidth::W32, bits: None, op: RmwOp::Add, memarg: MemArg::at(0) },
        ],
    );
    let load = b.func(
        load_ty,
        vec![],
        vec![
            I::LocalGet(0),
            I::AtomicLoad { w: IWidth::W32, bits: None, memarg: MemArg::at(0) },
        ],
    );
    b.export_func("store", atomic_store);
    b.export_func("wait32", wait32);
    b.export_func("notify", notify);
    b.export_func("add", add);
    b.export_func("load", load);
    b.build()
}

#[test]
fn rmw_and_load() {
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &atomic_module()).unwrap();
    invoke(&exec, &store, m, "store", &[Value::I32(0), Value::I32(40)]).unwrap();
    let old = invoke1(&exec, &store, m, "add", &[Value::I32(0), Value::I32(2)]).unwrap();
    assert_eq!(old, Value::I32(40));
    let now = invoke1(&exec, &store, m, "load", &[Value::I32(0)]).unwrap();
    assert_eq!(now, Value::I32(42));
}

#[test]
fn unaligned_atomic_traps() {
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &atomic_module()).unwrap();
    let r = invoke1(&exec, &store, m, "load", &[Value::I32(2)]);
    assert!(matches!(r, Err(Trap::OutOfBounds)));
}

#[test]
fn wait_value_mismatch_and_timeout() {
    let (exec, store) = engine();
    let m = exec.instantiate_module(&store, &atomic_module()).unwrap();
    invoke(&exec, &store, m, "store", &[Value::I32(0), Value::I32(7)]).unwrap();
    // expected 0, cell holds 7: "not-equal".
    let r = invoke1(
        &exec,
        &store,
        m,
        "wait32",
        &[Value::I32(0), Value::I32(0), Value::I64(-1)],
    )
    .unwrap();
    assert_eq!(r, Value::I32(1));
    // matching value, 2ms timeout: "timed-out".
    let r = invoke1(
        &exec,
        &store,
        m,
        "wait32",
        &[Value::I32(0), Value::I32(7), Value::I64(2_000_000)],
    )
    .unwrap();
    assert_eq!(r, Value::I32(2));
}

#[test]
fn wait_wakes_only_on_notify() {
    let exec = Arc::new(Executor::new(Config::default()));
    let store = Arc::new(Store::new());
    let m = exec.instantiate_module(&store, &atomic_module()).unwrap();
    let waiter_fn = export_func(&store, m, "wait32");

    let waiter = {
        let (exec, store) = (exec.clone(), store.clone());
        std::thread::spawn(move || {
            exec.invoke(&store, waiter_fn, &[Value::I32(8), Value::I32(0), Value::I64(-1)])
        })
    };

    // Thread A: store 42 at another address, then notify address 8 once the
    // waiter is parked.
    invoke(&exec, &store, m, "store", &[Value::I32(0), Value::I32(42)]).unwrap();
    loop {
        let woken = invoke1(&exec, &store, m, "notify", &[Value::I32(8), Value::I32(1)]).unwrap();
        if woken == Value::I32(1) {
            break;
        }
        std::thread::yield_now();
    }

    let result = waiter.join().unwrap().unwrap();
    assert_eq!(result[0].0, Value::I32(0)); // woken, not timed out
}

#[test]
fn notify_wakes_at_most_count() {
    let exec = Arc::new(Executor::new(Config::default()));
    let store = Arc::new(Store::new());
    let m = exec.instantiate_module(&store, &atomic_module()).unwrap();
    let wait_fn = export_func(&store, m, "wait32");

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let (exec, store) = (exec.clone(), store.clone());
        waiters.push(std::thread::spawn(move || {
            exec.invoke(&store, wait_fn, &[Value::I32(16), Value::I32(0), Value::I64(-1)])
        }));
    }
    // Wait until all three are parked, then wake exactly two.
    let mut woken_total = 0;
    while woken_total < 2 {
        let woken =
            invoke1(&exec, &store, m, "notify", &[Value::I32(16), Value::I32(2 - woken_total)])
                .unwrap();
        if let Value::I32(n) = woken {
            woken_total += n;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(woken_total, 2);
    // Exactly one waiter still parked; wake it so the test can join.
    std::thread::sleep(Duration::from_millis(20));
    let woken = invoke1(&exec, &store, m, "notify", &[Value::I32(16), Value::I32(99)]).unwrap();
    assert_eq!(woken, Value::I32(1));
    for w in waiters {
        assert_eq!(w.join().unwrap().unwrap()[0].0, Value::I32(0));
    }
}

#[test]
fn stop_interrupts_wait_and_loops() {
    let exec = Arc::new(Executor::new(Config::default()));
    let store = Arc::new(Store::new());
    let m = exec.instantiate_module(&store, &atomic_module()).unwrap();
    let wait_fn = export_func(&store, m, "wait32");

    // Infinite wait in one thread.
    let waiting = {
        let (exec, store) = (exec.clone(), store.clone());
        std::thread::spawn(move || {
            exec.invoke(&store, wait_fn, &[Value::I32(24), Value::I32(0), Value::I64(-1)])
        })
    };

    // Infinite interpreter loop in another.
    let mut b = ModuleBuilder::new();
    let ty = b.func_type(vec![], vec![]);
    use reef_wasm::ast::instr::BlockType;
    let f = b.func(ty, vec![], vec![I::Loop(BlockType::Empty), I::Br(0), I::End]);
    b.export_func("spin", f);
    let m2 = exec.instantiate_module(&store, &b.build()).unwrap();
    let spin_fn = export_func(&store, m2, "spin");
    let spinning = {
        let (exec, store) = (exec.clone(), store.clone());
        std::thread::spawn(move || exec.invoke(&store, spin_fn, &[]))
    };

    std::thread::sleep(Duration::from_millis(30));
    exec.stop();

    assert!(matches!(waiting.join().unwrap(), Err(Trap::Interrupted)));
    assert!(matches!(spinning.join().unwrap(), Err(Trap::Interrupted)));

    // Invocations after the stop run normally.
    invoke(&exec, &store, m, "store", &[Value::I32(0), Value::I32(1)]).unwrap();
}
