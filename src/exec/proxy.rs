//! Compiled-code bridge. AOT-compiled functions cannot embed checks that
//! need the store, so they call back through a fixed table of intrinsics.
//! A per-thread record carries the executor/store/stack trio plus the raw
//! execution context; `SavedThreadLocal` saves and restores it around every
//! reentrant call so nested Wasm-to-Wasm transitions stay safe.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU64};
use std::sync::Arc;

use crate::ast::types::ValType;
use crate::error::Trap;
use crate::runtime::func::FuncKind;
use crate::runtime::{
    FuncAddr, FunctionInstance, GcAddr, GlobalInstance, ModuleInstance, Ref, Store, Value,
};
use crate::vm::gc_ops;
use crate::vm::stack::StackManager;

use super::Executor;

/// Raw 128-bit value slot crossing the compiled-code ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVal {
    pub lo: u64,
    pub hi: u64,
}

// Reference encoding in a RawVal: `hi` carries the tag, `lo` the payload.
const REF_NULL: u64 = 0;
const REF_FUNC: u64 = 1;
const REF_STRUCT: u64 = 2;
const REF_ARRAY: u64 = 3;
const REF_I31: u64 = 4;

impl RawVal {
    pub const ZERO: RawVal = RawVal { lo: 0, hi: 0 };

    pub fn from_value(v: &Value) -> RawVal {
        match v {
            Value::I32(x) => RawVal { lo: *x as u32 as u64, hi: 0 },
            Value::I64(x) => RawVal { lo: *x as u64, hi: 0 },
            Value::F32(b) => RawVal { lo: *b as u64, hi: 0 },
            Value::F64(b) => RawVal { lo: *b, hi: 0 },
            Value::V128(x) => RawVal { lo: *x as u64, hi: (*x >> 64) as u64 },
            Value::Ref(r) => RawVal::from_ref(r),
        }
    }

    pub fn from_ref(r: &Ref) -> RawVal {
        match r {
            Ref::Null(_) => RawVal { lo: 0, hi: REF_NULL },
            Ref::Func(a) => RawVal { lo: a.index() as u64, hi: REF_FUNC },
            Ref::Struct(a) => RawVal { lo: a.index() as u64, hi: REF_STRUCT },
            Ref::Array(a) => RawVal { lo: a.index() as u64, hi: REF_ARRAY },
            Ref::I31(x) => RawVal { lo: *x as u64, hi: REF_I31 },
            // Extern and exception references do not cross the raw ABI.
            Ref::Extern(_) | Ref::Exn(_) => RawVal { lo: 0, hi: REF_NULL },
        }
    }

    pub fn to_ref(self) -> Ref {
        match self.hi {
            REF_FUNC => Ref::Func(FuncAddr(self.lo as usize)),
            REF_STRUCT => Ref::Struct(GcAddr(self.lo as usize)),
            REF_ARRAY => Ref::Array(GcAddr(self.lo as usize)),
            REF_I31 => Ref::I31(self.lo as u32),
            _ => Ref::Null(crate::ast::types::HeapType::None),
        }
    }

    /// Decode by declared type; the unused high bits of narrower scalars are
    /// cleared here, before typed observation.
    pub fn to_value(self, ty: &ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(self.lo as u32 as i32),
            ValType::I64 => Value::I64(self.lo as i64),
            ValType::F32 => Value::F32(self.lo as u32),
            ValType::F64 => Value::F64(self.lo),
            ValType::V128 => Value::V128((self.lo as u128) | ((self.hi as u128) << 64)),
            ValType::Ref(_) => Value::Ref(self.to_ref()),
        }
    }
}

/// Per-memory base entry. `direct` is valid only under the stable-allocator
/// promise; otherwise compiled code must re-read through `indirect`, which
/// `memory.grow` rewrites.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemBase {
    pub direct: *mut u8,
    pub indirect: *const AtomicPtr<u8>,
}

/// Execution context published to compiled code.
#[repr(C)]
#[derive(Debug)]
pub struct ExecutionContext {
    pub memories: *const MemBase,
    pub memory_count: usize,
    /// Opaque global handles; compiled code goes through the global
    /// intrinsics.
    pub globals: *const *const GlobalInstance,
    pub global_count: usize,
    pub instr_count: *const AtomicU64,
    pub cost_table: *const u64,
    pub gas: *const AtomicU64,
    pub gas_limit: u64,
    pub stop_token: *const AtomicU64,
    pub stop_epoch_entry: u64,
}

/// Backing storage keeping the context's pointers alive for the duration of
/// a compiled call.
pub(crate) struct ContextStorage {
    mem_bases: Vec<MemBase>,
    global_ptrs: Vec<*const GlobalInstance>,
    _mems: Vec<Arc<crate::runtime::MemoryInstance>>,
    _globals: Vec<Arc<GlobalInstance>>,
}

impl ContextStorage {
    pub(crate) fn build(exec: &Executor, store: &Store, module: &ModuleInstance) -> Self {
        let mut mems = Vec::with_capacity(module.memories.len());
        let mut mem_bases = Vec::with_capacity(module.memories.len());
        for addr in &module.memories {
            if let Some(mem) = store.memory(*addr) {
                mem.refresh_base();
                let base = MemBase {
                    direct: if exec.config().stable_allocator {
                        mem.base_ptr()
                    } else {
                        std::ptr::null_mut()
                    },
                    indirect: mem.base_slot(),
                };
                mem_bases.push(base);
                mems.push(mem);
            }
        }
        let mut globals = Vec::with_capacity(module.globals.len());
        let mut global_ptrs = Vec::with_capacity(module.globals.len());
        for addr in &module.globals {
            if let Some(g) = store.global(*addr) {
                global_ptrs.push(Arc::as_ptr(&g));
                globals.push(g);
            }
        }
        Self { mem_bases, global_ptrs, _mems: mems, _globals: globals }
    }

    pub(crate) fn context(&self, exec: &Executor, entry_epoch: u64) -> ExecutionContext {
        let (instr_count, gas, gas_limit, cost_table) = match exec.stats() {
            Some(stats) => {
                let (ic, gas, limit) = stats.counters();
                (
                    ic as *const AtomicU64,
                    gas as *const AtomicU64,
                    limit,
                    stats.cost_table().as_ptr(),
                )
            }
            None => (std::ptr::null(), std::ptr::null(), u64::MAX, std::ptr::null()),
        };
        ExecutionContext {
            memories: self.mem_bases.as_ptr(),
            memory_count: self.mem_bases.len(),
            globals: self.global_ptrs.as_ptr(),
            global_count: self.global_ptrs.len(),
            instr_count,
            cost_table,
            gas,
            gas_limit,
            stop_token: exec.stop_token().raw(),
            stop_epoch_entry: entry_epoch,
        }
    }
}

/// Native entry point of an AOT-compiled function. Returns 0 on success or a
/// trap code; rich traps are parked in the thread-local pending slot by the
/// intrinsic that raised them.
pub type CompiledEntry =
    unsafe extern "C" fn(ctx: *mut ExecutionContext, args: *const RawVal, rets: *mut RawVal) -> i32;

#[derive(Clone, Copy)]
struct CurrentExec {
    exec: *const Executor,
    store: *const Store,
    stack: *mut StackManager,
    module: *const ModuleInstance,
    epoch: u64,
}

impl CurrentExec {
    const NONE: CurrentExec = CurrentExec {
        exec: std::ptr::null(),
        store: std::ptr::null(),
        stack: std::ptr::null_mut(),
        module: std::ptr::null(),
        epoch: 0,
    };
}

thread_local! {
    static CURRENT: Cell<CurrentExec> = const { Cell::new(CurrentExec::NONE) };
    static PENDING_TRAP: Cell<Option<u32>> = const { Cell::new(None) };
    static PENDING_HOST: std::cell::RefCell<Option<Trap>> = const { std::cell::RefCell::new(None) };
}

fn set_pending(trap: Trap) -> i32 {
    let code = trap.code();
    PENDING_TRAP.with(|c| c.set(Some(code)));
    if matches!(trap, Trap::Host(_)) {
        PENDING_HOST.with(|c| *c.borrow_mut() = Some(trap));
    }
    code as i32
}

pub(crate) fn take_pending() -> Option<Trap> {
    if let Some(host) = PENDING_HOST.with(|c| c.borrow_mut().take()) {
        PENDING_TRAP.with(|c| c.set(None));
        return Some(host);
    }
    PENDING_TRAP.with(|c| c.take()).map(Trap::from_code)
}

/// Scoped save/restore of the per-thread execution record. Constructed
/// around every entry into compiled code, including reentrant ones.
pub(crate) struct SavedThreadLocal {
    prev: CurrentExec,
}

impl SavedThreadLocal {
    pub(crate) fn enter(
        exec: &Executor,
        store: &Store,
        stack: &mut StackManager,
        module: &Arc<ModuleInstance>,
        epoch: u64,
    ) -> Self {
        let next = CurrentExec {
            exec: exec as *const Executor,
            store: store as *const Store,
            stack: stack as *mut StackManager,
            module: Arc::as_ptr(module),
            epoch,
        };
        let prev = CURRENT.with(|c| c.replace(next));
        SavedThreadLocal { prev }
    }
}

impl Drop for SavedThreadLocal {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

/// Fetch the per-thread record; fails with a fatal code when compiled code
/// called an intrinsic outside any invocation.
macro_rules! with_current {
    (|$exec:ident, $store:ident, $sm:ident, $module:ident, $epoch:ident| $body:expr) => {{
        let cur = CURRENT.with(|c| c.get());
        if cur.exec.is_null() {
            set_pending(Trap::UnreachableExecuted)
        } else {
            // Valid for the duration of the enclosing compiled call: the
            // SavedThreadLocal guard outlives every intrinsic invocation.
            let $exec = unsafe { &*cur.exec };
            let $store = unsafe { &*cur.store };
            let $sm = unsafe { &mut *cur.stack };
            let $module = unsafe { &*cur.module };
            let $epoch = cur.epoch;
            let _ = (&$exec, &$store, &$sm, &$module, $epoch);
            $body
        }
    }};
}

fn ok_or_pending<T>(r: Result<T, Trap>, out: impl FnOnce(T)) -> i32 {
    match r {
        Ok(v) => {
            out(v);
            0
        }
        Err(t) => set_pending(t),
    }
}

// ===== intrinsic entry points =====

pub extern "C" fn proxy_trap(code: u32) -> i32 {
    set_pending(Trap::from_code(code))
}

pub extern "C" fn proxy_call(func_idx: u32, args: *const RawVal, rets: *mut RawVal) -> i32 {
    with_current!(|exec, store, sm, module, epoch| {
        let Some(addr) = module.func_addr(func_idx) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        call_raw(exec, store, sm, addr, args, rets, epoch)
    })
}

pub extern "C" fn proxy_call_indirect(
    table_idx: u32,
    type_idx: u32,
    func_idx: u32,
    args: *const RawVal,
    rets: *mut RawVal,
) -> i32 {
    with_current!(|exec, store, sm, module, epoch| {
        let entry = match module
            .table_addr(table_idx)
            .and_then(|a| store.table(a))
            .ok_or(Trap::UnreachableExecuted)
            .and_then(|t| t.get(func_idx))
        {
            Ok(e) => e,
            Err(t) => return set_pending(t),
        };
        let addr = match entry {
            Ref::Null(_) => return set_pending(Trap::UninitializedElement),
            Ref::Func(addr) => addr,
            _ => return set_pending(Trap::IndirectCallTypeMismatch),
        };
        let Some(func) = store.func(addr) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        match module.func_type(type_idx) {
            Some(expected) if expected == func.ty() => {}
            _ => return set_pending(Trap::IndirectCallTypeMismatch),
        }
        call_raw(exec, store, sm, addr, args, rets, epoch)
    })
}

pub extern "C" fn proxy_call_ref(r: RawVal, args: *const RawVal, rets: *mut RawVal) -> i32 {
    with_current!(|exec, store, sm, _module, epoch| {
        match r.to_ref() {
            Ref::Null(_) => set_pending(Trap::NullReference),
            Ref::Func(addr) => call_raw(exec, store, sm, addr, args, rets, epoch),
            _ => set_pending(Trap::UnreachableExecuted),
        }
    })
}

fn call_raw(
    exec: &Executor,
    store: &Store,
    sm: &mut StackManager,
    addr: FuncAddr,
    args: *const RawVal,
    rets: *mut RawVal,
    epoch: u64,
) -> i32 {
    let Some(func) = store.func(addr) else {
        return set_pending(Trap::UnreachableExecuted);
    };
    let ty = func.ty().clone();
    for (i, pty) in ty.params.iter().enumerate() {
        let raw = unsafe { *args.add(i) };
        sm.push(raw.to_value(pty));
    }
    if let Err(t) = exec.run_function(store, sm, addr, epoch) {
        return set_pending(t);
    }
    let results = match sm.pop_n(ty.results.len()) {
        Ok(r) => r,
        Err(t) => return set_pending(t),
    };
    for (i, v) in results.iter().enumerate() {
        unsafe { *rets.add(i) = RawVal::from_value(v) };
    }
    0
}

pub extern "C" fn proxy_ref_func(func_idx: u32, out: *mut RawVal) -> i32 {
    with_current!(|_exec, _store, _sm, module, _epoch| {
        match module.func_addr(func_idx) {
            Some(addr) => {
                unsafe { *out = RawVal::from_ref(&Ref::Func(addr)) };
                0
            }
            None => set_pending(Trap::UnreachableExecuted),
        }
    })
}

pub extern "C" fn proxy_struct_new(
    type_idx: u32,
    args: *const RawVal,
    arg_count: u32,
    out: *mut RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let field_types: Vec<ValType> = match module.composite_type(type_idx) {
            Some(crate::ast::types::CompositeType::Struct(st)) => {
                st.fields.iter().map(|f| f.storage.unpacked()).collect()
            }
            _ => return set_pending(Trap::UnreachableExecuted),
        };
        if field_types.len() != arg_count as usize {
            return set_pending(Trap::UnreachableExecuted);
        }
        let vals: Vec<Value> = field_types
            .iter()
            .enumerate()
            .map(|(i, ty)| unsafe { *args.add(i) }.to_value(ty))
            .collect();
        ok_or_pending(gc_ops::struct_new(store, module, type_idx, vals), |r| unsafe {
            *out = RawVal::from_ref(&r)
        })
    })
}

pub extern "C" fn proxy_struct_get(
    r: RawVal,
    type_idx: u32,
    field: u32,
    signed: bool,
    out: *mut RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let sign = if signed { Some(crate::ast::instr::Sign::S) } else { None };
        ok_or_pending(
            gc_ops::struct_get(store, module, &r.to_ref(), type_idx, field, sign),
            |v| unsafe { *out = RawVal::from_value(&v) },
        )
    })
}

pub extern "C" fn proxy_struct_set(r: RawVal, type_idx: u32, field: u32, val: RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let storage_ty = match module.composite_type(type_idx) {
            Some(crate::ast::types::CompositeType::Struct(st)) => {
                match st.fields.get(field as usize) {
                    Some(f) => f.storage.unpacked(),
                    None => return set_pending(Trap::OutOfBounds),
                }
            }
            _ => return set_pending(Trap::UnreachableExecuted),
        };
        ok_or_pending(
            gc_ops::struct_set(store, module, &r.to_ref(), type_idx, field, val.to_value(&storage_ty)),
            |_| {},
        )
    })
}

pub extern "C" fn proxy_array_new(
    type_idx: u32,
    length: u32,
    args: *const RawVal,
    arg_count: u32,
    out: *mut RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let elem_ty = match module.composite_type(type_idx) {
            Some(crate::ast::types::CompositeType::Array(at)) => at.field.storage.unpacked(),
            _ => return set_pending(Trap::UnreachableExecuted),
        };
        let result = if arg_count == 0 {
            gc_ops::array_new(
                store,
                module,
                type_idx,
                length,
                Value::default_for(elem_ty),
            )
        } else if arg_count == 1 {
            let fill = unsafe { *args }.to_value(&elem_ty);
            gc_ops::array_new(store, module, type_idx, length, fill)
        } else {
            let vals: Vec<Value> = (0..arg_count as usize)
                .map(|i| unsafe { *args.add(i) }.to_value(&elem_ty))
                .collect();
            gc_ops::array_new_fixed(store, module, type_idx, vals)
        };
        ok_or_pending(result, |r| unsafe { *out = RawVal::from_ref(&r) })
    })
}

pub extern "C" fn proxy_array_new_data(
    type_idx: u32,
    data_idx: u32,
    start: u32,
    length: u32,
    out: *mut RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(data) = module.data_addr(data_idx).and_then(|a| store.data(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let bytes = data.bytes();
        ok_or_pending(
            gc_ops::array_new_data(store, module, type_idx, &bytes, start, length),
            |r| unsafe { *out = RawVal::from_ref(&r) },
        )
    })
}

pub extern "C" fn proxy_array_new_elem(
    type_idx: u32,
    elem_idx: u32,
    start: u32,
    length: u32,
    out: *mut RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(elem) = module.elem_addr(elem_idx).and_then(|a| store.elem(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let items = elem.items();
        ok_or_pending(
            gc_ops::array_new_elem(store, module, type_idx, &items, start, length),
            |r| unsafe { *out = RawVal::from_ref(&r) },
        )
    })
}

pub extern "C" fn proxy_array_get(
    r: RawVal,
    type_idx: u32,
    idx: u32,
    signed: bool,
    out: *mut RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let sign = if signed { Some(crate::ast::instr::Sign::S) } else { None };
        ok_or_pending(
            gc_ops::array_get(store, module, &r.to_ref(), type_idx, idx, sign),
            |v| unsafe { *out = RawVal::from_value(&v) },
        )
    })
}

pub extern "C" fn proxy_array_set(r: RawVal, type_idx: u32, idx: u32, val: RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let elem_ty = match module.composite_type(type_idx) {
            Some(crate::ast::types::CompositeType::Array(at)) => at.field.storage.unpacked(),
            _ => return set_pending(Trap::UnreachableExecuted),
        };
        ok_or_pending(
            gc_ops::array_set(store, module, &r.to_ref(), type_idx, idx, val.to_value(&elem_ty)),
            |_| {},
        )
    })
}

pub extern "C" fn proxy_array_len(r: RawVal, out: *mut u32) -> i32 {
    with_current!(|_exec, store, _sm, _module, _epoch| {
        ok_or_pending(gc_ops::array_len(store, &r.to_ref()), |n| unsafe { *out = n })
    })
}

pub extern "C" fn proxy_array_fill(
    r: RawVal,
    type_idx: u32,
    idx: u32,
    count: u32,
    val: RawVal,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let elem_ty = match module.composite_type(type_idx) {
            Some(crate::ast::types::CompositeType::Array(at)) => at.field.storage.unpacked(),
            _ => return set_pending(Trap::UnreachableExecuted),
        };
        ok_or_pending(
            gc_ops::array_fill(store, module, &r.to_ref(), type_idx, idx, val.to_value(&elem_ty), count),
            |_| {},
        )
    })
}

#[allow(clippy::too_many_arguments)]
pub extern "C" fn proxy_array_copy(
    dst: RawVal,
    dst_type: u32,
    dst_idx: u32,
    src: RawVal,
    src_type: u32,
    src_idx: u32,
    count: u32,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        ok_or_pending(
            gc_ops::array_copy(
                store,
                module,
                &dst.to_ref(),
                dst_type,
                dst_idx,
                &src.to_ref(),
                src_type,
                src_idx,
                count,
            ),
            |_| {},
        )
    })
}

pub extern "C" fn proxy_array_init_data(
    r: RawVal,
    type_idx: u32,
    data_idx: u32,
    dst_idx: u32,
    src_idx: u32,
    count: u32,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(data) = module.data_addr(data_idx).and_then(|a| store.data(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let bytes = data.bytes();
        ok_or_pending(
            gc_ops::array_init_data(
                store,
                module,
                &r.to_ref(),
                type_idx,
                &bytes,
                dst_idx,
                src_idx,
                count,
            ),
            |_| {},
        )
    })
}

pub extern "C" fn proxy_array_init_elem(
    r: RawVal,
    _type_idx: u32,
    elem_idx: u32,
    dst_idx: u32,
    src_idx: u32,
    count: u32,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(elem) = module.elem_addr(elem_idx).and_then(|a| store.elem(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let items = elem.items();
        ok_or_pending(
            gc_ops::array_init_elem(store, &r.to_ref(), &items, dst_idx, src_idx, count),
            |_| {},
        )
    })
}

pub extern "C" fn proxy_ref_test(r: RawVal, nullable: bool, heap_code: i64, out: *mut u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let expected = decode_ref_type(nullable, heap_code);
        let matched = gc_ops::ref_matches(store, module, &r.to_ref(), &expected);
        unsafe { *out = matched as u32 };
        0
    })
}

pub extern "C" fn proxy_ref_cast(r: RawVal, nullable: bool, heap_code: i64, out: *mut RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let expected = decode_ref_type(nullable, heap_code);
        let referent = r.to_ref();
        if gc_ops::ref_matches(store, module, &referent, &expected) {
            unsafe { *out = r };
            0
        } else {
            set_pending(Trap::CastFailure)
        }
    })
}

/// Heap-type wire encoding shared with the code generator: non-negative
/// values are defined type indices, negative values abstract heap types.
fn decode_ref_type(nullable: bool, heap_code: i64) -> crate::ast::types::RefType {
    use crate::ast::types::HeapType;
    let heap = if heap_code >= 0 {
        HeapType::Defined(heap_code as u32)
    } else {
        match heap_code {
            -1 => HeapType::Func,
            -2 => HeapType::Extern,
            -3 => HeapType::Any,
            -4 => HeapType::Eq,
            -5 => HeapType::I31,
            -6 => HeapType::Struct,
            -7 => HeapType::Array,
            -8 => HeapType::Exn,
            -9 => HeapType::None,
            -10 => HeapType::NoFunc,
            -11 => HeapType::NoExtern,
            _ => HeapType::NoExn,
        }
    };
    crate::ast::types::RefType { nullable, heap }
}

pub extern "C" fn proxy_table_get(table_idx: u32, off: u32, out: *mut RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        ok_or_pending(table.get(off), |r| unsafe { *out = RawVal::from_ref(&r) })
    })
}

pub extern "C" fn proxy_table_set(table_idx: u32, off: u32, r: RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        ok_or_pending(table.set(off, r.to_ref()), |_| {})
    })
}

pub extern "C" fn proxy_table_init(
    table_idx: u32,
    elem_idx: u32,
    dst: u32,
    src: u32,
    len: u32,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let Some(elem) = module.elem_addr(elem_idx).and_then(|a| store.elem(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let items = elem.items();
        ok_or_pending(table.init_from(dst, &items, src, len), |_| {})
    })
}

pub extern "C" fn proxy_elem_drop(elem_idx: u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(elem) = module.elem_addr(elem_idx).and_then(|a| store.elem(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        elem.drop_payload();
        0
    })
}

pub extern "C" fn proxy_table_copy(
    dst_table: u32,
    src_table: u32,
    dst: u32,
    src: u32,
    len: u32,
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let (Some(d), Some(s)) = (
            module.table_addr(dst_table).and_then(|a| store.table(a)),
            module.table_addr(src_table).and_then(|a| store.table(a)),
        ) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        ok_or_pending(d.copy_from(dst, &s, src, len), |_| {})
    })
}

pub extern "C" fn proxy_table_grow(table_idx: u32, init: RawVal, delta: u32, out: *mut u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let result = match table.grow(delta, init.to_ref()) {
            Some(prev) => prev,
            None => u32::MAX,
        };
        unsafe { *out = result };
        0
    })
}

pub extern "C" fn proxy_table_size(table_idx: u32, out: *mut u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        unsafe { *out = table.size() };
        0
    })
}

pub extern "C" fn proxy_table_fill(table_idx: u32, off: u32, r: RawVal, len: u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        ok_or_pending(table.fill(off, r.to_ref(), len), |_| {})
    })
}

pub extern "C" fn proxy_mem_grow(mem_idx: u32, delta: u32, out: *mut u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(mem) = module.mem_addr(mem_idx).and_then(|a| store.memory(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let result = match mem.grow(delta) {
            Some(prev) => prev,
            None => u32::MAX,
        };
        unsafe { *out = result };
        0
    })
}

pub extern "C" fn proxy_mem_size(mem_idx: u32, out: *mut u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(mem) = module.mem_addr(mem_idx).and_then(|a| store.memory(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        unsafe { *out = mem.size_pages() };
        0
    })
}

pub extern "C" fn proxy_mem_init(mem_idx: u32, data_idx: u32, dst: u32, src: u32, len: u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(mem) = module.mem_addr(mem_idx).and_then(|a| store.memory(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let Some(data) = module.data_addr(data_idx).and_then(|a| store.data(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let bytes = data.bytes();
        ok_or_pending(mem.init_from(dst as u64, &bytes, src as u64, len as u64), |_| {})
    })
}

pub extern "C" fn proxy_data_drop(data_idx: u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(data) = module.data_addr(data_idx).and_then(|a| store.data(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        data.drop_payload();
        0
    })
}

pub extern "C" fn proxy_mem_copy(dst_mem: u32, src_mem: u32, dst: u32, src: u32, len: u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let (Some(d), Some(s)) = (
            module.mem_addr(dst_mem).and_then(|a| store.memory(a)),
            module.mem_addr(src_mem).and_then(|a| store.memory(a)),
        ) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        ok_or_pending(d.copy_from(dst as u64, &s, src as u64, len as u64), |_| {})
    })
}

pub extern "C" fn proxy_mem_fill(mem_idx: u32, off: u32, val: u8, len: u32) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(mem) = module.mem_addr(mem_idx).and_then(|a| store.memory(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        ok_or_pending(mem.fill(off as u64, val, len as u64), |_| {})
    })
}

pub extern "C" fn proxy_mem_atomic_notify(mem_idx: u32, offset: u32, count: u32, out: *mut u32) -> i32 {
    with_current!(|exec, store, _sm, module, _epoch| {
        let Some(addr) = module.mem_addr(mem_idx) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let Some(mem) = store.memory(addr) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        if let Err(t) = mem.atomic_load(offset as u64, 4) {
            return set_pending(t);
        }
        unsafe { *out = exec.waiters().notify(addr, offset as u64, count) };
        0
    })
}

#[allow(clippy::too_many_arguments)]
pub extern "C" fn proxy_mem_atomic_wait(
    mem_idx: u32,
    offset: u32,
    expected: u64,
    timeout: i64,
    bit_width: u32,
    out: *mut u32,
) -> i32 {
    with_current!(|exec, store, _sm, module, epoch| {
        let Some(addr) = module.mem_addr(mem_idx) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let Some(mem) = store.memory(addr) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let size = (bit_width / 8) as usize;
        ok_or_pending(
            exec.waiters().wait(
                addr,
                &mem,
                offset as u64,
                expected,
                size,
                timeout,
                exec.stop_token(),
                epoch,
            ),
            |r| unsafe { *out = r },
        )
    })
}

pub extern "C" fn proxy_global_get(global_idx: u32, out: *mut RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(g) = module.global_addr(global_idx).and_then(|a| store.global(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        unsafe { *out = RawVal::from_value(&g.get()) };
        0
    })
}

pub extern "C" fn proxy_global_set(global_idx: u32, val: RawVal) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(g) = module.global_addr(global_idx).and_then(|a| store.global(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        g.set(val.to_value(&g.ty().val_type));
        0
    })
}

/// Resolve the native entry of a compiled function stored in a table, for
/// direct calls between AOT functions. Null when the callee is not compiled.
pub extern "C" fn proxy_table_get_func_symbol(
    table_idx: u32,
    type_idx: u32,
    func_idx: u32,
    out: *mut *const (),
) -> i32 {
    with_current!(|_exec, store, _sm, module, _epoch| {
        let Some(table) = module.table_addr(table_idx).and_then(|a| store.table(a)) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        let entry = match table.get(func_idx) {
            Ok(e) => e,
            Err(t) => return set_pending(t),
        };
        let addr = match entry {
            Ref::Null(_) => return set_pending(Trap::UninitializedElement),
            Ref::Func(addr) => addr,
            _ => return set_pending(Trap::IndirectCallTypeMismatch),
        };
        let Some(func) = store.func(addr) else {
            return set_pending(Trap::UnreachableExecuted);
        };
        match module.func_type(type_idx) {
            Some(expected) if expected == func.ty() => {}
            _ => return set_pending(Trap::IndirectCallTypeMismatch),
        }
        unsafe { *out = func_symbol(&func) };
        0
    })
}

pub extern "C" fn proxy_ref_get_func_symbol(r: RawVal, out: *mut *const ()) -> i32 {
    with_current!(|_exec, store, _sm, _module, _epoch| {
        match r.to_ref() {
            Ref::Null(_) => set_pending(Trap::NullReference),
            Ref::Func(addr) => {
                let Some(func) = store.func(addr) else {
                    return set_pending(Trap::UnreachableExecuted);
                };
                unsafe { *out = func_symbol(&func) };
                0
            }
            _ => set_pending(Trap::UnreachableExecuted),
        }
    })
}

fn func_symbol(func: &FunctionInstance) -> *const () {
    match func.kind() {
        FuncKind::Compiled { entry, .. } => *entry as *const (),
        _ => std::ptr::null(),
    }
}

/// The stable intrinsics table referenced by every compiled module. Entry
/// order must never change after publication.
#[repr(C)]
pub struct IntrinsicsTable {
    pub trap: extern "C" fn(u32) -> i32,
    pub call: extern "C" fn(u32, *const RawVal, *mut RawVal) -> i32,
    pub call_indirect: extern "C" fn(u32, u32, u32, *const RawVal, *mut RawVal) -> i32,
    pub call_ref: extern "C" fn(RawVal, *const RawVal, *mut RawVal) -> i32,
    pub ref_func: extern "C" fn(u32, *mut RawVal) -> i32,
    pub struct_new: extern "C" fn(u32, *const RawVal, u32, *mut RawVal) -> i32,
    pub struct_get: extern "C" fn(RawVal, u32, u32, bool, *mut RawVal) -> i32,
    pub struct_set: extern "C" fn(RawVal, u32, u32, RawVal) -> i32,
    pub array_new: extern "C" fn(u32, u32, *const RawVal, u32, *mut RawVal) -> i32,
    pub array_new_data: extern "C" fn(u32, u32, u32, u32, *mut RawVal) -> i32,
    pub array_new_elem: extern "C" fn(u32, u32, u32, u32, *mut RawVal) -> i32,
    pub array_get: extern "C" fn(RawVal, u32, u32, bool, *mut RawVal) -> i32,
    pub array_set: extern "C" fn(RawVal, u32, u32, RawVal) -> i32,
    pub array_len: extern "C" fn(RawVal, *mut u32) -> i32,
    pub array_fill: extern "C" fn(RawVal, u32, u32, u32, RawVal) -> i32,
    pub array_copy: extern "C" fn(RawVal, u32, u32, RawVal, u32, u32, u32) -> i32,
    pub array_init_data: extern "C" fn(RawVal, u32, u32, u32, u32, u32) -> i32,
    pub array_init_elem: extern "C" fn(RawVal, u32, u32, u32, u32, u32) -> i32,
    pub ref_test: extern "C" fn(RawVal, bool, i64, *mut u32) -> i32,
    pub ref_cast: extern "C" fn(RawVal, bool, i64, *mut RawVal) -> i32,
    pub table_get: extern "C" fn(u32, u32, *mut RawVal) -> i32,
    pub table_set: extern "C" fn(u32, u32, RawVal) -> i32,
    pub table_init: extern "C" fn(u32, u32, u32, u32, u32) -> i32,
    pub elem_drop: extern "C" fn(u32) -> i32,
    pub table_copy: extern "C" fn(u32, u32, u32, u32, u32) -> i32,
    pub table_grow: extern "C" fn(u32, RawVal, u32, *mut u32) -> i32,
    pub table_size: extern "C" fn(u32, *mut u32) -> i32,
    pub table_fill: extern "C" fn(u32, u32, RawVal, u32) -> i32,
    pub mem_grow: extern "C" fn(u32, u32, *mut u32) -> i32,
    pub mem_size: extern "C" fn(u32, *mut u32) -> i32,
    pub mem_init: extern "C" fn(u32, u32, u32, u32, u32) -> i32,
    pub data_drop: extern "C" fn(u32) -> i32,
    pub mem_copy: extern "C" fn(u32, u32, u32, u32, u32) -> i32,
    pub mem_fill: extern "C" fn(u32, u32, u8, u32) -> i32,
    pub mem_atomic_notify: extern "C" fn(u32, u32, u32, *mut u32) -> i32,
    pub mem_atomic_wait: extern "C" fn(u32, u32, u64, i64, u32, *mut u32) -> i32,
    pub global_get: extern "C" fn(u32, *mut RawVal) -> i32,
    pub global_set: extern "C" fn(u32, RawVal) -> i32,
    pub table_get_func_symbol: extern "C" fn(u32, u32, u32, *mut *const ()) -> i32,
    pub ref_get_func_symbol: extern "C" fn(RawVal, *mut *const ()) -> i32,
}

/// The one published table.
pub static INTRINSICS: IntrinsicsTable = IntrinsicsTable {
    trap: proxy_trap,
    call: proxy_call,
    call_indirect: proxy_call_indirect,
    call_ref: proxy_call_ref,
    ref_func: proxy_ref_func,
    struct_new: proxy_struct_new,
    struct_get: proxy_struct_get,
    struct_set: proxy_struct_set,
    array_new: proxy_array_new,
    array_new_data: proxy_array_new_data,
    array_new_elem: proxy_array_new_elem,
    array_get: proxy_array_get,
    array_set: proxy_array_set,
    array_len: proxy_array_len,
    array_fill: proxy_array_fill,
    array_copy: proxy_array_copy,
    array_init_data: proxy_array_init_data,
    array_init_elem: proxy_array_init_elem,
    ref_test: proxy_ref_test,
    ref_cast: proxy_ref_cast,
    table_get: proxy_table_get,
    table_set: proxy_table_set,
    table_init: proxy_table_init,
    elem_drop: proxy_elem_drop,
    table_copy: proxy_table_copy,
    table_grow: proxy_table_grow,
    table_size: proxy_table_size,
    table_fill: proxy_table_fill,
    mem_grow: proxy_mem_grow,
    mem_size: proxy_mem_size,
    mem_init: proxy_mem_init,
    data_drop: proxy_data_drop,
    mem_copy: proxy_mem_copy,
    mem_fill: proxy_mem_fill,
    mem_atomic_notify: proxy_mem_atomic_notify,
    mem_atomic_wait: proxy_mem_atomic_wait,
    global_get: proxy_global_get,
    global_set: proxy_global_set,
    table_get_func_symbol: proxy_table_get_func_symbol,
    ref_get_func_symbol: proxy_ref_get_func_symbol,
};

// ===== executor-side call into compiled code =====

impl Executor {
    /// Invoke an AOT-compiled function: marshal parameters into raw slots,
    /// publish the execution context and the per-thread record, call the
    /// native entry, and unmarshal the results.
    pub(crate) fn call_compiled(
        &self,
        store: &Store,
        _addr: FuncAddr,
        func: &FunctionInstance,
        sm: &mut StackManager,
        epoch: u64,
    ) -> Result<(), Trap> {
        let FuncKind::Compiled { module, entry } = func.kind() else {
            return Err(Trap::UnreachableExecuted);
        };
        let module = store.module(*module).ok_or(Trap::UnreachableExecuted)?;
        let ty = func.ty().clone();
        let params = sm.pop_n(ty.params.len())?;
        let args: Vec<RawVal> = params.iter().map(RawVal::from_value).collect();
        let mut rets = vec![RawVal::ZERO; ty.results.len()];

        let storage = ContextStorage::build(self, store, &module);
        let mut ctx = storage.context(self, epoch);
        let code = {
            let _guard = SavedThreadLocal::enter(self, store, sm, &module, epoch);
            unsafe { (*entry)(&mut ctx as *mut ExecutionContext, args.as_ptr(), rets.as_mut_ptr()) }
        };
        if code != 0 {
            return Err(take_pending().unwrap_or_else(|| Trap::from_code(code as u32)));
        }
        let _ = take_pending();
        for (raw, rty) in rets.iter().zip(&ty.results) {
            sm.push(raw.to_value(rty));
        }
        Ok(())
    }
}
