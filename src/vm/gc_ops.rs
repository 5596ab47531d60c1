//! Shared struct/array lifecycle helpers. Both the interpreter and the
//! compiled-code bridge go through these, so null checks, bounds checks,
//! packing, and cross-array type checks live in exactly one place.

use std::sync::Arc;

use crate::ast::instr::Sign;
use crate::ast::types::{ArrayType, CompositeType, HeapType, RefType, StorageType, StructType, TypeIdx, ValType};
use crate::error::Trap;
use crate::runtime::gc::{ArrayObj, GcObject, StructObj};
use crate::runtime::{GcAddr, ModuleInstance, Ref, Store, Value};
use crate::vm::numeric::{pack_val, unpack_val};

fn struct_type<'a>(module: &'a ModuleInstance, type_idx: TypeIdx) -> Result<&'a StructType, Trap> {
    match module.composite_type(type_idx) {
        Some(CompositeType::Struct(st)) => Ok(st),
        _ => Err(Trap::UnreachableExecuted),
    }
}

fn array_type<'a>(module: &'a ModuleInstance, type_idx: TypeIdx) -> Result<&'a ArrayType, Trap> {
    match module.composite_type(type_idx) {
        Some(CompositeType::Array(at)) => Ok(at),
        _ => Err(Trap::UnreachableExecuted),
    }
}

fn struct_obj(store: &Store, r: &Ref) -> Result<Arc<GcObject>, Trap> {
    match r {
        Ref::Null(_) => Err(Trap::NullReference),
        Ref::Struct(addr) => store.gc_object(*addr).ok_or(Trap::UnreachableExecuted),
        _ => Err(Trap::CastFailure),
    }
}

fn array_obj(store: &Store, r: &Ref) -> Result<Arc<GcObject>, Trap> {
    match r {
        Ref::Null(_) => Err(Trap::NullReference),
        Ref::Array(addr) => store.gc_object(*addr).ok_or(Trap::UnreachableExecuted),
        _ => Err(Trap::CastFailure),
    }
}

// ===== struct =====

/// `struct.new`: pack each argument into its field's storage form and
/// allocate. The argument count must match the declared field count.
pub fn struct_new(
    store: &Store,
    module: &ModuleInstance,
    type_idx: TypeIdx,
    args: Vec<Value>,
) -> Result<Ref, Trap> {
    let st = struct_type(module, type_idx)?;
    if args.len() != st.fields.len() {
        return Err(Trap::UnreachableExecuted);
    }
    let fields = st
        .fields
        .iter()
        .zip(args)
        .map(|(f, v)| pack_val(&f.storage, v))
        .collect();
    let addr = store.alloc_gc(GcObject::Struct(StructObj::new(module.addr, type_idx, fields)));
    Ok(Ref::Struct(addr))
}

pub fn struct_new_default(
    store: &Store,
    module: &ModuleInstance,
    type_idx: TypeIdx,
) -> Result<Ref, Trap> {
    let st = struct_type(module, type_idx)?;
    let fields = st
        .fields
        .iter()
        .map(|f| Value::default_for_storage(&f.storage))
        .collect();
    let addr = store.alloc_gc(GcObject::Struct(StructObj::new(module.addr, type_idx, fields)));
    Ok(Ref::Struct(addr))
}

pub fn struct_get(
    store: &Store,
    module: &ModuleInstance,
    r: &Ref,
    type_idx: TypeIdx,
    field: u32,
    sign: Option<Sign>,
) -> Result<Value, Trap> {
    let st = struct_type(module, type_idx)?;
    let storage = st.fields.get(field as usize).map(|f| f.storage).ok_or(Trap::OutOfBounds)?;
    let obj = struct_obj(store, r)?;
    let s = obj.as_struct().ok_or(Trap::CastFailure)?;
    Ok(unpack_val(&storage, s.get(field)?, sign))
}

pub fn struct_set(
    store: &Store,
    module: &ModuleInstance,
    r: &Ref,
    type_idx: TypeIdx,
    field: u32,
    val: Value,
) -> Result<(), Trap> {
    let st = struct_type(module, type_idx)?;
    let storage = st.fields.get(field as usize).map(|f| f.storage).ok_or(Trap::OutOfBounds)?;
    let obj = struct_obj(store, r)?;
    let s = obj.as_struct().ok_or(Trap::CastFailure)?;
    s.set(field, pack_val(&storage, val))
}

// ===== array =====

/// `array.new` / `array.new_default`: `len` copies of one (packed) value.
pub fn array_new(
    store: &Store,
    module: &ModuleInstance,
    type_idx: TypeIdx,
    len: u32,
    fill: Value,
) -> Result<Ref, Trap> {
    let at = array_type(module, type_idx)?;
    let packed = pack_val(&at.field.storage, fill);
    let addr = store.alloc_gc(GcObject::Array(ArrayObj::new(
        module.addr,
        type_idx,
        vec![packed; len as usize],
    )));
    Ok(Ref::Array(addr))
}

/// `array.new_fixed`: explicit element values.
pub fn array_new_fixed(
    store: &Store,
    module: &ModuleInstance,
    type_idx: TypeIdx,
    vals: Vec<Value>,
) -> Result<Ref, Trap> {
    let at = array_type(module, type_idx)?;
    let elems = vals.into_iter().map(|v| pack_val(&at.field.storage, v)).collect();
    let addr = store.alloc_gc(GcObject::Array(ArrayObj::new(module.addr, type_idx, elems)));
    Ok(Ref::Array(addr))
}

/// Element byte width of a numeric storage type.
fn storage_byte_size(st: &StorageType) -> Result<usize, Trap> {
    Ok(match st {
        StorageType::I8 => 1,
        StorageType::I16 => 2,
        StorageType::Val(ValType::I32) | StorageType::Val(ValType::F32) => 4,
        StorageType::Val(ValType::I64) | StorageType::Val(ValType::F64) => 8,
        StorageType::Val(ValType::V128) => 16,
        StorageType::Val(ValType::Ref(_)) => return Err(Trap::UnreachableExecuted),
    })
}

/// Decode one element from data-segment bytes.
fn decode_elem(st: &StorageType, bytes: &[u8]) -> Value {
    match st {
        StorageType::I8 => Value::I32(bytes[0] as i32),
        StorageType::I16 => Value::I32(u16::from_le_bytes([bytes[0], bytes[1]]) as i32),
        StorageType::Val(ValType::I32) => {
            Value::I32(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        StorageType::Val(ValType::F32) => {
            Value::F32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        StorageType::Val(ValType::I64) => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            Value::I64(i64::from_le_bytes(b))
        }
        StorageType::Val(ValType::F64) => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            Value::F64(u64::from_le_bytes(b))
        }
        StorageType::Val(ValType::V128) => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&bytes[..16]);
            Value::V128(u128::from_le_bytes(b))
        }
        StorageType::Val(ValType::Ref(_)) => Value::I32(0),
    }
}

/// `array.new_data`: copy `len` elements out of a data segment starting at
/// byte offset `start`.
pub fn array_new_data(
    store: &Store,
    module: &ModuleInstance,
    type_idx: TypeIdx,
    data: &[u8],
    start: u32,
    len: u32,
) -> Result<Ref, Trap> {
    let at = array_type(module, type_idx)?;
    let size = storage_byte_size(&at.field.storage)?;
    let total = (len as usize).checked_mul(size).ok_or(Trap::OutOfBounds)?;
    let s = start as usize;
    let end = s.checked_add(total).ok_or(Trap::OutOfBounds)?;
    if end > data.len() {
        return Err(Trap::OutOfBounds);
    }
    let elems = (0..len as usize)
        .map(|i| decode_elem(&at.field.storage, &data[s + i * size..s + (i + 1) * size]))
        .collect();
    let addr = store.alloc_gc(GcObject::Array(ArrayObj::new(module.addr, type_idx, elems)));
    Ok(Ref::Array(addr))
}

/// `array.new_elem`: copy `len` references out of an element segment.
pub fn array_new_elem(
    store: &Store,
    module: &ModuleInstance,
    type_idx: TypeIdx,
    items: &[Ref],
    start: u32,
    len: u32,
) -> Result<Ref, Trap> {
    let s = start as usize;
    let end = s.checked_add(len as usize).ok_or(Trap::OutOfBounds)?;
    if end > items.len() {
        return Err(Trap::OutOfBounds);
    }
    let elems = items[s..end].iter().map(|r| Value::Ref(r.clone())).collect();
    let addr = store.alloc_gc(GcObject::Array(ArrayObj::new(module.addr, type_idx, elems)));
    Ok(Ref::Array(addr))
}

pub fn array_get(
    store: &Store,
    module: &ModuleInstance,
    r: &Ref,
    type_idx: TypeIdx,
    idx: u32,
    sign: Option<Sign>,
) -> Result<Value, Trap> {
    let at = array_type(module, type_idx)?;
    let obj = array_obj(store, r)?;
    let a = obj.as_array().ok_or(Trap::CastFailure)?;
    Ok(unpack_val(&at.field.storage, a.get(idx)?, sign))
}

pub fn array_set(
    store: &Store,
    module: &ModuleInstance,
    r: &Ref,
    type_idx: TypeIdx,
    idx: u32,
    val: Value,
) -> Result<(), Trap> {
    let at = array_type(module, type_idx)?;
    let obj = array_obj(store, r)?;
    let a = obj.as_array().ok_or(Trap::CastFailure)?;
    a.set(idx, pack_val(&at.field.storage, val))
}

pub fn array_len(store: &Store, r: &Ref) -> Result<u32, Trap> {
    let obj = array_obj(store, r)?;
    let a = obj.as_array().ok_or(Trap::CastFailure)?;
    Ok(a.len())
}

pub fn array_fill(
    store: &Store,
    module: &ModuleInstance,
    r: &Ref,
    type_idx: TypeIdx,
    dst: u32,
    val: Value,
    len: u32,
) -> Result<(), Trap> {
    let at = array_type(module, type_idx)?;
    let obj = array_obj(store, r)?;
    let a = obj.as_array().ok_or(Trap::CastFailure)?;
    a.fill(dst, pack_val(&at.field.storage, val), len)
}

/// `array.copy`. For reference elements the source element type must match
/// the destination hierarchy; incompatible copies trap with `CastFailure`.
#[allow(clippy::too_many_arguments)]
pub fn array_copy(
    store: &Store,
    module: &ModuleInstance,
    dst_ref: &Ref,
    dst_type: TypeIdx,
    dst: u32,
    src_ref: &Ref,
    src_type: TypeIdx,
    src: u32,
    len: u32,
) -> Result<(), Trap> {
    let dst_at = array_type(module, dst_type)?;
    let src_at = array_type(module, src_type)?;
    match (&src_at.field.storage, &dst_at.field.storage) {
        (StorageType::Val(ValType::Ref(s)), StorageType::Val(ValType::Ref(d))) => {
            if !heap_subtype(module, s.heap, d.heap) {
                return Err(Trap::CastFailure);
            }
        }
        (s, d) if s == d => {}
        _ => return Err(Trap::CastFailure),
    }
    let dst_obj = array_obj(store, dst_ref)?;
    let src_obj = array_obj(store, src_ref)?;
    let d = dst_obj.as_array().ok_or(Trap::CastFailure)?;
    let s = src_obj.as_array().ok_or(Trap::CastFailure)?;
    if dst_obj.type_idx() == src_obj.type_idx() && dst_ref.ref_eq(src_ref) {
        return d.copy_within(dst, src, len);
    }
    let vals = s.read_slice(src, len)?;
    d.write_slice(dst, &vals)
}

/// `array.init_data`.
pub fn array_init_data(
    store: &Store,
    module: &ModuleInstance,
    r: &Ref,
    type_idx: TypeIdx,
    data: &[u8],
    dst: u32,
    src: u32,
    len: u32,
) -> Result<(), Trap> {
    let at = array_type(module, type_idx)?;
    let size = storage_byte_size(&at.field.storage)?;
    let total = (len as usize).checked_mul(size).ok_or(Trap::OutOfBounds)?;
    let s = src as usize;
    let end = s.checked_add(total).ok_or(Trap::OutOfBounds)?;
    if end > data.len() {
        return Err(Trap::OutOfBounds);
    }
    let obj = array_obj(store, r)?;
    let a = obj.as_array().ok_or(Trap::CastFailure)?;
    let vals: Vec<Value> = (0..len as usize)
        .map(|i| decode_elem(&at.field.storage, &data[s + i * size..s + (i + 1) * size]))
        .collect();
    a.write_slice(dst, &vals)
}

/// `array.init_elem`.
pub fn array_init_elem(
    store: &Store,
    r: &Ref,
    items: &[Ref],
    dst: u32,
    src: u32,
    len: u32,
) -> Result<(), Trap> {
    let s = src as usize;
    let end = s.checked_add(len as usize).ok_or(Trap::OutOfBounds)?;
    if end > items.len() {
        return Err(Trap::OutOfBounds);
    }
    let obj = array_obj(store, r)?;
    let a = obj.as_array().ok_or(Trap::CastFailure)?;
    let vals: Vec<Value> = items[s..end].iter().map(|x| Value::Ref(x.clone())).collect();
    a.write_slice(dst, &vals)
}

// ===== dynamic typing =====

/// Heap subtype relation over declared types, without consulting object
/// headers. Defined-to-defined checks walk the declared supertype chain.
fn heap_subtype(module: &ModuleInstance, sub: HeapType, sup: HeapType) -> bool {
    if sub == sup {
        return true;
    }
    match (sub, sup) {
        (HeapType::Defined(a), HeapType::Defined(b)) => {
            let mut idx = a;
            loop {
                if idx == b {
                    return true;
                }
                match module.sub_type(idx).and_then(|st| st.supers.first().copied()) {
                    Some(s) => idx = s,
                    None => return false,
                }
            }
        }
        (HeapType::Defined(idx), _) => match module.composite_type(idx) {
            Some(CompositeType::Struct(_)) => {
                matches!(sup, HeapType::Any | HeapType::Eq | HeapType::Struct)
            }
            Some(CompositeType::Array(_)) => {
                matches!(sup, HeapType::Any | HeapType::Eq | HeapType::Array)
            }
            Some(CompositeType::Func(_)) => matches!(sup, HeapType::Func),
            None => false,
        },
        (HeapType::None, HeapType::Defined(idx)) => {
            !matches!(module.composite_type(idx), Some(CompositeType::Func(_)))
        }
        (HeapType::NoFunc, HeapType::Defined(idx)) => {
            matches!(module.composite_type(idx), Some(CompositeType::Func(_)))
        }
        (
            HeapType::None,
            HeapType::Any | HeapType::Eq | HeapType::I31 | HeapType::Struct | HeapType::Array,
        ) => true,
        (HeapType::NoFunc, HeapType::Func) => true,
        (HeapType::NoExtern, HeapType::Extern) => true,
        (HeapType::NoExn, HeapType::Exn) => true,
        (HeapType::I31 | HeapType::Struct | HeapType::Array, HeapType::Any | HeapType::Eq) => true,
        (HeapType::Eq, HeapType::Any) => true,
        _ => false,
    }
}

/// Does the defined type of a GC object match `expected_idx` as declared in
/// `module`? Same-module checks walk the declared supertype chain; a
/// cross-module reference falls back to structural equality of the composite
/// types.
fn gc_defined_matches(
    store: &Store,
    gc_addr: GcAddr,
    expected_idx: TypeIdx,
    module: &ModuleInstance,
) -> bool {
    let Some(obj) = store.gc_object(gc_addr) else {
        return false;
    };
    if obj.module() == module.addr {
        let mut idx = obj.type_idx();
        loop {
            if idx == expected_idx {
                return true;
            }
            match module.sub_type(idx).and_then(|st| st.supers.first().copied()) {
                Some(sup) => idx = sup,
                None => return false,
            }
        }
    } else {
        let Some(obj_module) = store.module(obj.module()) else {
            return false;
        };
        obj_module.composite_type(obj.type_idx()) == module.composite_type(expected_idx)
    }
}

/// Dynamic test behind `ref.test`, `ref.cast`, and the `br_on_cast` pair.
pub fn ref_matches(store: &Store, module: &ModuleInstance, r: &Ref, expected: &RefType) -> bool {
    match r {
        Ref::Null(h) => expected.nullable && heap_subtype(module, *h, expected.heap),
        Ref::I31(_) => matches!(expected.heap, HeapType::Any | HeapType::Eq | HeapType::I31),
        Ref::Extern(_) => matches!(expected.heap, HeapType::Extern),
        Ref::Exn(_) => matches!(expected.heap, HeapType::Exn),
        Ref::Func(addr) => match expected.heap {
            HeapType::Func => true,
            HeapType::Defined(idx) => {
                let Some(func) = store.func(*addr) else {
                    return false;
                };
                module.func_type(idx).is_some_and(|ft| ft == func.ty())
            }
            _ => false,
        },
        Ref::Struct(addr) => match expected.heap {
            HeapType::Any | HeapType::Eq | HeapType::Struct => true,
            HeapType::Defined(idx) => gc_defined_matches(store, *addr, idx, module),
            _ => false,
        },
        Ref::Array(addr) => match expected.heap {
            HeapType::Any | HeapType::Eq | HeapType::Array => true,
            HeapType::Defined(idx) => gc_defined_matches(store, *addr, idx, module),
            _ => false,
        },
    }
}
