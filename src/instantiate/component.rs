//! Component instantiation and the canonical ABI. Each section kind has its
//! own handler; `canon lift` produces component functions wrapping core
//! functions, `canon lower` produces core host adapters around component
//! functions. Value translation uses the target memory and the optional
//! `realloc` export.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ast::component::{
    Alias, Canon, Component, ComponentFuncType, ComponentSection, ComponentSort,
    ComponentValType, CoreInstance, CoreSort,
};
use crate::ast::module::Module;
use crate::ast::types::{FuncType, ValType};
use crate::error::{HostError, InstantiateError, Trap};
use crate::exec::Executor;
use crate::host::{CallingFrame, HostFunc};
use crate::runtime::component::{
    ComponentExternVal, ComponentFunction, ComponentInstance, ComponentValue,
};
use crate::runtime::module::ExternVal;
use crate::runtime::{
    ComponentAddr, FuncAddr, FunctionInstance, GlobalAddr, MemAddr, MemoryInstance, ModuleAddr,
    Store, TableAddr, TagAddr, Value,
};

const MAX_FLAT_PARAMS: usize = 16;

fn canon_trap(msg: &str) -> Trap {
    Trap::Host(HostError::msg(msg))
}

// ===== flattening =====

/// Join rule for variant payload slots sharing one flat lane.
fn join(a: ValType, b: ValType) -> ValType {
    if a == b {
        a
    } else if matches!((a, b), (ValType::I32, ValType::F32) | (ValType::F32, ValType::I32)) {
        ValType::I32
    } else {
        ValType::I64
    }
}

fn flatten_ty(ty: &ComponentValType, out: &mut Vec<ValType>) {
    match ty {
        ComponentValType::Bool
        | ComponentValType::S8
        | ComponentValType::U8
        | ComponentValType::S16
        | ComponentValType::U16
        | ComponentValType::S32
        | ComponentValType::U32
        | ComponentValType::Char
        | ComponentValType::Flags(_) => out.push(ValType::I32),
        ComponentValType::S64 | ComponentValType::U64 => out.push(ValType::I64),
        ComponentValType::F32 => out.push(ValType::F32),
        ComponentValType::F64 => out.push(ValType::F64),
        ComponentValType::String | ComponentValType::List(_) => {
            out.push(ValType::I32);
            out.push(ValType::I32);
        }
        ComponentValType::Record(fields) => {
            for (_, f) in fields {
                flatten_ty(f, out);
            }
        }
        ComponentValType::Tuple(items) => {
            for item in items {
                flatten_ty(item, out);
            }
        }
        ComponentValType::Option(payload) => {
            out.push(ValType::I32);
            flatten_ty(payload, out);
        }
        ComponentValType::Result { ok, err } => {
            out.push(ValType::I32);
            let mut a = Vec::new();
            let mut b = Vec::new();
            if let Some(ok) = ok {
                flatten_ty(ok, &mut a);
            }
            if let Some(err) = err {
                flatten_ty(err, &mut b);
            }
            for i in 0..a.len().max(b.len()) {
                let slot = match (a.get(i), b.get(i)) {
                    (Some(&x), Some(&y)) => join(x, y),
                    (Some(&x), None) | (None, Some(&x)) => x,
                    (None, None) => ValType::I32,
                };
                out.push(slot);
            }
        }
    }
}

/// Core signature of a lifted/lowered function. Oversized parameter lists
/// spill to memory behind a single pointer; results wider than one flat slot
/// come back as a pointer into memory.
fn flatten_func_ty(ty: &ComponentFuncType) -> FuncType {
    let mut params = Vec::new();
    for (_, p) in &ty.params {
        flatten_ty(p, &mut params);
    }
    if params.len() > MAX_FLAT_PARAMS {
        params = vec![ValType::I32];
    }
    let mut results = Vec::new();
    if let Some(r) = &ty.result {
        flatten_ty(r, &mut results);
        if results.len() > 1 {
            results = vec![ValType::I32];
        }
    }
    FuncType::new(params, results)
}

// ===== memory layout =====

fn align_to(n: u32, align: u32) -> u32 {
    (n + align - 1) & !(align - 1)
}

fn size_align(ty: &ComponentValType) -> (u32, u32) {
    match ty {
        ComponentValType::Bool | ComponentValType::S8 | ComponentValType::U8 => (1, 1),
        ComponentValType::S16 | ComponentValType::U16 => (2, 2),
        ComponentValType::S32
        | ComponentValType::U32
        | ComponentValType::F32
        | ComponentValType::Char
        | ComponentValType::Flags(_) => (4, 4),
        ComponentValType::S64 | ComponentValType::U64 | ComponentValType::F64 => (8, 8),
        ComponentValType::String | ComponentValType::List(_) => (8, 4),
        ComponentValType::Record(fields) => {
            let mut size = 0;
            let mut align = 1;
            for (_, f) in fields {
                let (s, a) = size_align(f);
                size = align_to(size, a) + s;
                align = align.max(a);
            }
            (align_to(size, align), align)
        }
        ComponentValType::Tuple(items) => {
            let mut size = 0;
            let mut align = 1;
            for item in items {
                let (s, a) = size_align(item);
                size = align_to(size, a) + s;
                align = align.max(a);
            }
            (align_to(size, align), align)
        }
        ComponentValType::Option(payload) => {
            let (s, a) = size_align(payload);
            let size = align_to(1, a) + s;
            (align_to(size, a.max(1)), a.max(1))
        }
        ComponentValType::Result { ok, err } => {
            let (so, ao) = ok.as_deref().map(size_align).unwrap_or((0, 1));
            let (se, ae) = err.as_deref().map(size_align).unwrap_or((0, 1));
            let a = ao.max(ae).max(1);
            let size = align_to(1, a) + so.max(se);
            (align_to(size, a), a)
        }
    }
}

/// Translation context: the canonical options resolved to runtime handles.
struct CanonCx<'a> {
    exec: &'a Executor,
    store: &'a Store,
    mem: Option<Arc<MemoryInstance>>,
    realloc: Option<FuncAddr>,
}

impl<'a> CanonCx<'a> {
    fn for_function(
        exec: &'a Executor,
        store: &'a Store,
        func: &ComponentFunction,
    ) -> CanonCx<'a> {
        CanonCx {
            exec,
            store,
            mem: func.memory.and_then(|a| store.memory(a)),
            realloc: func.realloc,
        }
    }

    fn mem(&self) -> Result<&Arc<MemoryInstance>, Trap> {
        self.mem
            .as_ref()
            .ok_or_else(|| canon_trap("canonical option `memory` required"))
    }

    /// Allocate `size` bytes through the instance's `realloc` export.
    fn alloc(&self, size: u32, align: u32) -> Result<u32, Trap> {
        let realloc = self
            .realloc
            .ok_or_else(|| canon_trap("canonical option `realloc` required"))?;
        let results = self.exec.invoke(
            self.store,
            realloc,
            &[Value::I32(0), Value::I32(0), Value::I32(align as i32), Value::I32(size as i32)],
        )?;
        match results.first() {
            Some((Value::I32(p), _)) => Ok(*p as u32),
            _ => Err(canon_trap("realloc returned no pointer")),
        }
    }

    // ===== flat lowering (component value -> core values) =====

    fn lower_flat(
        &self,
        ty: &ComponentValType,
        v: &ComponentValue,
        out: &mut Vec<Value>,
    ) -> Result<(), Trap> {
        match (ty, v) {
            (ComponentValType::Bool, ComponentValue::Bool(b)) => out.push(Value::I32(*b as i32)),
            (ComponentValType::S8, ComponentValue::S8(x)) => out.push(Value::I32(*x as i32)),
            (ComponentValType::U8, ComponentValue::U8(x)) => out.push(Value::I32(*x as i32)),
            (ComponentValType::S16, ComponentValue::S16(x)) => out.push(Value::I32(*x as i32)),
            (ComponentValType::U16, ComponentValue::U16(x)) => out.push(Value::I32(*x as i32)),
            (ComponentValType::S32, ComponentValue::S32(x)) => out.push(Value::I32(*x)),
            (ComponentValType::U32, ComponentValue::U32(x)) => out.push(Value::I32(*x as i32)),
            (ComponentValType::S64, ComponentValue::S64(x)) => out.push(Value::I64(*x)),
            (ComponentValType::U64, ComponentValue::U64(x)) => out.push(Value::I64(*x as i64)),
            (ComponentValType::F32, ComponentValue::F32(x)) => {
                out.push(Value::F32(x.to_bits()))
            }
            (ComponentValType::F64, ComponentValue::F64(x)) => {
                out.push(Value::F64(x.to_bits()))
            }
            (ComponentValType::Char, ComponentValue::Char(c)) => {
                out.push(Value::I32(*c as u32 as i32))
            }
            (ComponentValType::String, ComponentValue::String(s)) => {
                let bytes = s.as_bytes();
                let ptr = self.alloc(bytes.len() as u32, 1)?;
                self.mem()?.write(ptr as u64, bytes)?;
                out.push(Value::I32(ptr as i32));
                out.push(Value::I32(bytes.len() as i32));
            }
            (ComponentValType::List(elem_ty), ComponentValue::List(items)) => {
                let (esize, ealign) = size_align(elem_ty);
                let total = esize.checked_mul(items.len() as u32).ok_or(Trap::OutOfBounds)?;
                let ptr = self.alloc(total, ealign)?;
                for (i, item) in items.iter().enumerate() {
                    self.store_value(elem_ty, item, ptr as u64 + (i as u64) * esize as u64)?;
                }
                out.push(Value::I32(ptr as i32));
                out.push(Value::I32(items.len() as i32));
            }
            (ComponentValType::Record(fields), ComponentValue::Record(vals)) => {
                for ((_, fty), (_, fv)) in fields.iter().zip(vals) {
                    self.lower_flat(fty, fv, out)?;
                }
            }
            (ComponentValType::Tuple(tys), ComponentValue::Tuple(vals)) => {
                for (ity, iv) in tys.iter().zip(vals) {
                    self.lower_flat(ity, iv, out)?;
                }
            }
            (ComponentValType::Option(payload), ComponentValue::Option(opt)) => {
                let mut slots = Vec::new();
                flatten_ty(payload, &mut slots);
                match opt {
                    None => {
                        out.push(Value::I32(0));
                        for s in &slots {
                            out.push(Value::default_for(*s));
                        }
                    }
                    Some(inner) => {
                        out.push(Value::I32(1));
                        self.lower_flat(payload, inner, out)?;
                    }
                }
            }
            (ComponentValType::Result { ok, err }, ComponentValue::Result(res)) => {
                // Joined payload slots, as in flatten_ty.
                let mut slots = Vec::new();
                let mut full = Vec::new();
                flatten_ty(ty, &mut full);
                slots.extend_from_slice(&full[1..]);
                let (disc, payload_ty, payload) = match res {
                    Ok(p) => (0, ok.as_deref(), p.as_deref()),
                    Err(p) => (1, err.as_deref(), p.as_deref()),
                };
                out.push(Value::I32(disc));
                let mut payload_flat = Vec::new();
                if let (Some(pty), Some(pv)) = (payload_ty, payload) {
                    self.lower_flat(pty, pv, &mut payload_flat)?;
                }
                for (i, slot) in slots.iter().enumerate() {
                    out.push(match payload_flat.get(i) {
                        Some(v) => coerce_to_slot(v, slot),
                        None => Value::default_for(*slot),
                    });
                }
            }
            (ComponentValType::Flags(names), ComponentValue::Flags(set)) => {
                let mut bits = 0u32;
                for (i, name) in names.iter().enumerate() {
                    if set.contains(name) {
                        bits |= 1 << i;
                    }
                }
                out.push(Value::I32(bits as i32));
            }
            _ => return Err(canon_trap("component value does not match its declared type")),
        }
        Ok(())
    }

    // ===== flat lifting (core values -> component value) =====

    fn lift_flat(
        &self,
        ty: &ComponentValType,
        flat: &mut std::slice::Iter<'_, Value>,
    ) -> Result<ComponentValue, Trap> {
        let next_i32 = |flat: &mut std::slice::Iter<'_, Value>| -> Result<i32, Trap> {
            match flat.next() {
                Some(Value::I32(x)) => Ok(*x),
                Some(Value::I64(x)) => Ok(*x as i32),
                _ => Err(canon_trap("flat value mismatch")),
            }
        };
        Ok(match ty {
            ComponentValType::Bool => ComponentValue::Bool(next_i32(flat)? != 0),
            ComponentValType::S8 => ComponentValue::S8(next_i32(flat)? as i8),
            ComponentValType::U8 => ComponentValue::U8(next_i32(flat)? as u8),
            ComponentValType::S16 => ComponentValue::S16(next_i32(flat)? as i16),
            ComponentValType::U16 => ComponentValue::U16(next_i32(flat)? as u16),
            ComponentValType::S32 => ComponentValue::S32(next_i32(flat)?),
            ComponentValType::U32 => ComponentValue::U32(next_i32(flat)? as u32),
            ComponentValType::S64 => match flat.next() {
                Some(Value::I64(x)) => ComponentValue::S64(*x),
                _ => return Err(canon_trap("flat value mismatch")),
            },
            ComponentValType::U64 => match flat.next() {
                Some(Value::I64(x)) => ComponentValue::U64(*x as u64),
                _ => return Err(canon_trap("flat value mismatch")),
            },
            ComponentValType::F32 => match flat.next() {
                Some(Value::F32(b)) => ComponentValue::F32(f32::from_bits(*b)),
                Some(Value::I32(b)) => ComponentValue::F32(f32::from_bits(*b as u32)),
                Some(Value::I64(b)) => ComponentValue::F32(f32::from_bits(*b as u32)),
                _ => return Err(canon_trap("flat value mismatch")),
            },
            ComponentValType::F64 => match flat.next() {
                Some(Value::F64(b)) => ComponentValue::F64(f64::from_bits(*b)),
                Some(Value::I64(b)) => ComponentValue::F64(f64::from_bits(*b as u64)),
                _ => return Err(canon_trap("flat value mismatch")),
            },
            ComponentValType::Char => {
                let scalar = next_i32(flat)? as u32;
                ComponentValue::Char(
                    char::from_u32(scalar).ok_or_else(|| canon_trap("invalid char scalar"))?,
                )
            }
            ComponentValType::String => {
                let ptr = next_i32(flat)? as u32 as u64;
                let len = next_i32(flat)? as u32 as usize;
                let mut bytes = vec![0u8; len];
                self.mem()?.read(ptr, &mut bytes)?;
                ComponentValue::String(
                    String::from_utf8(bytes).map_err(|_| canon_trap("invalid utf-8 string"))?,
                )
            }
            ComponentValType::List(elem_ty) => {
                let ptr = next_i32(flat)? as u32 as u64;
                let len = next_i32(flat)? as u32;
                let (esize, _) = size_align(elem_ty);
                let mut items = Vec::with_capacity(len as usize);
                for i in 0..len as u64 {
                    items.push(self.load_value(elem_ty, ptr + i * esize as u64)?);
                }
                ComponentValue::List(items)
            }
            ComponentValType::Record(fields) => {
                let mut vals = Vec::with_capacity(fields.len());
                for (name, fty) in fields {
                    vals.push((name.clone(), self.lift_flat(fty, flat)?));
                }
                ComponentValue::Record(vals)
            }
            ComponentValType::Tuple(tys) => {
                let mut vals = Vec::with_capacity(tys.len());
                for ity in tys {
                    vals.push(self.lift_flat(ity, flat)?);
                }
                ComponentValue::Tuple(vals)
            }
            ComponentValType::Option(payload) => {
                let disc = next_i32(flat)?;
                if disc == 0 {
                    // Consume the payload lanes.
                    let mut slots = Vec::new();
                    flatten_ty(payload, &mut slots);
                    for _ in 0..slots.len() {
                        flat.next();
                    }
                    ComponentValue::Option(None)
                } else {
                    ComponentValue::Option(Some(Box::new(self.lift_flat(payload, flat)?)))
                }
            }
            ComponentValType::Result { ok, err } => {
                let disc = next_i32(flat)?;
                let mut full = Vec::new();
                flatten_ty(ty, &mut full);
                let payload_slots = full.len() - 1;
                let lanes: Vec<Value> = flat.take(payload_slots).cloned().collect();
                let (chosen, _) = if disc == 0 { (ok, err) } else { (err, ok) };
                let payload = match chosen {
                    None => None,
                    Some(pty) => {
                        let mut own_slots = Vec::new();
                        flatten_ty(pty, &mut own_slots);
                        let coerced: Vec<Value> = lanes
                            .iter()
                            .zip(&own_slots)
                            .map(|(v, s)| coerce_from_slot(v, s))
                            .collect();
                        let mut iter = coerced.iter();
                        Some(Box::new(self.lift_flat(pty, &mut iter)?))
                    }
                };
                ComponentValue::Result(if disc == 0 { Ok(payload) } else { Err(payload) })
            }
            ComponentValType::Flags(names) => {
                let bits = next_i32(flat)? as u32;
                let set = names
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| bits & (1 << i) != 0)
                    .map(|(_, n)| n.clone())
                    .collect();
                ComponentValue::Flags(set)
            }
        })
    }

    // ===== in-memory representation =====

    fn store_value(&self, ty: &ComponentValType, v: &ComponentValue, addr: u64) -> Result<(), Trap> {
        let mem = self.mem()?.clone();
        match (ty, v) {
            (ComponentValType::Bool, ComponentValue::Bool(b)) => mem.store_u8(addr, *b as u8)?,
            (ComponentValType::S8, ComponentValue::S8(x)) => mem.store_u8(addr, *x as u8)?,
            (ComponentValType::U8, ComponentValue::U8(x)) => mem.store_u8(addr, *x)?,
            (ComponentValType::S16, ComponentValue::S16(x)) => mem.store_u16(addr, *x as u16)?,
            (ComponentValType::U16, ComponentValue::U16(x)) => mem.store_u16(addr, *x)?,
            (ComponentValType::S32, ComponentValue::S32(x)) => mem.store_u32(addr, *x as u32)?,
            (ComponentValType::U32, ComponentValue::U32(x)) => mem.store_u32(addr, *x)?,
            (ComponentValType::S64, ComponentValue::S64(x)) => mem.store_u64(addr, *x as u64)?,
            (ComponentValType::U64, ComponentValue::U64(x)) => mem.store_u64(addr, *x)?,
            (ComponentValType::F32, ComponentValue::F32(x)) => mem.store_u32(addr, x.to_bits())?,
            (ComponentValType::F64, ComponentValue::F64(x)) => mem.store_u64(addr, x.to_bits())?,
            (ComponentValType::Char, ComponentValue::Char(c)) => {
                mem.store_u32(addr, *c as u32)?
            }
            (ComponentValType::String, ComponentValue::String(s)) => {
                let bytes = s.as_bytes();
                let ptr = self.alloc(bytes.len() as u32, 1)?;
                mem.write(ptr as u64, bytes)?;
                mem.store_u32(addr, ptr)?;
                mem.store_u32(addr + 4, bytes.len() as u32)?;
            }
            (ComponentValType::List(elem_ty), ComponentValue::List(items)) => {
                let (esize, ealign) = size_align(elem_ty);
                let total = esize.checked_mul(items.len() as u32).ok_or(Trap::OutOfBounds)?;
                let ptr = self.alloc(total, ealign)?;
                for (i, item) in items.iter().enumerate() {
                    self.store_value(elem_ty, item, ptr as u64 + (i as u64) * esize as u64)?;
                }
                mem.store_u32(addr, ptr)?;
                mem.store_u32(addr + 4, items.len() as u32)?;
            }
            (ComponentValType::Record(fields), ComponentValue::Record(vals)) => {
                let mut off = 0u32;
                for ((_, fty), (_, fv)) in fields.iter().zip(vals) {
                    let (s, a) = size_align(fty);
                    off = align_to(off, a);
                    self.store_value(fty, fv, addr + off as u64)?;
                    off += s;
                }
            }
            (ComponentValType::Tuple(tys), ComponentValue::Tuple(vals)) => {
                let mut off = 0u32;
                for (ity, iv) in tys.iter().zip(vals) {
                    let (s, a) = size_align(ity);
                    off = align_to(off, a);
                    self.store_value(ity, iv, addr + off as u64)?;
                    off += s;
                }
            }
            (ComponentValType::Option(payload), ComponentValue::Option(opt)) => {
                let (_, a) = size_align(payload);
                mem.store_u8(addr, opt.is_some() as u8)?;
                if let Some(inner) = opt {
                    self.store_value(payload, inner, addr + align_to(1, a) as u64)?;
                }
            }
            (ComponentValType::Result { ok, err }, ComponentValue::Result(res)) => {
                let (_, full_align) = size_align(ty);
                let (disc, pty, pv) = match res {
                    Ok(p) => (0u8, ok.as_deref(), p.as_deref()),
                    Err(p) => (1u8, err.as_deref(), p.as_deref()),
                };
                mem.store_u8(addr, disc)?;
                if let (Some(pty), Some(pv)) = (pty, pv) {
                    self.store_value(pty, pv, addr + align_to(1, full_align) as u64)?;
                }
            }
            (ComponentValType::Flags(names), ComponentValue::Flags(set)) => {
                let mut bits = 0u32;
                for (i, name) in names.iter().enumerate() {
                    if set.contains(name) {
                        bits |= 1 << i;
                    }
                }
                mem.store_u32(addr, bits)?;
            }
            _ => return Err(canon_trap("component value does not match its declared type")),
        }
        Ok(())
    }

    fn load_value(&self, ty: &ComponentValType, addr: u64) -> Result<ComponentValue, Trap> {
        let mem = self.mem()?.clone();
        Ok(match ty {
            ComponentValType::Bool => ComponentValue::Bool(mem.load_u8(addr)? != 0),
            ComponentValType::S8 => ComponentValue::S8(mem.load_u8(addr)? as i8),
            ComponentValType::U8 => ComponentValue::U8(mem.load_u8(addr)?),
            ComponentValType::S16 => ComponentValue::S16(mem.load_u16(addr)? as i16),
            ComponentValType::U16 => ComponentValue::U16(mem.load_u16(addr)?),
            ComponentValType::S32 => ComponentValue::S32(mem.load_u32(addr)? as i32),
            ComponentValType::U32 => ComponentValue::U32(mem.load_u32(addr)?),
            ComponentValType::S64 => ComponentValue::S64(mem.load_u64(addr)? as i64),
            ComponentValType::U64 => ComponentValue::U64(mem.load_u64(addr)?),
            ComponentValType::F32 => ComponentValue::F32(f32::from_bits(mem.load_u32(addr)?)),
            ComponentValType::F64 => ComponentValue::F64(f64::from_bits(mem.load_u64(addr)?)),
            ComponentValType::Char => ComponentValue::Char(
                char::from_u32(mem.load_u32(addr)?)
                    .ok_or_else(|| canon_trap("invalid char scalar"))?,
            ),
            ComponentValType::String => {
                let ptr = mem.load_u32(addr)? as u64;
                let len = mem.load_u32(addr + 4)? as usize;
                let mut bytes = vec![0u8; len];
                mem.read(ptr, &mut bytes)?;
                ComponentValue::String(
                    String::from_utf8(bytes).map_err(|_| canon_trap("invalid utf-8 string"))?,
                )
            }
            ComponentValType::List(elem_ty) => {
                let ptr = mem.load_u32(addr)? as u64;
                let len = mem.load_u32(addr + 4)?;
                let (esize, _) = size_align(elem_ty);
                let mut items = Vec::with_capacity(len as usize);
                for i in 0..len as u64 {
                    items.push(self.load_value(elem_ty, ptr + i * esize as u64)?);
                }
                ComponentValue::List(items)
            }
            ComponentValType::Record(fields) => {
                let mut off = 0u32;
                let mut vals = Vec::with_capacity(fields.len());
                for (name, fty) in fields {
                    let (s, a) = size_align(fty);
                    off = align_to(off, a);
                    vals.push((name.clone(), self.load_value(fty, addr + off as u64)?));
                    off += s;
                }
                ComponentValue::Record(vals)
            }
            ComponentValType::Tuple(tys) => {
                let mut off = 0u32;
                let mut vals = Vec::with_capacity(tys.len());
                for ity in tys {
                    let (s, a) = size_align(ity);
                    off = align_to(off, a);
                    vals.push(self.load_value(ity, addr + off as u64)?);
                    off += s;
                }
                ComponentValue::Tuple(vals)
            }
            ComponentValType::Option(payload) => {
                let disc = mem.load_u8(addr)?;
                let (_, a) = size_align(payload);
                ComponentValue::Option(if disc == 0 {
                    None
                } else {
                    Some(Box::new(self.load_value(payload, addr + align_to(1, a) as u64)?))
                })
            }
            ComponentValType::Result { ok, err } => {
                let disc = mem.load_u8(addr)?;
                let (_, a) = size_align(ty);
                let chosen = if disc == 0 { ok } else { err };
                let payload = match chosen {
                    None => None,
                    Some(pty) => {
                        Some(Box::new(self.load_value(pty, addr + align_to(1, a) as u64)?))
                    }
                };
                ComponentValue::Result(if disc == 0 { Ok(payload) } else { Err(payload) })
            }
            ComponentValType::Flags(names) => {
                let bits = mem.load_u32(addr)?;
                let set = names
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| bits & (1 << i) != 0)
                    .map(|(_, n)| n.clone())
                    .collect();
                ComponentValue::Flags(set)
            }
        })
    }
}

fn coerce_to_slot(v: &Value, slot: &ValType) -> Value {
    match (v, slot) {
        (Value::I32(x), ValType::I64) => Value::I64(*x as u32 as i64),
        (Value::F32(b), ValType::I32) => Value::I32(*b as i32),
        (Value::F32(b), ValType::I64) => Value::I64(*b as i64),
        (Value::F64(b), ValType::I64) => Value::I64(*b as i64),
        _ => v.clone(),
    }
}

fn coerce_from_slot(v: &Value, own: &ValType) -> Value {
    match (v, own) {
        (Value::I64(x), ValType::I32) => Value::I32(*x as i32),
        (Value::I32(b), ValType::F32) => Value::F32(*b as u32),
        (Value::I64(b), ValType::F32) => Value::F32(*b as u32),
        (Value::I64(b), ValType::F64) => Value::F64(*b as u64),
        _ => v.clone(),
    }
}

// ===== lowered adapter =====

/// Core host function produced by `canon lower`: lifts flat core arguments
/// into component values, invokes the component function, lowers the result
/// back into the caller's memory.
struct LoweredAdapter {
    func: Arc<ComponentFunction>,
    memory: Option<MemAddr>,
    realloc: Option<FuncAddr>,
}

impl HostFunc for LoweredAdapter {
    fn call(&self, frame: &CallingFrame<'_>, params: &[Value]) -> Result<Vec<Value>, HostError> {
        let cx = CanonCx {
            exec: frame.executor(),
            store: frame.store(),
            mem: self.memory.and_then(|a| frame.store().memory(a)),
            realloc: self.realloc,
        };
        let host_err = |t: Trap| match t {
            Trap::Host(h) => h,
            other => HostError::msg(other.to_string()),
        };
        let mut iter = params.iter();
        let mut args = Vec::with_capacity(self.func.ty.params.len());
        for (_, pty) in &self.func.ty.params {
            args.push(cx.lift_flat(pty, &mut iter).map_err(host_err)?);
        }
        let results = frame
            .executor()
            .invoke_component(frame.store(), &self.func, &args)
            .map_err(host_err)?;
        match (&self.func.ty.result, results.first()) {
            (None, _) => Ok(Vec::new()),
            (Some(rty), Some(rv)) => {
                let mut flat = Vec::new();
                cx.lower_flat(rty, rv, &mut flat).map_err(host_err)?;
                if flat.len() > 1 {
                    let (size, align) = size_align(rty);
                    let ptr = cx.alloc(size, align).map_err(host_err)?;
                    cx.store_value(rty, rv, ptr as u64).map_err(host_err)?;
                    Ok(vec![Value::I32(ptr as i32)])
                } else {
                    Ok(flat)
                }
            }
            (Some(_), None) => Err(HostError::msg("component function returned no value")),
        }
    }
}

// ===== component invocation =====

impl Executor {
    /// Invoke a lifted component function: lower the arguments to the core
    /// ABI, call the core function, lift the result.
    pub fn invoke_component(
        &self,
        store: &Store,
        func: &ComponentFunction,
        args: &[ComponentValue],
    ) -> Result<Vec<ComponentValue>, Trap> {
        let cx = CanonCx::for_function(self, store, func);
        if args.len() != func.ty.params.len() {
            return Err(canon_trap("component argument count mismatch"));
        }
        let mut flat = Vec::new();
        for ((_, pty), arg) in func.ty.params.iter().zip(args) {
            cx.lower_flat(pty, arg, &mut flat)?;
        }
        if flat.len() > MAX_FLAT_PARAMS {
            // Spill: store the whole argument tuple and pass one pointer.
            let tuple_ty = ComponentValType::Tuple(
                func.ty.params.iter().map(|(_, t)| t.clone()).collect(),
            );
            let tuple = ComponentValue::Tuple(args.to_vec());
            let (size, align) = size_align(&tuple_ty);
            let ptr = cx.alloc(size, align)?;
            cx.store_value(&tuple_ty, &tuple, ptr as u64)?;
            flat = vec![Value::I32(ptr as i32)];
        }
        let core_results = self.invoke(store, func.core, &flat)?;
        let result = match &func.ty.result {
            None => Vec::new(),
            Some(rty) => {
                let mut slots = Vec::new();
                flatten_ty(rty, &mut slots);
                let lifted = if slots.len() > 1 {
                    let ptr = match core_results.first() {
                        Some((Value::I32(p), _)) => *p as u32 as u64,
                        _ => return Err(canon_trap("expected result pointer")),
                    };
                    cx.load_value(rty, ptr)?
                } else {
                    let vals: Vec<Value> =
                        core_results.iter().map(|(v, _)| v.clone()).collect();
                    let mut iter = vals.iter();
                    cx.lift_flat(rty, &mut iter)?
                };
                vec![lifted]
            }
        };
        if let Some(post_return) = func.post_return {
            let args: Vec<Value> = core_results.iter().map(|(v, _)| v.clone()).collect();
            self.invoke(store, post_return, &args)?;
        }
        Ok(result)
    }

    pub(crate) fn instantiate_component_inner(
        &self,
        store: &Store,
        comp: &Arc<Component>,
        name: Option<String>,
    ) -> Result<ComponentAddr, InstantiateError> {
        let _span = tracing::debug_span!(
            "instantiate_component",
            name = name.as_deref().unwrap_or("<anonymous>")
        )
        .entered();
        if !self.config().proposals.component_model {
            return Err(InstantiateError::Init(Trap::UnreachableExecuted));
        }
        let _guard = store.lock_instantiation();
        let snapshot = store.snapshot();
        match self.instantiate_component_locked(store, comp, name) {
            Ok(addr) => Ok(addr),
            Err(err) => {
                store.rollback(snapshot);
                Err(err)
            }
        }
    }

    fn instantiate_component_locked(
        &self,
        store: &Store,
        comp: &Arc<Component>,
        name: Option<String>,
    ) -> Result<ComponentAddr, InstantiateError> {
        let fault = || InstantiateError::Init(Trap::UnreachableExecuted);

        let mut core_modules: Vec<Arc<Module>> = Vec::new();
        let mut core_instances: Vec<ModuleAddr> = Vec::new();
        let mut core_funcs: Vec<FuncAddr> = Vec::new();
        let mut core_tables: Vec<TableAddr> = Vec::new();
        let mut core_memories: Vec<MemAddr> = Vec::new();
        let mut core_globals: Vec<GlobalAddr> = Vec::new();
        let mut core_tags: Vec<TagAddr> = Vec::new();
        let mut func_types: Vec<ComponentFuncType> = Vec::new();
        let mut funcs: Vec<Arc<ComponentFunction>> = Vec::new();
        let mut exports: HashMap<String, ComponentExternVal> = HashMap::new();

        for section in &comp.sections {
            match section {
                ComponentSection::CoreModule(module) => core_modules.push(module.clone()),

                ComponentSection::Import(import) => {
                    let addr = store.lookup_named(&import.name).ok_or_else(|| {
                        crate::error::LinkError::UnknownImport {
                            module: import.name.clone(),
                            name: String::new(),
                        }
                    })?;
                    core_instances.push(addr);
                }

                ComponentSection::CoreInstance(ci) => match ci {
                    CoreInstance::Instantiate { module, args } => {
                        let ast = core_modules.get(*module as usize).ok_or_else(fault)?.clone();
                        // Bind the instantiation arguments under their import
                        // names for the duration of this core instantiation.
                        let mut saved = Vec::with_capacity(args.len());
                        for arg in args {
                            let inst = core_instances
                                .get(arg.instance as usize)
                                .copied()
                                .ok_or_else(fault)?;
                            saved.push((arg.name.clone(), store.lookup_named(&arg.name)));
                            store.register_named(arg.name.clone(), inst);
                        }
                        let outcome = self.instantiate_locked(store, &ast, None);
                        for (arg_name, old) in saved.into_iter().rev() {
                            match old {
                                Some(prev) => store.register_named(arg_name, prev),
                                None => {
                                    store.unregister_named(&arg_name);
                                }
                            }
                        }
                        core_instances.push(outcome?);
                    }
                    CoreInstance::FromExports(decls) => {
                        let addr = self.synthesize_core_instance(
                            store,
                            decls,
                            &core_funcs,
                            &core_tables,
                            &core_memories,
                            &core_globals,
                            &core_tags,
                        )?;
                        core_instances.push(addr);
                    }
                },

                ComponentSection::Alias(Alias::CoreInstanceExport { instance, name, sort }) => {
                    let inst = core_instances
                        .get(*instance as usize)
                        .and_then(|a| store.module(*a))
                        .ok_or_else(fault)?;
                    let val = inst.export(name).ok_or_else(|| {
                        InstantiateError::Link(crate::error::LinkError::UnknownImport {
                            module: inst.name.clone().unwrap_or_default(),
                            name: name.clone(),
                        })
                    })?;
                    match (sort, val) {
                        (CoreSort::Func, ExternVal::Func(a)) => core_funcs.push(a),
                        (CoreSort::Table, ExternVal::Table(a)) => core_tables.push(a),
                        (CoreSort::Memory, ExternVal::Memory(a)) => core_memories.push(a),
                        (CoreSort::Global, ExternVal::Global(a)) => core_globals.push(a),
                        (CoreSort::Tag, ExternVal::Tag(a)) => core_tags.push(a),
                        _ => return Err(fault()),
                    }
                }

                ComponentSection::Type(crate::ast::component::ComponentType::Func(ft)) => {
                    func_types.push(ft.clone());
                }

                ComponentSection::Canon(canon) => match canon {
                    Canon::Lift { core_func, ty, opts } => {
                        let core = core_funcs.get(*core_func as usize).copied().ok_or_else(fault)?;
                        let ty = func_types.get(*ty as usize).cloned().ok_or_else(fault)?;
                        funcs.push(Arc::new(ComponentFunction {
                            core,
                            ty,
                            memory: opts
                                .memory
                                .map(|i| core_memories.get(i as usize).copied().ok_or_else(fault))
                                .transpose()?,
                            realloc: opts
                                .realloc
                                .map(|i| core_funcs.get(i as usize).copied().ok_or_else(fault))
                                .transpose()?,
                            post_return: opts
                                .post_return
                                .map(|i| core_funcs.get(i as usize).copied().ok_or_else(fault))
                                .transpose()?,
                        }));
                    }
                    Canon::Lower { func, opts } => {
                        let component_func =
                            funcs.get(*func as usize).cloned().ok_or_else(fault)?;
                        let core_ty = flatten_func_ty(&component_func.ty);
                        let adapter = LoweredAdapter {
                            func: component_func,
                            memory: opts
                                .memory
                                .map(|i| core_memories.get(i as usize).copied().ok_or_else(fault))
                                .transpose()?,
                            realloc: opts
                                .realloc
                                .map(|i| core_funcs.get(i as usize).copied().ok_or_else(fault))
                                .transpose()?,
                        };
                        let addr =
                            store.alloc_func(FunctionInstance::host(core_ty, Arc::new(adapter)));
                        core_funcs.push(addr);
                    }
                },

                ComponentSection::Start(start) => {
                    let func = funcs.get(start.func as usize).cloned().ok_or_else(fault)?;
                    self.invoke_component(store, &func, &[])
                        .map_err(InstantiateError::Init)?;
                }

                ComponentSection::Export(export) => {
                    let val = match export.sort {
                        ComponentSort::Func => funcs
                            .get(export.idx as usize)
                            .cloned()
                            .map(ComponentExternVal::Func),
                        ComponentSort::CoreInstance => core_instances
                            .get(export.idx as usize)
                            .copied()
                            .map(ComponentExternVal::CoreInstance),
                    }
                    .ok_or_else(fault)?;
                    exports.insert(export.name.clone(), val);
                }
            }
        }

        let inst = ComponentInstance {
            name: name.clone(),
            addr: ComponentAddr(0),
            core_instances,
            funcs,
            exports,
        };
        let (addr, _) = store.commit_component(inst);
        if let Some(name) = name {
            store.register_component_named(name, addr);
        }
        debug!(component = addr.index(), "instantiated component");
        Ok(addr)
    }

    #[allow(clippy::too_many_arguments)]
    fn synthesize_core_instance(
        &self,
        store: &Store,
        decls: &[crate::ast::component::CoreExportDecl],
        core_funcs: &[FuncAddr],
        core_tables: &[TableAddr],
        core_memories: &[MemAddr],
        core_globals: &[GlobalAddr],
        core_tags: &[TagAddr],
    ) -> Result<ModuleAddr, InstantiateError> {
        let fault = || InstantiateError::Init(Trap::UnreachableExecuted);
        let addr = store.next_module_addr();
        let mut exports = HashMap::new();
        for decl in decls {
            let val = match decl.sort {
                CoreSort::Func => core_funcs
                    .get(decl.idx as usize)
                    .copied()
                    .map(ExternVal::Func),
                CoreSort::Table => core_tables
                    .get(decl.idx as usize)
                    .copied()
                    .map(ExternVal::Table),
                CoreSort::Memory => core_memories
                    .get(decl.idx as usize)
                    .copied()
                    .map(ExternVal::Memory),
                CoreSort::Global => core_globals
                    .get(decl.idx as usize)
                    .copied()
                    .map(ExternVal::Global),
                CoreSort::Tag => core_tags.get(decl.idx as usize).copied().map(ExternVal::Tag),
            }
            .ok_or_else(fault)?;
            exports.insert(decl.name.clone(), val);
        }
        let inst = crate::runtime::ModuleInstance {
            name: None,
            addr,
            module: Arc::new(Module::default()),
            funcs: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            tags: Vec::new(),
            elems: Vec::new(),
            datas: Vec::new(),
            exports,
        };
        let (addr, _) = store.commit_module(inst);
        Ok(addr)
    }
}
