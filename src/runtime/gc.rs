//! GC heap objects. Structs and arrays live in the store's GC arena and are
//! reached through `GcAddr` handles embedded in references. Objects record
//! their defining module and type index, which is how casts recover the
//! dynamic type.

use std::sync::RwLock;

use super::value::Value;
use super::ModuleAddr;
use crate::ast::types::TypeIdx;
use crate::error::Trap;

#[derive(Debug)]
pub struct StructObj {
    module: ModuleAddr,
    type_idx: TypeIdx,
    /// Field values in packed storage form.
    fields: RwLock<Vec<Value>>,
}

impl StructObj {
    pub fn new(module: ModuleAddr, type_idx: TypeIdx, fields: Vec<Value>) -> Self {
        Self { module, type_idx, fields: RwLock::new(fields) }
    }

    pub fn module(&self) -> ModuleAddr {
        self.module
    }

    pub fn type_idx(&self) -> TypeIdx {
        self.type_idx
    }

    pub fn field_count(&self) -> usize {
        self.fields.read().expect("gc lock").len()
    }

    pub fn get(&self, idx: u32) -> Result<Value, Trap> {
        self.fields
            .read()
            .expect("gc lock")
            .get(idx as usize)
            .cloned()
            .ok_or(Trap::OutOfBounds)
    }

    pub fn set(&self, idx: u32, val: Value) -> Result<(), Trap> {
        let mut fields = self.fields.write().expect("gc lock");
        let slot = fields.get_mut(idx as usize).ok_or(Trap::OutOfBounds)?;
        *slot = val;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ArrayObj {
    module: ModuleAddr,
    type_idx: TypeIdx,
    /// Element values in packed storage form.
    elems: RwLock<Vec<Value>>,
}

impl ArrayObj {
    pub fn new(module: ModuleAddr, type_idx: TypeIdx, elems: Vec<Value>) -> Self {
        Self { module, type_idx, elems: RwLock::new(elems) }
    }

    pub fn module(&self) -> ModuleAddr {
        self.module
    }

    pub fn type_idx(&self) -> TypeIdx {
        self.type_idx
    }

    pub fn len(&self) -> u32 {
        self.elems.read().expect("gc lock").len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: u32) -> Result<Value, Trap> {
        self.elems
            .read()
            .expect("gc lock")
            .get(idx as usize)
            .cloned()
            .ok_or(Trap::OutOfBounds)
    }

    pub fn set(&self, idx: u32, val: Value) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("gc lock");
        let slot = elems.get_mut(idx as usize).ok_or(Trap::OutOfBounds)?;
        *slot = val;
        Ok(())
    }

    /// `array.fill`.
    pub fn fill(&self, dst: u32, val: Value, len: u32) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("gc lock");
        let start = dst as usize;
        let end = start.checked_add(len as usize).ok_or(Trap::OutOfBounds)?;
        if end > elems.len() {
            return Err(Trap::OutOfBounds);
        }
        elems[start..end].fill(val);
        Ok(())
    }

    /// Write a slice of values starting at `dst`.
    pub fn write_slice(&self, dst: u32, vals: &[Value]) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("gc lock");
        let start = dst as usize;
        let end = start.checked_add(vals.len()).ok_or(Trap::OutOfBounds)?;
        if end > elems.len() {
            return Err(Trap::OutOfBounds);
        }
        elems[start..end].clone_from_slice(vals);
        Ok(())
    }

    /// Read `len` values starting at `src`.
    pub fn read_slice(&self, src: u32, len: u32) -> Result<Vec<Value>, Trap> {
        let elems = self.elems.read().expect("gc lock");
        let start = src as usize;
        let end = start.checked_add(len as usize).ok_or(Trap::OutOfBounds)?;
        if end > elems.len() {
            return Err(Trap::OutOfBounds);
        }
        Ok(elems[start..end].to_vec())
    }

    /// `array.copy` within one array; overlapping ranges are handled.
    pub fn copy_within(&self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("gc lock");
        let n = len as usize;
        let d = dst as usize;
        let s = src as usize;
        if d.checked_add(n).map_or(true, |e| e > elems.len())
            || s.checked_add(n).map_or(true, |e| e > elems.len())
        {
            return Err(Trap::OutOfBounds);
        }
        if d <= s {
            for i in 0..n {
                elems[d + i] = elems[s + i].clone();
            }
        } else {
            for i in (0..n).rev() {
                elems[d + i] = elems[s + i].clone();
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum GcObject {
    Struct(StructObj),
    Array(ArrayObj),
}

impl GcObject {
    pub fn as_struct(&self) -> Option<&StructObj> {
        match self {
            GcObject::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayObj> {
        match self {
            GcObject::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn module(&self) -> ModuleAddr {
        match self {
            GcObject::Struct(s) => s.module(),
            GcObject::Array(a) => a.module(),
        }
    }

    pub fn type_idx(&self) -> TypeIdx {
        match self {
            GcObject::Struct(s) => s.type_idx(),
            GcObject::Array(a) => a.type_idx(),
        }
    }
}
