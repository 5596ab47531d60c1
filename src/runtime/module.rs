//! Module instance: the runtime image of a module. Records the absolute
//! store addresses of every item in its index spaces (imports first, then
//! definitions) plus the export bindings. Immutable once committed.

use std::collections::HashMap;
use std::sync::Arc;

use super::{DataAddr, ElemAddr, FuncAddr, GlobalAddr, MemAddr, ModuleAddr, TableAddr, TagAddr};
use crate::ast::module::Module;
use crate::ast::types::{CompositeType, FuncType, SubType, TypeIdx};

/// A resolved export or import value: an address into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternVal {
    Func(FuncAddr),
    Table(TableAddr),
    Memory(MemAddr),
    Global(GlobalAddr),
    Tag(TagAddr),
}

impl ExternVal {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExternVal::Func(_) => "func",
            ExternVal::Table(_) => "table",
            ExternVal::Memory(_) => "memory",
            ExternVal::Global(_) => "global",
            ExternVal::Tag(_) => "tag",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleInstance {
    pub name: Option<String>,
    /// This instance's own store address, used to resolve module-relative
    /// indices during execution.
    pub addr: ModuleAddr,
    /// The declarative AST; holds the type section the instance answers type
    /// queries from.
    pub module: Arc<Module>,
    pub funcs: Vec<FuncAddr>,
    pub tables: Vec<TableAddr>,
    pub memories: Vec<MemAddr>,
    pub globals: Vec<GlobalAddr>,
    pub tags: Vec<TagAddr>,
    pub elems: Vec<ElemAddr>,
    pub datas: Vec<DataAddr>,
    pub exports: HashMap<String, ExternVal>,
}

impl ModuleInstance {
    pub fn export(&self, name: &str) -> Option<ExternVal> {
        self.exports.get(name).copied()
    }

    pub fn sub_type(&self, idx: TypeIdx) -> Option<&SubType> {
        self.module.types.get(idx as usize)
    }

    pub fn composite_type(&self, idx: TypeIdx) -> Option<&CompositeType> {
        self.sub_type(idx).map(|s| &s.composite)
    }

    pub fn func_type(&self, idx: TypeIdx) -> Option<&FuncType> {
        self.composite_type(idx).and_then(CompositeType::as_func)
    }

    pub fn func_addr(&self, idx: u32) -> Option<FuncAddr> {
        self.funcs.get(idx as usize).copied()
    }

    pub fn table_addr(&self, idx: u32) -> Option<TableAddr> {
        self.tables.get(idx as usize).copied()
    }

    pub fn mem_addr(&self, idx: u32) -> Option<MemAddr> {
        self.memories.get(idx as usize).copied()
    }

    pub fn global_addr(&self, idx: u32) -> Option<GlobalAddr> {
        self.globals.get(idx as usize).copied()
    }

    pub fn tag_addr(&self, idx: u32) -> Option<TagAddr> {
        self.tags.get(idx as usize).copied()
    }

    pub fn elem_addr(&self, idx: u32) -> Option<ElemAddr> {
        self.elems.get(idx as usize).copied()
    }

    pub fn data_addr(&self, idx: u32) -> Option<DataAddr> {
        self.datas.get(idx as usize).copied()
    }
}
