//! Shared helpers for the integration tests: a small module builder and
//! invocation shorthands.

#![allow(dead_code)]

use std::sync::Arc;

use reef_wasm::ast::instr::Instruction;
use reef_wasm::ast::module::{
    CodeBody, ConstExpr, DataMode, DataSegment, ElemMode, ElementSegment, Global, LocalDecl,
    Module, TableDef, Tag,
};
use reef_wasm::ast::types::{
    Export, ExportDesc, FuncType, GlobalType, Import, ImportDesc, Limits, MemoryType, RefType,
    SubType, TableType, TagType, ValType,
};
use reef_wasm::{
    CallingFrame, Config, Executor, ExternVal, FuncAddr, HostError, HostFunc, ModuleAddr, Store,
    Trap, Value,
};

/// Constrain a closure into a host-function object.
pub fn host_fn<F>(f: F) -> Arc<dyn HostFunc>
where
    F: Fn(&CallingFrame<'_>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self { module: Module::default() }
    }

    pub fn ty(&mut self, sub: SubType) -> u32 {
        self.module.types.push(sub);
        (self.module.types.len() - 1) as u32
    }

    pub fn func_type(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        self.ty(SubType::final_func(FuncType::new(params, results)))
    }

    /// Imports must be declared before the first definition of their index
    /// space.
    pub fn import_func(&mut self, module: &str, name: &str, type_idx: u32) -> u32 {
        self.module.imports.push(Import {
            module: module.into(),
            name: name.into(),
            desc: ImportDesc::Func(type_idx),
        });
        self.module.imported_funcs += 1;
        self.module.imported_funcs - 1
    }

    pub fn import_memory(&mut self, module: &str, name: &str, ty: MemoryType) -> u32 {
        self.module.imports.push(Import {
            module: module.into(),
            name: name.into(),
            desc: ImportDesc::Memory(ty),
        });
        self.module.imported_memories += 1;
        self.module.imported_memories - 1
    }

    pub fn import_global(&mut self, module: &str, name: &str, ty: GlobalType) -> u32 {
        self.module.imports.push(Import {
            module: module.into(),
            name: name.into(),
            desc: ImportDesc::Global(ty),
        });
        self.module.imported_globals += 1;
        self.module.imported_globals - 1
    }

    /// Define a function; the terminating `End` is appended here.
    pub fn func(&mut self, type_idx: u32, locals: Vec<ValType>, mut body: Vec<Instruction>) -> u32 {
        body.push(Instruction::End);
        let idx = self.module.imported_funcs + self.module.func_type_indices.len() as u32;
        self.module.func_type_indices.push(type_idx);
        self.module.codes.push(CodeBody {
            locals: locals
                .into_iter()
                .map(|val_type| LocalDecl { count: 1, val_type })
                .collect(),
            body,
        });
        idx
    }

    pub fn memory(&mut self, min: u32, max: Option<u32>) -> u32 {
        self.module.memories.push(MemoryType::new(min, max));
        self.module.imported_memories + self.module.memories.len() as u32 - 1
    }

    pub fn shared_memory(&mut self, min: u32, max: u32) -> u32 {
        self.module.memories.push(MemoryType::shared(min, max));
        self.module.imported_memories + self.module.memories.len() as u32 - 1
    }

    pub fn table(&mut self, elem: RefType, min: u32, max: Option<u32>) -> u32 {
        self.module.tables.push(TableDef {
            ty: TableType { elem, limits: Limits::new(min, max) },
            init: None,
        });
        self.module.imported_tables + self.module.tables.len() as u32 - 1
    }

    pub fn global(&mut self, ty: GlobalType, init: ConstExpr) -> u32 {
        self.module.globals.push(Global { ty, init });
        self.module.imported_globals + self.module.globals.len() as u32 - 1
    }

    pub fn tag(&mut self, type_idx: u32) -> u32 {
        self.module.tags.push(Tag { ty: TagType { type_idx } });
        self.module.imported_tags + self.module.tags.len() as u32 - 1
    }

    pub fn active_elem(&mut self, table: u32, offset: i32, func_indices: Vec<u32>) -> u32 {
        self.module.elements.push(ElementSegment {
            ty: RefType::FUNCREF,
            items: func_indices
                .into_iter()
                .map(|f| ConstExpr::new(vec![Instruction::RefFunc(f)]))
                .collect(),
            mode: ElemMode::Active { table, offset: ConstExpr::i32(offset) },
        });
        self.module.elements.len() as u32 - 1
    }

    pub fn passive_elem(&mut self, func_indices: Vec<u32>) -> u32 {
        self.module.elements.push(ElementSegment {
            ty: RefType::FUNCREF,
            items: func_indices
                .into_iter()
                .map(|f| ConstExpr::new(vec![Instruction::RefFunc(f)]))
                .collect(),
            mode: ElemMode::Passive,
        });
        self.module.elements.len() as u32 - 1
    }

    pub fn active_data(&mut self, memory: u32, offset: i32, bytes: Vec<u8>) -> u32 {
        self.module.data.push(DataSegment {
            init: bytes,
            mode: DataMode::Active { memory, offset: ConstExpr::i32(offset) },
        });
        self.module.data.len() as u32 - 1
    }

    pub fn passive_data(&mut self, bytes: Vec<u8>) -> u32 {
        self.module.data.push(DataSegment { init: bytes, mode: DataMode::Passive });
        self.module.data.len() as u32 - 1
    }

    pub fn export_func(&mut self, name: &str, idx: u32) -> &mut Self {
        self.module.exports.push(Export { name: name.into(), desc: ExportDesc::Func(idx) });
        self
    }

    pub fn export_memory(&mut self, name: &str, idx: u32) -> &mut Self {
        self.module.exports.push(Export { name: name.into(), desc: ExportDesc::Memory(idx) });
        self
    }

    pub fn export_global(&mut self, name: &str, idx: u32) -> &mut Self {
        self.module.exports.push(Export { name: name.into(), desc: ExportDesc::Global(idx) });
        self
    }

    pub fn start(&mut self, func: u32) -> &mut Self {
        self.module.start = Some(func);
        self
    }

    pub fn build(self) -> Arc<Module> {
        Arc::new(self.module)
    }
}

pub fn engine() -> (Executor, Store) {
    (Executor::new(Config::default()), Store::new())
}

pub fn export_func(store: &Store, module: ModuleAddr, name: &str) -> FuncAddr {
    match store.module(module).and_then(|m| m.export(name)) {
        Some(ExternVal::Func(f)) => f,
        other => panic!("export {name} is not a function: {other:?}"),
    }
}

pub fn invoke(
    exec: &Executor,
    store: &Store,
    module: ModuleAddr,
    name: &str,
    args: &[Value],
) -> Result<Vec<Value>, Trap> {
    let func = export_func(store, module, name);
    Ok(exec
        .invoke(store, func, args)?
        .into_iter()
        .map(|(v, _)| v)
        .collect())
}

/// Invoke an export that returns exactly one value.
pub fn invoke1(
    exec: &Executor,
    store: &Store,
    module: ModuleAddr,
    name: &str,
    args: &[Value],
) -> Result<Value, Trap> {
    let mut results = invoke(exec, store, module, name, args)?;
    assert_eq!(results.len(), 1, "expected a single result");
    Ok(results.remove(0))
}
