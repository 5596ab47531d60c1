//! Module instantiation, in the order the Wasm specification prescribes:
//! link imports, allocate function/table/memory/tag/global/element/data
//! instances, populate exports, run active segments, then the start
//! function. Initializer expressions run against the partially built
//! instance with only the already-populated index spaces visible. Any
//! failure rolls the store back to its pre-instantiation snapshot.

pub mod component;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ast::module::{DataMode, ElemMode, Module};
use crate::ast::types::{CompositeType, FuncType, ImportDesc, Limits};
use crate::error::{InstantiateError, LinkError, Trap};
use crate::exec::Executor;
use crate::runtime::module::ExternVal;
use crate::runtime::{
    CodeUnit, DataInstance, ElementInstance, FunctionInstance, GlobalInstance, MemoryInstance,
    ModuleAddr, ModuleInstance, Ref, Store, TableInstance, TagInstance, Value,
};
use crate::vm::stack::StackManager;

fn expect_ref(v: Value) -> Result<Ref, InstantiateError> {
    match v {
        Value::Ref(r) => Ok(r),
        _ => Err(InstantiateError::Init(Trap::UnreachableExecuted)),
    }
}

impl Executor {
    pub(crate) fn instantiate(
        &self,
        store: &Store,
        ast: &Arc<Module>,
        name: Option<String>,
    ) -> Result<ModuleAddr, InstantiateError> {
        let _span =
            tracing::debug_span!("instantiate", name = name.as_deref().unwrap_or("<anonymous>"))
                .entered();
        let _guard = store.lock_instantiation();
        let snapshot = store.snapshot();
        match self.instantiate_locked(store, ast, name) {
            Ok(addr) => Ok(addr),
            Err(err) => {
                store.rollback(snapshot);
                Err(err)
            }
        }
    }

    fn instantiate_locked(
        &self,
        store: &Store,
        ast: &Arc<Module>,
        name: Option<String>,
    ) -> Result<ModuleAddr, InstantiateError> {
        let addr = store.next_module_addr();
        let mut inst = ModuleInstance {
            name,
            addr,
            module: ast.clone(),
            funcs: Vec::with_capacity(ast.total_funcs() as usize),
            tables: Vec::with_capacity(ast.total_tables() as usize),
            memories: Vec::with_capacity(ast.total_memories() as usize),
            globals: Vec::with_capacity(ast.total_globals() as usize),
            tags: Vec::with_capacity(ast.total_tags() as usize),
            elems: Vec::with_capacity(ast.elements.len()),
            datas: Vec::with_capacity(ast.data.len()),
            exports: HashMap::new(),
        };

        // 1. Resolve and type-check imports against the registry.
        self.link_imports(store, &mut inst, ast)?;

        // 2a. Defined functions: pre-process each body into a CodeUnit.
        for (def_idx, type_idx) in ast.func_type_indices.iter().enumerate() {
            let ty = self.declared_func_type(ast, *type_idx)?;
            let body = ast
                .codes
                .get(def_idx)
                .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
            let mut locals = Vec::new();
            for decl in &body.locals {
                locals.extend(std::iter::repeat(decl.val_type).take(decl.count as usize));
            }
            let code = Arc::new(CodeUnit::new(*type_idx, locals, body.body.clone()));
            inst.funcs.push(store.alloc_func(FunctionInstance::wasm(ty, addr, code)));
        }

        // 2b. Tables, with their optional element initializer.
        for table in &ast.tables {
            let init = match &table.init {
                Some(expr) => {
                    let ctx = Arc::new(inst.clone());
                    expect_ref(
                        self.eval_const(store, &ctx, &expr.instrs)
                            .map_err(InstantiateError::Init)?,
                    )?
                }
                None => Ref::null(table.ty.elem.heap),
            };
            inst.tables.push(store.alloc_table(TableInstance::new(table.ty, init)));
        }

        // 2c. Memories.
        for mem_ty in &ast.memories {
            inst.memories.push(store.alloc_memory(MemoryInstance::new(*mem_ty)));
        }

        // 2d. Tags.
        for tag in &ast.tags {
            let ty = self.declared_func_type(ast, tag.ty.type_idx)?;
            inst.tags.push(store.alloc_tag(TagInstance::new(ty)));
        }

        // 2e. Globals; each init expression sees the globals defined so far.
        for global in &ast.globals {
            let ctx = Arc::new(inst.clone());
            let init = self
                .eval_const(store, &ctx, &global.init.instrs)
                .map_err(InstantiateError::Init)?;
            inst.globals.push(store.alloc_global(GlobalInstance::new(global.ty, init)));
        }

        // 2f. Element instances: evaluate every item expression.
        for seg in &ast.elements {
            let ctx = Arc::new(inst.clone());
            let mut items = Vec::with_capacity(seg.items.len());
            for item in &seg.items {
                items.push(expect_ref(
                    self.eval_const(store, &ctx, &item.instrs)
                        .map_err(InstantiateError::Init)?,
                )?);
            }
            inst.elems.push(store.alloc_elem(ElementInstance::new(seg.ty, items)));
        }

        // 2g. Data instances.
        for seg in &ast.data {
            inst.datas.push(store.alloc_data(DataInstance::new(seg.init.clone())));
        }

        // 3. Exports.
        for export in &ast.exports {
            use crate::ast::types::ExportDesc;
            let val = match export.desc {
                ExportDesc::Func(i) => inst.funcs.get(i as usize).copied().map(ExternVal::Func),
                ExportDesc::Table(i) => inst.tables.get(i as usize).copied().map(ExternVal::Table),
                ExportDesc::Memory(i) => {
                    inst.memories.get(i as usize).copied().map(ExternVal::Memory)
                }
                ExportDesc::Global(i) => {
                    inst.globals.get(i as usize).copied().map(ExternVal::Global)
                }
                ExportDesc::Tag(i) => inst.tags.get(i as usize).copied().map(ExternVal::Tag),
            }
            .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
            inst.exports.insert(export.name.clone(), val);
        }

        // Commit: from here on the instance is addressable; a failure below
        // still rolls the whole allocation back.
        let (addr, inst) = store.commit_module(inst);

        // 4. Active element and data segments; a trap aborts instantiation.
        for (idx, seg) in ast.elements.iter().enumerate() {
            match &seg.mode {
                ElemMode::Active { table, offset } => {
                    let base = self
                        .eval_const(store, &inst, &offset.instrs)
                        .map_err(InstantiateError::Init)?
                        .as_i32()
                        .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?
                        as u32;
                    let elem = inst
                        .elem_addr(idx as u32)
                        .and_then(|a| store.elem(a))
                        .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
                    let table = inst
                        .table_addr(*table)
                        .and_then(|a| store.table(a))
                        .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
                    let items = elem.items();
                    table
                        .init_from(base, &items, 0, items.len() as u32)
                        .map_err(InstantiateError::Init)?;
                    elem.drop_payload();
                }
                ElemMode::Declarative => {
                    if let Some(elem) = inst.elem_addr(idx as u32).and_then(|a| store.elem(a)) {
                        elem.drop_payload();
                    }
                }
                ElemMode::Passive => {}
            }
        }
        for (idx, seg) in ast.data.iter().enumerate() {
            if let DataMode::Active { memory, offset } = &seg.mode {
                let base = self
                    .eval_const(store, &inst, &offset.instrs)
                    .map_err(InstantiateError::Init)?
                    .as_i32()
                    .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?
                    as u32 as u64;
                let data = inst
                    .data_addr(idx as u32)
                    .and_then(|a| store.data(a))
                    .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
                let mem = inst
                    .mem_addr(*memory)
                    .and_then(|a| store.memory(a))
                    .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
                let bytes = data.bytes();
                mem.init_from(base, &bytes, 0, bytes.len() as u64)
                    .map_err(InstantiateError::Init)?;
                data.drop_payload();
            }
        }

        // 5. Start function.
        if let Some(start) = ast.start {
            let func = inst
                .func_addr(start)
                .ok_or(InstantiateError::Init(Trap::UnreachableExecuted))?;
            let mut sm = StackManager::new();
            self.run_function(store, &mut sm, func, self.stop_token().epoch())
                .map_err(InstantiateError::Init)?;
        }

        if let Some(name) = &inst.name {
            store.register_named(name.clone(), addr);
        }
        debug!(module = addr.index(), "instantiated");
        Ok(addr)
    }

    fn declared_func_type(
        &self,
        ast: &Module,
        type_idx: u32,
    ) -> Result<FuncType, InstantiateError> {
        match ast.types.get(type_idx as usize).map(|s| &s.composite) {
            Some(CompositeType::Func(ft)) => Ok(ft.clone()),
            _ => Err(InstantiateError::Init(Trap::UnreachableExecuted)),
        }
    }

    fn link_imports(
        &self,
        store: &Store,
        inst: &mut ModuleInstance,
        ast: &Module,
    ) -> Result<(), LinkError> {
        for imp in &ast.imports {
            let unknown = || LinkError::UnknownImport {
                module: imp.module.clone(),
                name: imp.name.clone(),
            };
            let exporter = store
                .lookup_named(&imp.module)
                .and_then(|a| store.module(a))
                .ok_or_else(unknown)?;
            let val = exporter.export(&imp.name).ok_or_else(unknown)?;
            let incompatible = |expected: String, found: String| LinkError::IncompatibleImportType {
                module: imp.module.clone(),
                name: imp.name.clone(),
                expected,
                found,
            };
            match (&imp.desc, val) {
                (ImportDesc::Func(type_idx), ExternVal::Func(fa)) => {
                    let expected = self
                        .declared_func_type(ast, *type_idx)
                        .map_err(|_| unknown())?;
                    let func = store.func(fa).ok_or_else(unknown)?;
                    if func.ty() != &expected {
                        return Err(incompatible(
                            format!("{expected:?}"),
                            format!("{:?}", func.ty()),
                        ));
                    }
                    inst.funcs.push(fa);
                }
                (ImportDesc::Table(tt), ExternVal::Table(ta)) => {
                    let table = store.table(ta).ok_or_else(unknown)?;
                    if table.ty().elem != tt.elem {
                        return Err(incompatible(
                            format!("{:?}", tt.elem),
                            format!("{:?}", table.ty().elem),
                        ));
                    }
                    let actual = Limits::new(table.size(), table.ty().limits.max);
                    if !actual.satisfies(&tt.limits) {
                        return Err(LinkError::ImportLimitsExceeded {
                            module: imp.module.clone(),
                            name: imp.name.clone(),
                        });
                    }
                    inst.tables.push(ta);
                }
                (ImportDesc::Memory(mt), ExternVal::Memory(ma)) => {
                    let mem = store.memory(ma).ok_or_else(unknown)?;
                    if mem.ty().shared != mt.shared {
                        return Err(incompatible(
                            format!("shared={}", mt.shared),
                            format!("shared={}", mem.ty().shared),
                        ));
                    }
                    let actual = Limits::new(mem.size_pages(), mem.ty().limits.max);
                    if !actual.satisfies(&mt.limits) {
                        return Err(LinkError::ImportLimitsExceeded {
                            module: imp.module.clone(),
                            name: imp.name.clone(),
                        });
                    }
                    inst.memories.push(ma);
                }
                (ImportDesc::Global(gt), ExternVal::Global(ga)) => {
                    let global = store.global(ga).ok_or_else(unknown)?;
                    if global.ty() != gt {
                        return Err(incompatible(
                            format!("{gt:?}"),
                            format!("{:?}", global.ty()),
                        ));
                    }
                    inst.globals.push(ga);
                }
                (ImportDesc::Tag(tag_ty), ExternVal::Tag(ta)) => {
                    let expected = self
                        .declared_func_type(ast, tag_ty.type_idx)
                        .map_err(|_| unknown())?;
                    let tag = store.tag(ta).ok_or_else(unknown)?;
                    if tag.ty() != &expected {
                        return Err(incompatible(
                            format!("{expected:?}"),
                            format!("{:?}", tag.ty()),
                        ));
                    }
                    inst.tags.push(ta);
                }
                (desc, found) => {
                    let expected = match desc {
                        ImportDesc::Func(_) => "func",
                        ImportDesc::Table(_) => "table",
                        ImportDesc::Memory(_) => "memory",
                        ImportDesc::Global(_) => "global",
                        ImportDesc::Tag(_) => "tag",
                    };
                    return Err(incompatible(expected.into(), found.kind_name().into()));
                }
            }
        }
        Ok(())
    }
}
