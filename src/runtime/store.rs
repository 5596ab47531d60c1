//! The store: single ownership root for every runtime instance. Arenas are
//! append-only — writers run during instantiation (serialised by the
//! instantiation lock) and during GC allocation; execution reads clone the
//! `Arc` under a read lock and proceed lock-free from there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::component::ComponentInstance;
use super::gc::GcObject;
use super::{
    ComponentAddr, DataAddr, DataInstance, ElemAddr, ElementInstance, FuncAddr, FunctionInstance,
    GcAddr, GlobalAddr, GlobalInstance, MemAddr, MemoryInstance, ModuleAddr, ModuleInstance,
    TableAddr, TableInstance, TagAddr, TagInstance,
};

#[derive(Debug, Default)]
pub struct Store {
    funcs: RwLock<Vec<Arc<FunctionInstance>>>,
    tables: RwLock<Vec<Arc<TableInstance>>>,
    mems: RwLock<Vec<Arc<MemoryInstance>>>,
    globals: RwLock<Vec<Arc<GlobalInstance>>>,
    tags: RwLock<Vec<Arc<TagInstance>>>,
    elems: RwLock<Vec<Arc<ElementInstance>>>,
    datas: RwLock<Vec<Arc<DataInstance>>>,
    modules: RwLock<Vec<Arc<ModuleInstance>>>,
    components: RwLock<Vec<Arc<ComponentInstance>>>,
    gc: RwLock<Vec<Arc<GcObject>>>,
    registry: RwLock<HashMap<String, ModuleAddr>>,
    component_registry: RwLock<HashMap<String, ComponentAddr>>,
    /// Serialises instantiations so reserved module addresses stay stable
    /// and rollback truncation cannot race another instantiation.
    instantiation: Mutex<()>,
}

/// Arena lengths at the start of an instantiation. Rolling back to a
/// snapshot removes everything the failed instantiation allocated. The GC
/// arena is exempt: execution threads allocate there concurrently, and
/// objects orphaned by an aborted instantiation are simply unreachable.
#[derive(Debug, Clone, Copy)]
pub struct StoreSnapshot {
    funcs: usize,
    tables: usize,
    mems: usize,
    globals: usize,
    tags: usize,
    elems: usize,
    datas: usize,
    modules: usize,
    components: usize,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Taken for the whole of an instantiation.
    pub(crate) fn lock_instantiation(&self) -> MutexGuard<'_, ()> {
        self.instantiation.lock().expect("instantiation lock")
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            funcs: self.funcs.read().expect("store lock").len(),
            tables: self.tables.read().expect("store lock").len(),
            mems: self.mems.read().expect("store lock").len(),
            globals: self.globals.read().expect("store lock").len(),
            tags: self.tags.read().expect("store lock").len(),
            elems: self.elems.read().expect("store lock").len(),
            datas: self.datas.read().expect("store lock").len(),
            modules: self.modules.read().expect("store lock").len(),
            components: self.components.read().expect("store lock").len(),
        }
    }

    pub(crate) fn rollback(&self, snap: StoreSnapshot) {
        self.funcs.write().expect("store lock").truncate(snap.funcs);
        self.tables.write().expect("store lock").truncate(snap.tables);
        self.mems.write().expect("store lock").truncate(snap.mems);
        self.globals.write().expect("store lock").truncate(snap.globals);
        self.tags.write().expect("store lock").truncate(snap.tags);
        self.elems.write().expect("store lock").truncate(snap.elems);
        self.datas.write().expect("store lock").truncate(snap.datas);
        self.modules.write().expect("store lock").truncate(snap.modules);
        self.components.write().expect("store lock").truncate(snap.components);
    }

    // ===== allocation =====

    pub fn alloc_func(&self, f: FunctionInstance) -> FuncAddr {
        let mut funcs = self.funcs.write().expect("store lock");
        let addr = FuncAddr(funcs.len());
        funcs.push(Arc::new(f));
        addr
    }

    pub fn alloc_table(&self, t: TableInstance) -> TableAddr {
        let mut tables = self.tables.write().expect("store lock");
        let addr = TableAddr(tables.len());
        tables.push(Arc::new(t));
        addr
    }

    pub fn alloc_memory(&self, m: MemoryInstance) -> MemAddr {
        let mut mems = self.mems.write().expect("store lock");
        let addr = MemAddr(mems.len());
        mems.push(Arc::new(m));
        addr
    }

    pub fn alloc_global(&self, g: GlobalInstance) -> GlobalAddr {
        let mut globals = self.globals.write().expect("store lock");
        let addr = GlobalAddr(globals.len());
        globals.push(Arc::new(g));
        addr
    }

    pub fn alloc_tag(&self, t: TagInstance) -> TagAddr {
        let mut tags = self.tags.write().expect("store lock");
        let addr = TagAddr(tags.len());
        tags.push(Arc::new(t));
        addr
    }

    pub fn alloc_elem(&self, e: ElementInstance) -> ElemAddr {
        let mut elems = self.elems.write().expect("store lock");
        let addr = ElemAddr(elems.len());
        elems.push(Arc::new(e));
        addr
    }

    pub fn alloc_data(&self, d: DataInstance) -> DataAddr {
        let mut datas = self.datas.write().expect("store lock");
        let addr = DataAddr(datas.len());
        datas.push(Arc::new(d));
        addr
    }

    /// Address the next committed module will get. Stable while the
    /// instantiation lock is held.
    pub(crate) fn next_module_addr(&self) -> ModuleAddr {
        ModuleAddr(self.modules.read().expect("store lock").len())
    }

    pub(crate) fn commit_module(&self, m: ModuleInstance) -> (ModuleAddr, Arc<ModuleInstance>) {
        let mut modules = self.modules.write().expect("store lock");
        let addr = ModuleAddr(modules.len());
        debug_assert_eq!(addr, m.addr);
        let inst = Arc::new(m);
        modules.push(inst.clone());
        (addr, inst)
    }

    pub(crate) fn commit_component(&self, c: ComponentInstance) -> (ComponentAddr, Arc<ComponentInstance>) {
        let mut components = self.components.write().expect("store lock");
        let addr = ComponentAddr(components.len());
        let mut c = c;
        c.addr = addr;
        let inst = Arc::new(c);
        components.push(inst.clone());
        (addr, inst)
    }

    pub fn alloc_gc(&self, obj: GcObject) -> GcAddr {
        let mut gc = self.gc.write().expect("store lock");
        let addr = GcAddr(gc.len());
        gc.push(Arc::new(obj));
        addr
    }

    // ===== lookup =====

    pub fn func(&self, addr: FuncAddr) -> Option<Arc<FunctionInstance>> {
        self.funcs.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn table(&self, addr: TableAddr) -> Option<Arc<TableInstance>> {
        self.tables.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn memory(&self, addr: MemAddr) -> Option<Arc<MemoryInstance>> {
        self.mems.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn global(&self, addr: GlobalAddr) -> Option<Arc<GlobalInstance>> {
        self.globals.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn tag(&self, addr: TagAddr) -> Option<Arc<TagInstance>> {
        self.tags.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn elem(&self, addr: ElemAddr) -> Option<Arc<ElementInstance>> {
        self.elems.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn data(&self, addr: DataAddr) -> Option<Arc<DataInstance>> {
        self.datas.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn module(&self, addr: ModuleAddr) -> Option<Arc<ModuleInstance>> {
        self.modules.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn component(&self, addr: ComponentAddr) -> Option<Arc<ComponentInstance>> {
        self.components.read().expect("store lock").get(addr.index()).cloned()
    }

    pub fn gc_object(&self, addr: GcAddr) -> Option<Arc<GcObject>> {
        self.gc.read().expect("store lock").get(addr.index()).cloned()
    }

    // ===== registry =====

    /// Bind a name to a module instance. Re-registering a name replaces the
    /// binding; existing instances keep the imports they already resolved.
    pub fn register_named(&self, name: impl Into<String>, addr: ModuleAddr) {
        self.registry.write().expect("store lock").insert(name.into(), addr);
    }

    pub fn lookup_named(&self, name: &str) -> Option<ModuleAddr> {
        self.registry.read().expect("store lock").get(name).copied()
    }

    pub fn unregister_named(&self, name: &str) -> Option<ModuleAddr> {
        self.registry.write().expect("store lock").remove(name)
    }

    pub fn register_component_named(&self, name: impl Into<String>, addr: ComponentAddr) {
        self.component_registry
            .write()
            .expect("store lock")
            .insert(name.into(), addr);
    }

    pub fn lookup_component_named(&self, name: &str) -> Option<ComponentAddr> {
        self.component_registry.read().expect("store lock").get(name).copied()
    }

    /// Drop everything: all instances, the GC arena, and both registries.
    pub fn reset(&self) {
        self.funcs.write().expect("store lock").clear();
        self.tables.write().expect("store lock").clear();
        self.mems.write().expect("store lock").clear();
        self.globals.write().expect("store lock").clear();
        self.tags.write().expect("store lock").clear();
        self.elems.write().expect("store lock").clear();
        self.datas.write().expect("store lock").clear();
        self.modules.write().expect("store lock").clear();
        self.components.write().expect("store lock").clear();
        self.gc.write().expect("store lock").clear();
        self.registry.write().expect("store lock").clear();
        self.component_registry.write().expect("store lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{GlobalType, ValType};
    use crate::runtime::value::Value;

    #[test]
    fn alloc_and_rollback() {
        let store = Store::new();
        let snap = store.snapshot();
        let g = store.alloc_global(GlobalInstance::new(
            GlobalType::new(ValType::I32, true),
            Value::I32(1),
        ));
        assert!(store.global(g).is_some());
        store.rollback(snap);
        assert!(store.global(g).is_none());
    }

    #[test]
    fn registry_replaces() {
        let store = Store::new();
        store.register_named("m", ModuleAddr(0));
        store.register_named("m", ModuleAddr(1));
        assert_eq!(store.lookup_named("m"), Some(ModuleAddr(1)));
        assert_eq!(store.lookup_named("absent"), None);
    }
}
