//! Executor facade: instantiation entry points, synchronous and
//! asynchronous invocation, host-module registration, and cooperative stop.

pub mod hooks;
pub mod proxy;
pub mod stats;
pub mod waiter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::ast::component::Component;
use crate::ast::module::Module;
use crate::ast::types::{FuncType, GlobalType, MemoryType, TableType, ValType};
use crate::config::Config;
use crate::error::{InstantiateError, Trap};
use crate::host::HostFunc;
use crate::runtime::module::ExternVal;
use crate::runtime::{
    ComponentAddr, FuncAddr, FunctionInstance, GlobalInstance, MemoryInstance, ModuleAddr,
    ModuleInstance, Ref, Store, TableInstance, TagInstance, Value,
};
use crate::vm::stack::StackManager;

use hooks::{HookData, HookFn, HostHooks};
use stats::Statistics;
use waiter::WaiterTable;

/// Cooperative-stop token. Stopping bumps an epoch; an invocation records the
/// epoch at entry and aborts once the current epoch moves past it, so a stop
/// interrupts everything in flight without poisoning later invocations.
#[derive(Debug, Default)]
pub struct StopToken {
    epoch: AtomicU64,
}

impl StopToken {
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn trip(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stopped_since(&self, entry_epoch: u64) -> bool {
        self.epoch() != entry_epoch
    }

    pub(crate) fn raw(&self) -> *const AtomicU64 {
        &self.epoch
    }
}

/// An item exported by an embedder-provided host module.
pub enum HostItem {
    Func { ty: FuncType, callable: Arc<dyn HostFunc> },
    Memory(MemoryType),
    Global { ty: GlobalType, init: Value },
    Table { ty: TableType, init: Ref },
    Tag { ty: FuncType },
}

/// The execution engine. One executor can drive any number of stores; all
/// invocation state lives in per-call stack managers.
#[derive(Debug)]
pub struct Executor {
    config: Config,
    stats: Option<Arc<Statistics>>,
    stop: StopToken,
    waiters: WaiterTable,
    hooks: HostHooks,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        let stats = config.stats.any_enabled().then(|| Arc::new(Statistics::new(&config.stats)));
        Self {
            config,
            stats,
            stop: StopToken::default(),
            waiters: WaiterTable::new(),
            hooks: HostHooks::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn statistics(&self) -> Option<&Arc<Statistics>> {
        self.stats.as_ref()
    }

    pub(crate) fn stats(&self) -> Option<&Statistics> {
        self.stats.as_deref()
    }

    pub(crate) fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub(crate) fn waiters(&self) -> &WaiterTable {
        &self.waiters
    }

    pub(crate) fn hooks(&self) -> &HostHooks {
        &self.hooks
    }

    // ===== instantiation =====

    /// Instantiate a module anonymously.
    pub fn instantiate_module(
        &self,
        store: &Store,
        module: &Arc<Module>,
    ) -> Result<ModuleAddr, InstantiateError> {
        self.instantiate(store, module, None)
    }

    /// Instantiate a module and register it by name for future imports.
    pub fn register_module(
        &self,
        store: &Store,
        module: &Arc<Module>,
        name: impl Into<String>,
    ) -> Result<ModuleAddr, InstantiateError> {
        self.instantiate(store, module, Some(name.into()))
    }

    /// Register an already-instantiated module under a name. Re-registering
    /// a name replaces the binding for future instantiations only.
    pub fn register_module_instance(
        &self,
        store: &Store,
        addr: ModuleAddr,
        name: impl Into<String>,
    ) {
        let name = name.into();
        debug!(module = name.as_str(), "register module instance");
        store.register_named(name, addr);
    }

    /// Instantiate a component anonymously.
    pub fn instantiate_component(
        &self,
        store: &Store,
        component: &Arc<Component>,
    ) -> Result<ComponentAddr, InstantiateError> {
        self.instantiate_component_inner(store, component, None)
    }

    /// Instantiate a component and register it by name.
    pub fn register_component(
        &self,
        store: &Store,
        component: &Arc<Component>,
        name: impl Into<String>,
    ) -> Result<ComponentAddr, InstantiateError> {
        self.instantiate_component_inner(store, component, Some(name.into()))
    }

    /// Build a host module whose exports come from the embedder, register it
    /// by name, and return its address.
    pub fn register_host_module(
        &self,
        store: &Store,
        name: impl Into<String>,
        items: Vec<(String, HostItem)>,
    ) -> ModuleAddr {
        let name = name.into();
        let _guard = store.lock_instantiation();
        let addr = store.next_module_addr();
        let mut exports = HashMap::new();
        let mut funcs = Vec::new();
        let mut tables = Vec::new();
        let mut memories = Vec::new();
        let mut globals = Vec::new();
        let mut tags = Vec::new();
        for (export_name, item) in items {
            let val = match item {
                HostItem::Func { ty, callable } => {
                    let a = store.alloc_func(FunctionInstance::host(ty, callable));
                    funcs.push(a);
                    ExternVal::Func(a)
                }
                HostItem::Memory(ty) => {
                    let a = store.alloc_memory(MemoryInstance::new(ty));
                    memories.push(a);
                    ExternVal::Memory(a)
                }
                HostItem::Global { ty, init } => {
                    let a = store.alloc_global(GlobalInstance::new(ty, init));
                    globals.push(a);
                    ExternVal::Global(a)
                }
                HostItem::Table { ty, init } => {
                    let a = store.alloc_table(TableInstance::new(ty, init));
                    tables.push(a);
                    ExternVal::Table(a)
                }
                HostItem::Tag { ty } => {
                    let a = store.alloc_tag(TagInstance::new(ty));
                    tags.push(a);
                    ExternVal::Tag(a)
                }
            };
            exports.insert(export_name, val);
        }
        let inst = ModuleInstance {
            name: Some(name.clone()),
            addr,
            module: Arc::new(Module::default()),
            funcs,
            tables,
            memories,
            globals,
            tags,
            elems: Vec::new(),
            datas: Vec::new(),
            exports,
        };
        let (addr, _) = store.commit_module(inst);
        store.register_named(name, addr);
        addr
    }

    // ===== invocation =====

    /// Invoke a function instance synchronously. Returns each result paired
    /// with its declared type.
    pub fn invoke(
        &self,
        store: &Store,
        func: FuncAddr,
        params: &[Value],
    ) -> Result<Vec<(Value, ValType)>, Trap> {
        let f = store.func(func).ok_or(Trap::UnreachableExecuted)?;
        let ty = f.ty().clone();
        if params.len() != ty.params.len()
            || !params.iter().zip(&ty.params).all(|(v, t)| v.matches_shape(t))
        {
            return Err(Trap::IndirectCallTypeMismatch);
        }
        trace!(func = func.index(), "invoke");
        let started = self
            .stats()
            .filter(|s| s.time_measuring())
            .map(|_| Instant::now());
        let epoch = self.stop.epoch();
        let mut sm = StackManager::new();
        for p in params {
            sm.push(p.clone());
        }
        let outcome = self.run_function(store, &mut sm, func, epoch);
        if let (Some(stats), Some(t0)) = (self.stats(), started) {
            stats.add_wall_time(t0.elapsed().as_nanos() as u64);
        }
        outcome?;
        let results = sm.pop_n(ty.results.len())?;
        Ok(results.into_iter().zip(ty.results.iter().copied()).collect())
    }

    /// Post an invocation to a worker thread; the returned handle is a
    /// cancelable future.
    pub fn async_invoke(
        self: &Arc<Self>,
        store: &Arc<Store>,
        func: FuncAddr,
        params: &[Value],
    ) -> AsyncInvocation {
        let (tx, rx) = mpsc::channel();
        let exec = self.clone();
        let store = store.clone();
        let params = params.to_vec();
        trace!(func = func.index(), "async invoke");
        let handle = std::thread::Builder::new()
            .name("reef-wasm-worker".into())
            .spawn(move || {
                let _ = tx.send(exec.invoke(&store, func, &params));
            })
            .expect("spawn invocation worker");
        AsyncInvocation { rx, handle: Some(handle), exec: self.clone() }
    }

    // ===== host hooks =====

    /// Register the callback invoked before every host-function call.
    pub fn register_pre_host_function(&self, data: HookData, f: HookFn) {
        self.hooks.set_pre(data, f);
    }

    /// Register the callback invoked after every host-function call.
    pub fn register_post_host_function(&self, data: HookData, f: HookFn) {
        self.hooks.set_post(data, f);
    }

    // ===== cancellation =====

    /// Interrupt every invocation in flight: active waits wake and trap, and
    /// interpreter loops trap at their next back-edge. Invocations started
    /// after this call run normally.
    pub fn stop(&self) {
        info!("stop requested");
        self.stop.trip();
        self.waiters.wake_all();
    }
}

/// Handle to an in-flight asynchronous invocation.
pub struct AsyncInvocation {
    rx: mpsc::Receiver<Result<Vec<(Value, ValType)>, Trap>>,
    handle: Option<JoinHandle<()>>,
    exec: Arc<Executor>,
}

impl AsyncInvocation {
    /// Block until the invocation finishes.
    pub fn wait(mut self) -> Result<Vec<(Value, ValType)>, Trap> {
        let result = self.rx.recv().unwrap_or(Err(Trap::Interrupted));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        result
    }

    /// Wait up to `timeout`; gives the handle back on timeout.
    pub fn wait_timeout(
        self,
        timeout: Duration,
    ) -> Result<Result<Vec<(Value, ValType)>, Trap>, AsyncInvocation> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                let mut this = self;
                if let Some(handle) = this.handle.take() {
                    let _ = handle.join();
                }
                Ok(result)
            }
            Err(_) => Err(self),
        }
    }

    /// Cancel the invocation: sets the stop token (interrupting every
    /// invocation in flight on this executor) and waits for the worker.
    pub fn cancel(self) -> Result<Vec<(Value, ValType)>, Trap> {
        self.exec.stop();
        self.wait()
    }
}
