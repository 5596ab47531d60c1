//! Host function ABI. A host function receives the calling frame — the
//! executor, the store, and the caller's module instance — plus the
//! parameter values, and returns result values or an opaque host error.

use std::sync::Arc;

use crate::error::HostError;
use crate::exec::Executor;
use crate::runtime::{MemoryInstance, ModuleInstance, Store, Value};

/// View of the call site handed to every host function.
pub struct CallingFrame<'a> {
    executor: &'a Executor,
    store: &'a Store,
    module: Option<Arc<ModuleInstance>>,
}

impl<'a> CallingFrame<'a> {
    pub(crate) fn new(
        executor: &'a Executor,
        store: &'a Store,
        module: Option<Arc<ModuleInstance>>,
    ) -> Self {
        Self { executor, store, module }
    }

    pub fn executor(&self) -> &Executor {
        self.executor
    }

    pub fn store(&self) -> &Store {
        self.store
    }

    /// The calling module instance; absent when the host function is invoked
    /// directly by the embedder.
    pub fn module(&self) -> Option<&Arc<ModuleInstance>> {
        self.module.as_ref()
    }

    /// Memory `idx` of the calling module.
    pub fn memory(&self, idx: u32) -> Option<Arc<MemoryInstance>> {
        let module = self.module.as_ref()?;
        let addr = module.mem_addr(idx)?;
        self.store.memory(addr)
    }
}

/// A callable registered as a host function instance.
pub trait HostFunc: Send + Sync {
    fn call(&self, frame: &CallingFrame<'_>, params: &[Value]) -> Result<Vec<Value>, HostError>;
}

impl<F> HostFunc for F
where
    F: Fn(&CallingFrame<'_>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync,
{
    fn call(&self, frame: &CallingFrame<'_>, params: &[Value]) -> Result<Vec<Value>, HostError> {
        self(frame, params)
    }
}
