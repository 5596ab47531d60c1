//! reef-wasm: the execution core of a WebAssembly virtual machine.
//!
//! The crate takes a validated module AST, instantiates it against a store,
//! and executes it — by interpretation, or through the intrinsics bridge for
//! ahead-of-time-compiled code. It covers the full instruction set
//! (control, numeric, reference, GC, table, memory, SIMD, atomics),
//! shared-memory wait/notify across threads, and cooperative cancellation
//! via a stop token.
//!
//! The parser/validator producing the AST, host-module plug-ins, the code
//! generator itself, and WASI bindings are external collaborators; this
//! crate is only the engine they plug into.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reef_wasm::{Config, Executor, Store, Value};
//!
//! # fn build_module() -> Arc<reef_wasm::ast::Module> { unimplemented!() }
//! let executor = Executor::new(Config::default());
//! let store = Store::new();
//! let module = build_module();
//! let addr = executor.instantiate_module(&store, &module)?;
//! let add = store
//!     .module(addr)
//!     .and_then(|m| m.export("add"))
//!     .and_then(|e| match e {
//!         reef_wasm::ExternVal::Func(f) => Some(f),
//!         _ => None,
//!     })
//!     .expect("export");
//! let results = executor.invoke(&store, add, &[Value::I32(2), Value::I32(3)])?;
//! assert_eq!(results[0].0, Value::I32(5));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod ast;
pub mod config;
pub mod error;
pub mod exec;
pub mod host;
pub mod instantiate;
pub mod runtime;
pub mod vm;

pub use config::{Config, Proposals, StatsConfig};
pub use error::{HostError, InstantiateError, LinkError, Trap};
pub use exec::proxy::{CompiledEntry, ExecutionContext, IntrinsicsTable, RawVal, INTRINSICS};
pub use exec::stats::{CostClass, Statistics};
pub use exec::{AsyncInvocation, Executor, HostItem, StopToken};
pub use host::{CallingFrame, HostFunc};
pub use runtime::component::{ComponentFunction, ComponentValue};
pub use runtime::module::ExternVal;
pub use runtime::{
    ComponentAddr, FuncAddr, GlobalAddr, MemAddr, ModuleAddr, Ref, Store, TableAddr, TagAddr,
    Value,
};
