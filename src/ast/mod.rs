//! Validated-input AST consumed by the engine: types, module structure, the
//! abstract instruction stream, and the component variant.

pub mod component;
pub mod instr;
pub mod module;
pub mod types;

pub use instr::Instruction;
pub use module::{CodeBody, ConstExpr, Module};
pub use types::{FuncType, ValType};
