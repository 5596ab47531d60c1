//! Function instances: Wasm-defined bodies pre-processed into a `CodeUnit`,
//! host callables, and AOT-compiled entry points.

use std::collections::HashMap;
use std::sync::Arc;

use super::ModuleAddr;
use crate::ast::instr::Instruction;
use crate::ast::types::{FuncType, TypeIdx, ValType};
use crate::exec::proxy::CompiledEntry;
use crate::host::HostFunc;

/// Jump targets of one structured opcode, resolved at instantiation time so
/// the dispatch loop never scans for a matching `else`/`end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTargets {
    /// Position of the `Else` opcode, when the opener is an `If` with one.
    pub else_ip: Option<u32>,
    /// Position of the matching `End` opcode.
    pub end_ip: u32,
}

/// Pre-processed body of a defined function.
#[derive(Debug)]
pub struct CodeUnit {
    pub type_idx: TypeIdx,
    /// Expanded declared locals, params excluded.
    pub locals: Vec<ValType>,
    /// Instruction stream, terminated by the function-level `End`.
    pub body: Arc<[Instruction]>,
    /// ip of each `Block`/`Loop`/`If`/`TryTable`/`Else` to its targets.
    pub targets: HashMap<u32, BlockTargets>,
}

impl CodeUnit {
    pub fn new(type_idx: TypeIdx, locals: Vec<ValType>, body: Vec<Instruction>) -> Self {
        let targets = compute_targets(&body);
        Self { type_idx, locals, body: body.into(), targets }
    }
}

/// One linear pass matching structured openers to their `Else`/`End`. The
/// stream is validated, so every opener has a matching terminator; a
/// malformed tail simply yields no entry and the validated interpreter never
/// asks for one.
pub fn compute_targets(body: &[Instruction]) -> HashMap<u32, BlockTargets> {
    struct Open {
        ip: u32,
        else_ip: Option<u32>,
    }
    let mut targets = HashMap::new();
    let mut open: Vec<Open> = Vec::new();
    for (ip, instr) in body.iter().enumerate() {
        let ip = ip as u32;
        match instr {
            Instruction::Block(_)
            | Instruction::Loop(_)
            | Instruction::If(_)
            | Instruction::TryTable { .. } => {
                open.push(Open { ip, else_ip: None });
            }
            Instruction::Else => {
                if let Some(top) = open.last_mut() {
                    top.else_ip = Some(ip);
                }
            }
            Instruction::End => {
                if let Some(top) = open.pop() {
                    targets.insert(top.ip, BlockTargets { else_ip: top.else_ip, end_ip: ip });
                    if let Some(else_ip) = top.else_ip {
                        targets.insert(else_ip, BlockTargets { else_ip: None, end_ip: ip });
                    }
                }
                // The function-level End has no opener; nothing to record.
            }
            _ => {}
        }
    }
    targets
}

/// The three function flavours the store can hold.
pub enum FuncKind {
    /// A Wasm-defined function: owning module plus its pre-processed body.
    Wasm { module: ModuleAddr, code: Arc<CodeUnit> },
    /// A host function.
    Host { callable: Arc<dyn HostFunc> },
    /// An AOT-compiled function: native entry point, executed through the
    /// intrinsics bridge.
    Compiled { module: ModuleAddr, entry: CompiledEntry },
}

pub struct FunctionInstance {
    ty: FuncType,
    kind: FuncKind,
}

impl FunctionInstance {
    pub fn wasm(ty: FuncType, module: ModuleAddr, code: Arc<CodeUnit>) -> Self {
        Self { ty, kind: FuncKind::Wasm { module, code } }
    }

    pub fn host(ty: FuncType, callable: Arc<dyn HostFunc>) -> Self {
        Self { ty, kind: FuncKind::Host { callable } }
    }

    pub fn compiled(ty: FuncType, module: ModuleAddr, entry: CompiledEntry) -> Self {
        Self { ty, kind: FuncKind::Compiled { module, entry } }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub fn kind(&self) -> &FuncKind {
        &self.kind
    }

    /// Owning module for Wasm and compiled functions; host functions have
    /// none.
    pub fn module(&self) -> Option<ModuleAddr> {
        match &self.kind {
            FuncKind::Wasm { module, .. } | FuncKind::Compiled { module, .. } => Some(*module),
            FuncKind::Host { .. } => None,
        }
    }
}

impl std::fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FuncKind::Wasm { module, code } => f
                .debug_struct("Wasm")
                .field("module", module)
                .field("type_idx", &code.type_idx)
                .finish(),
            FuncKind::Host { .. } => f.debug_struct("Host").field("ty", &self.ty).finish(),
            FuncKind::Compiled { module, .. } => {
                f.debug_struct("Compiled").field("module", module).finish()
            }
        }
    }
}
