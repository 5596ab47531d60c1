//! Validated module AST: index-addressed sections, segments, code bodies.
//! The engine trusts the validator and never re-type-checks this structure.

use super::instr::Instruction;
use super::types::{
    Export, FuncIdx, GlobalType, Import, MemIdx, MemoryType, RefType, SubType, TableIdx, TableType,
    TagType, TypeIdx, ValType,
};

/// Local declarations inside a function body (count repetitions of a type).
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecl {
    pub count: u32,
    pub val_type: ValType,
}

/// A constant initializer expression: a validated, const-evaluable
/// instruction sequence (no terminator).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstExpr {
    pub instrs: Vec<Instruction>,
}

impl ConstExpr {
    pub fn new(instrs: Vec<Instruction>) -> Self {
        Self { instrs }
    }

    pub fn i32(v: i32) -> Self {
        Self::new(vec![Instruction::I32Const(v)])
    }

    pub fn i64(v: i64) -> Self {
        Self::new(vec![Instruction::I64Const(v)])
    }
}

/// Code body for a defined function. The instruction stream is terminated by
/// an `End` marking the function's end, as the parser produces it.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBody {
    pub locals: Vec<LocalDecl>,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

/// Element segment mode.
#[derive(Debug, Clone, PartialEq)]
pub enum ElemMode {
    /// Written into `table` at `offset` during instantiation.
    Active { table: TableIdx, offset: ConstExpr },
    Passive,
    /// Usable only via `ref.func` declarations; dropped immediately.
    Declarative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementSegment {
    pub ty: RefType,
    pub items: Vec<ConstExpr>,
    pub mode: ElemMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Active { memory: MemIdx, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub init: Vec<u8>,
    pub mode: DataMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub ty: TagType,
}

/// The validated module: the input format of the instantiator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub types: Vec<SubType>,
    pub imports: Vec<Import>,
    /// Type indices for each defined (non-imported) function, in order.
    pub func_type_indices: Vec<TypeIdx>,
    pub tables: Vec<TableDef>,
    pub memories: Vec<MemoryType>,
    pub tags: Vec<Tag>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElementSegment>,
    /// Code bodies for defined functions; same length as `func_type_indices`.
    pub codes: Vec<CodeBody>,
    pub data: Vec<DataSegment>,

    // Import counts per index space, precomputed for index arithmetic.
    pub imported_funcs: u32,
    pub imported_tables: u32,
    pub imported_memories: u32,
    pub imported_globals: u32,
    pub imported_tags: u32,
}

/// A defined table: its type plus an optional element initializer (tables of
/// non-nullable references carry one; others default to null-fill).
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub ty: TableType,
    pub init: Option<ConstExpr>,
}

impl Module {
    pub fn total_funcs(&self) -> u32 {
        self.imported_funcs + self.func_type_indices.len() as u32
    }

    pub fn total_tables(&self) -> u32 {
        self.imported_tables + self.tables.len() as u32
    }

    pub fn total_memories(&self) -> u32 {
        self.imported_memories + self.memories.len() as u32
    }

    pub fn total_globals(&self) -> u32 {
        self.imported_globals + self.globals.len() as u32
    }

    pub fn total_tags(&self) -> u32 {
        self.imported_tags + self.tags.len() as u32
    }

    /// Recompute the `imported_*` counters from the import section. Builders
    /// constructing a module by hand call this once at the end.
    pub fn recount_imports(&mut self) {
        use super::types::ImportDesc;
        self.imported_funcs = 0;
        self.imported_tables = 0;
        self.imported_memories = 0;
        self.imported_globals = 0;
        self.imported_tags = 0;
        for imp in &self.imports {
            match imp.desc {
                ImportDesc::Func(_) => self.imported_funcs += 1,
                ImportDesc::Table(_) => self.imported_tables += 1,
                ImportDesc::Memory(_) => self.imported_memories += 1,
                ImportDesc::Global(_) => self.imported_globals += 1,
                ImportDesc::Tag(_) => self.imported_tags += 1,
            }
        }
    }
}
