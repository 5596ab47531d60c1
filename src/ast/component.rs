//! Component AST: the validated component-model input format. Sections are
//! processed in order by the component instantiator; each section kind has a
//! dedicated handler there.

use std::sync::Arc;

use super::module::Module;

/// Component-model value type (the subset whose canonical ABI this engine
/// implements).
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValType {
    Bool,
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
    F32,
    F64,
    Char,
    String,
    List(Box<ComponentValType>),
    Record(Vec<(String, ComponentValType)>),
    Tuple(Vec<ComponentValType>),
    Option(Box<ComponentValType>),
    Result {
        ok: Option<Box<ComponentValType>>,
        err: Option<Box<ComponentValType>>,
    },
    Flags(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComponentFuncType {
    pub params: Vec<(String, ComponentValType)>,
    pub result: Option<ComponentValType>,
}

/// Component-level defined types. Only function types participate in
/// lifting/lowering.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentType {
    Func(ComponentFuncType),
}

/// Sort of a core item aliased out of a core instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSort {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

/// Argument to a core-instance instantiation: a previously created core
/// instance supplied under an import name.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreInstantiateArg {
    pub name: String,
    pub instance: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreInstance {
    /// Instantiate core module `module` with the given instance arguments.
    Instantiate {
        module: u32,
        args: Vec<CoreInstantiateArg>,
    },
    /// Synthesize an instance from individual aliased core items.
    FromExports(Vec<CoreExportDecl>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreExportDecl {
    pub name: String,
    pub sort: CoreSort,
    pub idx: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alias {
    /// Alias an export of core instance `instance` into the matching core
    /// index space.
    CoreInstanceExport {
        instance: u32,
        name: String,
        sort: CoreSort,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    #[default]
    Utf8,
}

/// Canonical-ABI options attached to lift/lower.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonOpts {
    /// Core memory index used for indirect values.
    pub memory: Option<u32>,
    /// Core function index of the `realloc` export.
    pub realloc: Option<u32>,
    /// Core function index of the `post-return` export.
    pub post_return: Option<u32>,
    pub string_encoding: StringEncoding,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Canon {
    /// Lift core function `core_func` to the component function type `ty`.
    Lift {
        core_func: u32,
        ty: u32,
        opts: CanonOpts,
    },
    /// Lower component function `func` into a core function.
    Lower { func: u32, opts: CanonOpts },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentStart {
    pub func: u32,
}

/// Component import: resolved against the store registry by name; the named
/// module instance joins the core-instance index space.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentImport {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentSort {
    Func,
    CoreInstance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentExport {
    pub name: String,
    pub sort: ComponentSort,
    pub idx: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentSection {
    CoreModule(Arc<Module>),
    CoreInstance(CoreInstance),
    Alias(Alias),
    Type(ComponentType),
    Canon(Canon),
    Start(ComponentStart),
    Import(ComponentImport),
    Export(ComponentExport),
}

/// The validated component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Component {
    pub sections: Vec<ComponentSection>,
}
