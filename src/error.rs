//! Crate-level error types: runtime traps, link errors, instantiation errors,
//! and opaque host-function errors.

use thiserror::Error;

/// Opaque wrapper around an error returned by a host function. The payload is
/// preserved untouched through frame unwinding so the embedder gets back
/// exactly what its host function produced.
#[derive(Debug, Error)]
#[error("host error: {0}")]
pub struct HostError(pub Box<dyn std::error::Error + Send + Sync>);

impl HostError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HostError(Box::new(err))
    }

    /// Wrap a plain message as a host error.
    pub fn msg(msg: impl Into<String>) -> Self {
        #[derive(Debug, Error)]
        #[error("{0}")]
        struct Msg(String);
        HostError(Box::new(Msg(msg.into())))
    }
}

/// A runtime fault. Terminates the current invocation unless caught by a
/// matching `try_table` handler (only `UncaughtException` is produced by the
/// exception machinery itself; the rest unwind to the invocation boundary).
#[derive(Debug, Error)]
pub enum Trap {
    #[error("out of bounds memory or table access")]
    OutOfBounds,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("integer divide by zero")]
    IntegerDivideByZero,

    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,

    #[error("unreachable executed")]
    UnreachableExecuted,

    #[error("null reference")]
    NullReference,

    #[error("cast failure")]
    CastFailure,

    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,

    #[error("uninitialized element")]
    UninitializedElement,

    #[error("call stack exhausted")]
    StackOverflow,

    #[error("execution interrupted")]
    Interrupted,

    #[error("cost limit exceeded")]
    CostLimitExceeded,

    #[error("uncaught wasm exception")]
    UncaughtException,

    /// Host errors propagate through the same channel as traps but keep the
    /// host payload intact for the embedder.
    #[error(transparent)]
    Host(#[from] HostError),
}

impl Trap {
    /// Numeric code used by the compiled-code bridge (`proxy_trap`). Codes are
    /// stable: compiled modules embed them.
    pub fn code(&self) -> u32 {
        match self {
            Trap::OutOfBounds => 1,
            Trap::IntegerOverflow => 2,
            Trap::IntegerDivideByZero => 3,
            Trap::InvalidConversionToInteger => 4,
            Trap::UnreachableExecuted => 5,
            Trap::NullReference => 6,
            Trap::CastFailure => 7,
            Trap::IndirectCallTypeMismatch => 8,
            Trap::UninitializedElement => 9,
            Trap::StackOverflow => 10,
            Trap::Interrupted => 11,
            Trap::CostLimitExceeded => 12,
            Trap::UncaughtException => 13,
            Trap::Host(_) => 14,
        }
    }

    pub fn from_code(code: u32) -> Trap {
        match code {
            1 => Trap::OutOfBounds,
            2 => Trap::IntegerOverflow,
            3 => Trap::IntegerDivideByZero,
            4 => Trap::InvalidConversionToInteger,
            6 => Trap::NullReference,
            7 => Trap::CastFailure,
            8 => Trap::IndirectCallTypeMismatch,
            9 => Trap::UninitializedElement,
            10 => Trap::StackOverflow,
            11 => Trap::Interrupted,
            12 => Trap::CostLimitExceeded,
            13 => Trap::UncaughtException,
            _ => Trap::UnreachableExecuted,
        }
    }
}

/// Instantiation-time import resolution failure.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown import: {module}.{name}")]
    UnknownImport { module: String, name: String },

    #[error("incompatible import type for {module}.{name}: expected {expected}, found {found}")]
    IncompatibleImportType {
        module: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error("import limits exceeded for {module}.{name}")]
    ImportLimitsExceeded { module: String, name: String },
}

/// Failure while building a module or component instance. A trap raised by a
/// segment initializer or the start function is tagged as having occurred
/// during instantiation; the store is rolled back before this is returned.
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("trap occurred during instantiation: {0}")]
    Init(#[source] Trap),
}
