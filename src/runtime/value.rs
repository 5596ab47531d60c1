//! Runtime values and references. Floats are stored as raw IEEE-754 bits so
//! NaN payloads survive every pass through the stack, memory, and globals.

use std::any::Any;
use std::sync::Arc;

use super::{FuncAddr, GcAddr, TagAddr};
use crate::ast::types::{HeapType, RefType, StorageType, ValType};

/// Opaque host pointer carried by `externref` values. Reference identity is
/// pointer identity.
#[derive(Clone)]
pub struct ExternRef(pub Arc<dyn Any + Send + Sync>);

impl ExternRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        ExternRef(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for ExternRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExternRef({:p})", Arc::as_ptr(&self.0))
    }
}

/// A thrown Wasm exception: tag identity plus the payload values.
#[derive(Debug, Clone)]
pub struct Exception {
    pub tag: TagAddr,
    pub payload: Vec<Value>,
}

/// Reference variant. Every non-null reference carries (or reaches through
/// its target) its dynamic type, so `ref.test`/`ref.cast` stay well-defined
/// after the value has moved through tables, globals, and GC fields.
#[derive(Debug, Clone)]
pub enum Ref {
    /// Null of the given heap-type hierarchy.
    Null(HeapType),
    Func(FuncAddr),
    Extern(ExternRef),
    Struct(GcAddr),
    Array(GcAddr),
    /// Unboxed 31-bit integer, stored zero-extended in the low bits.
    I31(u32),
    Exn(Arc<Exception>),
}

impl Ref {
    pub fn null(heap: HeapType) -> Ref {
        Ref::Null(heap.bottom())
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Ref::Null(_))
    }

    /// Reference identity as observed by `ref.eq`.
    pub fn ref_eq(&self, other: &Ref) -> bool {
        match (self, other) {
            (Ref::Null(_), Ref::Null(_)) => true,
            (Ref::Func(a), Ref::Func(b)) => a == b,
            (Ref::Struct(a), Ref::Struct(b)) => a == b,
            (Ref::Array(a), Ref::Array(b)) => a == b,
            (Ref::I31(a), Ref::I31(b)) => a == b,
            (Ref::Extern(a), Ref::Extern(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Ref::Exn(a), Ref::Exn(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.ref_eq(other)
    }
}

/// Runtime value variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    /// Raw bits.
    F32(u32),
    /// Raw bits.
    F64(u64),
    V128(u128),
    Ref(Ref),
}

impl Value {
    /// Default (zero/null) value for a type.
    pub fn default_for(ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0),
            ValType::F64 => Value::F64(0),
            ValType::V128 => Value::V128(0),
            ValType::Ref(rt) => Value::Ref(Ref::null(rt.heap)),
        }
    }

    /// Default value for a storage type (packed fields default to zero i32).
    pub fn default_for_storage(st: &StorageType) -> Value {
        match st {
            StorageType::Val(v) => Value::default_for(*v),
            StorageType::I8 | StorageType::I16 => Value::I32(0),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32_bits(&self) -> Option<u32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64_bits(&self) -> Option<u64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<&Ref> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// True when the value's runtime representation matches `ty`'s shape.
    /// Only the variant is compared; reference typing is dynamic.
    pub fn matches_shape(&self, ty: &ValType) -> bool {
        matches!(
            (self, ty),
            (Value::I32(_), ValType::I32)
                | (Value::I64(_), ValType::I64)
                | (Value::F32(_), ValType::F32)
                | (Value::F64(_), ValType::F64)
                | (Value::V128(_), ValType::V128)
                | (Value::Ref(_), ValType::Ref(_))
        )
    }

    /// The static type of this value as far as the variant determines it.
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::Ref(r) => ValType::Ref(RefType {
                nullable: r.is_null(),
                heap: match r {
                    Ref::Null(h) => *h,
                    Ref::Func(_) => HeapType::Func,
                    Ref::Extern(_) => HeapType::Extern,
                    Ref::Struct(_) => HeapType::Struct,
                    Ref::Array(_) => HeapType::Array,
                    Ref::I31(_) => HeapType::I31,
                    Ref::Exn(_) => HeapType::Exn,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(Value::default_for(ValType::I64), Value::I64(0));
        let null = Value::default_for(ValType::Ref(RefType::FUNCREF));
        assert!(matches!(null, Value::Ref(Ref::Null(HeapType::NoFunc))));
    }

    #[test]
    fn ref_identity() {
        let a = Ref::Struct(GcAddr(3));
        assert!(a.ref_eq(&Ref::Struct(GcAddr(3))));
        assert!(!a.ref_eq(&Ref::Struct(GcAddr(4))));
        assert!(Ref::Null(HeapType::None).ref_eq(&Ref::Null(HeapType::NoFunc)));
        let e1 = Ref::Extern(ExternRef::new(7u32));
        let e2 = e1.clone();
        assert!(e1.ref_eq(&e2));
        assert!(!e1.ref_eq(&Ref::Extern(ExternRef::new(7u32))));
    }

    #[test]
    fn nan_bits_survive() {
        let v = Value::F32(0x7FC0_0001);
        assert_eq!(v.as_f32_bits(), Some(0x7FC0_0001));
    }
}
