//! Tag instance: an exception tag with its parameter signature. Tag identity
//! is the store address; two tags with equal signatures are still distinct.

use crate::ast::types::FuncType;

#[derive(Debug, Clone)]
pub struct TagInstance {
    ty: FuncType,
}

impl TagInstance {
    pub fn new(ty: FuncType) -> Self {
        Self { ty }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub fn param_count(&self) -> usize {
        self.ty.params.len()
    }
}
