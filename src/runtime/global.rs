//! Global instance: declared type plus the current value.

use std::sync::RwLock;

use super::value::Value;
use crate::ast::types::GlobalType;

#[derive(Debug)]
pub struct GlobalInstance {
    ty: GlobalType,
    val: RwLock<Value>,
}

impl GlobalInstance {
    pub fn new(ty: GlobalType, init: Value) -> Self {
        Self { ty, val: RwLock::new(init) }
    }

    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }

    pub fn get(&self) -> Value {
        self.val.read().expect("global lock").clone()
    }

    /// Write the value. Mutability was checked by validation; imports are
    /// additionally checked at link time.
    pub fn set(&self, v: Value) {
        *self.val.write().expect("global lock") = v;
    }
}
