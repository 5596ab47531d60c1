//! Element instance: evaluated element items plus the dropped flag.

use std::sync::RwLock;

use super::value::Ref;
use crate::ast::types::RefType;

#[derive(Debug)]
pub struct ElementInstance {
    ty: RefType,
    items: RwLock<std::sync::Arc<[Ref]>>,
}

impl ElementInstance {
    pub fn new(ty: RefType, items: Vec<Ref>) -> Self {
        Self { ty, items: RwLock::new(items.into()) }
    }

    pub fn ty(&self) -> &RefType {
        &self.ty
    }

    /// Current items; empty once dropped.
    pub fn items(&self) -> std::sync::Arc<[Ref]> {
        self.items.read().expect("elem lock").clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().expect("elem lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `elem.drop`: release the payload; the descriptor persists.
    pub fn drop_payload(&self) {
        *self.items.write().expect("elem lock") = Vec::new().into();
    }
}
