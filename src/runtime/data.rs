//! Data instance: an immutable byte payload that `data.drop` empties while
//! the descriptor itself stays put for index stability.

use std::sync::RwLock;

#[derive(Debug)]
pub struct DataInstance {
    bytes: RwLock<std::sync::Arc<[u8]>>,
}

impl DataInstance {
    pub fn new(init: Vec<u8>) -> Self {
        Self { bytes: RwLock::new(init.into()) }
    }

    /// Current payload; an empty slice once dropped.
    pub fn bytes(&self) -> std::sync::Arc<[u8]> {
        self.bytes.read().expect("data lock").clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.read().expect("data lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `data.drop`: release the payload; observable as empty afterwards.
    pub fn drop_payload(&self) {
        *self.bytes.write().expect("data lock") = Vec::new().into();
    }
}
