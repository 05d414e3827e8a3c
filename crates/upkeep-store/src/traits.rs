//! Store trait definitions

use crate::StoreResult;

/// A single write in a batch. `None` deletes the key.
pub type WriteOp = (String, Option<String>);

/// Writes applied together or not at all
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push((key.into(), Some(value.into())));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push((key.into(), None));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// Process-wide key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read one key
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Apply every write in `batch` atomically, in order
    fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
