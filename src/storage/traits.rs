use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Simple KV iterator returned by `scan_prefix`, sorted by key
pub struct KvIter {
    // each item: (key, value)
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
}

/// One operation of a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered put/delete operations applied together by `KvStore::write_batch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Core key-value store trait backing sign-state and the ledger
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Put a key / value
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Get a key
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Delete a key
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Check existence
    async fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Apply a write batch atomically: after a crash either every op is visible or none is,
    /// at the latest once the store has been reopened.
    async fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Scan by prefix. Returns the full match set sorted by key.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<KvIter>;
}
