//! Storage module: abstraction over key-value backends.
//!
//! Engines: RocksDB (feature "rocksdb-db"), a file-per-key FS store and an in-memory store.
//! Use `storage::open(path, engine)` to create an Arc<dyn KvStore> to pass to other modules.

pub mod traits;
pub mod fs_store;
pub mod mem_store;

#[cfg(feature = "rocksdb")]
pub mod rocksdb_store;

pub use traits::{BatchOp, KvIter, KvStore, WriteBatch};
pub use fs_store::FsKvStore;
pub use mem_store::MemKvStore;

#[cfg(feature = "rocksdb")]
pub use rocksdb_store::RocksKvStore;

use anyhow::Result;
use serde::{Serialize, Deserialize};
use std::path::Path;
use std::sync::Arc;

/// Engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    Fs,
    Memory,
    #[cfg(feature = "rocksdb")]
    RocksDb,
}

impl Default for StorageEngine {
    fn default() -> Self {
        StorageEngine::Fs
    }
}

/// Open a KvStore under `path` with the selected engine
pub fn open(path: impl AsRef<Path>, engine: StorageEngine) -> Result<Arc<dyn KvStore>> {
    match engine {
        StorageEngine::Fs => Ok(Arc::new(FsKvStore::open(path)?)),
        StorageEngine::Memory => Ok(Arc::new(MemKvStore::new())),
        #[cfg(feature = "rocksdb")]
        StorageEngine::RocksDb => Ok(Arc::new(RocksKvStore::open(path)?)),
    }
}
