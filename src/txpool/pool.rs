//! TxPool: in-memory FIFO transaction pool with hash dedup and size limits.
//!
//! Data model:
//! - Tx: opaque bytes (the application decides what they mean)
//! - TxId: SHA-256 of the bytes
//! - Under the hood: a VecDeque in arrival order plus a HashSet index, behind one mutex.
//!
//! Notes:
//! - Proposers take a prefix of the queue (`pending_transactions`), committed blocks evict.
//! - `wait_for_txs` is driven by a tokio `Notify`, woken on every insert.

use crate::consensus::types::Tx;
use crate::consensus::Mempool;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

/// Transaction ID type (SHA-256)
pub type TxId = [u8; 32];

pub fn tx_id(tx: &[u8]) -> TxId {
    Sha256::digest(tx).into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxPoolConfig {
    /// Maximum number of pending transactions.
    pub size: usize,
    pub max_tx_bytes: usize,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self { size: 5000, max_tx_bytes: 64 * 1024 }
    }
}

/// Error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("duplicate tx")]
    Duplicate,
    #[error("pool full")]
    PoolFull,
    #[error("tx of {size} bytes exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("empty tx")]
    Empty,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<(TxId, Tx)>,
    index: HashSet<TxId>,
}

/// The TxPool main struct
pub struct TxPool {
    inner: Mutex<Inner>,
    notify: Notify,
    cfg: TxPoolConfig,
}

impl TxPool {
    pub fn new(cfg: TxPoolConfig) -> Self {
        Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), cfg }
    }

    /// Insert a transaction at the back of the queue.
    pub fn insert(&self, tx: Tx) -> Result<TxId, TxPoolError> {
        if tx.is_empty() {
            return Err(TxPoolError::Empty);
        }
        if tx.len() > self.cfg.max_tx_bytes {
            return Err(TxPoolError::TooLarge { size: tx.len(), limit: self.cfg.max_tx_bytes });
        }
        let id = tx_id(&tx);
        {
            let mut inner = self.inner.lock();
            if inner.index.contains(&id) {
                return Err(TxPoolError::Duplicate);
            }
            if inner.queue.len() >= self.cfg.size {
                return Err(TxPoolError::PoolFull);
            }
            inner.index.insert(id);
            inner.queue.push_back((id, tx));
        }
        trace!(tx = %hex::encode(&id[..4]), "tx admitted");
        self.notify.notify_waiters();
        Ok(id)
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.inner.lock().index.contains(id)
    }
}

#[async_trait]
impl Mempool for TxPool {
    fn pending_transactions(&self, max_bytes: usize) -> Vec<Tx> {
        let inner = self.inner.lock();
        let mut used = 0usize;
        let mut out = Vec::new();
        for (_, tx) in inner.queue.iter() {
            if used + tx.len() > max_bytes {
                break;
            }
            used += tx.len();
            out.push(tx.clone());
        }
        out
    }

    fn evict(&self, committed: &[Tx]) {
        if committed.is_empty() {
            return;
        }
        let ids: HashSet<TxId> = committed.iter().map(|tx| tx_id(tx)).collect();
        let mut inner = self.inner.lock();
        inner.queue.retain(|(id, _)| !ids.contains(id));
        inner.index.retain(|id| !ids.contains(id));
    }

    fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    async fn wait_for_txs(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
