pub mod blockstore;

use crate::consensus::types::{AppHash, Block, BlockId, CommitSeal, Height};
use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::Application;
use crate::storage::KvStore;
use crate::utils::errors::AppError;
use async_trait::async_trait;
use blockstore::{BlockStore, Tip};
use parking_lot::RwLock;
use sha2::{Sha256, Digest};
use std::sync::Arc;
use tracing::debug;

/// Ledger service that stores finalized blocks and chains the application hash.
///
/// `app_hash(h) = sha256(app_hash(h-1) || block_id || txs)`, with an all-zero hash before
/// genesis. A block is accepted only at `tip + 1`, on top of the tip, with a commit seal
/// from the validator set.
pub struct Ledger {
    store: BlockStore,
    validators: ValidatorSet,
    tip: RwLock<Option<Tip>>,
}

impl Ledger {
    pub async fn open(kv: Arc<dyn KvStore>, validators: ValidatorSet) -> anyhow::Result<Self> {
        let store = BlockStore::new(kv);
        let tip = store.tip().await?;
        if let Some(t) = &tip {
            debug!(height = t.height, block = %t.block_id.short(), "ledger opened");
        }
        Ok(Self { store, validators, tip: RwLock::new(tip) })
    }

    pub fn tip(&self) -> Option<Tip> {
        *self.tip.read()
    }

    pub fn height(&self) -> Height {
        self.tip().map(|t| t.height).unwrap_or(0)
    }

    pub async fn block(&self, height: Height) -> anyhow::Result<Option<Block>> {
        self.store.read_block(height).await
    }

    pub async fn app_hash(&self, height: Height) -> anyhow::Result<Option<AppHash>> {
        self.store.read_app_hash(height).await
    }

    pub fn next_app_hash(prev: &AppHash, block: &Block) -> AppHash {
        let mut h = Sha256::new();
        h.update(prev);
        h.update(block.id().0);
        for tx in &block.txs {
            h.update((tx.len() as u64).to_be_bytes());
            h.update(tx);
        }
        h.finalize().into()
    }
}

#[async_trait]
impl Application for Ledger {
    async fn apply_block(&self, block: &Block, seal: &CommitSeal) -> Result<AppHash, AppError> {
        let tip = self.tip();
        let expected = tip.map(|t| t.height).unwrap_or(0) + 1;
        if block.height != expected {
            return Err(AppError::Rejected(format!("block height {} but ledger expects {}", block.height, expected)));
        }
        if block.parent != tip.map(|t| t.block_id) {
            return Err(AppError::Rejected(format!("block {} does not extend the tip", block.id().short())));
        }
        if seal.height != block.height || seal.block_id != block.id() {
            return Err(AppError::Rejected("commit seal is for a different block".into()));
        }
        self.validators
            .verify_commit_seal(seal)
            .map_err(|e| AppError::Rejected(format!("commit seal: {}", e)))?;

        let prev = tip.map(|t| t.app_hash).unwrap_or([0u8; 32]);
        let app_hash = Self::next_app_hash(&prev, block);
        let new_tip = self.store.write_block(block, seal, app_hash).await?;
        *self.tip.write() = Some(new_tip);
        Ok(app_hash)
    }

    async fn last_committed_height(&self) -> Result<Height, AppError> {
        Ok(self.height())
    }

    async fn block_id_at(&self, height: Height) -> Result<Option<BlockId>, AppError> {
        if let Some(t) = self.tip().filter(|t| t.height == height) {
            return Ok(Some(t.block_id));
        }
        Ok(self.store.read_block(height).await?.map(|b| b.id()))
    }

    async fn commit_seal(&self, height: Height) -> Result<Option<CommitSeal>, AppError> {
        Ok(self.store.read_seal(height).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemKvStore;
    use crate::tests::harness::Keys;

    fn block(height: Height, parent: Option<BlockId>, txs: Vec<Vec<u8>>) -> Block {
        Block { height, parent, proposer: "val-0".into(), timestamp_ms: height * 1000, txs }
    }

    #[tokio::test]
    async fn test_apply_chain_and_reopen() {
        let keys = Keys::new(4);
        let kv = Arc::new(MemKvStore::new());
        let ledger = Ledger::open(kv.clone(), keys.set.clone()).await.unwrap();
        assert_eq!(ledger.last_committed_height().await.unwrap(), 0);

        let b1 = block(1, None, vec![b"tx1".to_vec()]);
        let h1 = ledger.apply_block(&b1, &keys.seal(&b1, 0, 3)).await.unwrap();
        assert_eq!(h1, Ledger::next_app_hash(&[0u8; 32], &b1));
        let b2 = block(2, Some(b1.id()), vec![]);
        let h2 = ledger.apply_block(&b2, &keys.seal(&b2, 1, 4)).await.unwrap();
        assert_ne!(h1, h2);

        let reopened = Ledger::open(kv, keys.set.clone()).await.unwrap();
        assert_eq!(reopened.last_committed_height().await.unwrap(), 2);
        assert_eq!(reopened.block_id_at(1).await.unwrap(), Some(b1.id()));
        assert_eq!(reopened.commit_seal(2).await.unwrap().unwrap().round, 1);
        assert_eq!(reopened.app_hash(2).await.unwrap(), Some(h2));
        assert_eq!(reopened.block(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_gaps_forks_and_weak_seals() {
        let keys = Keys::new(4);
        let ledger = Ledger::open(Arc::new(MemKvStore::new()), keys.set.clone()).await.unwrap();

        let gap = block(2, None, vec![]);
        assert!(matches!(ledger.apply_block(&gap, &keys.seal(&gap, 0, 3)).await, Err(AppError::Rejected(_))));

        let b1 = block(1, None, vec![]);
        // 2 of 4 is not more than two thirds
        assert!(matches!(ledger.apply_block(&b1, &keys.seal(&b1, 0, 2)).await, Err(AppError::Rejected(_))));
        ledger.apply_block(&b1, &keys.seal(&b1, 0, 3)).await.unwrap();

        let fork = block(2, Some(BlockId([9; 32])), vec![]);
        assert!(matches!(ledger.apply_block(&fork, &keys.seal(&fork, 0, 3)).await, Err(AppError::Rejected(_))));
        assert_eq!(ledger.height(), 1);
    }
}
