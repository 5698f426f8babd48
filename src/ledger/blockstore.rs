use crate::consensus::types::{AppHash, Block, BlockId, CommitSeal, Height};
use crate::storage::{KvStore, WriteBatch};
use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};
use std::sync::Arc;

const TIP_KEY: &[u8] = b"ledger/tip";

fn key(prefix: &str, height: Height) -> Vec<u8> {
    let mut k = prefix.as_bytes().to_vec();
    k.extend_from_slice(&height.to_be_bytes());
    k
}

/// Latest committed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tip {
    pub height: Height,
    pub block_id: BlockId,
    pub app_hash: AppHash,
}

/// Blocks, commit seals and app hashes keyed by height.
pub struct BlockStore {
    kv: Arc<dyn KvStore>,
}

impl BlockStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Writes the block, its seal, its app hash and the new tip in one batch.
    pub async fn write_block(&self, block: &Block, seal: &CommitSeal, app_hash: AppHash) -> Result<Tip> {
        let tip = Tip { height: block.height, block_id: block.id(), app_hash };
        let mut batch = WriteBatch::new();
        batch.put(key("ledger/block/", block.height), bincode::serialize(block)?);
        batch.put(key("ledger/seal/", block.height), bincode::serialize(seal)?);
        batch.put(key("ledger/hash/", block.height), app_hash.to_vec());
        batch.put(TIP_KEY.to_vec(), bincode::serialize(&tip)?);
        self.kv.write_batch(batch).await?;
        Ok(tip)
    }

    pub async fn read_block(&self, height: Height) -> Result<Option<Block>> {
        match self.kv.get(&key("ledger/block/", height)).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).context("decoding block")?)),
            None => Ok(None),
        }
    }

    pub async fn read_seal(&self, height: Height) -> Result<Option<CommitSeal>> {
        match self.kv.get(&key("ledger/seal/", height)).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).context("decoding commit seal")?)),
            None => Ok(None),
        }
    }

    pub async fn read_app_hash(&self, height: Height) -> Result<Option<AppHash>> {
        match self.kv.get(&key("ledger/hash/", height)).await? {
            Some(bytes) => {
                let hash: AppHash = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("app hash at {} has {} bytes", height, bytes.len()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub async fn tip(&self) -> Result<Option<Tip>> {
        match self.kv.get(TIP_KEY).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).context("decoding ledger tip")?)),
            None => Ok(None),
        }
    }
}
