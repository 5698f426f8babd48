//! Last-sign-state and the double-sign guard.
//!
//! Every signature this validator produces is recorded before it leaves the signing path:
//! - `sign/last` holds the most recent (height, round, step) and its signature
//! - `sign/hist/<height><round><step>` keeps per-step history for the startup guard
//!
//! Signing rules: a regression below the last (height, round, step) is refused. The same step
//! with the same value reuses the stored signature, and a different value is refused.

use crate::consensus::types::{BlockId, Height, Proposal, Round, ValidatorId, Vote, VoteType};
use crate::consensus::PrivValidator;
use crate::storage::{KvStore, WriteBatch};
use crate::utils::errors::SignError;
use anyhow::Context;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const LAST_KEY: &[u8] = b"sign/last";
const HIST_PREFIX: &[u8] = b"sign/hist/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignStep {
    Proposal,
    Prevote,
    Precommit,
}

impl From<VoteType> for SignStep {
    fn from(t: VoteType) -> Self {
        match t {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

impl SignStep {
    fn code(self) -> u8 {
        match self {
            SignStep::Proposal => 0,
            SignStep::Prevote => 1,
            SignStep::Precommit => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    pub height: Height,
    pub round: Round,
    pub step: SignStep,
    pub block_id: Option<BlockId>,
    pub signature: Vec<u8>,
}

impl SignedRecord {
    fn hrs(&self) -> (Height, Round, SignStep) {
        (self.height, self.round, self.step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignCheck {
    Fresh,
    Reuse(Vec<u8>),
    Refuse(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("{source_name} has {step:?} at height {height} round {round} for {found:?}, previously signed {signed:?}")]
    Conflict {
        height: Height,
        round: Round,
        step: SignStep,
        signed: Option<BlockId>,
        found: Option<BlockId>,
        source_name: &'static str,
    },
}

pub struct SignStateStore {
    kv: Arc<dyn KvStore>,
    last: Option<SignedRecord>,
}

fn hist_key(height: Height, round: Round, step: SignStep) -> Vec<u8> {
    let mut k = HIST_PREFIX.to_vec();
    k.extend_from_slice(&height.to_be_bytes());
    k.extend_from_slice(&round.to_be_bytes());
    k.push(step.code());
    k
}

impl SignStateStore {
    pub async fn open(kv: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let last = match kv.get(LAST_KEY).await? {
            Some(bytes) => Some(bincode::deserialize(&bytes).context("decoding last sign state")?),
            None => None,
        };
        Ok(Self { kv, last })
    }

    pub fn last(&self) -> Option<&SignedRecord> {
        self.last.as_ref()
    }

    pub fn check(&self, height: Height, round: Round, step: SignStep, block_id: Option<BlockId>) -> SignCheck {
        let Some(last) = &self.last else {
            return SignCheck::Fresh;
        };
        let want = (height, round, step);
        if want < last.hrs() {
            return SignCheck::Refuse(format!("regression from {:?} to {:?}", last.hrs(), want));
        }
        if want == last.hrs() {
            if block_id == last.block_id {
                return SignCheck::Reuse(last.signature.clone());
            }
            return SignCheck::Refuse(format!(
                "already signed {:?} at {:?}, refusing {:?}",
                last.block_id, want, block_id
            ));
        }
        SignCheck::Fresh
    }

    pub async fn record(&mut self, rec: SignedRecord) -> anyhow::Result<()> {
        let bytes = bincode::serialize(&rec)?;
        let mut batch = WriteBatch::new();
        batch.put(hist_key(rec.height, rec.round, rec.step), bytes.clone());
        batch.put(LAST_KEY.to_vec(), bytes);
        self.kv.write_batch(batch).await?;
        self.last = Some(rec);
        Ok(())
    }

    /// Own signing history for heights >= `from`, ordered by (height, round, step).
    pub async fn history(&self, from: Height) -> anyhow::Result<Vec<SignedRecord>> {
        let scan = self.kv.scan_prefix(HIST_PREFIX).await?;
        let mut out = Vec::with_capacity(scan.items.len());
        for (_, v) in scan.items {
            let rec: SignedRecord = bincode::deserialize(&v).context("decoding sign history")?;
            if rec.height >= from {
                out.push(rec);
            }
        }
        out.sort_by_key(|r| r.hrs());
        Ok(out)
    }

    /// Drops history below `height`. `sign/last` is never removed.
    pub async fn prune_history_below(&self, height: Height) -> anyhow::Result<usize> {
        let scan = self.kv.scan_prefix(HIST_PREFIX).await?;
        let mut batch = WriteBatch::new();
        for (k, v) in scan.items {
            let rec: SignedRecord = bincode::deserialize(&v).context("decoding sign history")?;
            if rec.height < height {
                batch.delete(k);
            }
        }
        let n = batch.len();
        if n > 0 {
            self.kv.write_batch(batch).await?;
        }
        Ok(n)
    }
}

impl SignStateStore {
    async fn guarded_sign<F>(
        &mut self,
        height: Height,
        round: Round,
        step: SignStep,
        block_id: Option<BlockId>,
        timeout: Duration,
        sign: F,
    ) -> Result<Vec<u8>, SignError>
    where
        F: std::future::Future<Output = Result<Vec<u8>, SignError>>,
    {
        match self.check(height, round, step, block_id) {
            SignCheck::Reuse(sig) => {
                debug!(height, round, ?step, "reusing stored signature");
                return Ok(sig);
            }
            SignCheck::Refuse(reason) => {
                warn!(height, round, ?step, %reason, "refusing to sign");
                return Err(SignError::DoubleSign(reason));
            }
            SignCheck::Fresh => {}
        }
        let signature = tokio::time::timeout(timeout, sign).await.map_err(|_| SignError::Timeout)??;
        self.record(SignedRecord { height, round, step, block_id, signature: signature.clone() })
            .await
            .map_err(|e| SignError::Backend(format!("persisting sign state: {}", e)))?;
        Ok(signature)
    }

    /// Signs `vote` through `signer`, enforcing the last-sign-state rules.
    pub async fn sign_vote(
        &mut self,
        signer: &dyn PrivValidator,
        vote: &Vote,
        timeout: Duration,
    ) -> Result<Vec<u8>, SignError> {
        self.guarded_sign(vote.height, vote.round, vote.vote_type.into(), vote.block_id, timeout, signer.sign_vote(vote))
            .await
    }

    pub async fn sign_proposal(
        &mut self,
        signer: &dyn PrivValidator,
        proposal: &Proposal,
        timeout: Duration,
    ) -> Result<Vec<u8>, SignError> {
        let id = Some(proposal.block_id());
        self.guarded_sign(proposal.height, proposal.round, SignStep::Proposal, id, timeout, signer.sign_proposal(proposal))
            .await
    }
}

/// Startup comparison of own signing history against own votes found elsewhere.
pub struct DoubleSignGuard {
    own_id: ValidatorId,
    seen: BTreeMap<(Height, Round, SignStep), Option<BlockId>>,
}

impl DoubleSignGuard {
    pub fn new(own_id: ValidatorId, history: &[SignedRecord]) -> Self {
        let seen = history.iter().map(|r| (r.hrs(), r.block_id)).collect();
        Self { own_id, seen }
    }

    /// Checks own votes among `votes` against everything seen so far, then remembers them.
    /// `source_name` labels the origin in the violation ("wal", "commit seal").
    pub fn check_votes<'a>(
        &mut self,
        source_name: &'static str,
        votes: impl IntoIterator<Item = &'a Vote>,
    ) -> Result<(), GuardViolation> {
        for vote in votes.into_iter().filter(|v| v.validator == self.own_id) {
            let key = (vote.height, vote.round, SignStep::from(vote.vote_type));
            match self.seen.get(&key) {
                Some(signed) if *signed != vote.block_id => {
                    return Err(GuardViolation::Conflict {
                        height: vote.height,
                        round: vote.round,
                        step: key.2,
                        signed: *signed,
                        found: vote.block_id,
                        source_name,
                    });
                }
                Some(_) => {}
                None => {
                    self.seen.insert(key, vote.block_id);
                }
            }
        }
        Ok(())
    }

    pub fn checked(&self) -> usize {
        self.seen.len()
    }
}
