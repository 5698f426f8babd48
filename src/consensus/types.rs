//! Core consensus data model: heights, rounds, steps, blocks, proposals, votes and commit seals.

use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type Height = u64;
pub type Round = u32;
pub type ValidatorId = String;
pub type VotingPower = u64;
pub type Tx = Vec<u8>;
pub type AppHash = [u8; 32];

/// Content hash of a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.short())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Phase within a round. Ordering follows the protocol progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: Height,
    pub parent: Option<BlockId>,
    pub proposer: ValidatorId,
    pub timestamp_ms: u64,
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        let mut h = Sha256::new();
        h.update(b"stratumbft/block");
        h.update(self.height.to_be_bytes());
        match &self.parent {
            Some(p) => {
                h.update([1u8]);
                h.update(p.0);
            }
            None => h.update([0u8]),
        }
        put_str(&mut h, &self.proposer);
        h.update(self.timestamp_ms.to_be_bytes());
        h.update((self.txs.len() as u64).to_be_bytes());
        for tx in &self.txs {
            h.update((tx.len() as u64).to_be_bytes());
            h.update(tx);
        }
        BlockId(h.finalize().into())
    }

    pub fn txs_bytes(&self) -> usize {
        self.txs.iter().map(|t| t.len()).sum()
    }
}

/// Block proposal for (height, round). `pol_round` is the proof-of-lock round, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub block: Block,
    pub pol_round: Option<Round>,
    pub proposer: ValidatorId,
    pub signature: Vec<u8>,
}

impl Proposal {
    pub fn new(height: Height, round: Round, block: Block, pol_round: Option<Round>, proposer: ValidatorId) -> Self {
        Self { height, round, block, pol_round, proposer, signature: vec![] }
    }

    pub fn block_id(&self) -> BlockId {
        self.block.id()
    }

    /// Canonical bytes covered by the proposer signature.
    pub fn sign_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(b"stratumbft/proposal");
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.round.to_be_bytes());
        out.extend_from_slice(&self.block_id().0);
        let pol = self.pol_round.map(i64::from).unwrap_or(-1);
        out.extend_from_slice(&pol.to_be_bytes());
        out.extend_from_slice(self.proposer.as_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    /// `None` is a vote for nil.
    pub block_id: Option<BlockId>,
    pub validator: ValidatorId,
    pub power: VotingPower,
    pub signature: Vec<u8>,
}

impl Vote {
    pub fn new(
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: Option<BlockId>,
        validator: ValidatorId,
        power: VotingPower,
    ) -> Self {
        Self { height, round, vote_type, block_id, validator, power, signature: vec![] }
    }

    /// Canonical bytes covered by the validator signature.
    pub fn sign_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(b"stratumbft/vote");
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.round.to_be_bytes());
        out.push(match self.vote_type {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        });
        match &self.block_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.0);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.power.to_be_bytes());
        out.extend_from_slice(self.validator.as_bytes());
        out
    }

    /// Two signed votes from one validator for the same (height, round, type) naming
    /// different non-nil blocks.
    pub fn conflicts_with(&self, other: &Vote) -> bool {
        self.validator == other.validator
            && self.height == other.height
            && self.round == other.round
            && self.vote_type == other.vote_type
            && matches!((self.block_id, other.block_id), (Some(a), Some(b)) if a != b)
    }
}

/// +2/3 precommits for one block at one round: the proof that finalizes a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSeal {
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub precommits: Vec<Vote>,
}

fn put_str(h: &mut Sha256, s: &str) {
    h.update((s.len() as u64).to_be_bytes());
    h.update(s.as_bytes());
}
