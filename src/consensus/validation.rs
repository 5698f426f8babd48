//! Inbound message validation.
//!
//! Every proposal and vote is classified against the current height/round before it is
//! logged or handed to the state machine. Messages for future heights inside the look-ahead
//! window are parked in a `FutureBuffer` and re-validated once that height starts.

use crate::consensus::config::ConsensusConfig;
use crate::consensus::evidence::Evidence;
use crate::consensus::types::{Block, BlockId, Height, Proposal, Round, Vote, VoteType};
use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::vote_set::HeightVoteSet;
use crate::crypto::Verifier;
use crate::network::message::{ConsensusMessage, Envelope};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Future height inside the look-ahead window.
    Buffer,
    /// Signed vote conflicting with one already counted. Still logged and fed to the tally,
    /// which withdraws both.
    Equivocation(Evidence),
    RejectMalformed(String),
    RejectUnauthorized,
    RejectStale,
    /// Height or round beyond the look-ahead window.
    RejectFuture,
}

impl Verdict {
    /// Whether the message goes to the log and the state machine.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accept | Verdict::Equivocation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookahead {
    pub heights: u64,
    pub rounds: u32,
}

impl From<&ConsensusConfig> for Lookahead {
    fn from(cfg: &ConsensusConfig) -> Self {
        Self { heights: cfg.height_lookahead, rounds: cfg.round_lookahead }
    }
}

/// Read-only view of the state needed to classify a message.
pub struct ValidationContext<'a> {
    pub height: Height,
    pub round: Round,
    pub validators: &'a ValidatorSet,
    pub votes: &'a HeightVoteSet,
    pub proposals: &'a BTreeMap<Round, Proposal>,
    pub known_blocks: &'a HashMap<BlockId, Block>,
    pub last_block_id: Option<BlockId>,
    pub max_block_bytes: usize,
    pub lookahead: Lookahead,
}

impl<'a> ValidationContext<'a> {
    fn height_window(&self, height: Height) -> Option<Verdict> {
        if height < self.height {
            return Some(Verdict::RejectStale);
        }
        if height > self.height {
            if height - self.height <= self.lookahead.heights {
                return Some(Verdict::Buffer);
            }
            return Some(Verdict::RejectFuture);
        }
        None
    }

    fn beyond_round_window(&self, round: Round) -> bool {
        round > self.round.saturating_add(self.lookahead.rounds)
    }

    pub fn validate(&self, msg: &ConsensusMessage) -> Verdict {
        match msg {
            ConsensusMessage::Proposal(p) => self.validate_proposal(p),
            ConsensusMessage::Vote(v) => self.validate_vote(v),
        }
    }

    pub fn validate_vote(&self, vote: &Vote) -> Verdict {
        if let Some(v) = self.height_window(vote.height) {
            return v;
        }
        if let Err(rejected) = authenticate_vote(vote, self.validators) {
            return rejected;
        }
        if self.beyond_round_window(vote.round) {
            return Verdict::RejectFuture;
        }
        if let Some(existing) = self.votes.conflicting(vote) {
            return Verdict::Equivocation(Evidence::DuplicateVote { vote_a: existing.clone(), vote_b: vote.clone() });
        }
        // a decided lower round has no use for more votes of that type
        if vote.round < self.round && self.votes.majority(vote.round, vote.vote_type).is_some() {
            return Verdict::RejectStale;
        }
        Verdict::Accept
    }

    pub fn validate_proposal(&self, p: &Proposal) -> Verdict {
        if let Some(v) = self.height_window(p.height) {
            return v;
        }
        if let Err(rejected) = authenticate_proposal(p, self.validators) {
            return rejected;
        }
        if matches!(p.pol_round, Some(pol) if pol >= p.round) {
            return Verdict::RejectMalformed(format!("pol round {:?} not below round {}", p.pol_round, p.round));
        }
        if let Err(reason) = self.check_block(p) {
            return Verdict::RejectMalformed(reason);
        }
        if self.beyond_round_window(p.round) {
            return Verdict::RejectFuture;
        }
        if self.proposals.contains_key(&p.round) {
            return Verdict::RejectStale;
        }
        if p.round < self.round && !self.block_needed(p.round, &p.block_id()) {
            return Verdict::RejectStale;
        }
        Verdict::Accept
    }

    fn check_block(&self, p: &Proposal) -> Result<(), String> {
        let b = &p.block;
        if b.height != p.height {
            return Err(format!("block height {} in proposal for {}", b.height, p.height));
        }
        if b.proposer != p.proposer {
            return Err(format!("block proposer {} differs from signer {}", b.proposer, p.proposer));
        }
        if b.parent != self.last_block_id {
            return Err("block does not extend the last committed block".into());
        }
        if b.txs_bytes() > self.max_block_bytes {
            return Err(format!("block carries {} tx bytes, limit {}", b.txs_bytes(), self.max_block_bytes));
        }
        Ok(())
    }

    // An old-round block is still wanted when a majority at that round names it and we never saw it.
    fn block_needed(&self, round: Round, id: &BlockId) -> bool {
        if self.known_blocks.contains_key(id) {
            return false;
        }
        [VoteType::Prevote, VoteType::Precommit]
            .iter()
            .any(|t| self.votes.majority_block(round, *t) == Some(*id))
    }
}

/// Checks that the signer belongs to `validators` and signed the message. Used on its own
/// for messages parked for a later height, whose other checks wait until that height starts.
pub fn authenticate(msg: &ConsensusMessage, validators: &ValidatorSet) -> Result<(), Verdict> {
    match msg {
        ConsensusMessage::Proposal(p) => authenticate_proposal(p, validators),
        ConsensusMessage::Vote(v) => authenticate_vote(v, validators),
    }
}

fn authenticate_vote(vote: &Vote, validators: &ValidatorSet) -> Result<(), Verdict> {
    let validator = validators.get(&vote.validator).ok_or(Verdict::RejectUnauthorized)?;
    if vote.power != validator.power {
        return Err(Verdict::RejectMalformed(format!(
            "power {} does not match validator set power {}",
            vote.power, validator.power
        )));
    }
    if validator.public_key.verify(&vote.sign_bytes(), &vote.signature).is_err() {
        return Err(Verdict::RejectMalformed("bad vote signature".into()));
    }
    Ok(())
}

fn authenticate_proposal(p: &Proposal, validators: &ValidatorSet) -> Result<(), Verdict> {
    let validator = validators.get(&p.proposer).ok_or(Verdict::RejectUnauthorized)?;
    if !validators.is_proposer(&p.proposer, p.height, p.round) {
        return Err(Verdict::RejectUnauthorized);
    }
    if validator.public_key.verify(&p.sign_bytes(), &p.signature).is_err() {
        return Err(Verdict::RejectMalformed("bad proposal signature".into()));
    }
    Ok(())
}

/// Bounded buffer of messages for heights the node has not reached yet, kept with the peer
/// that sent them.
pub struct FutureBuffer {
    capacity: usize,
    by_height: BTreeMap<Height, Vec<Envelope>>,
    len: usize,
}

impl FutureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, by_height: BTreeMap::new(), len: 0 }
    }

    /// Returns false when the buffer is full and the message was dropped.
    pub fn push(&mut self, env: Envelope) -> bool {
        if self.len >= self.capacity {
            return false;
        }
        self.by_height.entry(env.message.height()).or_default().push(env);
        self.len += 1;
        true
    }

    /// Removes and returns the messages for `height` with their senders, discarding anything
    /// below it.
    pub fn take(&mut self, height: Height) -> Vec<Envelope> {
        let mut keep = self.by_height.split_off(&height);
        let taken = keep.remove(&height).unwrap_or_default();
        self.by_height = keep;
        self.len = self.by_height.values().map(Vec::len).sum();
        taken
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
