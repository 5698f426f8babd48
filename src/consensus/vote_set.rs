//! Vote aggregation.
//!
//! `VoteSet` tallies voting power per value (a block id or nil) for one (height, round, type).
//! `HeightVoteSet` owns every `VoteSet` of a height, all weighted by the validator-set snapshot
//! taken when the height started.

use crate::consensus::evidence::Evidence;
use crate::consensus::types::{BlockId, Height, Round, ValidatorId, Vote, VoteType, VotingPower};
use crate::consensus::validator_set::ValidatorSet;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVoteResult {
    Added,
    Duplicate,
    /// The vote conflicts with one already counted. Both are withdrawn from the tally.
    Conflicting(Evidence),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteSetError {
    #[error("vote for height {got}, vote set is for {expected}")]
    WrongHeight { expected: Height, got: Height },
    #[error("{0} is not in the validator set")]
    UnknownValidator(ValidatorId),
}

/// Outcome of a +2/3 tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Majority {
    Block(BlockId),
    Nil,
}

impl Majority {
    pub fn block_id(&self) -> Option<BlockId> {
        match self {
            Majority::Block(id) => Some(*id),
            Majority::Nil => None,
        }
    }
}

impl From<Option<BlockId>> for Majority {
    fn from(value: Option<BlockId>) -> Self {
        match value {
            Some(id) => Majority::Block(id),
            None => Majority::Nil,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteSet {
    height: Height,
    round: Round,
    vote_type: VoteType,
    votes: BTreeMap<ValidatorId, Vote>,
    power_by_value: BTreeMap<Option<BlockId>, VotingPower>,
    voted_power: VotingPower,
    majority: Option<Majority>,
    // equivocators no longer counted in this set
    excluded: BTreeSet<ValidatorId>,
}

impl VoteSet {
    pub fn new(height: Height, round: Round, vote_type: VoteType) -> Self {
        Self {
            height,
            round,
            vote_type,
            votes: BTreeMap::new(),
            power_by_value: BTreeMap::new(),
            voted_power: 0,
            majority: None,
            excluded: BTreeSet::new(),
        }
    }

    /// `power` must come from the height's validator-set snapshot, not from the vote.
    fn add(&mut self, vote: Vote, power: VotingPower, validators: &ValidatorSet) -> AddVoteResult {
        debug_assert_eq!((vote.height, vote.round, vote.vote_type), (self.height, self.round, self.vote_type));
        if self.excluded.contains(&vote.validator) {
            return AddVoteResult::Duplicate;
        }
        if let Some(existing) = self.votes.get(&vote.validator) {
            if existing.conflicts_with(&vote) {
                let existing = existing.clone();
                self.withdraw(&existing, power, validators);
                self.excluded.insert(vote.validator.clone());
                return AddVoteResult::Conflicting(Evidence::DuplicateVote { vote_a: existing, vote_b: vote });
            }
            return AddVoteResult::Duplicate;
        }

        let value = vote.block_id;
        self.votes.insert(vote.validator.clone(), vote);
        let tally = self.power_by_value.entry(value).or_insert(0);
        *tally += power;
        self.voted_power += power;
        // first value to cross the threshold wins
        if self.majority.is_none() && validators.is_two_thirds(*tally) {
            self.majority = Some(value.into());
        }
        AddVoteResult::Added
    }

    fn withdraw(&mut self, vote: &Vote, power: VotingPower, validators: &ValidatorSet) {
        self.votes.remove(&vote.validator);
        if let Some(tally) = self.power_by_value.get_mut(&vote.block_id) {
            *tally = tally.saturating_sub(power);
        }
        self.voted_power = self.voted_power.saturating_sub(power);
        if let Some(m) = self.majority {
            if !validators.is_two_thirds(self.power_for(m.block_id())) {
                self.majority = self
                    .power_by_value
                    .iter()
                    .find(|(_, p)| validators.is_two_thirds(**p))
                    .map(|(v, _)| (*v).into());
            }
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn majority(&self) -> Option<Majority> {
        self.majority
    }

    pub fn majority_block(&self) -> Option<BlockId> {
        self.majority.and_then(|m| m.block_id())
    }

    /// Counted votes hold more than 2/3 of power, whatever they vote for.
    pub fn has_two_thirds_any(&self, validators: &ValidatorSet) -> bool {
        validators.is_two_thirds(self.voted_power)
    }

    pub fn power_for(&self, value: Option<BlockId>) -> VotingPower {
        self.power_by_value.get(&value).copied().unwrap_or(0)
    }

    pub fn voted_power(&self) -> VotingPower {
        self.voted_power
    }

    pub fn get(&self, validator: &str) -> Option<&Vote> {
        self.votes.get(validator)
    }

    pub fn votes_for(&self, value: Option<BlockId>) -> Vec<Vote> {
        self.votes.values().filter(|v| v.block_id == value).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// All vote sets of one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightVoteSet {
    height: Height,
    validators: ValidatorSet,
    sets: BTreeMap<(Round, VoteType), VoteSet>,
}

impl HeightVoteSet {
    pub fn new(height: Height, validators: ValidatorSet) -> Self {
        Self { height, validators, sets: BTreeMap::new() }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn add_vote(&mut self, vote: Vote) -> Result<AddVoteResult, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight { expected: self.height, got: vote.height });
        }
        let power = self
            .validators
            .get(&vote.validator)
            .map(|v| v.power)
            .ok_or_else(|| VoteSetError::UnknownValidator(vote.validator.clone()))?;
        let key = (vote.round, vote.vote_type);
        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| VoteSet::new(vote.height, vote.round, vote.vote_type));
        Ok(set.add(vote, power, &self.validators))
    }

    pub fn vote_set(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        self.sets.get(&(round, vote_type))
    }

    pub fn majority(&self, round: Round, vote_type: VoteType) -> Option<Majority> {
        self.vote_set(round, vote_type).and_then(|s| s.majority())
    }

    pub fn majority_block(&self, round: Round, vote_type: VoteType) -> Option<BlockId> {
        self.vote_set(round, vote_type).and_then(|s| s.majority_block())
    }

    pub fn has_two_thirds_any(&self, round: Round, vote_type: VoteType) -> bool {
        self.vote_set(round, vote_type)
            .map(|s| s.has_two_thirds_any(&self.validators))
            .unwrap_or(false)
    }

    pub fn get(&self, validator: &str, round: Round, vote_type: VoteType) -> Option<&Vote> {
        self.vote_set(round, vote_type).and_then(|s| s.get(validator))
    }

    /// Counted vote that `vote` would equivocate against, if any.
    pub fn conflicting(&self, vote: &Vote) -> Option<&Vote> {
        self.get(&vote.validator, vote.round, vote.vote_type)
            .filter(|existing| existing.conflicts_with(vote))
    }

    /// Rounds with a +2/3 precommit majority for a block, lowest first.
    pub fn precommit_majorities(&self) -> Vec<(Round, BlockId)> {
        self.sets
            .iter()
            .filter(|((_, t), _)| *t == VoteType::Precommit)
            .filter_map(|((r, _), s)| s.majority_block().map(|b| (*r, b)))
            .collect()
    }

    /// Highest round above `round` where +2/3 of power voted (any value, either type).
    pub fn highest_round_with_two_thirds_any(&self, above: Round) -> Option<Round> {
        self.sets
            .iter()
            .filter(|((r, _), s)| *r > above && s.has_two_thirds_any(&self.validators))
            .map(|((r, _), _)| *r)
            .max()
    }
}
