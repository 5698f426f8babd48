//! Validator set snapshot and proposer selection.
//!
//! A `ValidatorSet` is fixed for a whole height. Proposer selection is a pure function of
//! (height, round, snapshot):
//! - round 0: stake-weighted pick seeded by H(height), walking validators ordered by id
//! - round r: round-robin offset r from the round-0 proposer, so consecutive rounds rotate

use crate::consensus::types::{CommitSeal, Height, Round, ValidatorId, VoteType, VotingPower};
use crate::crypto::{PublicKey, Verifier};
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: ValidatorId,
    pub public_key: PublicKey,
    pub power: VotingPower,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,
    #[error("validator {0} has zero voting power")]
    ZeroPower(ValidatorId),
    #[error("duplicate validator {0}")]
    Duplicate(ValidatorId),
    #[error("total voting power overflows")]
    Overflow,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("precommit for wrong height/round/block from {0}")]
    WrongVote(ValidatorId),
    #[error("unknown signer {0}")]
    UnknownSigner(ValidatorId),
    #[error("duplicate signer {0}")]
    DuplicateSigner(ValidatorId),
    #[error("bad signature from {0}")]
    BadSignature(ValidatorId),
    #[error("insufficient power: {got} of {total}")]
    InsufficientPower { got: VotingPower, total: VotingPower },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    // sorted by id for deterministic iteration
    validators: Vec<Validator>,
    total: VotingPower,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        validators.sort_by(|a, b| a.id.cmp(&b.id));
        let mut total: VotingPower = 0;
        for (i, v) in validators.iter().enumerate() {
            if v.power == 0 {
                return Err(ValidatorSetError::ZeroPower(v.id.clone()));
            }
            if i > 0 && validators[i - 1].id == v.id {
                return Err(ValidatorSetError::Duplicate(v.id.clone()));
            }
            total = total.checked_add(v.power).ok_or(ValidatorSetError::Overflow)?;
        }
        Ok(Self { validators, total })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_power(&self) -> VotingPower {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Validator> {
        self.validators
            .binary_search_by(|v| v.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.validators[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Strictly more than two thirds of total power.
    pub fn is_two_thirds(&self, power: VotingPower) -> bool {
        (power as u128) * 3 > (self.total as u128) * 2
    }

    /// Smallest power that is strictly more than two thirds.
    pub fn quorum_power(&self) -> VotingPower {
        ((self.total as u128) * 2 / 3 + 1) as VotingPower
    }

    pub fn proposer(&self, height: Height, round: Round) -> &Validator {
        let first = self.weighted_index(height);
        let idx = (first + round as usize) % self.validators.len();
        &self.validators[idx]
    }

    pub fn is_proposer(&self, id: &str, height: Height, round: Round) -> bool {
        self.proposer(height, round).id == id
    }

    fn weighted_index(&self, height: Height) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(b"stratumbft/proposer");
        hasher.update(height.to_be_bytes());
        let digest = hasher.finalize();
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&digest[..16]);
        let pick = u128::from_be_bytes(arr) % (self.total as u128);

        let mut acc: u128 = 0;
        for (i, v) in self.validators.iter().enumerate() {
            acc += v.power as u128;
            if pick < acc {
                return i;
            }
        }
        self.validators.len() - 1
    }

    /// Checks that a seal carries valid, distinct precommits worth more than 2/3 of power.
    pub fn verify_commit_seal(&self, seal: &CommitSeal) -> Result<(), SealError> {
        let mut seen = HashSet::new();
        let mut power: VotingPower = 0;
        for vote in &seal.precommits {
            if vote.height != seal.height
                || vote.round != seal.round
                || vote.vote_type != VoteType::Precommit
                || vote.block_id != Some(seal.block_id)
            {
                return Err(SealError::WrongVote(vote.validator.clone()));
            }
            let validator = self
                .get(&vote.validator)
                .ok_or_else(|| SealError::UnknownSigner(vote.validator.clone()))?;
            if !seen.insert(vote.validator.as_str()) {
                return Err(SealError::DuplicateSigner(vote.validator.clone()));
            }
            validator
                .public_key
                .verify(&vote.sign_bytes(), &vote.signature)
                .map_err(|_| SealError::BadSignature(vote.validator.clone()))?;
            power += validator.power;
        }
        if !self.is_two_thirds(power) {
            return Err(SealError::InsufficientPower { got: power, total: self.total });
        }
        Ok(())
    }
}
