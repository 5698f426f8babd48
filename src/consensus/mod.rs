//! Consensus module (Tendermint-style BFT: propose, prevote, precommit, commit)
//!
//! Public surface:
//! - ConsensusEngine: single-consumer event loop driving the round-state machine
//! - types, validator_set, validation, vote_set, timeout, state_machine, wal, sign_state,
//!   evidence, config
//!
//! Collaborators are passed in as trait objects: the transport, the mempool, the application
//! (state transition + block storage) and the private validator (signing backend).

pub mod types;
pub mod validator_set;
pub mod validation;
pub mod vote_set;
pub mod timeout;
pub mod state_machine;
pub mod wal;
pub mod sign_state;
pub mod evidence;
pub mod config;
pub mod engine;

use crate::consensus::types::{AppHash, Block, CommitSeal, Height, Proposal, Tx, ValidatorId, Vote};
use crate::consensus::validator_set::ValidatorSet;
use crate::network::message::{ConsensusMessage, PeerId};
use crate::utils::errors::{AppError, SignError};
use async_trait::async_trait;

pub use config::ConsensusConfig;
pub use engine::{Collaborators, ConsensusEngine, EngineHandle};
pub use evidence::{Evidence, EvidencePool, EvidenceReporter};
pub use state_machine::RoundState;

/// Outbound side of the peer-to-peer layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Best-effort delivery to every peer. Inbound messages come back through
    /// `EngineHandle::deliver`.
    async fn broadcast(&self, msg: ConsensusMessage);

    /// Validator set in force at `height`. Must be known for the current height and the next.
    fn validator_set(&self, height: Height) -> Option<ValidatorSet>;

    /// Flags a peer that sent an unauthorized or malformed message.
    fn report_peer(&self, _peer: &PeerId, _reason: &str) {}
}

/// Candidate transaction source.
#[async_trait]
pub trait Mempool: Send + Sync + 'static {
    /// Pending transactions in order, whose total size fits `max_bytes`.
    fn pending_transactions(&self, max_bytes: usize) -> Vec<Tx>;

    /// Removes transactions included in a committed block.
    fn evict(&self, committed: &[Tx]);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once at least one transaction is pending.
    async fn wait_for_txs(&self);
}

/// External state-transition function and block storage.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn apply_block(&self, block: &Block, seal: &CommitSeal) -> Result<AppHash, AppError>;

    /// 0 before genesis.
    async fn last_committed_height(&self) -> Result<Height, AppError>;

    /// Id of the block committed at `height`, if any.
    async fn block_id_at(&self, height: Height) -> Result<Option<types::BlockId>, AppError>;

    async fn commit_seal(&self, height: Height) -> Result<Option<CommitSeal>, AppError>;
}

/// Signing backend. May be remote, may fail or time out.
#[async_trait]
pub trait PrivValidator: Send + Sync + 'static {
    fn id(&self) -> ValidatorId;

    async fn sign_vote(&self, vote: &Vote) -> Result<Vec<u8>, SignError>;

    async fn sign_proposal(&self, proposal: &Proposal) -> Result<Vec<u8>, SignError>;
}
