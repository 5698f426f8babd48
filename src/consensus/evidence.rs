//! Equivocation evidence and the reporting collaborator.

use crate::consensus::types::{Height, Round, ValidatorId, Vote, VoteType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evidence {
    /// Two signed votes from one validator for the same (height, round, type) naming
    /// different blocks.
    DuplicateVote { vote_a: Vote, vote_b: Vote },
}

impl Evidence {
    pub fn validator(&self) -> &ValidatorId {
        match self {
            Evidence::DuplicateVote { vote_a, .. } => &vote_a.validator,
        }
    }

    pub fn height(&self) -> Height {
        match self {
            Evidence::DuplicateVote { vote_a, .. } => vote_a.height,
        }
    }

    pub fn key(&self) -> (ValidatorId, Height, Round, VoteType) {
        match self {
            Evidence::DuplicateVote { vote_a, .. } => {
                (vote_a.validator.clone(), vote_a.height, vote_a.round, vote_a.vote_type)
            }
        }
    }
}

/// Interface for surfacing evidence to the evidence-handling collaborator.
#[async_trait]
pub trait EvidenceReporter: Send + Sync + 'static {
    async fn report(&self, evidence: Evidence) -> anyhow::Result<()>;
}

/// Logs evidence and keeps it, deduplicated per (validator, height, round, type).
#[derive(Default)]
pub struct EvidencePool {
    items: Mutex<Vec<Evidence>>,
}

impl EvidencePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<Evidence> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl EvidenceReporter for EvidencePool {
    async fn report(&self, evidence: Evidence) -> anyhow::Result<()> {
        let mut items = self.items.lock();
        if items.iter().any(|e| e.key() == evidence.key()) {
            return Ok(());
        }
        warn!(validator = %evidence.validator(), height = evidence.height(), "equivocation evidence recorded");
        items.push(evidence);
        Ok(())
    }
}
