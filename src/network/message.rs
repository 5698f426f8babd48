use crate::consensus::types::{Height, Proposal, Round, Vote};
use serde::{Serialize, Deserialize};

/// Identifier of a transport peer. For validators this is the validator id.
pub type PeerId = String;

/// Consensus messages carried by the transport. Keep stable and small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn height(&self) -> Height {
        match self {
            ConsensusMessage::Proposal(p) => p.height,
            ConsensusMessage::Vote(v) => v.height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            ConsensusMessage::Proposal(p) => p.round,
            ConsensusMessage::Vote(v) => v.round,
        }
    }

    /// Validator that signed the message.
    pub fn signer(&self) -> &str {
        match self {
            ConsensusMessage::Proposal(p) => &p.proposer,
            ConsensusMessage::Vote(v) => &v.validator,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Inbound message tagged with the peer that delivered it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: PeerId,
    pub message: ConsensusMessage,
}
