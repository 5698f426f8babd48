//! Network module - consensus wire messages and the in-process transport.
//! Real peer-to-peer transports plug in through `consensus::Transport`.

pub mod message;
pub mod local;

pub use message::{ConsensusMessage, Envelope, PeerId};
pub use local::{LocalNetwork, LocalTransport};
