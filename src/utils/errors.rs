use thiserror::Error;
use crate::consensus::types::Height;
use crate::consensus::wal::WalError;
use crate::consensus::sign_state::GuardViolation;
use crate::consensus::config::ConfigError;

/// Fatal consensus errors. Anything surfacing as `ConsensusError` stops the engine.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("write-ahead log error: {0}")]
    Wal(#[from] WalError),

    #[error("failed to apply block at height {height}: {source}")]
    ApplyBlock {
        height: Height,
        #[source]
        source: AppError,
    },

    #[error("double-sign guard refused to start: {0}")]
    DoubleSign(#[from] GuardViolation),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("application error: {0}")]
    Application(#[from] AppError),

    #[error("invalid consensus config: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid validator set for height {height}: {reason}")]
    ValidatorSet { height: Height, reason: String },

    #[error("event queue closed")]
    QueueClosed,
}

/// Signing collaborator failures. Never fatal: the validator abstains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error("signer backend error: {0}")]
    Backend(String),

    #[error("signer timed out")]
    Timeout,

    #[error("refusing to sign: {0}")]
    DoubleSign(String),
}

/// State-transition collaborator failures.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("block rejected: {0}")]
    Rejected(String),

    #[error("storage: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Convenience alias
pub type Result<T> = std::result::Result<T, ConsensusError>;
