//! Tunable consensus surface: timeouts, empty-block policy, look-ahead windows, WAL and
//! double-sign guard settings.

use serde::{Serialize, Deserialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("timeout_propose must be non-zero")]
    ZeroProposeTimeout,
    #[error("round_lookahead must be at least 1")]
    ZeroRoundLookahead,
    #[error("max_block_bytes must be non-zero")]
    ZeroBlockBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    #[serde(with = "humantime_serde")]
    pub timeout_propose: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_propose_delta: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_prevote: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_prevote_delta: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_precommit: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_precommit_delta: Duration,
    /// Grace period after a commit before round 0 of the next height.
    #[serde(with = "humantime_serde")]
    pub timeout_commit: Duration,
    /// Make progress as soon as +2/3 precommits are seen, ignoring `timeout_commit`.
    pub skip_timeout_commit: bool,

    pub create_empty_blocks: bool,
    /// Zero waits for transactions indefinitely.
    #[serde(with = "humantime_serde")]
    pub create_empty_blocks_interval: Duration,
    pub max_block_bytes: usize,

    /// Future heights (beyond the current one) whose messages are buffered.
    pub height_lookahead: u64,
    /// Future rounds of the current height whose messages are accepted.
    pub round_lookahead: u32,
    pub max_buffered_messages: usize,

    /// Heights of own vote history checked at startup; 0 disables the guard.
    pub double_sign_check_height: u64,
    #[serde(with = "humantime_serde")]
    pub sign_timeout: Duration,

    pub wal_file: PathBuf,
    /// fsync after every WAL append
    pub wal_sync: bool,
    /// Committed heights kept in the WAL; 0 never compacts.
    pub wal_retain_heights: u64,

    pub event_queue_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose: Duration::from_secs(3),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_secs(1),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_secs(1),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_secs(1),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            max_block_bytes: 1024 * 1024,
            height_lookahead: 1,
            round_lookahead: 10,
            max_buffered_messages: 10_000,
            double_sign_check_height: 0,
            sign_timeout: Duration::from_secs(1),
            wal_file: PathBuf::from("cs.wal/wal"),
            wal_sync: true,
            wal_retain_heights: 100,
            event_queue_capacity: 4096,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_propose.is_zero() {
            return Err(ConfigError::ZeroProposeTimeout);
        }
        if self.round_lookahead == 0 {
            return Err(ConfigError::ZeroRoundLookahead);
        }
        if self.max_block_bytes == 0 {
            return Err(ConfigError::ZeroBlockBytes);
        }
        Ok(())
    }

    /// Millisecond-scale timeouts for tests and in-process devnets.
    pub fn fast() -> Self {
        Self {
            timeout_propose: Duration::from_millis(200),
            timeout_propose_delta: Duration::from_millis(50),
            timeout_prevote: Duration::from_millis(100),
            timeout_prevote_delta: Duration::from_millis(50),
            timeout_precommit: Duration::from_millis(100),
            timeout_precommit_delta: Duration::from_millis(50),
            timeout_commit: Duration::from_millis(20),
            sign_timeout: Duration::from_millis(200),
            wal_sync: false,
            ..Self::default()
        }
    }
}
