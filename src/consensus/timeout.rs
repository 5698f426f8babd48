//! Timeout scheduling.
//!
//! `timeout_for(step, round) = base(step) + delta(step) * round`. The `Timer` keeps exactly one
//! armed timeout: arming a new one cancels the previous task. Fired timeouts are delivered into
//! the engine's ordered event queue, never handled from the timer task itself.

use crate::consensus::config::ConsensusConfig;
use crate::consensus::types::{Height, Round, Step};
use serde::{Serialize, Deserialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSchedule {
    propose: (Duration, Duration),
    prevote: (Duration, Duration),
    precommit: (Duration, Duration),
    commit: Duration,
    skip_commit: bool,
    empty_blocks_interval: Duration,
}

impl TimeoutSchedule {
    pub fn from_config(cfg: &ConsensusConfig) -> Self {
        Self {
            propose: (cfg.timeout_propose, cfg.timeout_propose_delta),
            prevote: (cfg.timeout_prevote, cfg.timeout_prevote_delta),
            precommit: (cfg.timeout_precommit, cfg.timeout_precommit_delta),
            commit: cfg.timeout_commit,
            skip_commit: cfg.skip_timeout_commit,
            empty_blocks_interval: cfg.create_empty_blocks_interval,
        }
    }

    /// Deadline for the timer armed on entering `step` in `round`.
    pub fn timeout_for(&self, step: Step, round: Round) -> Duration {
        let linear = |(base, delta): (Duration, Duration)| base.saturating_add(delta.saturating_mul(round));
        match step {
            Step::Propose => linear(self.propose),
            Step::Prevote | Step::PrevoteWait => linear(self.prevote),
            Step::Precommit | Step::PrecommitWait => linear(self.precommit),
            Step::NewHeight | Step::Commit => {
                if self.skip_commit {
                    Duration::ZERO
                } else {
                    self.commit
                }
            }
            Step::NewRound => self.empty_blocks_interval,
        }
    }

    pub fn skip_commit(&self) -> bool {
        self.skip_commit
    }
}

/// Single-slot cancellable timer feeding fired timeouts into a channel.
pub struct Timer<E> {
    tx: mpsc::Sender<E>,
    wrap: fn(TimeoutInfo) -> E,
    armed: Option<(TimeoutInfo, CancellationToken)>,
}

impl<E: Send + 'static> Timer<E> {
    pub fn new(tx: mpsc::Sender<E>, wrap: fn(TimeoutInfo) -> E) -> Self {
        Self { tx, wrap, armed: None }
    }

    /// Arm `info`, disarming whatever was pending.
    pub fn arm(&mut self, info: TimeoutInfo) {
        self.disarm();
        let token = CancellationToken::new();
        let child = token.clone();
        let tx = self.tx.clone();
        let event = (self.wrap)(info);
        trace!(height = info.height, round = info.round, step = ?info.step, duration = ?info.duration, "arming timeout");
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(info.duration) => {
                    // a closed queue means the engine is gone
                    let _ = tx.send(event).await;
                }
            }
        });
        self.armed = Some((info, token));
    }

    pub fn disarm(&mut self) {
        if let Some((_, token)) = self.armed.take() {
            token.cancel();
        }
    }
}

impl<E> Drop for Timer<E> {
    fn drop(&mut self) {
        if let Some((_, token)) = self.armed.take() {
            token.cancel();
        }
    }
}
