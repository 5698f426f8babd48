//! Round-state machine.
//!
//! A pure, single-threaded driver: `handle(Input) -> Vec<Action>`. It never signs, sleeps,
//! persists or sends anything itself. Intents (sign this vote, arm this timeout, commit this
//! block) are returned as `Action`s, and their results come back later as `Input`s through the
//! engine's ordered queue. The same sequence of inputs always produces the same state, which
//! is what makes WAL replay exact.
//!
//! Per height the machine owns the lock, the valid block, the proposals seen per round and the
//! `HeightVoteSet`. All of it is discarded on commit.

use crate::consensus::config::ConsensusConfig;
use crate::consensus::evidence::Evidence;
use crate::consensus::timeout::{TimeoutInfo, TimeoutSchedule};
use crate::consensus::types::{Block, BlockId, CommitSeal, Height, Proposal, Round, Step, ValidatorId, Vote, VoteType};
use crate::consensus::validation::{Lookahead, ValidationContext};
use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::vote_set::{AddVoteResult, HeightVoteSet, Majority};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Begin the current height at round 0 without waiting for the commit timeout.
    Start,
    Proposal(Proposal),
    Vote(Vote),
    Timeout(TimeoutInfo),
    /// The mempool reported transactions while round 0 waited for them.
    TxsAvailable { height: Height, round: Round },
    /// The decided block was applied; move to the next height.
    Committed { height: Height, next_validators: ValidatorSet },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ScheduleTimeout(TimeoutInfo),
    /// Build a fresh block on `parent`, sign it as a proposal and feed it back.
    BuildProposal { height: Height, round: Round, parent: Option<BlockId> },
    /// Re-propose an already known block.
    SignProposal(Proposal),
    SignVote(Vote),
    WaitForTxs { height: Height, round: Round },
    ReportEvidence(Evidence),
    Commit { block: Block, seal: CommitSeal },
}

/// Observable snapshot of the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub locked_round: Option<Round>,
    pub locked_block: Option<BlockId>,
    pub valid_round: Option<Round>,
    pub valid_block: Option<BlockId>,
    pub proposal_block: Option<BlockId>,
    pub last_block_id: Option<BlockId>,
    pub commit_round: Option<Round>,
}

pub struct StateMachine {
    id: ValidatorId,
    schedule: TimeoutSchedule,
    create_empty_blocks: bool,
    max_block_bytes: usize,
    lookahead: Lookahead,

    height: Height,
    round: Round,
    step: Step,
    validators: ValidatorSet,
    votes: HeightVoteSet,
    proposals: BTreeMap<Round, Proposal>,
    blocks: HashMap<BlockId, Block>,
    locked: Option<(Round, BlockId)>,
    valid: Option<(Round, BlockId)>,
    last_block_id: Option<BlockId>,
    commit_round: Option<Round>,

    // what this validator decided at the current round, kept to re-issue after replay
    last_timeout: Option<TimeoutInfo>,
    proposal_intent: Option<Action>,
    prevote_intent: Option<Option<BlockId>>,
    precommit_intent: Option<Option<BlockId>>,
}

impl StateMachine {
    pub fn new(
        id: ValidatorId,
        cfg: &ConsensusConfig,
        height: Height,
        validators: ValidatorSet,
        last_block_id: Option<BlockId>,
    ) -> Self {
        let votes = HeightVoteSet::new(height, validators.clone());
        Self {
            id,
            schedule: TimeoutSchedule::from_config(cfg),
            create_empty_blocks: cfg.create_empty_blocks,
            max_block_bytes: cfg.max_block_bytes,
            lookahead: Lookahead::from(cfg),
            height,
            round: 0,
            step: Step::NewHeight,
            validators,
            votes,
            proposals: BTreeMap::new(),
            blocks: HashMap::new(),
            locked: None,
            valid: None,
            last_block_id,
            commit_round: None,
            last_timeout: None,
            proposal_intent: None,
            prevote_intent: None,
            precommit_intent: None,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn votes(&self) -> &HeightVoteSet {
        &self.votes
    }

    pub fn is_validator(&self) -> bool {
        self.validators.contains(&self.id)
    }

    pub fn round_state(&self) -> RoundState {
        RoundState {
            height: self.height,
            round: self.round,
            step: self.step,
            locked_round: self.locked.map(|(r, _)| r),
            locked_block: self.locked.map(|(_, b)| b),
            valid_round: self.valid.map(|(r, _)| r),
            valid_block: self.valid.map(|(_, b)| b),
            proposal_block: self.proposals.get(&self.round).map(|p| p.block_id()),
            last_block_id: self.last_block_id,
            commit_round: self.commit_round,
        }
    }

    pub fn validation_context(&self) -> ValidationContext<'_> {
        ValidationContext {
            height: self.height,
            round: self.round,
            validators: &self.validators,
            votes: &self.votes,
            proposals: &self.proposals,
            known_blocks: &self.blocks,
            last_block_id: self.last_block_id,
            max_block_bytes: self.max_block_bytes,
            lookahead: self.lookahead,
        }
    }

    /// Whether a fired timeout still matches the current (height, round, step).
    pub fn is_live_timeout(&self, info: &TimeoutInfo) -> bool {
        info.height == self.height && info.round == self.round && info.step == self.step
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::Start => {
                if self.step == Step::NewHeight {
                    self.enter_new_round(0, &mut out);
                }
            }
            Input::Proposal(p) => self.on_proposal(p, &mut out),
            Input::Vote(v) => self.on_vote(v, &mut out),
            Input::Timeout(info) => self.on_timeout(info, &mut out),
            Input::TxsAvailable { height, round } => {
                if height == self.height && round == self.round && self.step == Step::NewRound {
                    self.enter_propose(round, &mut out);
                }
            }
            Input::Committed { height, next_validators } => self.on_committed(height, next_validators, &mut out),
        }
        out
    }

    /// Actions to re-issue after WAL replay: the armed timeout and any own message decided
    /// but never logged.
    pub fn resume_actions(&self) -> Vec<Action> {
        let mut out = Vec::new();
        if self.step == Step::Commit {
            return out;
        }
        if let Some(info) = self.last_timeout.filter(|t| self.is_live_timeout(t)) {
            out.push(Action::ScheduleTimeout(info));
        }
        if self.step == Step::NewRound {
            out.push(Action::WaitForTxs { height: self.height, round: self.round });
        }
        if self.step == Step::Propose && !self.proposals.contains_key(&self.round) {
            if let Some(intent) = &self.proposal_intent {
                out.push(intent.clone());
            }
        }
        let pending = [(VoteType::Prevote, self.prevote_intent), (VoteType::Precommit, self.precommit_intent)];
        for (vote_type, intent) in pending {
            if let Some(block_id) = intent {
                if self.votes.get(&self.id, self.round, vote_type).is_none() {
                    if let Some(vote) = self.own_vote(vote_type, block_id) {
                        out.push(Action::SignVote(vote));
                    }
                }
            }
        }
        out
    }

    // ---- transitions ----

    fn schedule(&mut self, step: Step, out: &mut Vec<Action>) {
        let info = TimeoutInfo {
            height: self.height,
            round: self.round,
            step,
            duration: self.schedule.timeout_for(step, self.round),
        };
        self.last_timeout = Some(info);
        out.push(Action::ScheduleTimeout(info));
    }

    fn enter_new_round(&mut self, round: Round, out: &mut Vec<Action>) {
        if round < self.round || (round == self.round && self.step != Step::NewHeight) || self.step == Step::Commit {
            return;
        }
        debug!(height = self.height, round, "entering new round");
        self.round = round;
        self.step = Step::NewRound;
        self.proposal_intent = None;
        self.prevote_intent = None;
        self.precommit_intent = None;

        if round == 0 && !self.create_empty_blocks {
            out.push(Action::WaitForTxs { height: self.height, round });
            if !self.schedule.timeout_for(Step::NewRound, round).is_zero() {
                self.schedule(Step::NewRound, out);
            }
            return;
        }
        self.enter_propose(round, out);
    }

    fn enter_propose(&mut self, round: Round, out: &mut Vec<Action>) {
        if round != self.round || self.step >= Step::Propose {
            return;
        }
        self.step = Step::Propose;
        self.schedule(Step::Propose, out);

        if self.validators.is_proposer(&self.id, self.height, round) {
            let intent = match self.valid.and_then(|(vr, id)| self.blocks.get(&id).map(|b| (vr, b))) {
                Some((vr, block)) => {
                    debug!(height = self.height, round, block = %block.id().short(), "re-proposing valid block");
                    Action::SignProposal(Proposal::new(self.height, round, block.clone(), Some(vr), self.id.clone()))
                }
                None => Action::BuildProposal { height: self.height, round, parent: self.last_block_id },
            };
            self.proposal_intent = Some(intent.clone());
            if !self.proposals.contains_key(&round) {
                out.push(intent);
            }
        }

        if self.proposal_ready() {
            self.enter_prevote(round, out);
        }
    }

    fn enter_prevote(&mut self, round: Round, out: &mut Vec<Action>) {
        if round != self.round || self.step >= Step::Prevote {
            return;
        }
        self.step = Step::Prevote;
        let target = self.decide_prevote();
        trace!(height = self.height, round, ?target, "prevote decided");
        self.prevote_intent = Some(target);
        if let Some(vote) = self.own_vote(VoteType::Prevote, target) {
            out.push(Action::SignVote(vote));
        }
        self.check_prevotes(round, out);
    }

    fn enter_prevote_wait(&mut self, round: Round, out: &mut Vec<Action>) {
        if round != self.round || self.step != Step::Prevote {
            return;
        }
        self.step = Step::PrevoteWait;
        self.schedule(Step::PrevoteWait, out);
    }

    fn enter_precommit(&mut self, round: Round, out: &mut Vec<Action>) {
        if round != self.round || self.step >= Step::Precommit {
            return;
        }
        self.step = Step::Precommit;
        let target = match self.votes.majority(round, VoteType::Prevote) {
            Some(Majority::Block(id)) if self.blocks.get(&id).map_or(false, |b| self.is_valid_block(b)) => {
                if self.locked.map(|(_, b)| b) != Some(id) {
                    info!(height = self.height, round, block = %id.short(), "locking block");
                }
                self.locked = Some((round, id));
                self.valid = Some((round, id));
                Some(id)
            }
            Some(Majority::Block(id)) => {
                // majority on a block we cannot check: release a lock on anything else
                if matches!(self.locked, Some((lr, lb)) if lb != id && lr < round) {
                    debug!(height = self.height, round, "unlocking for unknown majority block");
                    self.locked = None;
                }
                None
            }
            _ => None,
        };
        self.precommit_intent = Some(target);
        if let Some(vote) = self.own_vote(VoteType::Precommit, target) {
            out.push(Action::SignVote(vote));
        }
        self.check_precommits(round, out);
    }

    fn enter_precommit_wait(&mut self, round: Round, out: &mut Vec<Action>) {
        if round != self.round || self.step >= Step::PrecommitWait {
            return;
        }
        self.step = Step::PrecommitWait;
        self.schedule(Step::PrecommitWait, out);
    }

    fn try_commit(&mut self, out: &mut Vec<Action>) -> bool {
        if self.step == Step::Commit {
            return true;
        }
        for (round, id) in self.votes.precommit_majorities() {
            let Some(block) = self.blocks.get(&id) else {
                debug!(height = self.height, round, block = %id.short(), "commit majority for unknown block");
                continue;
            };
            if !self.is_valid_block(block) {
                warn!(height = self.height, round, block = %id.short(), "commit majority for invalid block");
                continue;
            }
            let precommits = self
                .votes
                .vote_set(round, VoteType::Precommit)
                .map(|s| s.votes_for(Some(id)))
                .unwrap_or_default();
            let seal = CommitSeal { height: self.height, round, block_id: id, precommits };
            info!(height = self.height, round, block = %id.short(), txs = block.txs.len(), "committing block");
            self.step = Step::Commit;
            self.commit_round = Some(round);
            out.push(Action::Commit { block: block.clone(), seal });
            return true;
        }
        false
    }

    fn on_committed(&mut self, height: Height, next_validators: ValidatorSet, out: &mut Vec<Action>) {
        if height != self.height || self.step != Step::Commit {
            warn!(height, current = self.height, step = ?self.step, "unexpected commit notification");
            return;
        }
        let committed = self
            .commit_round
            .and_then(|r| self.votes.majority_block(r, VoteType::Precommit));
        let next = height + 1;
        self.height = next;
        self.round = 0;
        self.step = Step::NewHeight;
        self.votes = HeightVoteSet::new(next, next_validators.clone());
        self.validators = next_validators;
        self.proposals.clear();
        self.blocks.clear();
        self.locked = None;
        self.valid = None;
        self.last_block_id = committed.or(self.last_block_id);
        self.commit_round = None;
        self.proposal_intent = None;
        self.prevote_intent = None;
        self.precommit_intent = None;

        if self.schedule.skip_commit() {
            self.enter_new_round(0, out);
        } else {
            self.schedule(Step::NewHeight, out);
        }
    }

    // ---- inputs ----

    fn on_proposal(&mut self, p: Proposal, out: &mut Vec<Action>) {
        if p.height != self.height || self.proposals.contains_key(&p.round) || self.step == Step::Commit {
            return;
        }
        let id = p.block_id();
        let round = p.round;
        debug!(height = self.height, round, block = %id.short(), proposer = %p.proposer, "proposal received");
        self.blocks.insert(id, p.block.clone());
        self.proposals.insert(round, p);

        if self.try_commit(out) {
            return;
        }
        if round != self.round {
            return;
        }
        if self.step < Step::Propose {
            self.enter_propose(round, out);
        } else if self.step == Step::Propose {
            if self.proposal_ready() {
                self.enter_prevote(round, out);
            }
        } else {
            // late block for a majority already seen at this round
            self.check_prevotes(round, out);
        }
    }

    fn on_vote(&mut self, vote: Vote, out: &mut Vec<Action>) {
        if vote.height != self.height || self.step == Step::Commit {
            return;
        }
        let (round, vote_type) = (vote.round, vote.vote_type);
        match self.votes.add_vote(vote) {
            Ok(AddVoteResult::Added) => {}
            Ok(AddVoteResult::Duplicate) => return,
            Ok(AddVoteResult::Conflicting(evidence)) => {
                warn!(height = self.height, round, validator = %evidence.validator(), "equivocating vote");
                out.push(Action::ReportEvidence(evidence));
                return;
            }
            Err(e) => {
                debug!(error = %e, "vote not counted");
                return;
            }
        }

        if round > self.round && self.votes.has_two_thirds_any(round, vote_type) {
            info!(height = self.height, from = self.round, to = round, "skipping to round with +2/3 votes");
            self.enter_new_round(round, out);
        }
        match vote_type {
            VoteType::Prevote => self.check_prevotes(round, out),
            VoteType::Precommit => self.check_precommits(round, out),
        }
    }

    fn check_prevotes(&mut self, round: Round, out: &mut Vec<Action>) {
        let majority = self.votes.majority(round, VoteType::Prevote);

        if let Some(Majority::Block(id)) = majority {
            if round == self.round
                && self.step >= Step::Prevote
                && self.blocks.contains_key(&id)
                && self.valid.map_or(true, |(vr, _)| vr < round)
            {
                self.valid = Some((round, id));
            }
        }

        if round == self.round {
            match self.step {
                Step::Prevote | Step::PrevoteWait => {
                    if majority.is_some() {
                        self.enter_precommit(round, out);
                    } else if self.votes.has_two_thirds_any(round, VoteType::Prevote) {
                        self.enter_prevote_wait(round, out);
                    }
                }
                _ => {}
            }
        }

        // a proof-of-lock arriving for a proposal that waits on it
        if self.step == Step::Propose && self.proposal_ready() {
            let current = self.round;
            self.enter_prevote(current, out);
        }
    }

    fn check_precommits(&mut self, round: Round, out: &mut Vec<Action>) {
        if self.try_commit(out) {
            return;
        }
        if round == self.round && self.step >= Step::Propose && self.votes.has_two_thirds_any(round, VoteType::Precommit) {
            self.enter_precommit_wait(round, out);
        }
    }

    fn on_timeout(&mut self, info: TimeoutInfo, out: &mut Vec<Action>) {
        if !self.is_live_timeout(&info) {
            trace!(height = info.height, round = info.round, step = ?info.step, "ignoring stale timeout");
            return;
        }
        debug!(height = info.height, round = info.round, step = ?info.step, "timeout");
        match info.step {
            Step::NewHeight => self.enter_new_round(0, out),
            Step::NewRound => self.enter_propose(info.round, out),
            Step::Propose => self.enter_prevote(info.round, out),
            Step::PrevoteWait => self.enter_precommit(info.round, out),
            Step::PrecommitWait => self.enter_new_round(info.round + 1, out),
            Step::Prevote | Step::Precommit | Step::Commit => {}
        }
    }

    // ---- decisions ----

    fn decide_prevote(&mut self) -> Option<BlockId> {
        let proposal = self
            .proposals
            .get(&self.round)
            .filter(|p| self.is_valid_block(&p.block))
            .map(|p| (p.block_id(), p.pol_round));
        match (self.locked, proposal) {
            (Some((_, locked)), Some((id, _))) if id == locked => Some(locked),
            (Some((lr, locked)), Some((id, pol))) => {
                if matches!(pol, Some(vr) if vr > lr) && self.pol_holds(id, pol) {
                    info!(height = self.height, round = self.round, from = %locked.short(), to = %id.short(), "unlocking for newer proof-of-lock");
                    self.locked = None;
                    Some(id)
                } else {
                    Some(locked)
                }
            }
            (Some((_, locked)), None) => Some(locked),
            (None, Some((id, pol))) if self.pol_holds(id, pol) => Some(id),
            (None, _) => None,
        }
    }

    /// A proposal without a proof-of-lock, or one whose POL round holds a prevote majority
    /// for its block.
    fn pol_holds(&self, id: BlockId, pol_round: Option<Round>) -> bool {
        match pol_round {
            None => true,
            Some(vr) => self.votes.majority_block(vr, VoteType::Prevote) == Some(id),
        }
    }

    fn proposal_ready(&self) -> bool {
        self.proposals
            .get(&self.round)
            .map_or(false, |p| self.pol_holds(p.block_id(), p.pol_round))
    }

    fn is_valid_block(&self, block: &Block) -> bool {
        block.height == self.height
            && block.parent == self.last_block_id
            && self.validators.contains(&block.proposer)
            && block.txs_bytes() <= self.max_block_bytes
    }

    fn own_vote(&self, vote_type: VoteType, block_id: Option<BlockId>) -> Option<Vote> {
        let me = self.validators.get(&self.id)?;
        Some(Vote::new(self.height, self.round, vote_type, block_id, self.id.clone(), me.power))
    }
}
