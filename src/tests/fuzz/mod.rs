//! Randomized schedules over in-memory state machines.
//!
//! Messages are delivered in random order, duplicated or dropped, and timeouts fire at random
//! points. Optionally one validator equivocates. Every run must keep the honest validators on
//! one chain, and every machine's input log must replay to the same state.

use crate::consensus::config::ConsensusConfig;
use crate::consensus::state_machine::{Action, Input, StateMachine};
use crate::consensus::timeout::TimeoutInfo;
use crate::consensus::types::{BlockId, Height, Round, Vote, VoteType};
use crate::consensus::validation::Verdict;
use crate::network::ConsensusMessage;
use crate::tests::harness::Keys;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};

const VALIDATORS: usize = 4;

struct Faults {
    drop_rate: f64,
    duplicate_rate: f64,
    byzantine: Option<usize>,
}

impl Faults {
    fn none() -> Self {
        Self { drop_rate: 0.0, duplicate_rate: 0.0, byzantine: None }
    }
}

struct Sim {
    keys: Keys,
    cfg: ConsensusConfig,
    faults: Faults,
    rng: StdRng,
    machines: Vec<StateMachine>,
    inboxes: Vec<Vec<ConsensusMessage>>,
    parked: Vec<Vec<ConsensusMessage>>,
    timeouts: Vec<Option<TimeoutInfo>>,
    logs: Vec<Vec<Input>>,
    commits: Vec<BTreeMap<Height, BlockId>>,
    signed: Vec<HashMap<(Height, Round, VoteType), Option<BlockId>>>,
    evidence: Vec<String>,
}

impl Sim {
    fn new(seed: u64, faults: Faults) -> Self {
        let keys = Keys::new(VALIDATORS);
        let cfg = ConsensusConfig { height_lookahead: 10, ..ConsensusConfig::fast() };
        let machines = (0..VALIDATORS)
            .map(|i| StateMachine::new(keys.id(i), &cfg, 1, keys.set.clone(), None))
            .collect();
        Self {
            keys,
            cfg,
            faults,
            rng: StdRng::seed_from_u64(seed),
            machines,
            inboxes: vec![Vec::new(); VALIDATORS],
            parked: vec![Vec::new(); VALIDATORS],
            timeouts: vec![None; VALIDATORS],
            logs: vec![Vec::new(); VALIDATORS],
            commits: vec![BTreeMap::new(); VALIDATORS],
            signed: vec![HashMap::new(); VALIDATORS],
            evidence: Vec::new(),
        }
    }

    fn honest(&self) -> Vec<usize> {
        (0..VALIDATORS).filter(|i| Some(*i) != self.faults.byzantine).collect()
    }

    fn broadcast(&mut self, from: usize, msg: ConsensusMessage) {
        for to in (0..VALIDATORS).filter(|to| *to != from) {
            self.inboxes[to].push(msg.clone());
        }
    }

    // sends either the real vote or a conflicting one to each peer, sometimes both
    fn equivocate(&mut self, from: usize, vote: Vote) {
        let fake = BlockId(self.rng.gen());
        let real = ConsensusMessage::Vote(vote.clone());
        let other = ConsensusMessage::Vote(self.keys.vote(from, vote.height, vote.round, vote.vote_type, Some(fake)));
        for to in (0..VALIDATORS).filter(|to| *to != from) {
            let (first, second) = if self.rng.gen_bool(0.5) { (&real, &other) } else { (&other, &real) };
            self.inboxes[to].push(first.clone());
            if self.rng.gen_bool(0.3) {
                self.inboxes[to].push(second.clone());
            }
        }
    }

    fn feed(&mut self, i: usize, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            self.logs[i].push(input.clone());
            let height = self.machines[i].height();
            for action in self.machines[i].handle(input) {
                self.execute(i, action, &mut queue);
            }
            if self.machines[i].height() > height {
                let parked = std::mem::take(&mut self.parked[i]);
                self.inboxes[i].extend(parked);
            }
        }
    }

    fn execute(&mut self, i: usize, action: Action, queue: &mut VecDeque<Input>) {
        match action {
            Action::ScheduleTimeout(info) => self.timeouts[i] = Some(info),
            Action::BuildProposal { height, round, parent } => {
                let tx = vec![i as u8, round as u8, self.rng.gen()];
                let block = self.keys.block(height, round, parent, vec![tx]);
                let proposal = self.keys.proposal(round, block, None);
                queue.push_back(Input::Proposal(proposal.clone()));
                self.broadcast(i, ConsensusMessage::Proposal(proposal));
            }
            Action::SignProposal(p) => {
                let proposal = self.keys.proposal(p.round, p.block, p.pol_round);
                queue.push_back(Input::Proposal(proposal.clone()));
                self.broadcast(i, ConsensusMessage::Proposal(proposal));
            }
            Action::SignVote(v) => {
                let key = (v.height, v.round, v.vote_type);
                if let Some(prev) = self.signed[i].insert(key, v.block_id) {
                    assert_eq!(prev, v.block_id, "validator {} signed two different votes at {:?}", i, key);
                }
                let vote = self.keys.vote(i, v.height, v.round, v.vote_type, v.block_id);
                queue.push_back(Input::Vote(vote.clone()));
                if self.faults.byzantine == Some(i) {
                    self.equivocate(i, vote);
                } else {
                    self.broadcast(i, ConsensusMessage::Vote(vote));
                }
            }
            Action::WaitForTxs { height, round } => queue.push_back(Input::TxsAvailable { height, round }),
            Action::ReportEvidence(ev) => self.evidence.push(ev.validator().clone()),
            Action::Commit { block, seal } => {
                assert_eq!(seal.block_id, block.id());
                self.keys.set.verify_commit_seal(&seal).unwrap();
                self.commits[i].insert(block.height, block.id());
                queue.push_back(Input::Committed { height: block.height, next_validators: self.keys.set.clone() });
            }
        }
    }

    fn deliver(&mut self, i: usize, msg: ConsensusMessage) {
        let verdict = self.machines[i].validation_context().validate(&msg);
        match verdict {
            Verdict::Accept | Verdict::Equivocation(_) => {
                let input = match msg {
                    ConsensusMessage::Proposal(p) => Input::Proposal(p),
                    ConsensusMessage::Vote(v) => Input::Vote(v),
                };
                self.feed(i, input);
            }
            Verdict::Buffer => self.parked[i].push(msg),
            _ => {}
        }
    }

    fn fire_timeout(&mut self, i: usize) {
        if let Some(info) = self.timeouts[i].take() {
            if self.machines[i].is_live_timeout(&info) {
                self.feed(i, Input::Timeout(info));
            }
        }
    }

    fn step(&mut self) -> bool {
        let pending: Vec<usize> = (0..VALIDATORS).filter(|i| !self.inboxes[*i].is_empty()).collect();
        let armed: Vec<usize> = (0..VALIDATORS).filter(|i| self.timeouts[*i].is_some()).collect();
        if pending.is_empty() && armed.is_empty() {
            return false;
        }
        if !pending.is_empty() && (armed.is_empty() || self.rng.gen_bool(0.85)) {
            let i = pending[self.rng.gen_range(0..pending.len())];
            let at = self.rng.gen_range(0..self.inboxes[i].len());
            let msg = self.inboxes[i].swap_remove(at);
            if self.rng.gen_bool(self.faults.drop_rate) {
                return true;
            }
            if self.rng.gen_bool(self.faults.duplicate_rate) {
                self.inboxes[i].push(msg.clone());
            }
            self.deliver(i, msg);
        } else {
            let i = armed[self.rng.gen_range(0..armed.len())];
            self.fire_timeout(i);
        }
        true
    }

    fn run(&mut self, target: Height, max_steps: usize) {
        for i in 0..VALIDATORS {
            self.feed(i, Input::Start);
        }
        for _ in 0..max_steps {
            if self.honest().iter().all(|i| self.machines[*i].height() > target) {
                return;
            }
            if !self.step() {
                return;
            }
        }
    }

    fn assert_safety(&self) {
        let honest = self.honest();
        let mut chain: BTreeMap<Height, BlockId> = BTreeMap::new();
        for i in &honest {
            for (h, id) in &self.commits[*i] {
                let agreed = chain.entry(*h).or_insert(*id);
                assert_eq!(agreed, id, "validator {} committed a different block at height {}", i, h);
            }
        }
        let byzantine = self.faults.byzantine.map(|b| self.keys.id(b));
        for accused in &self.evidence {
            assert_eq!(Some(accused), byzantine.as_ref(), "honest validator {} accused", accused);
        }
    }

    fn assert_replay(&self, i: usize) {
        let replay = || {
            let mut sm = StateMachine::new(self.keys.id(i), &self.cfg, 1, self.keys.set.clone(), None);
            for input in &self.logs[i] {
                sm.handle(input.clone());
            }
            sm.round_state()
        };
        let first = replay();
        assert_eq!(first, self.machines[i].round_state());
        assert_eq!(replay(), first);
    }

    fn top(&self) -> Height {
        self.honest().iter().map(|i| self.commits[*i].keys().last().copied().unwrap_or(0)).max().unwrap_or(0)
    }
}

#[test]
fn fuzz_reordered_delivery_commits_one_chain() {
    for seed in 0..6 {
        let mut sim = Sim::new(seed, Faults::none());
        sim.run(3, 40_000);
        sim.assert_safety();
        assert!(sim.top() >= 3, "seed {} stalled at height {}", seed, sim.top());
        for i in 0..VALIDATORS {
            sim.assert_replay(i);
        }
    }
}

#[test]
fn fuzz_drops_and_duplicates_stay_safe() {
    for seed in 100..110 {
        let faults = Faults { drop_rate: 0.1, duplicate_rate: 0.1, byzantine: None };
        let mut sim = Sim::new(seed, faults);
        sim.run(3, 20_000);
        sim.assert_safety();
        assert!(sim.evidence.is_empty());
        sim.assert_replay(0);
    }
}

#[test]
fn fuzz_equivocating_validator_cannot_split_the_chain() {
    for seed in 200..210 {
        let faults = Faults { drop_rate: 0.02, duplicate_rate: 0.05, byzantine: Some((seed % VALIDATORS as u64) as usize) };
        let mut sim = Sim::new(seed, faults);
        sim.run(3, 20_000);
        sim.assert_safety();
        for i in sim.honest() {
            sim.assert_replay(i);
        }
    }
}
