//! Consensus engine: the single consumer of the event queue.
//!
//! Everything that can change consensus state (peer messages, fired timeouts, signed own
//! messages, mempool notifications) is an `Event` on one bounded queue, handled strictly in
//! order. Each accepted input is appended to the WAL before the state machine sees it.
//!
//! Two helper tasks run next to the loop:
//! - the sign worker builds blocks and signs proposals and votes one at a time, so the
//!   last-sign-state only ever moves forward
//! - the broadcaster hands outbound messages to the transport in the order they were produced

use crate::consensus::config::ConsensusConfig;
use crate::consensus::evidence::EvidenceReporter;
use crate::consensus::sign_state::{DoubleSignGuard, SignStateStore};
use crate::consensus::state_machine::{Action, Input, RoundState, StateMachine};
use crate::consensus::timeout::{TimeoutInfo, Timer};
use crate::consensus::types::{Block, BlockId, CommitSeal, Height, Proposal, Round, Step, ValidatorId, Vote};
use crate::consensus::validation::{authenticate, FutureBuffer, Verdict};
use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::wal::{Wal, WalEntry, WalEvent};
use crate::consensus::{Application, Mempool, PrivValidator, Transport};
use crate::network::message::{ConsensusMessage, Envelope, PeerId};
use crate::storage::KvStore;
use crate::utils::errors::{ConsensusError, Result, SignError};
use crate::utils::metrics::{self, METRICS};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// External services the engine drives. All of them are shared with the rest of the node.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub mempool: Arc<dyn Mempool>,
    pub app: Arc<dyn Application>,
    pub signer: Arc<dyn PrivValidator>,
    pub evidence: Arc<dyn EvidenceReporter>,
    /// Backing store of the last-sign-state.
    pub sign_store: Arc<dyn KvStore>,
}

#[derive(Debug)]
pub(crate) enum Event {
    Message(Envelope),
    Timeout(TimeoutInfo),
    TxsAvailable { height: Height, round: Round },
    Signed(ConsensusMessage),
    SignFailed { height: Height, round: Round, error: SignError },
    Query(oneshot::Sender<RoundState>),
    Terminate,
}

/// Cloneable handle for feeding and inspecting a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Event>,
}

impl EngineHandle {
    /// Queues an inbound message. Waits while the queue is full.
    pub async fn deliver(&self, from: PeerId, message: ConsensusMessage) -> Result<()> {
        self.tx
            .send(Event::Message(Envelope { from, message }))
            .await
            .map_err(|_| ConsensusError::QueueClosed)
    }

    /// Snapshot of the round state, answered in queue order.
    pub async fn round_state(&self) -> Result<RoundState> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Event::Query(reply)).await.map_err(|_| ConsensusError::QueueClosed)?;
        rx.await.map_err(|_| ConsensusError::QueueClosed)
    }

    /// Asks the engine to stop after the events already queued.
    pub async fn terminate(&self) {
        let _ = self.tx.send(Event::Terminate).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum SignRequest {
    Build { height: Height, round: Round, parent: Option<BlockId> },
    Proposal(Proposal),
    Vote(Vote),
    PruneBelow(Height),
}

/// Owns the last-sign-state once the engine is live.
struct SignWorker {
    id: ValidatorId,
    state: SignStateStore,
    signer: Arc<dyn PrivValidator>,
    mempool: Arc<dyn Mempool>,
    max_block_bytes: usize,
    timeout: Duration,
    events: mpsc::Sender<Event>,
}

impl SignWorker {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<SignRequest>) {
        while let Some(req) = requests.recv().await {
            let event = match req {
                SignRequest::Build { height, round, parent } => {
                    let txs = self.mempool.pending_transactions(self.max_block_bytes);
                    let block = Block { height, parent, proposer: self.id.clone(), timestamp_ms: now_ms(), txs };
                    debug!(height, round, txs = block.txs.len(), bytes = block.txs_bytes(), "built block");
                    self.proposal(Proposal::new(height, round, block, None, self.id.clone())).await
                }
                SignRequest::Proposal(p) => self.proposal(p).await,
                SignRequest::Vote(v) => self.vote(v).await,
                SignRequest::PruneBelow(height) => {
                    match self.state.prune_history_below(height).await {
                        Ok(n) if n > 0 => debug!(below = height, pruned = n, "sign history pruned"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "pruning sign history failed"),
                    }
                    continue;
                }
            };
            if self.events.send(event).await.is_err() {
                break;
            }
        }
    }

    async fn proposal(&mut self, mut p: Proposal) -> Event {
        match self.state.sign_proposal(self.signer.as_ref(), &p, self.timeout).await {
            Ok(sig) => {
                p.signature = sig;
                Event::Signed(ConsensusMessage::Proposal(p))
            }
            Err(error) => Event::SignFailed { height: p.height, round: p.round, error },
        }
    }

    async fn vote(&mut self, mut v: Vote) -> Event {
        match self.state.sign_vote(self.signer.as_ref(), &v, self.timeout).await {
            Ok(sig) => {
                v.signature = sig;
                Event::Signed(ConsensusMessage::Vote(v))
            }
            Err(error) => Event::SignFailed { height: v.height, round: v.round, error },
        }
    }
}

async fn broadcast_loop(transport: Arc<dyn Transport>, mut outbound: mpsc::UnboundedReceiver<ConsensusMessage>) {
    while let Some(msg) = outbound.recv().await {
        transport.broadcast(msg).await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

// state held until the helper tasks are spawned
struct Idle {
    sign_state: SignStateStore,
    sign_rx: mpsc::UnboundedReceiver<SignRequest>,
    outbound_rx: mpsc::UnboundedReceiver<ConsensusMessage>,
}

pub struct ConsensusEngine {
    cfg: ConsensusConfig,
    id: ValidatorId,
    sm: StateMachine,
    wal: Wal,
    timer: Timer<Event>,
    collab: Collaborators,
    buffer: FutureBuffer,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    sign_tx: mpsc::UnboundedSender<SignRequest>,
    outbound_tx: mpsc::UnboundedSender<ConsensusMessage>,
    idle: Option<Idle>,
    tx_waiter: Option<JoinHandle<()>>,
    replaying: bool,
    position: (Height, Round),
}

impl ConsensusEngine {
    /// Opens the WAL and sign state and positions the machine at the height after the
    /// application's last commit. Nothing runs until `run`.
    pub async fn new(cfg: ConsensusConfig, collab: Collaborators) -> Result<(Self, EngineHandle)> {
        cfg.validate()?;
        let id = collab.signer.id();
        let last = collab.app.last_committed_height().await?;
        let height = last + 1;
        let validators = validator_set(collab.transport.as_ref(), height)?;
        let last_block_id = if last > 0 { collab.app.block_id_at(last).await? } else { None };
        if !validators.contains(&id) {
            info!(%id, height, "not in the validator set, following only");
        }

        let sm = StateMachine::new(id.clone(), &cfg, height, validators, last_block_id);
        let wal = Wal::open(&cfg.wal_file, cfg.wal_sync)?;
        let sign_state = SignStateStore::open(collab.sign_store.clone()).await?;

        let (events_tx, events_rx) = mpsc::channel(cfg.event_queue_capacity);
        let (sign_tx, sign_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let timer = Timer::new(events_tx.clone(), Event::Timeout);
        let handle = EngineHandle { tx: events_tx.clone() };

        let engine = Self {
            buffer: FutureBuffer::new(cfg.max_buffered_messages),
            cfg,
            id,
            sm,
            wal,
            timer,
            collab,
            events_tx,
            events_rx,
            sign_tx,
            outbound_tx,
            idle: Some(Idle { sign_state, sign_rx, outbound_rx }),
            tx_waiter: None,
            replaying: false,
            position: (height, 0),
        };
        Ok((engine, handle))
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle { tx: self.events_tx.clone() }
    }

    /// Replays the WAL, runs the double-sign guard, then processes events until terminated.
    /// Returns the fatal error that stopped it, if any.
    pub async fn run(mut self) -> Result<()> {
        let idle = self.idle.take().ok_or(ConsensusError::QueueClosed)?;
        let resume = self.recover(&idle.sign_state).await?;

        let worker = SignWorker {
            id: self.id.clone(),
            state: idle.sign_state,
            signer: self.collab.signer.clone(),
            mempool: self.collab.mempool.clone(),
            max_block_bytes: self.cfg.max_block_bytes,
            timeout: self.cfg.sign_timeout,
            events: self.events_tx.clone(),
        };
        tokio::spawn(worker.run(idle.sign_rx));
        tokio::spawn(broadcast_loop(self.collab.transport.clone(), idle.outbound_rx));

        let mut inputs = VecDeque::new();
        for action in resume {
            self.execute(action, &mut inputs).await?;
        }
        while let Some(input) = inputs.pop_front() {
            self.apply(input).await?;
        }
        info!(
            height = self.sm.height(),
            round = self.sm.round(),
            step = ?self.sm.step(),
            "consensus engine running"
        );

        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!(error = %e, height = self.sm.height(), "consensus engine halted");
        }
        self.timer.disarm();
        if let Some(waiter) = self.tx_waiter.take() {
            waiter.abort();
        }
        self.wal.flush_sync()?;
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        while let Some(event) = self.events_rx.recv().await {
            if let Event::Terminate = event {
                info!(height = self.sm.height(), "consensus engine terminating");
                return Ok(());
            }
            let height = self.sm.height();
            self.on_event(event).await?;
            if self.sm.height() > height {
                self.drain_buffer().await?;
            }
        }
        Err(ConsensusError::QueueClosed)
    }

    // ---- recovery ----

    async fn recover(&mut self, sign_state: &SignStateStore) -> Result<Vec<Action>> {
        let start = self.sm.height();
        let entries = self.wal.read_all()?;
        self.replaying = true;
        let mut replayed = 0usize;
        for entry in &entries {
            if entry.event_height() < self.sm.height() {
                continue;
            }
            let input = match &entry.event {
                WalEvent::Start(height) if *height == self.sm.height() => Input::Start,
                WalEvent::Proposal(p) => Input::Proposal(p.clone()),
                WalEvent::Vote(v) => Input::Vote(v.clone()),
                WalEvent::Timeout(t) => Input::Timeout(*t),
                WalEvent::TxsAvailable { height, round } => Input::TxsAvailable { height: *height, round: *round },
                WalEvent::Start(_) | WalEvent::EndHeight(_) => continue,
            };
            replayed += 1;
            self.apply(input).await?;
        }
        if self.sm.step() == Step::NewHeight {
            // nothing logged moved this height past its start
            self.log(WalEvent::Start(self.sm.height()))?;
            self.apply(Input::Start).await?;
        }
        self.replaying = false;
        info!(
            from_height = start,
            entries = entries.len(),
            replayed,
            height = self.sm.height(),
            round = self.sm.round(),
            step = ?self.sm.step(),
            "wal replay finished"
        );

        self.guard_double_sign(start, &entries, sign_state).await?;
        Ok(self.sm.resume_actions())
    }

    async fn guard_double_sign(&self, start: Height, entries: &[WalEntry], sign_state: &SignStateStore) -> Result<()> {
        let depth = self.cfg.double_sign_check_height;
        if depth == 0 {
            return Ok(());
        }
        let from = start.saturating_sub(depth).max(1);
        let history = sign_state.history(from).await?;
        let mut guard = DoubleSignGuard::new(self.id.clone(), &history);

        let own_logged = entries.iter().filter_map(|e| match &e.event {
            WalEvent::Vote(v) if v.height >= from => Some(v),
            _ => None,
        });
        guard.check_votes("wal", own_logged)?;

        let last = self.collab.app.last_committed_height().await?;
        for height in from..=last {
            if let Some(seal) = self.collab.app.commit_seal(height).await? {
                guard.check_votes("commit seal", &seal.precommits)?;
            }
        }
        info!(from, to = start, checked = guard.checked(), "double-sign guard passed");
        Ok(())
    }

    // ---- live events ----

    async fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Message(env) => self.on_message(env.from, env.message).await,
            Event::Timeout(info) => {
                if !self.sm.is_live_timeout(&info) {
                    trace!(height = info.height, round = info.round, step = ?info.step, "dropping stale timeout");
                    return Ok(());
                }
                METRICS.inc_counter(metrics::TIMEOUTS);
                self.log(WalEvent::Timeout(info))?;
                self.apply(Input::Timeout(info)).await
            }
            Event::TxsAvailable { height, round } => {
                if height != self.sm.height() || round != self.sm.round() {
                    return Ok(());
                }
                self.log(WalEvent::TxsAvailable { height, round })?;
                self.apply(Input::TxsAvailable { height, round }).await
            }
            Event::Signed(msg) => self.on_own_message(msg).await,
            Event::SignFailed { height, round, error } => {
                METRICS.inc_counter(metrics::SIGN_FAILURES);
                warn!(height, round, %error, "signing failed, abstaining");
                Ok(())
            }
            Event::Query(reply) => {
                let _ = reply.send(self.sm.round_state());
                Ok(())
            }
            Event::Terminate => Ok(()),
        }
    }

    async fn on_message(&mut self, from: PeerId, msg: ConsensusMessage) -> Result<()> {
        let mut verdict = self.sm.validation_context().validate(&msg);
        if verdict == Verdict::Buffer {
            // park only what the known set for that height vouches for
            if let Some(set) = self.collab.transport.validator_set(msg.height()) {
                if let Err(rejected) = authenticate(&msg, &set) {
                    verdict = rejected;
                }
            }
        }
        match &verdict {
            Verdict::Accept | Verdict::Equivocation(_) => self.accept(msg).await,
            Verdict::Buffer => {
                if !self.buffer.push(Envelope { from, message: msg }) {
                    METRICS.inc_counter(metrics::DROPPED_MESSAGES);
                }
                Ok(())
            }
            Verdict::RejectStale | Verdict::RejectFuture => {
                trace!(%from, height = msg.height(), round = msg.round(), ?verdict, "dropping message");
                METRICS.inc_counter(metrics::DROPPED_MESSAGES);
                Ok(())
            }
            Verdict::RejectMalformed(reason) => {
                warn!(%from, signer = msg.signer(), %reason, "malformed message");
                METRICS.inc_counter(metrics::DROPPED_MESSAGES);
                self.collab.transport.report_peer(&from, reason);
                Ok(())
            }
            Verdict::RejectUnauthorized => {
                debug!(%from, signer = msg.signer(), "message from non-validator");
                METRICS.inc_counter(metrics::DROPPED_MESSAGES);
                self.collab.transport.report_peer(&from, "unauthorized signer");
                Ok(())
            }
        }
    }

    async fn accept(&mut self, msg: ConsensusMessage) -> Result<()> {
        let input = match msg {
            ConsensusMessage::Proposal(p) => {
                self.log(WalEvent::Proposal(p.clone()))?;
                Input::Proposal(p)
            }
            ConsensusMessage::Vote(v) => {
                self.log(WalEvent::Vote(v.clone()))?;
                Input::Vote(v)
            }
        };
        self.apply(input).await
    }

    async fn on_own_message(&mut self, msg: ConsensusMessage) -> Result<()> {
        if msg.height() == self.sm.height() {
            self.accept(msg.clone()).await?;
        }
        // peers still at that height may need it even if we moved on
        let _ = self.outbound_tx.send(msg);
        Ok(())
    }

    async fn drain_buffer(&mut self) -> Result<()> {
        loop {
            let height = self.sm.height();
            let pending = self.buffer.take(height);
            if pending.is_empty() {
                return Ok(());
            }
            debug!(height, count = pending.len(), "replaying buffered messages");
            for env in pending {
                self.on_message(env.from, env.message).await?;
            }
            if self.sm.height() == height {
                return Ok(());
            }
        }
    }

    fn log(&mut self, event: WalEvent) -> Result<()> {
        let entry = WalEntry { height: self.sm.height(), round: self.sm.round(), step: self.sm.step(), event };
        self.wal.append(&entry)?;
        Ok(())
    }

    // ---- actions ----

    async fn apply(&mut self, input: Input) -> Result<()> {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let committed = matches!(input, Input::Committed { .. });
            for action in self.sm.handle(input) {
                self.execute(action, &mut inputs).await?;
            }
            if committed && self.sm.step() != Step::NewHeight {
                // round 0 began without a logged commit timeout
                self.log(WalEvent::Start(self.sm.height()))?;
            }
        }
        let position = (self.sm.height(), self.sm.round());
        if position != self.position {
            if round_advanced(self.position, position) {
                METRICS.inc_counter(metrics::ROUNDS);
            }
            self.position = position;
            METRICS.set_gauge(metrics::HEIGHT, position.0 as f64);
            METRICS.set_gauge(metrics::ROUND, position.1 as f64);
        }
        Ok(())
    }

    async fn execute(&mut self, action: Action, inputs: &mut VecDeque<Input>) -> Result<()> {
        if self.replaying && !matches!(action, Action::Commit { .. }) {
            return Ok(());
        }
        match action {
            Action::ScheduleTimeout(info) => self.timer.arm(info),
            Action::BuildProposal { height, round, parent } => {
                self.request_sign(SignRequest::Build { height, round, parent });
            }
            Action::SignProposal(p) => self.request_sign(SignRequest::Proposal(p)),
            Action::SignVote(v) => self.request_sign(SignRequest::Vote(v)),
            Action::WaitForTxs { height, round } => self.wait_for_txs(height, round),
            Action::ReportEvidence(evidence) => {
                METRICS.inc_counter(metrics::EQUIVOCATIONS);
                let reporter = self.collab.evidence.clone();
                tokio::spawn(async move {
                    if let Err(e) = reporter.report(evidence).await {
                        warn!(error = %e, "evidence report failed");
                    }
                });
            }
            Action::Commit { block, seal } => {
                let height = block.height;
                let next_validators = self.commit(&block, &seal).await?;
                inputs.push_back(Input::Committed { height, next_validators });
            }
        }
        Ok(())
    }

    fn request_sign(&self, req: SignRequest) {
        if self.sign_tx.send(req).is_err() {
            warn!("sign worker gone");
        }
    }

    fn wait_for_txs(&mut self, height: Height, round: Round) {
        if let Some(prev) = self.tx_waiter.take() {
            prev.abort();
        }
        let mempool = self.collab.mempool.clone();
        let events = self.events_tx.clone();
        self.tx_waiter = Some(tokio::spawn(async move {
            mempool.wait_for_txs().await;
            let _ = events.send(Event::TxsAvailable { height, round }).await;
        }));
    }

    /// Hands the decided block to the application and closes the height. Returns the
    /// validator set of the next height.
    async fn commit(&mut self, block: &Block, seal: &CommitSeal) -> Result<ValidatorSet> {
        let height = block.height;
        self.timer.disarm();
        if let Some(waiter) = self.tx_waiter.take() {
            waiter.abort();
        }

        let applied = self.collab.app.last_committed_height().await?;
        let fresh = applied < height;
        if fresh {
            let app_hash = self
                .collab
                .app
                .apply_block(block, seal)
                .await
                .map_err(|source| ConsensusError::ApplyBlock { height, source })?;
            info!(
                height,
                round = seal.round,
                block = %block.id().short(),
                txs = block.txs.len(),
                app_hash = %hex::encode(&app_hash[..4]),
                "committed block"
            );
            METRICS.inc_counter(metrics::COMMITS);
        } else {
            debug!(height, applied, "block already applied");
        }
        self.collab.mempool.evict(&block.txs);

        if !self.replaying || fresh {
            self.log(WalEvent::EndHeight(height))?;
        }
        self.wal.flush_sync()?;

        let retain = self.cfg.wal_retain_heights;
        if retain > 0 && height >= retain {
            self.wal.prune_below(height + 1 - retain)?;
        }
        let keep = self.cfg.double_sign_check_height.max(1);
        if height >= keep {
            self.request_sign(SignRequest::PruneBelow(height + 1 - keep));
        }

        validator_set(self.collab.transport.as_ref(), height + 1)
    }
}

// a new round of the same height; moving to the next height is not a round change
fn round_advanced(from: (Height, Round), to: (Height, Round)) -> bool {
    from.0 == to.0 && to.1 > from.1
}

fn validator_set(transport: &dyn Transport, height: Height) -> Result<ValidatorSet> {
    transport.validator_set(height).ok_or_else(|| ConsensusError::ValidatorSet {
        height,
        reason: "no validator set known".into(),
    })
}
