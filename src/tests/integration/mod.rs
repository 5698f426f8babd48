//! Integration tests: engines wired to real ledgers, pools and WALs.
//!
//! Multi-node runs go through `LocalNetwork`. Crash and restart scenarios script the peers by
//! hand through a `Recorder` transport so every step is deterministic.

use crate::consensus::sign_state::{SignStateStore, SignStep, SignedRecord};
use crate::consensus::types::{Block, BlockId, Step, Vote, VoteType};
use crate::consensus::{Application, ConsensusConfig, Mempool, RoundState};
use crate::crypto::{Keypair, Signer};
use crate::network::ConsensusMessage;
use crate::tests::harness::{spawn_engine, Cluster, Keys, NodeStores, Recorder, Running};
use crate::utils::errors::ConsensusError;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn slow_timeouts() -> ConsensusConfig {
    ConsensusConfig {
        timeout_propose: Duration::from_secs(30),
        timeout_prevote: Duration::from_secs(30),
        timeout_precommit: Duration::from_secs(30),
        double_sign_check_height: 10,
        ..ConsensusConfig::fast()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_validators_commit_and_agree() {
    let mut cluster = Cluster::start(4, ConsensusConfig::fast(), &[]).await;
    let txs: Vec<Vec<u8>> = (0..5).map(|i| format!("transfer-{}", i).into_bytes()).collect();
    for i in 0..4 {
        for tx in &txs {
            cluster.node(i).pool.insert(tx.clone()).unwrap();
        }
    }

    assert!(cluster.wait_for_height(&[0, 1, 2, 3], 5, Duration::from_secs(30)).await);
    cluster.assert_agreement().await;

    let ledger = &cluster.node(0).ledger;
    let mut included = HashSet::new();
    let mut parent: Option<BlockId> = None;
    for h in 1..=4 {
        let block = ledger.block(h).await.unwrap().unwrap();
        assert_eq!(block.parent, parent);
        parent = Some(block.id());
        included.extend(block.txs.iter().cloned());

        let seal = ledger.commit_seal(h).await.unwrap().unwrap();
        assert_eq!(seal.block_id, block.id());
        cluster.keys.set.verify_commit_seal(&seal).unwrap();

        let hash = ledger.app_hash(h).await.unwrap();
        for i in 1..4 {
            assert_eq!(cluster.node(i).ledger.app_hash(h).await.unwrap(), hash);
        }
    }
    for tx in &txs {
        assert!(included.contains(tx));
    }
    for i in 0..4 {
        assert!(cluster.node(i).pool.is_empty());
    }

    for result in cluster.stop_all().await {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_offline_proposer_forces_next_round() {
    let offline = Keys::new(4).proposer_index(1, 0);
    let mut cluster = Cluster::start(4, ConsensusConfig::fast(), &[offline]).await;
    let online = cluster.online();
    assert_eq!(online.len(), 3);

    assert!(cluster.wait_for_height(&online, 1, Duration::from_secs(30)).await);
    cluster.assert_agreement().await;

    let seal = cluster.node(online[0]).ledger.commit_seal(1).await.unwrap().unwrap();
    assert!(seal.round >= 1, "height 1 cannot commit in round 0 without its proposer");
    let block = cluster.node(online[0]).ledger.block(1).await.unwrap().unwrap();
    assert_ne!(block.proposer, cluster.keys.id(offline));

    for result in cluster.stop_all().await {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_validator_does_not_stop_the_rest() {
    let mut cluster = Cluster::start(4, ConsensusConfig::fast(), &[]).await;
    assert!(cluster.wait_for_height(&[0, 1, 2, 3], 1, Duration::from_secs(30)).await);

    cluster.net.isolate(&cluster.keys.id(3));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stuck_at = cluster.node(3).ledger.height();

    assert!(cluster.wait_for_height(&[0, 1, 2], stuck_at + 2, Duration::from_secs(30)).await);
    assert!(cluster.node(3).ledger.height() <= stuck_at + 1);
    cluster.assert_agreement().await;

    for result in cluster.stop_all().await {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unauthorized_sender_is_reported() {
    let mut cluster = Cluster::start(4, ConsensusConfig::fast(), &[]).await;
    let outsider = Keypair::from_secret_bytes(&[99u8; 32]).unwrap();
    let mut vote = Vote::new(1, 0, VoteType::Prevote, None, "val-9".into(), 10);
    vote.signature = outsider.sign(&vote.sign_bytes()).unwrap();

    cluster.node(0).handle.deliver("intruder".into(), ConsensusMessage::Vote(vote)).await.unwrap();
    let reported = tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.net.reports("intruder").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reported.is_ok());

    for result in cluster.stop_all().await {
        result.unwrap();
    }
}

// ---- scripted peers ----

async fn next_vote(rx: &mut UnboundedReceiver<ConsensusMessage>) -> Vote {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
        if let ConsensusMessage::Vote(v) = msg {
            return v;
        }
    }
}

async fn crash(running: Running) {
    running.task.abort();
    let _ = running.task.await;
    // let the detached sign worker notice its queue is gone
    tokio::time::sleep(Duration::from_millis(50)).await;
}

struct Script {
    keys: Keys,
    me: usize,
    peers: Vec<usize>,
    block: Block,
    stores: NodeStores,
    cfg: ConsensusConfig,
    _dir: tempfile::TempDir,
}

impl Script {
    fn new() -> Self {
        let keys = Keys::new(4);
        let proposer = keys.proposer_index(1, 0);
        let me = (proposer + 1) % 4;
        let peers = (0..4).filter(|i| *i != me).collect();
        let block = keys.block(1, 0, None, vec![b"script-tx".to_vec()]);
        let dir = tempfile::tempdir().unwrap();
        let stores = NodeStores::new(&dir, &keys.id(me));
        Self { keys, me, peers, block, stores, cfg: slow_timeouts(), _dir: dir }
    }

    async fn spawn(&self) -> Result<(Running, UnboundedReceiver<ConsensusMessage>), ConsensusError> {
        let (transport, rx) = Recorder::new(self.keys.set.clone());
        let running = spawn_engine(&self.keys, self.me, &self.stores, &self.cfg, transport).await?;
        Ok((running, rx))
    }

    async fn send(&self, running: &Running, from: usize, msg: ConsensusMessage) {
        running.handle.deliver(self.keys.id(from), msg).await.unwrap();
    }

    /// Drives height 1 round 0 up to this node's precommit and returns its two votes.
    async fn to_precommit(&self, running: &Running, rx: &mut UnboundedReceiver<ConsensusMessage>) -> (Vote, Vote) {
        let proposer = self.keys.proposer_index(1, 0);
        let proposal = self.keys.proposal(0, self.block.clone(), None);
        self.send(running, proposer, ConsensusMessage::Proposal(proposal)).await;
        let prevote = next_vote(rx).await;

        let id = self.block.id();
        for &peer in self.peers.iter().take(2) {
            let v = self.keys.vote(peer, 1, 0, VoteType::Prevote, Some(id));
            self.send(running, peer, ConsensusMessage::Vote(v)).await;
        }
        let precommit = next_vote(rx).await;
        (prevote, precommit)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crash_after_precommit_keeps_lock_and_commits() {
    let script = Script::new();
    let id = script.block.id();

    let (running, mut rx) = script.spawn().await.unwrap();
    let (prevote, precommit) = script.to_precommit(&running, &mut rx).await;
    assert_eq!((prevote.vote_type, prevote.block_id), (VoteType::Prevote, Some(id)));
    assert_eq!((precommit.vote_type, precommit.block_id), (VoteType::Precommit, Some(id)));
    crash(running).await;

    // restart: replay lands on the same lock and nothing is re-signed
    let (running, mut rx) = script.spawn().await.unwrap();
    let state = running.handle.round_state().await.unwrap();
    assert_eq!((state.height, state.round, state.step), (1, 0, Step::Precommit));
    assert_eq!(state.locked_block, Some(id));
    assert_eq!(state.locked_round, Some(0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    // replaying the same log again yields the same state
    crash(running).await;
    let (running, mut rx) = script.spawn().await.unwrap();
    assert_eq!(running.handle.round_state().await.unwrap(), state);

    for &peer in script.peers.iter().take(2) {
        let v = script.keys.vote(peer, 1, 0, VoteType::Precommit, Some(id));
        script.send(&running, peer, ConsensusMessage::Vote(v)).await;
    }
    tokio::time::timeout(Duration::from_secs(10), async {
        while running.ledger.height() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(running.ledger.block(1).await.unwrap().unwrap().id(), id);
    assert_eq!(running.handle.round_state().await.unwrap().height, 2);

    // whatever it signs next belongs to height 2
    while let Ok(msg) = rx.try_recv() {
        assert!(msg.height() >= 2);
    }

    running.handle.terminate().await;
    running.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guard_refuses_conflicting_sign_history() {
    let script = Script::new();
    let (running, mut rx) = script.spawn().await.unwrap();
    script.to_precommit(&running, &mut rx).await;
    crash(running).await;

    // the sign history now claims a precommit for another block at the same round
    let mut state = SignStateStore::open(script.stores.sign_kv.clone()).await.unwrap();
    state
        .record(SignedRecord {
            height: 1,
            round: 0,
            step: SignStep::Precommit,
            block_id: Some(BlockId([7u8; 32])),
            signature: vec![1; 64],
        })
        .await
        .unwrap();

    let (running, _rx) = script.spawn().await.unwrap();
    let result = running.task.await.unwrap();
    assert!(matches!(result, Err(ConsensusError::DoubleSign(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equivocating_peer_is_reported_as_evidence() {
    let script = Script::new();
    let (running, mut rx) = script.spawn().await.unwrap();
    script.to_precommit(&running, &mut rx).await;

    let cheater = script.peers[2];
    let a = script.keys.vote(cheater, 1, 0, VoteType::Prevote, Some(script.block.id()));
    let b = script.keys.vote(cheater, 1, 0, VoteType::Prevote, Some(BlockId([3u8; 32])));
    script.send(&running, cheater, ConsensusMessage::Vote(a)).await;
    script.send(&running, cheater, ConsensusMessage::Vote(b)).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while running.evidence.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let evidence = running.evidence.pending();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].validator(), &script.keys.id(cheater));

    running.handle.terminate().await;
    running.task.await.unwrap().unwrap();
}

async fn wait_until(running: &Running, reached: impl Fn(&RoundState) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !reached(&running.handle.round_state().await.unwrap()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn settled_state(running: &Running, reached: impl Fn(&RoundState) -> bool) -> RoundState {
    wait_until(running, reached).await;
    // let own proposals and votes come back from the signer and reach the log
    tokio::time::sleep(Duration::from_millis(300)).await;
    running.handle.round_state().await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_mid_round_of_later_height_restores_state() {
    let mut script = Script::new();
    script.cfg.timeout_commit = Duration::from_millis(500);
    let id = script.block.id();

    let (running, mut rx) = script.spawn().await.unwrap();
    script.to_precommit(&running, &mut rx).await;
    for &peer in script.peers.iter().take(2) {
        let v = script.keys.vote(peer, 1, 0, VoteType::Precommit, Some(id));
        script.send(&running, peer, ConsensusMessage::Vote(v)).await;
    }
    wait_until(&running, |s| s.height == 2).await;

    // precommits that land while the commit timeout still runs are counted but not acted on
    let other = BlockId([5u8; 32]);
    let targets = [None, None, Some(other)];
    for (&peer, target) in script.peers.iter().zip(targets) {
        let v = script.keys.vote(peer, 2, 0, VoteType::Precommit, target);
        script.send(&running, peer, ConsensusMessage::Vote(v)).await;
    }
    let state = running.handle.round_state().await.unwrap();
    assert_eq!((state.height, state.round, state.step), (2, 0, Step::NewHeight));

    let before = settled_state(&running, |s| s.step != Step::NewHeight).await;
    assert!(matches!(before.step, Step::Propose | Step::Prevote), "step {:?}", before.step);
    crash(running).await;

    let (running, _rx) = script.spawn().await.unwrap();
    assert_eq!(running.handle.round_state().await.unwrap(), before);

    // move to round 1 and crash there
    for &peer in &script.peers {
        let v = script.keys.vote(peer, 2, 1, VoteType::Precommit, None);
        script.send(&running, peer, ConsensusMessage::Vote(v)).await;
    }
    let before = settled_state(&running, |s| s.round == 1 && s.step == Step::PrecommitWait).await;
    assert_eq!(before.height, 2);
    crash(running).await;

    let (running, mut rx) = script.spawn().await.unwrap();
    assert_eq!(running.handle.round_state().await.unwrap(), before);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    running.handle.terminate().await;
    running.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forged_future_vote_blames_the_sending_peer() {
    // a lone online validator cannot leave height 1
    let mut cluster = Cluster::start(4, slow_timeouts(), &[1, 2, 3]).await;
    let impostor = Keypair::from_secret_bytes(&[42u8; 32]).unwrap();
    let mut forged = Vote::new(2, 0, VoteType::Prevote, None, cluster.keys.id(1), 10);
    forged.signature = impostor.sign(&forged.sign_bytes()).unwrap();
    let honest = cluster.keys.vote(2, 2, 0, VoteType::Prevote, None);

    let node = cluster.node(0);
    node.handle.deliver("intruder".into(), ConsensusMessage::Vote(forged)).await.unwrap();
    node.handle.deliver(cluster.keys.id(2), ConsensusMessage::Vote(honest)).await.unwrap();
    assert_eq!(node.handle.round_state().await.unwrap().height, 1);

    assert_eq!(cluster.net.reports("intruder").len(), 1);
    assert!(cluster.net.reports(&cluster.keys.id(1)).is_empty());
    assert!(cluster.net.reports(&cluster.keys.id(2)).is_empty());

    for result in cluster.stop_all().await {
        result.unwrap();
    }
}
