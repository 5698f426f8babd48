//! LocalNetwork: in-process broadcast hub connecting engines through their handles.
//!
//! - every registered node gets a `LocalTransport` endpoint
//! - links can be cut per direction to simulate partitions
//! - peers reported for misbehaviour are recorded, not disconnected

use crate::consensus::types::Height;
use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::{EngineHandle, Transport};
use crate::network::message::{ConsensusMessage, PeerId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{trace, warn};

struct Hub {
    validators: ValidatorSet,
    peers: HashMap<PeerId, EngineHandle>,
    // directed (from, to) links that drop everything
    cut: HashSet<(PeerId, PeerId)>,
    reports: HashMap<PeerId, Vec<String>>,
}

#[derive(Clone)]
pub struct LocalNetwork {
    hub: Arc<RwLock<Hub>>,
}

impl LocalNetwork {
    pub fn new(validators: ValidatorSet) -> Self {
        let hub = Hub { validators, peers: HashMap::new(), cut: HashSet::new(), reports: HashMap::new() };
        Self { hub: Arc::new(RwLock::new(hub)) }
    }

    /// Endpoint used as the `Transport` of node `id`.
    pub fn transport(&self, id: impl Into<PeerId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport { id: id.into(), hub: self.hub.clone() })
    }

    /// Starts routing messages to `handle`. Replaces an earlier registration of `id`.
    pub fn register(&self, id: impl Into<PeerId>, handle: EngineHandle) {
        self.hub.write().peers.insert(id.into(), handle);
    }

    pub fn unregister(&self, id: &str) {
        self.hub.write().peers.remove(id);
    }

    pub fn cut(&self, a: &str, b: &str) {
        let mut hub = self.hub.write();
        hub.cut.insert((a.to_string(), b.to_string()));
        hub.cut.insert((b.to_string(), a.to_string()));
    }

    /// Cuts every link of `id`, registered now or later.
    pub fn isolate(&self, id: &str) {
        let ids: Vec<PeerId> = self.hub.read().validators.iter().map(|v| v.id.clone()).collect();
        for other in ids.iter().filter(|o| o.as_str() != id) {
            self.cut(id, other);
        }
    }

    pub fn heal(&self) {
        self.hub.write().cut.clear();
    }

    pub fn reports(&self, peer: &str) -> Vec<String> {
        self.hub.read().reports.get(peer).cloned().unwrap_or_default()
    }
}

/// One node's view of the hub.
pub struct LocalTransport {
    id: PeerId,
    hub: Arc<RwLock<Hub>>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn broadcast(&self, msg: ConsensusMessage) {
        let targets: Vec<(PeerId, EngineHandle)> = {
            let hub = self.hub.read();
            hub.peers
                .iter()
                .filter(|(peer, _)| **peer != self.id && !hub.cut.contains(&(self.id.clone(), (*peer).clone())))
                .map(|(peer, handle)| (peer.clone(), handle.clone()))
                .collect()
        };
        let sends = targets.into_iter().map(|(peer, handle)| {
            let msg = msg.clone();
            let from = self.id.clone();
            async move {
                if handle.deliver(from, msg).await.is_err() {
                    trace!(%peer, "peer queue closed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    fn validator_set(&self, _height: Height) -> Option<ValidatorSet> {
        Some(self.hub.read().validators.clone())
    }

    fn report_peer(&self, peer: &PeerId, reason: &str) {
        warn!(reporter = %self.id, %peer, %reason, "peer misbehaviour");
        self.hub.write().reports.entry(peer.clone()).or_default().push(reason.to_string());
    }
}
