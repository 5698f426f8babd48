//! Node orchestration: wire storage, ledger, txpool, signer and transport into the consensus
//! engine and run it under a `ServiceHandle`.

use crate::consensus::{
    Collaborators, ConsensusEngine, EngineHandle, EvidencePool, PrivValidator, Transport,
};
use crate::ledger::Ledger;
use crate::node::config::NodeConfig;
use crate::node::service_handle::ServiceHandle;
use crate::storage;
use crate::txpool::TxPool;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Shared pieces of a started node.
#[derive(Clone)]
pub struct NodeParts {
    pub id: String,
    pub engine: EngineHandle,
    pub ledger: Arc<Ledger>,
    pub pool: Arc<TxPool>,
    pub evidence: Arc<EvidencePool>,
}

/// Main Node object
pub struct Node {
    cfg: NodeConfig,
}

impl Node {
    pub fn new(cfg: NodeConfig) -> Self {
        Self { cfg }
    }

    /// Start the node: open stores, replay the WAL, spawn the engine and return the
    /// ServiceHandle for graceful shutdown.
    pub async fn start(
        self,
        signer: Arc<dyn PrivValidator>,
        transport: Arc<dyn Transport>,
    ) -> Result<(NodeParts, ServiceHandle)> {
        let (mut svc, mut shutdown_rx) = ServiceHandle::new();
        let data_dir = self.cfg.node.data_dir.clone();
        std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;

        let engine_kind = self.cfg.node.storage;
        let ledger_kv = storage::open(&data_dir.join("ledger"), engine_kind)?;
        let sign_kv = storage::open(&data_dir.join("sign_state"), engine_kind)?;

        let validators = self.cfg.validator_set()?;
        let ledger = Arc::new(Ledger::open(ledger_kv, validators).await?);
        let pool = Arc::new(TxPool::new(self.cfg.mempool.clone()));
        let evidence = Arc::new(EvidencePool::new());

        let collab = Collaborators {
            transport,
            mempool: pool.clone(),
            app: ledger.clone(),
            signer: signer.clone(),
            evidence: evidence.clone(),
            sign_store: sign_kv,
        };
        let (engine, handle) = ConsensusEngine::new(self.cfg.consensus_resolved(), collab).await?;

        let h: JoinHandle<Result<()>> = tokio::spawn(async move { Ok(engine.run().await?) });
        svc.attach("consensus", h);

        {
            let handle = handle.clone();
            let h: JoinHandle<Result<()>> = tokio::spawn(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                handle.terminate().await;
                Ok(())
            });
            svc.attach("shutdown", h);
        }

        let id = signer.id();
        info!(
            moniker = %self.cfg.node.moniker,
            validator = %id,
            height = ledger.height() + 1,
            data_dir = %data_dir.display(),
            "node started"
        );
        Ok((NodeParts { id, engine: handle, ledger, pool, evidence }, svc))
    }
}
