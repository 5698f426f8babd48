use crate::consensus::wal::read_entries;
use crate::crypto::{KeyFile, Keypair, LocalSigner};
use crate::network::LocalNetwork;
use crate::node::config::{GenesisValidator, NodeConfig, CONFIG_FILE};
use crate::node::{Node, NodeParts, ServiceHandle};
use crate::utils::logging::init_logging;
use crate::utils::metrics::METRICS;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// CLI for node control.
#[derive(Parser)]
#[clap(name = "stratumbft-node", version)]
pub struct Cli {
    /// Path to data directory
    #[clap(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Log level when RUST_LOG is unset; defaults to `node.log_level` from the config file
    #[clap(long)]
    pub log_level: Option<String>,

    #[clap(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand)]
pub enum Cmd {
    /// Write config.toml and a fresh validator key into the data directory
    Init {
        #[clap(long, default_value = "val-0")]
        moniker: String,

        /// overwrite an existing config and key
        #[clap(long)]
        force: bool,
    },
    /// Run the node
    Run {
        /// run N in-process validators over the local network instead of the configured node
        #[clap(long)]
        devnet: Option<usize>,

        /// submit a random transaction this often (devnet only, "0" disables)
        #[clap(long, default_value = "500ms", value_parser = humantime::parse_duration)]
        tx_interval: Duration,
    },
    /// Decode and print write-ahead log entries
    WalDump {
        /// WAL file; defaults to the configured one
        #[clap(long)]
        file: Option<PathBuf>,

        /// one JSON object per line
        #[clap(long)]
        json: bool,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&log_level(&cli));

    match cli.cmd {
        Cmd::Init { moniker, force } => init(&cli.data_dir, &moniker, force),
        Cmd::Run { devnet: Some(n), tx_interval } => run_devnet(&cli.data_dir, n, tx_interval).await,
        Cmd::Run { devnet: None, .. } => run_single(&cli.data_dir).await,
        Cmd::WalDump { file, json } => wal_dump(&cli.data_dir, file, json),
    }
}

/// `--log-level`, then the config file's `node.log_level`, then "info".
fn log_level(cli: &Cli) -> String {
    match &cli.log_level {
        Some(level) => level.clone(),
        None => NodeConfig::load(cli.data_dir.join(CONFIG_FILE))
            .map(|cfg| cfg.node.log_level)
            .unwrap_or_else(|_| "info".into()),
    }
}

fn init(data_dir: &Path, moniker: &str, force: bool) -> Result<()> {
    let cfg_path = data_dir.join(CONFIG_FILE);
    if cfg_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", cfg_path.display());
    }
    std::fs::create_dir_all(data_dir)?;

    let keypair = Keypair::generate();
    let mut cfg = NodeConfig::default();
    cfg.node.moniker = moniker.to_string();
    cfg.node.data_dir = data_dir.to_path_buf();
    cfg.genesis.validators.push(GenesisValidator {
        id: moniker.to_string(),
        public_key: keypair.public().to_hex(),
        power: 10,
    });
    KeyFile::new(moniker, &keypair).save(cfg.key_path())?;
    cfg.save(&cfg_path)?;
    println!("initialized node data dir at {}", data_dir.display());
    println!("validator {} public key {}", moniker, keypair.public().to_hex());
    Ok(())
}

async fn run_single(data_dir: &Path) -> Result<()> {
    let mut cfg = NodeConfig::load(data_dir.join(CONFIG_FILE))?;
    cfg.node.data_dir = data_dir.to_path_buf();
    let key = KeyFile::load(cfg.key_path()).context("loading validator key")?;
    let validators = cfg.validator_set()?;
    if validators.len() > 1 {
        warn!(validators = validators.len(), "no peer transport configured, only the local validator will vote");
    }

    let net = LocalNetwork::new(validators);
    let signer = Arc::new(LocalSigner::new(key.id.clone(), key.keypair()?));
    let (parts, svc) = Node::new(cfg).start(signer, net.transport(key.id.clone())).await?;
    net.register(parts.id.clone(), parts.engine.clone());

    wait_for_exit(&[&svc]).await;
    println!("Shutting down node...");
    svc.shutdown().await?;
    println!("Node stopped at height {}", parts.ledger.height());
    Ok(())
}

async fn run_devnet(data_dir: &Path, n: usize, tx_interval: Duration) -> Result<()> {
    if n == 0 {
        bail!("--devnet needs at least one validator");
    }
    let keys: Vec<(String, Keypair)> = (0..n).map(|i| (format!("val-{}", i), Keypair::generate())).collect();
    let genesis: Vec<GenesisValidator> = keys
        .iter()
        .map(|(id, kp)| GenesisValidator { id: id.clone(), public_key: kp.public().to_hex(), power: 10 })
        .collect();

    let mut base = NodeConfig::default();
    base.genesis.validators = genesis;
    let net = LocalNetwork::new(base.validator_set()?);

    let mut nodes: Vec<(NodeParts, ServiceHandle)> = Vec::with_capacity(n);
    for (id, kp) in keys {
        let mut cfg = base.clone();
        cfg.node.moniker = id.clone();
        cfg.node.data_dir = data_dir.join(&id);
        let signer = Arc::new(LocalSigner::new(id.clone(), kp));
        let (parts, svc) = Node::new(cfg).start(signer, net.transport(id.clone())).await?;
        net.register(id, parts.engine.clone());
        nodes.push((parts, svc));
    }
    info!(validators = n, "devnet running");

    let feeder = (!tx_interval.is_zero()).then(|| {
        let pools: Vec<_> = nodes.iter().map(|(p, _)| p.pool.clone()).collect();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(tx_interval);
            loop {
                tick.tick().await;
                let tx = {
                    let mut rng = rand::thread_rng();
                    let mut tx = vec![0u8; rng.gen_range(16..128)];
                    rng.fill(&mut tx[..]);
                    tx
                };
                // every pool gets the tx, as a gossiping mempool would
                for pool in &pools {
                    let _ = pool.insert(tx.clone());
                }
            }
        })
    });

    let handles: Vec<&ServiceHandle> = nodes.iter().map(|(_, s)| s).collect();
    wait_for_exit(&handles).await;
    if let Some(f) = feeder {
        f.abort();
    }
    println!("Shutting down devnet...");
    let mut result = Ok(());
    for (parts, svc) in nodes {
        let height = parts.ledger.height();
        if let Err(e) = svc.shutdown().await {
            result = Err(e);
        }
        println!("{} stopped at height {}", parts.id, height);
    }
    println!("{:?}", METRICS.snapshot());
    result
}

/// Waits for Ctrl+C, or for any service to stop on its own.
async fn wait_for_exit(services: &[&ServiceHandle]) {
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => return,
            _ = poll.tick() => {
                if services.iter().any(|s| s.any_finished()) {
                    warn!("a node service stopped");
                    return;
                }
            }
        }
    }
}

fn wal_dump(data_dir: &Path, file: Option<PathBuf>, json: bool) -> Result<()> {
    let path = match file {
        Some(p) => p,
        None => {
            let mut cfg = NodeConfig::load(data_dir.join(CONFIG_FILE))?;
            cfg.node.data_dir = data_dir.to_path_buf();
            cfg.consensus_resolved().wal_file
        }
    };
    let decoded = read_entries(&path).with_context(|| format!("reading {}", path.display()))?;
    for entry in &decoded.entries {
        if json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!("h={} r={} {:?} {:?}", entry.height, entry.round, entry.step, entry.event);
        }
    }
    if let Some(reason) = decoded.torn {
        println!("torn tail after byte {}: {}", decoded.valid_len, reason);
    }
    Ok(())
}
