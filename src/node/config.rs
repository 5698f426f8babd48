//! Node configuration file (`config.toml` in the data dir).
//!
//! ```toml
//! [node]
//! moniker = "val-0"
//! data_dir = "./data"
//! key_file = "validator_key.json"
//! storage = "fs"
//!
//! [consensus]
//! timeout_propose = "3s"
//! timeout_propose_delta = "500ms"
//!
//! [mempool]
//! size = 5000
//!
//! [[genesis.validators]]
//! id = "val-0"
//! public_key = "<hex>"
//! power = 10
//! ```

use crate::consensus::config::ConsensusConfig;
use crate::consensus::validator_set::{Validator, ValidatorSet};
use crate::crypto::PublicKey;
use crate::storage::StorageEngine;
use crate::txpool::TxPoolConfig;
use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub moniker: String,
    pub data_dir: PathBuf,
    /// Relative paths resolve against `data_dir`.
    pub key_file: PathBuf,
    pub storage: StorageEngine,
    pub log_level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            moniker: "val-0".into(),
            data_dir: PathBuf::from("./data"),
            key_file: PathBuf::from("validator_key.json"),
            storage: StorageEngine::default(),
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub id: String,
    /// hex encoded ed25519 public key
    pub public_key: String,
    pub power: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub validators: Vec<GenesisValidator>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub consensus: ConsensusConfig,
    pub mempool: TxPoolConfig,
    pub genesis: GenesisConfig,
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg: NodeConfig = toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        cfg.consensus.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), data)?;
        Ok(())
    }

    pub fn validator_set(&self) -> Result<ValidatorSet> {
        let validators = self
            .genesis
            .validators
            .iter()
            .map(|v| {
                let public_key = PublicKey::from_hex(&v.public_key)
                    .with_context(|| format!("genesis key of {}", v.id))?;
                Ok(Validator { id: v.id.clone(), public_key, power: v.power })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ValidatorSet::new(validators)?)
    }

    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.node.data_dir.join(p)
        }
    }

    pub fn key_path(&self) -> PathBuf {
        self.resolve(&self.node.key_file)
    }

    /// Consensus settings with the WAL path resolved against the data dir.
    pub fn consensus_resolved(&self) -> ConsensusConfig {
        ConsensusConfig { wal_file: self.resolve(&self.consensus.wal_file), ..self.consensus.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use std::time::Duration;

    #[test]
    fn test_save_load_and_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let kp = Keypair::generate();
        let mut cfg = NodeConfig::default();
        cfg.node.data_dir = dir.path().to_path_buf();
        cfg.consensus.timeout_propose = Duration::from_millis(1500);
        cfg.genesis.validators.push(GenesisValidator { id: "val-0".into(), public_key: kp.public().to_hex(), power: 7 });

        let path = dir.path().join(CONFIG_FILE);
        cfg.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("timeout_propose = \"1500ms\""));

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
        let set = loaded.validator_set().unwrap();
        assert_eq!(set.total_power(), 7);
        assert_eq!(loaded.consensus_resolved().wal_file, dir.path().join("cs.wal/wal"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let cfg: NodeConfig = toml::from_str("[node]\nmoniker = \"x\"\n[consensus]\nskip_timeout_commit = true\n").unwrap();
        assert_eq!(cfg.node.moniker, "x");
        assert!(cfg.consensus.skip_timeout_commit);
        assert_eq!(cfg.mempool, TxPoolConfig::default());
        assert!(cfg.validator_set().is_err());
    }
}
