use ed25519_dalek::{Keypair as DalekKeypair, PublicKey as DalekPublic, SecretKey};
use rand::RngCore;
use serde::{Serialize, Deserialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key bytes: {0}")]
    InvalidKey(#[from] ed25519_dalek::SignatureError),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("key file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("public key does not match secret key")]
    Mismatch,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s)?;
        // validates the point encoding
        let pk = DalekPublic::from_bytes(&bytes)?;
        Ok(PublicKey(pk.to_bytes()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

/// Validator signing key. The secret is kept as raw bytes and expanded on use.
#[derive(Clone)]
pub struct Keypair {
    secret: [u8; 32],
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        // 32 random bytes are always a valid ed25519 secret
        match Self::from_secret_bytes(&secret) {
            Ok(kp) => kp,
            Err(_) => unreachable!("ed25519 secret keys accept any 32 bytes"),
        }
    }

    /// Construct from raw secret bytes
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, KeyError> {
        let sk = SecretKey::from_bytes(secret)?;
        let pk = DalekPublic::from(&sk);
        Ok(Self { secret: sk.to_bytes(), public: PublicKey(pk.to_bytes()) })
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret
    }

    pub(crate) fn dalek(&self) -> Result<DalekKeypair, KeyError> {
        let secret = SecretKey::from_bytes(&self.secret)?;
        let public = DalekPublic::from_bytes(&self.public.0)?;
        Ok(DalekKeypair { secret, public })
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// On-disk validator key file (JSON, hex encoded keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub id: String,
    pub public_key: String,
    pub secret_key: String,
}

impl KeyFile {
    pub fn new(id: impl Into<String>, keypair: &Keypair) -> Self {
        Self {
            id: id.into(),
            public_key: keypair.public().to_hex(),
            secret_key: hex::encode(keypair.secret_bytes()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyError> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn keypair(&self) -> Result<Keypair, KeyError> {
        let kp = Keypair::from_secret_bytes(&hex::decode(&self.secret_key)?)?;
        if kp.public().to_hex() != self.public_key {
            return Err(KeyError::Mismatch);
        }
        Ok(kp)
    }
}
