//! Crypto module: validator key management, signing, verification.
//!
//! - Keys: generation, key file storage, hex serialization
//! - Sign: Ed25519 signatures and the local `PrivValidator` signer

pub mod keys;
pub mod sign;

pub use keys::{Keypair, PublicKey, KeyFile, KeyError};
pub use sign::{Signer, Verifier, LocalSigner};
