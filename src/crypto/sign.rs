use async_trait::async_trait;
use ed25519_dalek::{Signature as DalekSig, Signer as DalekSigner, Verifier as DalekVerifier};
use crate::consensus::types::{Proposal, ValidatorId, Vote};
use crate::consensus::PrivValidator;
use crate::crypto::{Keypair, KeyError, PublicKey};
use crate::utils::errors::SignError;

/// Trait for signing
pub trait Signer {
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, KeyError>;
}

/// Trait for verifying
pub trait Verifier {
    fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), KeyError>;
}

impl Signer for Keypair {
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, KeyError> {
        let sig = self.dalek()?.sign(msg);
        Ok(sig.to_bytes().to_vec())
    }
}

impl Verifier for PublicKey {
    fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), KeyError> {
        let pk = ed25519_dalek::PublicKey::from_bytes(&self.0)?;
        let ds = DalekSig::try_from(sig)?;
        pk.verify(msg, &ds)?;
        Ok(())
    }
}

/// In-process signer holding the validator key. Remote signers implement `PrivValidator`
/// the same way and may fail or time out.
pub struct LocalSigner {
    id: ValidatorId,
    keypair: Keypair,
}

impl LocalSigner {
    pub fn new(id: impl Into<ValidatorId>, keypair: Keypair) -> Self {
        Self { id: id.into(), keypair }
    }

    pub fn public(&self) -> PublicKey {
        self.keypair.public()
    }
}

#[async_trait]
impl PrivValidator for LocalSigner {
    fn id(&self) -> ValidatorId {
        self.id.clone()
    }

    async fn sign_vote(&self, vote: &Vote) -> Result<Vec<u8>, SignError> {
        self.keypair
            .sign(&vote.sign_bytes())
            .map_err(|e| SignError::Backend(e.to_string()))
    }

    async fn sign_proposal(&self, proposal: &Proposal) -> Result<Vec<u8>, SignError> {
        self.keypair
            .sign(&proposal.sign_bytes())
            .map_err(|e| SignError::Backend(e.to_string()))
    }
}
