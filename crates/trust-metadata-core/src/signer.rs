//! Signing collaborator and a local Ed25519 implementation for tests and tooling.
//!
//! The engine never holds private key material of its own; production
//! deployments inject a [`Signer`] backed by an HSM, smartcard or remote
//! signing service.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use ed25519_dalek::{Signer as DalekSigner, SigningKey};
use thiserror::Error;

use crate::crypto::{Key, KeyId, PublicKey};
use crate::error::Result;

/// Errors reported by a [`Signer`].
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no private key available for '{0}'")]
    Unavailable(KeyId),
    #[error("signing with '{key_id}' failed: {reason}")]
    Failed { key_id: KeyId, reason: String },
}

/// Produces signatures over canonical payload bytes.
///
/// `payload` is the complete canonical JSON encoding of the document's
/// `signed` section, not a digest of it: Ed25519 hashes the message itself,
/// so a backend that only accepts prehashed input cannot produce signatures
/// this crate will verify. The returned bytes are the raw signature.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, key_id: &KeyId, payload: &[u8]) -> std::result::Result<Vec<u8>, SignerError>;
}

/// An Ed25519 signing key paired with its public identity.
pub struct Ed25519Keypair {
    signing: SigningKey,
    key: Key,
}

impl Ed25519Keypair {
    pub fn from_seed(seed: [u8; 32]) -> Result<Self> {
        let signing = SigningKey::from_bytes(&seed);
        let key = Key::new(PublicKey::ed25519(signing.verifying_key().as_bytes()))?;
        Ok(Ed25519Keypair { signing, key })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field("key_id", self.key.id())
            .finish_non_exhaustive()
    }
}

/// In-memory signer keyed by key id.
#[derive(Debug, Default)]
pub struct MemorySigner {
    keys: RwLock<HashMap<KeyId, Ed25519Keypair>>,
}

impl MemorySigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a keypair and returns its public key.
    pub fn insert(&self, keypair: Ed25519Keypair) -> Key {
        let key = keypair.key().clone();
        if let Ok(mut guard) = self.keys.write() {
            guard.insert(key.id().clone(), keypair);
        }
        key
    }

    /// Forgets a key, e.g. to simulate a revoked or offline device.
    pub fn remove(&self, key_id: &KeyId) -> bool {
        self.keys
            .write()
            .map(|mut guard| guard.remove(key_id).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.keys
            .read()
            .map(|guard| guard.contains_key(key_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Signer for MemorySigner {
    async fn sign(&self, key_id: &KeyId, payload: &[u8]) -> std::result::Result<Vec<u8>, SignerError> {
        let guard = self.keys.read().map_err(|_| SignerError::Failed {
            key_id: key_id.clone(),
            reason: "signer key map poisoned".into(),
        })?;
        let keypair = guard
            .get(key_id)
            .ok_or_else(|| SignerError::Unavailable(key_id.clone()))?;
        Ok(keypair.sign(payload).to_vec())
    }
}
