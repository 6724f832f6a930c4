//! Key material, key identities, signatures and digests.
//!
//! Keys are identified by the SHA-256 of their canonical public encoding; a
//! key never carries role information, role binding lives in root and
//! targets metadata.

use std::fmt;

use data_encoding::BASE64;
use ed25519_dalek::{Signature as DalekSignature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::canonical::to_canonical_bytes;
use crate::error::{Result, TrustError};

/// Hex-encoded SHA-256 of a key's canonical public encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        KeyId(value.to_owned())
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        KeyId(value)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signature scheme declared by a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyAlgorithm {
    Ed25519,
    /// Any scheme this engine cannot verify; such keys never contribute to a threshold.
    Other(String),
}

impl From<String> for KeyAlgorithm {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ed25519" => KeyAlgorithm::Ed25519,
            _ => KeyAlgorithm::Other(value),
        }
    }
}

impl From<KeyAlgorithm> for String {
    fn from(value: KeyAlgorithm) -> Self {
        match value {
            KeyAlgorithm::Ed25519 => "ed25519".to_owned(),
            KeyAlgorithm::Other(other) => other,
        }
    }
}

/// Public half of the `keyval` object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    /// Base64 public key material.
    pub public: String,
}

/// Public key as it appears in root and delegation key maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: KeyAlgorithm,
    pub keyval: KeyValue,
}

impl PublicKey {
    /// Wraps raw Ed25519 public key bytes.
    pub fn ed25519(bytes: &[u8; 32]) -> Self {
        PublicKey {
            keytype: KeyAlgorithm::Ed25519,
            keyval: KeyValue {
                public: BASE64.encode(bytes),
            },
        }
    }

    /// Computes the content-addressed identity of this key.
    pub fn key_id(&self) -> Result<KeyId> {
        let canonical = to_canonical_bytes(self)?;
        Ok(KeyId(sha256_hex(&canonical)))
    }

    fn verifying_key(&self) -> std::result::Result<VerifyingKey, String> {
        let raw = BASE64
            .decode(self.keyval.public.as_bytes())
            .map_err(|err| format!("public key is not base64: {err}"))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| format!("ed25519 public key must be 32 bytes, got {}", raw.len()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|err| err.to_string())
    }
}

/// A public key together with its verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    id: KeyId,
    public: PublicKey,
}

impl Key {
    /// Builds a key, deriving its identity from the public material.
    pub fn new(public: PublicKey) -> Result<Self> {
        let id = public.key_id()?;
        Ok(Key { id, public })
    }

    /// Builds a key from a `keyid → key` map entry, rejecting mislabelled keys.
    pub fn from_declared(declared: &KeyId, public: PublicKey) -> Result<Self> {
        let key = Key::new(public)?;
        if &key.id != declared {
            return Err(TrustError::UnknownKey {
                key_id: declared.clone(),
                reason: "declared key id does not match the key material",
            });
        }
        Ok(key)
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn algorithm(&self) -> &KeyAlgorithm {
        &self.public.keytype
    }

    /// Checks `signature` over `message`; unsupported algorithms always fail.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let bad = |reason: String| TrustError::BadSignature {
            key_id: self.id.clone(),
            reason,
        };
        match &self.public.keytype {
            KeyAlgorithm::Ed25519 => {
                let verifying = self.public.verifying_key().map_err(bad)?;
                let raw = signature.bytes().map_err(bad)?;
                let sig = DalekSignature::from_slice(&raw).map_err(|err| bad(err.to_string()))?;
                verifying
                    .verify_strict(message, &sig)
                    .map_err(|err| bad(err.to_string()))
            }
            KeyAlgorithm::Other(name) => Err(bad(format!("unsupported key type '{name}'"))),
        }
    }
}

fn default_method() -> String {
    "ed25519".to_owned()
}

/// One entry of a document's signature list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: KeyId,
    #[serde(default = "default_method")]
    pub method: String,
    /// Base64 signature bytes.
    pub sig: String,
}

impl Signature {
    pub fn new(keyid: KeyId, bytes: &[u8]) -> Self {
        Signature {
            keyid,
            method: default_method(),
            sig: BASE64.encode(bytes),
        }
    }

    fn bytes(&self) -> std::result::Result<Vec<u8>, String> {
        BASE64
            .decode(self.sig.as_bytes())
            .map_err(|err| format!("signature is not base64: {err}"))
    }
}

/// Digest algorithms accepted in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 2] = [HashAlgorithm::Sha256, HashAlgorithm::Sha512];

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Lowercase hex digest of `bytes`.
    pub fn digest_hex(self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    HashAlgorithm::Sha256.digest_hex(bytes)
}
