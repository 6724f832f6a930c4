//! Metadata documents: descriptors, the four payload kinds and the signed envelope.
//!
//! Payloads are a tagged sum type ([`Payload`]) keyed by `_type`; the envelope
//! and signing logic are written once against the [`Metadata`] capability and
//! reused for every role.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::to_canonical_bytes;
use crate::crypto::{HashAlgorithm, KeyId, PublicKey, Signature};
use crate::delegation::PathSet;
use crate::error::{Result, TrustError};
use crate::role::{Role, RoleKeys, RoleName};
use crate::signer::Ed25519Keypair;

/// Expected length, digests and version of a metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl FileMeta {
    /// Describes `bytes` with every supported digest.
    pub fn from_bytes(bytes: &[u8], version: Option<u64>) -> Self {
        let hashes = HashAlgorithm::ALL
            .iter()
            .map(|alg| (alg.as_str().to_owned(), alg.digest_hex(bytes)))
            .collect();
        FileMeta {
            length: Some(bytes.len() as u64),
            hashes,
            version,
        }
    }

    /// Descriptor that pins only a version.
    pub fn version_only(version: u64) -> Self {
        FileMeta {
            length: None,
            hashes: BTreeMap::new(),
            version: Some(version),
        }
    }

    /// True when at least one digest uses a supported algorithm.
    pub fn has_supported_hash(&self) -> bool {
        self.hashes
            .keys()
            .any(|name| HashAlgorithm::from_name(name).is_some())
    }

    /// Checks length and digests against the raw bytes. Runs before any parsing.
    pub fn check_bytes(&self, role: &RoleName, bytes: &[u8]) -> Result<()> {
        if let Some(length) = self.length {
            if bytes.len() as u64 != length {
                return Err(TrustError::descriptor(
                    role,
                    format!("length {} differs from expected {length}", bytes.len()),
                ));
            }
        }
        if !self.hashes.is_empty() && !self.has_supported_hash() {
            return Err(TrustError::descriptor(role, "descriptor lists no supported hash"));
        }
        if self.hashes.is_empty() && self.version.is_none() {
            return Err(TrustError::descriptor(role, "descriptor pins neither digest nor version"));
        }
        for (name, expected) in &self.hashes {
            let Some(alg) = HashAlgorithm::from_name(name) else {
                continue;
            };
            if !alg.digest_hex(bytes).eq_ignore_ascii_case(expected) {
                return Err(TrustError::descriptor(role, format!("{name} digest differs")));
            }
        }
        Ok(())
    }

    /// Checks the parsed document's version against a pinned version, if any.
    pub fn check_version(&self, role: &RoleName, version: u64) -> Result<()> {
        match self.version {
            Some(expected) if expected != version => Err(TrustError::descriptor(
                role,
                format!("version {version} differs from expected {expected}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Root payload: the key map and the policy of every top-level role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub consistent_snapshot: bool,
    pub keys: BTreeMap<KeyId, PublicKey>,
    pub roles: BTreeMap<RoleName, RoleKeys>,
}

impl RootMetadata {
    /// Resolves a top-level role's keys and threshold.
    pub fn role(&self, name: &RoleName) -> Result<Role> {
        let policy = self
            .roles
            .get(name)
            .ok_or_else(|| TrustError::UnknownRole(name.to_string()))?;
        policy.resolve(name.clone(), &self.keys)
    }

    pub fn root_role(&self) -> Result<Role> {
        self.role(&RoleName::root())
    }

    /// Ensures all four top-level roles are declared and internally consistent.
    pub fn validate(&self) -> Result<()> {
        for name in [
            RoleName::root(),
            RoleName::timestamp(),
            RoleName::snapshot(),
            RoleName::targets(),
        ] {
            self.role(&name)?;
        }
        if let Some(extra) = self.roles.keys().find(|name| name.is_descendant_of(&RoleName::targets())) {
            return Err(TrustError::invalid_role(
                extra,
                "delegated roles are declared by targets metadata, not root",
            ));
        }
        Ok(())
    }
}

/// Timestamp payload: pins the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<RoleName, FileMeta>,
}

impl TimestampMetadata {
    pub fn snapshot_descriptor(&self) -> Option<&FileMeta> {
        self.meta.get(&RoleName::snapshot())
    }
}

/// Snapshot payload: descriptors of root, targets and every delegated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<RoleName, FileMeta>,
}

/// Signed description of one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescription {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl TargetDescription {
    /// Describes artifact bytes with every supported digest.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let described = FileMeta::from_bytes(bytes, None);
        TargetDescription {
            length: bytes.len() as u64,
            hashes: described.hashes,
            custom: None,
        }
    }
}

/// A delegation declared by a targets-family document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedRole {
    pub name: RoleName,
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_hash_prefixes: Option<Vec<String>>,
    #[serde(default)]
    pub terminating: bool,
}

impl DelegatedRole {
    /// The path grant; exactly one of `paths` and `path_hash_prefixes` must be set.
    pub fn path_set(&self) -> Result<PathSet> {
        match (&self.paths, &self.path_hash_prefixes) {
            (Some(paths), None) => PathSet::paths(paths.clone()),
            (None, Some(prefixes)) => PathSet::hash_prefixes(prefixes.clone()),
            _ => Err(TrustError::invalid_role(
                &self.name,
                "exactly one of paths and path_hash_prefixes must be set",
            )),
        }
    }
}

/// Keys and sub-roles a targets-family document delegates to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Delegations {
    pub keys: BTreeMap<KeyId, PublicKey>,
    pub roles: Vec<DelegatedRole>,
}

impl Delegations {
    /// Resolves the keys and threshold declared for `child`.
    pub fn role(&self, child: &DelegatedRole) -> Result<Role> {
        RoleKeys {
            keyids: child.keyids.clone(),
            threshold: child.threshold,
        }
        .resolve(child.name.clone(), &self.keys)
    }
}

/// Targets payload, used by `targets` and every delegated role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,
}

impl TargetsMetadata {
    pub fn delegated_roles(&self) -> &[DelegatedRole] {
        self.delegations
            .as_ref()
            .map(|d| d.roles.as_slice())
            .unwrap_or_default()
    }
}

/// Signed payload of any role, tagged by `_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
pub enum Payload {
    Root(RootMetadata),
    Timestamp(TimestampMetadata),
    Snapshot(SnapshotMetadata),
    Targets(TargetsMetadata),
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Root(_) => RootMetadata::TYPE,
            Payload::Timestamp(_) => TimestampMetadata::TYPE,
            Payload::Snapshot(_) => SnapshotMetadata::TYPE,
            Payload::Targets(_) => TargetsMetadata::TYPE,
        }
    }
}

/// Capability shared by every payload kind: versioned, expiring, and convertible
/// to and from the tagged [`Payload`].
pub trait Metadata: Clone + Sized {
    const TYPE: &'static str;

    fn version(&self) -> u64;
    fn expires(&self) -> DateTime<Utc>;
    fn into_payload(self) -> Payload;
    fn from_payload(payload: Payload) -> Option<Self>;

    /// Canonical bytes the signatures are computed over.
    fn signable_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(&self.clone().into_payload())
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires() <= now
    }
}

macro_rules! impl_metadata {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl Metadata for $ty {
            const TYPE: &'static str = $name;

            fn version(&self) -> u64 {
                self.version
            }

            fn expires(&self) -> DateTime<Utc> {
                self.expires
            }

            fn into_payload(self) -> Payload {
                Payload::$variant(self)
            }

            fn from_payload(payload: Payload) -> Option<Self> {
                match payload {
                    Payload::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_metadata!(RootMetadata, Root, "root");
impl_metadata!(TimestampMetadata, Timestamp, "timestamp");
impl_metadata!(SnapshotMetadata, Snapshot, "snapshot");
impl_metadata!(TargetsMetadata, Targets, "targets");

/// Wire form of a signed envelope.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    signatures: &'a [Signature],
    signed: Payload,
}

/// A payload plus its signature list. Producing side only; verification goes
/// through [`crate::verify`], which never trusts a parsed `SignedMetadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedMetadata<M> {
    pub signed: M,
    pub signatures: Vec<Signature>,
}

impl<M: Metadata> SignedMetadata<M> {
    pub fn new(signed: M) -> Self {
        SignedMetadata {
            signed,
            signatures: Vec::new(),
        }
    }

    /// Adds a signature, replacing any earlier one from the same key.
    pub fn add_signature(&mut self, signature: Signature) {
        self.signatures.retain(|existing| existing.keyid != signature.keyid);
        self.signatures.push(signature);
    }

    /// Signs in place with a local Ed25519 keypair.
    pub fn sign(&mut self, keypair: &Ed25519Keypair) -> Result<()> {
        let payload = self.signed.signable_bytes()?;
        let signature = keypair.sign(&payload);
        self.add_signature(Signature::new(keypair.key().id().clone(), &signature));
        Ok(())
    }

    /// Canonical wire bytes of the whole envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(&WireEnvelope {
            signatures: &self.signatures,
            signed: self.signed.clone().into_payload(),
        })
    }

    /// Parses an envelope without verifying anything.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            signed: Payload,
            #[serde(default)]
            signatures: Vec<Signature>,
        }
        let raw: Raw = serde_json::from_slice(bytes)?;
        let found = raw.signed.type_name();
        let signed = M::from_payload(raw.signed).ok_or_else(|| {
            TrustError::Encoding(format!("expected {} metadata, found {found}", M::TYPE))
        })?;
        Ok(SignedMetadata {
            signed,
            signatures: raw.signatures,
        })
    }
}
