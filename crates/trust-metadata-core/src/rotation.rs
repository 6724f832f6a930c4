//! Root rotation: verifying a successor root and producing one.
//!
//! A successor root must satisfy two independent passes: the previous root's
//! threshold (old holders authorised the change) and its own threshold (the
//! new key set controls it). Roots advance exactly one version at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crypto::{Key, KeyId, Signature};
use crate::error::{Result, TrustError};
use crate::keystore::Keystore;
use crate::metadata::{Metadata, RootMetadata, SignedMetadata};
use crate::role::{RoleKeys, RoleKind, RoleName};
use crate::signer::{Signer, SignerError};
use crate::verify::{Envelope, Verified};

/// Verifies `raw` as the direct successor of `trusted`.
pub fn verify_root_update(trusted: &RootMetadata, raw: &[u8]) -> Result<Verified<RootMetadata>> {
    let envelope = Envelope::parse(raw)?;

    // Pass 1: the currently trusted root authorises the change.
    envelope.check_threshold(&trusted.root_role()?)?;

    let candidate: RootMetadata = envelope.decode()?;
    candidate.validate()?;

    // Pass 2: the candidate's own root role controls it.
    envelope.check_threshold(&candidate.root_role()?)?;

    if candidate.version <= trusted.version {
        return Err(TrustError::VersionRollback {
            role: RoleName::root(),
            trusted: trusted.version,
            offered: candidate.version,
        });
    }
    if candidate.version != trusted.version + 1 {
        return Err(TrustError::VersionGap {
            trusted: trusted.version,
            offered: candidate.version,
        });
    }
    Ok(Verified::new(candidate, raw.to_vec()))
}

/// Verifies a root that vouches only for itself (pinning and cache restore).
pub fn verify_self_signed_root(raw: &[u8]) -> Result<Verified<RootMetadata>> {
    let envelope = Envelope::parse(raw)?;
    let root: RootMetadata = envelope.decode()?;
    root.validate()?;
    envelope.check_threshold(&root.root_role()?)?;
    Ok(Verified::new(root, raw.to_vec()))
}

/// New policy for one top-level role.
#[derive(Debug, Clone)]
pub enum RoleChange {
    Keys { keys: Vec<Key>, threshold: u32 },
    /// Use whatever keys the keystore lists for the role.
    FromKeystore { threshold: u32 },
}

/// Everything that changes between root N and N+1.
#[derive(Debug, Clone)]
pub struct RootChanges {
    pub expires: DateTime<Utc>,
    pub roles: BTreeMap<RoleName, RoleChange>,
}

impl RootChanges {
    pub fn new(expires: DateTime<Utc>) -> Self {
        RootChanges {
            expires,
            roles: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: RoleName, change: RoleChange) -> Self {
        self.roles.insert(role, change);
        self
    }
}

/// Signs `payload` with each of `key_ids` through `signer`.
///
/// Keys the signer cannot reach are skipped; the call fails only when no
/// signature at all could be produced or the deadline passes.
pub async fn sign_document<M: Metadata>(
    payload: M,
    key_ids: &[KeyId],
    signer: &dyn Signer,
    deadline: Duration,
) -> Result<SignedMetadata<M>> {
    let bytes = payload.signable_bytes()?;
    let mut document = SignedMetadata::new(payload);

    let work = async {
        for key_id in key_ids {
            match signer.sign(key_id, &bytes).await {
                Ok(sig) => document.add_signature(Signature::new(key_id.clone(), &sig)),
                Err(SignerError::Unavailable(missing)) => {
                    tracing::warn!(
                        key_id = %missing,
                        document = M::TYPE,
                        "trust: signer has no private key, skipping"
                    );
                }
                Err(err) => return Err(TrustError::from(err)),
            }
        }
        Ok(())
    };
    tokio::time::timeout(deadline, work)
        .await
        .map_err(|_| TrustError::DeadlineExceeded)??;

    if document.signatures.is_empty() {
        if let Some(first) = key_ids.first() {
            return Err(SignerError::Unavailable(first.clone()).into());
        }
    }
    Ok(document)
}

/// Drops the existing signatures of `document` and signs it with `key_ids`.
pub async fn resign<M: Metadata>(
    document: SignedMetadata<M>,
    key_ids: &[KeyId],
    signer: &dyn Signer,
    deadline: Duration,
) -> Result<SignedMetadata<M>> {
    sign_document(document.signed, key_ids, signer, deadline).await
}

/// Builds, signs and verifies root version N+1 from `current`.
pub async fn rotate_root(
    current: &RootMetadata,
    changes: RootChanges,
    keystore: &dyn Keystore,
    signer: &dyn Signer,
    deadline: Duration,
) -> Result<Verified<RootMetadata>> {
    let mut next = current.clone();
    next.version = current.version + 1;
    next.expires = changes.expires;

    for (name, change) in changes.roles {
        if name.kind() == RoleKind::Delegated {
            return Err(TrustError::invalid_role(
                &name,
                "root only declares top-level roles",
            ));
        }
        let (keys, threshold) = match change {
            RoleChange::Keys { keys, threshold } => (keys, threshold),
            RoleChange::FromKeystore { threshold } => {
                (keystore.list_keys(&name).await.into_iter().collect(), threshold)
            }
        };
        let mut keyids = Vec::with_capacity(keys.len());
        for key in keys {
            keyids.push(key.id().clone());
            next.keys.insert(key.id().clone(), key.public().clone());
        }
        keyids.sort();
        keyids.dedup();
        next.roles.insert(name, RoleKeys { keyids, threshold });
    }

    let referenced: BTreeSet<&KeyId> = next.roles.values().flat_map(|r| r.keyids.iter()).collect();
    let keys = std::mem::take(&mut next.keys);
    next.keys = keys
        .into_iter()
        .filter(|(id, _)| referenced.contains(id))
        .collect();
    next.validate()?;

    let mut signing_ids = BTreeSet::new();
    for id in current
        .root_role()?
        .key_ids()
        .chain(next.root_role()?.key_ids())
    {
        if keystore.has_private(id).await {
            signing_ids.insert(id.clone());
        }
    }
    let signing_ids: Vec<KeyId> = signing_ids.into_iter().collect();

    tracing::info!(
        from_version = current.version,
        to_version = next.version,
        signers = signing_ids.len(),
        "trust: signing root rotation"
    );
    let signed = sign_document(next, &signing_ids, signer, deadline).await?;
    let raw = signed.to_bytes()?;
    verify_root_update(current, &raw)
}
