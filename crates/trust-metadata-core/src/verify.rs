//! Threshold signature verification, independent of document semantics.
//!
//! Signatures are always checked against the canonical form of the received
//! `signed` value, so fields this engine does not model are still covered.

use std::collections::BTreeSet;
use std::ops::Deref;

use serde::Deserialize;
use serde_json::Value;

use crate::canonical::to_canonical_bytes;
use crate::crypto::{KeyId, Signature};
use crate::error::{Result, TrustError};
use crate::metadata::{Metadata, Payload};
use crate::role::Role;

/// A parsed but unverified `{signed, signatures}` envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    signed: Value,
    canonical: Vec<u8>,
    signatures: Vec<Signature>,
}

impl Envelope {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            signed: Value,
            #[serde(default)]
            signatures: Vec<Signature>,
        }
        let parsed: Raw = serde_json::from_slice(raw)?;
        if !parsed.signed.is_object() {
            return Err(TrustError::Encoding("signed section must be an object".into()));
        }
        let canonical = to_canonical_bytes(&parsed.signed)?;
        Ok(Envelope {
            signed: parsed.signed,
            canonical,
            signatures: parsed.signatures,
        })
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Canonical bytes of the `signed` section.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.canonical
    }

    /// Distinct keys of `role` that produced a valid signature.
    pub fn valid_signers(&self, role: &Role) -> BTreeSet<KeyId> {
        let mut valid = BTreeSet::new();
        for signature in &self.signatures {
            if valid.contains(&signature.keyid) {
                continue;
            }
            let Some(key) = role.key(&signature.keyid) else {
                tracing::trace!(
                    role = %role.name(),
                    key_id = %signature.keyid,
                    "trust: ignoring signature from key outside the role"
                );
                continue;
            };
            match key.verify(&self.canonical, signature) {
                Ok(()) => {
                    valid.insert(signature.keyid.clone());
                }
                Err(err) => {
                    tracing::debug!(
                        role = %role.name(),
                        key_id = %signature.keyid,
                        error = %err,
                        "trust: signature did not verify"
                    );
                }
            }
        }
        valid
    }

    /// Succeeds iff at least `role.threshold()` distinct role keys signed.
    pub fn check_threshold(&self, role: &Role) -> Result<BTreeSet<KeyId>> {
        let valid = self.valid_signers(role);
        if valid.len() < role.threshold() as usize {
            return Err(TrustError::InsufficientSignatures {
                role: role.name().clone(),
                valid: valid.len(),
                threshold: role.threshold(),
            });
        }
        Ok(valid)
    }

    /// Decodes the payload as `M`, rejecting any other `_type`.
    pub fn decode<M: Metadata>(&self) -> Result<M> {
        let payload: Payload = serde_json::from_value(self.signed.clone())?;
        let found = payload.type_name();
        M::from_payload(payload).ok_or_else(|| {
            TrustError::Encoding(format!("expected {} metadata, found {found}", M::TYPE))
        })
    }
}

/// A payload whose signatures met a role's threshold, with the raw bytes it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Verified<M> {
    value: M,
    raw: Vec<u8>,
}

impl<M> Verified<M> {
    pub(crate) fn new(value: M, raw: Vec<u8>) -> Self {
        Verified { value, raw }
    }

    /// Exact bytes that were verified.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_inner(self) -> M {
        self.value
    }
}

impl<M> Deref for Verified<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.value
    }
}

/// Checks `raw` against `role` and decodes it as `M`.
pub fn verify_signatures<M: Metadata>(raw: &[u8], role: &Role) -> Result<Verified<M>> {
    let envelope = Envelope::parse(raw)?;
    envelope.check_threshold(role)?;
    let value = envelope.decode::<M>()?;
    Ok(Verified::new(value, raw.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::metadata::{SignedMetadata, TargetsMetadata};
    use crate::role::RoleName;
    use crate::signer::Ed25519Keypair;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn targets_doc(version: u64) -> SignedMetadata<TargetsMetadata> {
        SignedMetadata::new(TargetsMetadata {
            version,
            expires: Utc.with_ymd_and_hms(2031, 6, 1, 0, 0, 0).unwrap(),
            targets: BTreeMap::new(),
            delegations: None,
        })
    }

    fn role_of(keys: &[Ed25519Keypair], threshold: u32) -> Role {
        Role::new(
            RoleName::targets(),
            keys.iter().map(|k| k.key().clone()),
            threshold,
        )
        .unwrap()
    }

    #[test]
    /// Repeating one key's signature does not count twice.
    fn duplicate_signatures_count_once() {
        let a = Ed25519Keypair::from_seed([1; 32]).unwrap();
        let b = Ed25519Keypair::from_seed([2; 32]).unwrap();
        let mut doc = targets_doc(1);
        doc.sign(&a).unwrap();
        let dup = doc.signatures[0].clone();
        doc.signatures.push(dup);
        let raw = doc.to_bytes().unwrap();

        match verify_signatures::<TargetsMetadata>(&raw, &role_of(&[a, b], 2)).unwrap_err() {
            TrustError::InsufficientSignatures { valid, threshold, .. } => {
                assert_eq!((valid, threshold), (1, 2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    /// Signatures by keys outside the role are ignored even when valid.
    fn foreign_keys_do_not_count() {
        let a = Ed25519Keypair::from_seed([1; 32]).unwrap();
        let outsider = Ed25519Keypair::from_seed([9; 32]).unwrap();
        let mut doc = targets_doc(1);
        doc.sign(&outsider).unwrap();
        let raw = doc.to_bytes().unwrap();
        assert!(verify_signatures::<TargetsMetadata>(&raw, &role_of(&[a], 1)).is_err());
    }

    #[test]
    /// Tampering with the payload after signing invalidates the signature.
    fn tampered_payload_fails() {
        let a = Ed25519Keypair::from_seed([4; 32]).unwrap();
        let mut doc = targets_doc(1);
        doc.sign(&a).unwrap();
        let raw = doc.to_bytes().unwrap();
        let tampered = String::from_utf8(raw)
            .unwrap()
            .replace(r#""version":1"#, r#""version":2"#);
        assert!(
            verify_signatures::<TargetsMetadata>(tampered.as_bytes(), &role_of(&[a], 1)).is_err()
        );
    }

    #[test]
    /// Key ordering and whitespace in the received bytes do not affect verification.
    fn verification_uses_canonical_form() {
        let a = Ed25519Keypair::from_seed([5; 32]).unwrap();
        let mut doc = targets_doc(3);
        doc.sign(&a).unwrap();
        let value: Value = serde_json::from_slice(&doc.to_bytes().unwrap()).unwrap();
        let pretty = serde_json::to_vec_pretty(&value).unwrap();
        let verified = verify_signatures::<TargetsMetadata>(&pretty, &role_of(&[a], 1)).unwrap();
        assert_eq!(verified.version, 3);
        assert_eq!(verified.raw(), pretty.as_slice());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Acceptance happens exactly when the number of distinct signers reaches the threshold.
        #[test]
        fn threshold_is_exact(total in 1usize..5, threshold_seed in 0usize..5, signers_seed in 0usize..6) {
            let threshold = threshold_seed % total + 1;
            let signers = signers_seed % (total + 1);
            let keys: Vec<Ed25519Keypair> = (0..total)
                .map(|i| Ed25519Keypair::from_seed([i as u8 + 10; 32]).unwrap())
                .collect();
            let role = Role::new(
                RoleName::targets(),
                keys.iter().map(|k| k.key().clone()).collect::<Vec<Key>>(),
                threshold as u32,
            )
            .unwrap();

            let mut doc = targets_doc(1);
            for key in keys.iter().take(signers) {
                doc.sign(key).unwrap();
            }
            let raw = doc.to_bytes().unwrap();
            let result = verify_signatures::<TargetsMetadata>(&raw, &role);
            prop_assert_eq!(result.is_ok(), signers >= threshold);
        }
    }
}
