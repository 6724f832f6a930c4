//! Keystore collaborator: which public keys belong to a role and which private keys are held.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::crypto::{Key, KeyId};
use crate::role::RoleName;

/// Lists role keys and reports private key availability. Never exposes private material.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn list_keys(&self, role: &RoleName) -> BTreeSet<Key>;
    async fn has_private(&self, key_id: &KeyId) -> bool;
}

/// In-memory keystore for tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryKeystore {
    roles: RwLock<BTreeMap<RoleName, BTreeSet<Key>>>,
    private: RwLock<HashSet<KeyId>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a public key with a role.
    pub fn add_key(&self, role: RoleName, key: Key) {
        if let Ok(mut roles) = self.roles.write() {
            roles.entry(role).or_default().insert(key);
        }
    }

    /// Records that private material for `key_id` is available to the signer.
    pub fn mark_private(&self, key_id: KeyId) {
        if let Ok(mut private) = self.private.write() {
            private.insert(key_id);
        }
    }

    pub fn forget_private(&self, key_id: &KeyId) {
        if let Ok(mut private) = self.private.write() {
            private.remove(key_id);
        }
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn list_keys(&self, role: &RoleName) -> BTreeSet<Key> {
        self.roles
            .read()
            .ok()
            .and_then(|roles| roles.get(role).cloned())
            .unwrap_or_default()
    }

    async fn has_private(&self, key_id: &KeyId) -> bool {
        self.private
            .read()
            .map(|private| private.contains(key_id))
            .unwrap_or(false)
    }
}
