//! Transport collaborator: where metadata bytes come from.
//!
//! Retry and backoff are the transport's business; the engine treats every
//! failure as final for the current update attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::role::RoleName;
use crate::state::Gun;

/// Errors emitted by a [`MetadataTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{role} metadata not found for '{gun}' (version {version:?})")]
    NotFound {
        gun: Gun,
        role: RoleName,
        version: Option<u64>,
    },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport rejected the request: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

/// Fetches and publishes raw metadata documents.
#[async_trait]
pub trait MetadataTransport: Send + Sync {
    /// Fetches `role`, at `version` when given, otherwise the latest.
    async fn fetch(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: Option<u64>,
    ) -> Result<Vec<u8>, TransportError>;

    async fn put(&self, gun: &Gun, role: &RoleName, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct StoredRole {
    latest: Option<Vec<u8>>,
    versions: BTreeMap<u64, Vec<u8>>,
}

/// In-memory transport that keeps every published version.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    roles: RwLock<HashMap<(Gun, RoleName), StoredRole>>,
    unavailable: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `bytes` as the latest copy and, when known, under `version`.
    pub fn publish(&self, gun: &Gun, role: &RoleName, version: Option<u64>, bytes: Vec<u8>) {
        if let Ok(mut roles) = self.roles.write() {
            let stored = roles.entry((gun.clone(), role.clone())).or_default();
            if let Some(version) = version {
                stored.versions.insert(version, bytes.clone());
            }
            stored.latest = Some(bytes);
        }
    }

    /// Simulates an outage; every call fails with [`TransportError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(TransportError::Unavailable("memory transport offline".into()));
        }
        Ok(())
    }
}

/// Version of a document, read without verifying anything.
fn peek_version(bytes: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get("signed")?.get("version")?.as_u64()
}

#[async_trait]
impl MetadataTransport for MemoryTransport {
    async fn fetch(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: Option<u64>,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_available()?;
        let roles = self
            .roles
            .read()
            .map_err(|_| TransportError::Unavailable("memory transport lock poisoned".into()))?;
        let stored = roles.get(&(gun.clone(), role.clone()));
        let found = match version {
            Some(version) => stored.and_then(|s| s.versions.get(&version)),
            None => stored.and_then(|s| s.latest.as_ref()),
        };
        found.cloned().ok_or_else(|| TransportError::NotFound {
            gun: gun.clone(),
            role: role.clone(),
            version,
        })
    }

    async fn put(&self, gun: &Gun, role: &RoleName, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.check_available()?;
        let version = peek_version(&bytes);
        self.publish(gun, role, version, bytes);
        Ok(())
    }
}
