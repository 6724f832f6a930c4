//! Persistence collaborator for trusted metadata.
//!
//! The engine writes the raw bytes of every trusted document after a
//! successful update and reads them back on start-up, so version baselines
//! survive restarts. [`SledCache`] keeps one sled tree per namespace.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use sled::{Batch, Config as SledConfig, Db};
use thiserror::Error;

use crate::role::RoleName;
use crate::state::Gun;

/// Prefix of document keys inside a namespace tree.
const DOC_PREFIX: &str = "meta/";
/// Prefix of namespace tree names.
const TREE_PREFIX: &str = "ns/";

/// Errors emitted by a [`MetadataCache`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Stores raw metadata per namespace and role.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    async fn get(&self, gun: &Gun, role: &RoleName) -> Result<Option<Vec<u8>>, CacheError>;

    /// Atomically replaces every cached document of `gun` with `documents`.
    async fn put_batch(
        &self,
        gun: &Gun,
        documents: &BTreeMap<RoleName, Vec<u8>>,
    ) -> Result<(), CacheError>;

    async fn list(&self, gun: &Gun) -> Result<BTreeMap<RoleName, Vec<u8>>, CacheError>;
}

/// Volatile cache, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    namespaces: RwLock<HashMap<Gun, BTreeMap<RoleName, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites one cached document in place, e.g. to simulate tampering at rest.
    pub fn insert_raw(&self, gun: &Gun, role: RoleName, bytes: Vec<u8>) {
        if let Ok(mut namespaces) = self.namespaces.write() {
            namespaces.entry(gun.clone()).or_default().insert(role, bytes);
        }
    }
}

fn poisoned() -> CacheError {
    CacheError::Unavailable("memory cache lock poisoned".into())
}

#[async_trait]
impl MetadataCache for MemoryCache {
    async fn get(&self, gun: &Gun, role: &RoleName) -> Result<Option<Vec<u8>>, CacheError> {
        let namespaces = self.namespaces.read().map_err(|_| poisoned())?;
        Ok(namespaces.get(gun).and_then(|docs| docs.get(role)).cloned())
    }

    async fn put_batch(
        &self,
        gun: &Gun,
        documents: &BTreeMap<RoleName, Vec<u8>>,
    ) -> Result<(), CacheError> {
        let mut namespaces = self.namespaces.write().map_err(|_| poisoned())?;
        namespaces.insert(gun.clone(), documents.clone());
        Ok(())
    }

    async fn list(&self, gun: &Gun) -> Result<BTreeMap<RoleName, Vec<u8>>, CacheError> {
        let namespaces = self.namespaces.read().map_err(|_| poisoned())?;
        Ok(namespaces.get(gun).cloned().unwrap_or_default())
    }
}

/// Sled-backed cache with one tree per namespace.
#[derive(Debug, Clone)]
pub struct SledCache {
    db: Db,
    path: PathBuf,
}

impl SledCache {
    /// Opens (or creates) a cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new()
            .path(&path)
            .cache_capacity(16 * 1024 * 1024)
            .open()?;
        Ok(SledCache { db, path })
    }

    /// Opens an in-memory cache that disappears with the handle.
    pub fn open_ephemeral() -> Result<Self, CacheError> {
        let db = SledConfig::new().temporary(true).open()?;
        Ok(SledCache {
            db,
            path: PathBuf::new(),
        })
    }

    /// Filesystem path backing the cache; empty for ephemeral caches.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }

    fn tree(&self, gun: &Gun) -> Result<sled::Tree, CacheError> {
        Ok(self.db.open_tree(format!("{TREE_PREFIX}{gun}"))?)
    }
}

fn doc_key(role: &RoleName) -> Vec<u8> {
    format!("{DOC_PREFIX}{role}").into_bytes()
}

#[async_trait]
impl MetadataCache for SledCache {
    async fn get(&self, gun: &Gun, role: &RoleName) -> Result<Option<Vec<u8>>, CacheError> {
        let tree = self.tree(gun)?;
        Ok(tree.get(doc_key(role))?.map(|value| value.as_ref().to_vec()))
    }

    async fn put_batch(
        &self,
        gun: &Gun,
        documents: &BTreeMap<RoleName, Vec<u8>>,
    ) -> Result<(), CacheError> {
        let tree = self.tree(gun)?;
        let mut batch = Batch::default();
        for entry in tree.scan_prefix(DOC_PREFIX.as_bytes()).keys() {
            batch.remove(entry?);
        }
        for (role, bytes) in documents {
            batch.insert(doc_key(role), bytes.as_slice());
        }
        tree.apply_batch(batch)?;
        tree.flush()?;
        Ok(())
    }

    async fn list(&self, gun: &Gun) -> Result<BTreeMap<RoleName, Vec<u8>>, CacheError> {
        let tree = self.tree(gun)?;
        let mut documents = BTreeMap::new();
        for entry in tree.scan_prefix(DOC_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let name = String::from_utf8_lossy(&key[DOC_PREFIX.len()..]).into_owned();
            match RoleName::new(name) {
                Ok(role) => {
                    documents.insert(role, value.as_ref().to_vec());
                }
                Err(err) => {
                    tracing::warn!(
                        namespace = %gun,
                        error = %err,
                        "trust: skipping cache entry with an invalid role name"
                    );
                }
            }
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn docs(pairs: &[(&str, &[u8])]) -> BTreeMap<RoleName, Vec<u8>> {
        pairs
            .iter()
            .map(|(role, bytes)| (RoleName::new(*role).unwrap(), bytes.to_vec()))
            .collect()
    }

    #[tokio::test]
    /// A batch replaces the namespace contents, dropping roles it does not mention.
    async fn sled_put_batch_replaces_namespace() {
        let cache = SledCache::open_ephemeral().unwrap();
        let gun = Gun::from("example.com/app");
        cache
            .put_batch(&gun, &docs(&[("root", b"r1"), ("targets/old", b"x")]))
            .await
            .unwrap();
        cache
            .put_batch(&gun, &docs(&[("root", b"r2"), ("targets", b"t")]))
            .await
            .unwrap();

        let listed = cache.list(&gun).await.unwrap();
        assert_eq!(listed, docs(&[("root", b"r2"), ("targets", b"t")]));
        assert_eq!(
            cache.get(&gun, &RoleName::root()).await.unwrap(),
            Some(b"r2".to_vec())
        );
        assert!(cache.list(&Gun::from("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    /// Documents survive closing and re-opening an on-disk cache.
    async fn sled_cache_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("trust.db");
        let gun = Gun::from("example.com/app");
        {
            let cache = SledCache::open(&path).unwrap();
            cache
                .put_batch(&gun, &docs(&[("root", b"root-bytes")]))
                .await
                .unwrap();
            cache.flush().unwrap();
        }
        let reopened = SledCache::open(&path).unwrap();
        assert_eq!(reopened.path(), path.as_path());
        assert_eq!(
            reopened.get(&gun, &RoleName::root()).await.unwrap(),
            Some(b"root-bytes".to_vec())
        );
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        let gun = Gun::from("a");
        cache.put_batch(&gun, &docs(&[("snapshot", b"s")])).await.unwrap();
        assert_eq!(cache.list(&gun).await.unwrap().len(), 1);
        assert_eq!(cache.get(&gun, &RoleName::timestamp()).await.unwrap(), None);
    }
}
