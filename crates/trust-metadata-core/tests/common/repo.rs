// Signed repository fixtures shared across tests.
//
// These helpers produce roots, timestamp/snapshot/targets chains and
// delegated targets documents from seeded Ed25519 keys, so integration tests
// can emulate a publisher without repeating the signing logic inline.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use trust_metadata_core::{
    DelegatedRole, Delegations, Ed25519Keypair, FileMeta, Gun, MemoryCache, MemoryTransport,
    Metadata, RoleKeys, RoleName, RootMetadata, SignedMetadata, SnapshotMetadata,
    TargetDescription, TargetsMetadata, TimestampMetadata, TrustEngine, UpdateBundle,
};

pub const GUN: &str = "example.com/app";
pub const DEFAULT_TARGET: &str = "app/config.json";

pub fn gun() -> Gun {
    Gun::from(GUN)
}

/// Deterministic keypair derived from a one-byte seed.
pub fn key(seed: u8) -> Ed25519Keypair {
    Ed25519Keypair::from_seed([seed; 32]).expect("seeded key should load")
}

pub fn expiry() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap()
}

/// Signs `payload` with every key in order and returns the wire bytes.
pub fn sign<M: Metadata>(payload: M, keys: &[&Ed25519Keypair]) -> Vec<u8> {
    let mut document = SignedMetadata::new(payload);
    for key in keys {
        document.sign(key).expect("fixture signing");
    }
    document.to_bytes().expect("fixture encoding")
}

/// Root payload whose root role is `root_keys` at `threshold`; every other
/// top-level role is held by `online` at threshold 1.
pub fn root(
    version: u64,
    root_keys: &[&Ed25519Keypair],
    threshold: u32,
    online: &Ed25519Keypair,
) -> RootMetadata {
    let mut keys = BTreeMap::new();
    for key in root_keys.iter().chain(std::iter::once(&online)) {
        keys.insert(key.key().id().clone(), key.key().public().clone());
    }
    let online_role = || RoleKeys {
        keyids: vec![online.key().id().clone()],
        threshold: 1,
    };
    let roles = BTreeMap::from([
        (
            RoleName::root(),
            RoleKeys {
                keyids: root_keys.iter().map(|k| k.key().id().clone()).collect(),
                threshold,
            },
        ),
        (RoleName::timestamp(), online_role()),
        (RoleName::snapshot(), online_role()),
        (RoleName::targets(), online_role()),
    ]);
    RootMetadata {
        version,
        expires: expiry(),
        consistent_snapshot: false,
        keys,
        roles,
    }
}

/// Self-signed root v1 with a single root key.
pub fn pinned_root(root_key: &Ed25519Keypair, online: &Ed25519Keypair) -> Vec<u8> {
    sign(root(1, &[root_key], 1, online), &[root_key])
}

pub fn engine(transport: Arc<MemoryTransport>) -> TrustEngine {
    TrustEngine::new(transport, Arc::new(MemoryCache::new()))
}

/// One delegation edge plus the targets the delegated role provides.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub parent: RoleName,
    pub role: RoleName,
    pub seed: u8,
    /// Seed of the key that actually signs the document, when it differs from `seed`.
    pub signed_by: Option<u8>,
    pub paths: Vec<String>,
    pub terminating: bool,
    pub provides: Vec<String>,
}

impl Delegation {
    pub fn new(parent: &str, role: &str, seed: u8, paths: &[&str]) -> Self {
        Delegation {
            parent: RoleName::new(parent).expect("fixture parent name"),
            role: RoleName::new(role).expect("fixture role name"),
            seed,
            signed_by: None,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            terminating: false,
            provides: Vec::new(),
        }
    }

    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn providing(mut self, targets: &[&str]) -> Self {
        self.provides = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn signed_by(mut self, seed: u8) -> Self {
        self.signed_by = Some(seed);
        self
    }
}

/// Versions stamped on each document of a published chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versions {
    pub timestamp: u64,
    pub snapshot: u64,
    pub targets: u64,
    pub delegated: u64,
}

impl Versions {
    pub fn all(version: u64) -> Self {
        Versions {
            timestamp: version,
            snapshot: version,
            targets: version,
            delegated: version,
        }
    }
}

/// Signed documents of one publication.
#[derive(Debug, Clone)]
pub struct Documents {
    pub versions: Versions,
    pub timestamp: Vec<u8>,
    pub snapshot: Vec<u8>,
    pub targets: Vec<u8>,
    pub delegated: BTreeMap<RoleName, Vec<u8>>,
}

impl Documents {
    pub fn publish(&self, transport: &MemoryTransport, gun: &Gun) {
        let v = self.versions;
        transport.publish(gun, &RoleName::timestamp(), Some(v.timestamp), self.timestamp.clone());
        transport.publish(gun, &RoleName::snapshot(), Some(v.snapshot), self.snapshot.clone());
        transport.publish(gun, &RoleName::targets(), Some(v.targets), self.targets.clone());
        for (role, raw) in &self.delegated {
            transport.publish(gun, role, Some(v.delegated), raw.clone());
        }
    }

    pub fn bundle(&self) -> UpdateBundle {
        self.delegated.iter().fold(
            UpdateBundle::new(
                self.timestamp.clone(),
                self.snapshot.clone(),
                self.targets.clone(),
            ),
            |bundle, (role, raw)| bundle.with_delegation(role.clone(), raw.clone()),
        )
    }
}

/// Publisher of the online documents of a namespace.
pub struct Repo {
    pub online: Ed25519Keypair,
    pub expires: DateTime<Utc>,
    pub targets: Vec<String>,
    pub delegations: Vec<Delegation>,
}

impl Repo {
    pub fn new(online_seed: u8) -> Self {
        Repo {
            online: key(online_seed),
            expires: expiry(),
            targets: vec![DEFAULT_TARGET.to_string()],
            delegations: Vec::new(),
        }
    }

    pub fn with_delegation(mut self, delegation: Delegation) -> Self {
        self.delegations.push(delegation);
        self
    }

    /// Root v1 signed by `root_key`, delegating the online roles to this repo.
    pub fn pinned_root(&self, root_key: &Ed25519Keypair) -> Vec<u8> {
        pinned_root(root_key, &self.online)
    }

    pub fn documents(&self, version: u64) -> Documents {
        self.documents_with(Versions::all(version))
    }

    pub fn documents_with(&self, versions: Versions) -> Documents {
        let targets = sign(
            self.targets_metadata(&RoleName::targets(), &self.targets, versions.targets),
            &[&self.online],
        );

        let mut delegated = BTreeMap::new();
        for edge in &self.delegations {
            if delegated.contains_key(&edge.role) {
                continue;
            }
            let payload = self.targets_metadata(&edge.role, &edge.provides, versions.delegated);
            let signer = key(edge.signed_by.unwrap_or(edge.seed));
            delegated.insert(edge.role.clone(), sign(payload, &[&signer]));
        }

        let mut meta = BTreeMap::from([(
            RoleName::targets(),
            FileMeta::from_bytes(&targets, Some(versions.targets)),
        )]);
        for (role, raw) in &delegated {
            meta.insert(role.clone(), FileMeta::from_bytes(raw, Some(versions.delegated)));
        }
        let snapshot = sign(
            SnapshotMetadata {
                version: versions.snapshot,
                expires: self.expires,
                meta,
            },
            &[&self.online],
        );
        let timestamp = sign(
            TimestampMetadata {
                version: versions.timestamp,
                expires: self.expires,
                meta: BTreeMap::from([(
                    RoleName::snapshot(),
                    FileMeta::from_bytes(&snapshot, Some(versions.snapshot)),
                )]),
            },
            &[&self.online],
        );

        Documents {
            versions,
            timestamp,
            snapshot,
            targets,
            delegated,
        }
    }

    fn targets_metadata(&self, role: &RoleName, provides: &[String], version: u64) -> TargetsMetadata {
        let targets = provides
            .iter()
            .map(|path| {
                let content = format!("{role}:{path}:{version}");
                (path.clone(), TargetDescription::from_bytes(content.as_bytes()))
            })
            .collect();

        let children: Vec<&Delegation> = self
            .delegations
            .iter()
            .filter(|edge| &edge.parent == role)
            .collect();
        let delegations = if children.is_empty() {
            None
        } else {
            let mut keys = BTreeMap::new();
            let mut roles = Vec::with_capacity(children.len());
            for edge in children {
                let declared = key(edge.seed);
                keys.insert(declared.key().id().clone(), declared.key().public().clone());
                roles.push(DelegatedRole {
                    name: edge.role.clone(),
                    keyids: vec![declared.key().id().clone()],
                    threshold: 1,
                    paths: Some(edge.paths.clone()),
                    path_hash_prefixes: None,
                    terminating: edge.terminating,
                });
            }
            Some(Delegations { keys, roles })
        };

        TargetsMetadata {
            version,
            expires: self.expires,
            targets,
            delegations,
        }
    }
}
