//! Public entry points for the trust metadata core crate.
//!
//! The crate verifies and maintains signed repository metadata for any number
//! of namespaces: root, timestamp, snapshot and targets roles, delegated
//! targets roles, threshold signatures and root rotation. Updates are applied
//! in a fixed order and only become visible once every step has passed, so a
//! rollback, freeze or mix-and-match attempt leaves the trusted state as it
//! was.

pub mod cache;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod metadata;
pub mod pin;
pub mod role;
pub mod rotation;
pub mod signer;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod update;
pub mod verify;

pub use cache::{CacheError, MemoryCache, MetadataCache, SledCache};
pub use config::TrustConfig;
pub use crypto::{HashAlgorithm, Key, KeyAlgorithm, KeyId, PublicKey, Signature};
pub use delegation::{PathPattern, PathSet, ResolvedTarget};
pub use engine::{Clock, NoopTelemetry, TrustEngine, TrustTelemetry, UpdateBundle};
pub use error::{ErrorKind, Result, TrustError};
pub use keystore::{Keystore, MemoryKeystore};
pub use metadata::{
    DelegatedRole, Delegations, FileMeta, Metadata, RootMetadata, SignedMetadata,
    SnapshotMetadata, TargetDescription, TargetsMetadata, TimestampMetadata,
};
pub use pin::TrustPin;
pub use role::{Role, RoleKeys, RoleKind, RoleName};
pub use rotation::{RoleChange, RootChanges};
pub use signer::{Ed25519Keypair, MemorySigner, Signer, SignerError};
pub use state::{Gun, RoleVersions, TrustedDelegation, TrustedState};
pub use telemetry::{CompositeTelemetry, CountingTelemetry, TelemetryCounters, TelemetrySnapshot};
pub use transport::{MemoryTransport, MetadataTransport, TransportError};
pub use update::{DelegationRequest, TrustUpdate, UpdateOptions, UpdatePhase};
pub use verify::{Envelope, Verified};
