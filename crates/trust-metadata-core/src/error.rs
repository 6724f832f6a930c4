//! Error taxonomy shared by every stage of the trust engine.
//!
//! Each variant maps onto a copyable [`ErrorKind`] so callers (and the
//! telemetry layer) can tell potential attacks apart from ordinary
//! unavailability without matching on payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::CacheError;
use crate::crypto::KeyId;
use crate::role::RoleName;
use crate::signer::SignerError;
use crate::state::Gun;
use crate::transport::TransportError;
use crate::update::UpdatePhase;

/// Flat classification of [`TrustError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    InsufficientSignatures,
    BadSignature,
    UnknownKey,
    UnknownRole,
    VersionRollback,
    VersionGap,
    Expired,
    DescriptorMismatch,
    DelegationCycle,
    PathNotDelegated,
    PinMismatch,
    Transport,
    BootstrapRequired,
    AlreadyBootstrapped,
    Encoding,
    InvalidRole,
    OutOfOrder,
    DeadlineExceeded,
    Cancelled,
    Signer,
    Cache,
    TargetNotFound,
}

impl ErrorKind {
    /// Returns `true` for kinds that indicate tampering rather than unavailability.
    pub fn is_security_relevant(self) -> bool {
        matches!(
            self,
            ErrorKind::InsufficientSignatures
                | ErrorKind::BadSignature
                | ErrorKind::UnknownKey
                | ErrorKind::VersionRollback
                | ErrorKind::VersionGap
                | ErrorKind::Expired
                | ErrorKind::DescriptorMismatch
                | ErrorKind::DelegationCycle
                | ErrorKind::PathNotDelegated
                | ErrorKind::PinMismatch
        )
    }

    /// Stable snake-case label used in structured logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InsufficientSignatures => "insufficient_signatures",
            ErrorKind::BadSignature => "bad_signature",
            ErrorKind::UnknownKey => "unknown_key",
            ErrorKind::UnknownRole => "unknown_role",
            ErrorKind::VersionRollback => "version_rollback",
            ErrorKind::VersionGap => "version_gap",
            ErrorKind::Expired => "expired",
            ErrorKind::DescriptorMismatch => "descriptor_mismatch",
            ErrorKind::DelegationCycle => "delegation_cycle",
            ErrorKind::PathNotDelegated => "path_not_delegated",
            ErrorKind::PinMismatch => "pin_mismatch",
            ErrorKind::Transport => "transport",
            ErrorKind::BootstrapRequired => "bootstrap_required",
            ErrorKind::AlreadyBootstrapped => "already_bootstrapped",
            ErrorKind::Encoding => "encoding",
            ErrorKind::InvalidRole => "invalid_role",
            ErrorKind::OutOfOrder => "out_of_order",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Signer => "signer",
            ErrorKind::Cache => "cache",
            ErrorKind::TargetNotFound => "target_not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors emitted while parsing, verifying, or committing trust metadata.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("role '{role}' has {valid} valid signature(s), threshold is {threshold}")]
    InsufficientSignatures {
        role: RoleName,
        valid: usize,
        threshold: u32,
    },
    #[error("signature from key '{key_id}' does not verify: {reason}")]
    BadSignature { key_id: KeyId, reason: String },
    #[error("unknown key '{key_id}': {reason}")]
    UnknownKey { key_id: KeyId, reason: &'static str },
    #[error("role '{0}' is not defined anywhere in the trust chain")]
    UnknownRole(String),
    #[error("{role} version {offered} is older than trusted version {trusted}")]
    VersionRollback {
        role: RoleName,
        trusted: u64,
        offered: u64,
    },
    #[error("root version {offered} does not directly follow trusted root version {trusted}")]
    VersionGap { trusted: u64, offered: u64 },
    #[error("{role} metadata expired at {expires}")]
    Expired {
        role: RoleName,
        expires: DateTime<Utc>,
    },
    #[error("{role} does not match its descriptor: {reason}")]
    DescriptorMismatch { role: RoleName, reason: String },
    #[error("delegation cycle: '{role}' is delegated again below itself")]
    DelegationCycle { role: RoleName },
    #[error("delegation '{role}' claims '{pattern}' outside the delegating role's paths")]
    PathNotDelegated { role: RoleName, pattern: String },
    #[error("trust pin rejected: {0}")]
    PinMismatch(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("namespace '{0}' has no trusted root and no pinning input was supplied")]
    BootstrapRequired(Gun),
    #[error("namespace '{0}' is already pinned to a different root")]
    AlreadyBootstrapped(Gun),
    #[error("metadata parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata encoding error: {0}")]
    Encoding(String),
    #[error("invalid role '{role}': {reason}")]
    InvalidRole { role: String, reason: String },
    #[error("update step '{attempted}' cannot run while the update is {phase}")]
    OutOfOrder {
        phase: UpdatePhase,
        attempted: &'static str,
    },
    #[error("update deadline exceeded")]
    DeadlineExceeded,
    #[error("update cancelled by caller")]
    Cancelled,
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),
    #[error("metadata cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("no trusted role provides target '{path}'")]
    TargetNotFound { path: String },
}

impl TrustError {
    /// Returns the flat classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrustError::InsufficientSignatures { .. } => ErrorKind::InsufficientSignatures,
            TrustError::BadSignature { .. } => ErrorKind::BadSignature,
            TrustError::UnknownKey { .. } => ErrorKind::UnknownKey,
            TrustError::UnknownRole(_) => ErrorKind::UnknownRole,
            TrustError::VersionRollback { .. } => ErrorKind::VersionRollback,
            TrustError::VersionGap { .. } => ErrorKind::VersionGap,
            TrustError::Expired { .. } => ErrorKind::Expired,
            TrustError::DescriptorMismatch { .. } => ErrorKind::DescriptorMismatch,
            TrustError::DelegationCycle { .. } => ErrorKind::DelegationCycle,
            TrustError::PathNotDelegated { .. } => ErrorKind::PathNotDelegated,
            TrustError::PinMismatch(_) => ErrorKind::PinMismatch,
            TrustError::Transport(_) => ErrorKind::Transport,
            TrustError::BootstrapRequired(_) => ErrorKind::BootstrapRequired,
            TrustError::AlreadyBootstrapped(_) => ErrorKind::AlreadyBootstrapped,
            TrustError::Json(_) | TrustError::Encoding(_) => ErrorKind::Encoding,
            TrustError::InvalidRole { .. } => ErrorKind::InvalidRole,
            TrustError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            TrustError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            TrustError::Cancelled => ErrorKind::Cancelled,
            TrustError::Signer(_) => ErrorKind::Signer,
            TrustError::Cache(_) => ErrorKind::Cache,
            TrustError::TargetNotFound { .. } => ErrorKind::TargetNotFound,
        }
    }

    /// Shorthand for `self.kind().is_security_relevant()`.
    pub fn is_security_relevant(&self) -> bool {
        self.kind().is_security_relevant()
    }

    pub(crate) fn descriptor(role: &RoleName, reason: impl Into<String>) -> Self {
        TrustError::DescriptorMismatch {
            role: role.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_role(role: impl fmt::Display, reason: impl Into<String>) -> Self {
        TrustError::InvalidRole {
            role: role.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrustError>;
