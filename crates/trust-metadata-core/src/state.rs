//! The trusted repository state of one namespace.
//!
//! A [`TrustedState`] is immutable once built; updates produce a new value
//! that the engine publishes with a single pointer swap.

use std::collections::BTreeMap;
use std::fmt;

use crate::delegation::{resolve_target_owner, PathSet, ResolvedTarget};
use crate::error::{Result, TrustError};
use crate::metadata::{RootMetadata, SnapshotMetadata, TargetsMetadata, TimestampMetadata};
use crate::role::{Role, RoleKind, RoleName};
use crate::verify::Verified;

/// Globally unique name of a trust namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gun(String);

impl Gun {
    pub fn new(name: impl Into<String>) -> Self {
        Gun(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Gun {
    fn from(value: &str) -> Self {
        Gun(value.to_owned())
    }
}

impl fmt::Display for Gun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A verified delegated targets document and the policy it was verified under.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedDelegation {
    /// Role that first declared this delegation.
    pub parent: RoleName,
    pub role: Role,
    pub paths: PathSet,
    pub terminating: bool,
    pub document: Verified<TargetsMetadata>,
}

/// Versions of every trusted document, used to check monotonicity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleVersions {
    pub root: u64,
    pub timestamp: Option<u64>,
    pub snapshot: Option<u64>,
    pub targets: Option<u64>,
    pub delegations: BTreeMap<RoleName, u64>,
}

impl RoleVersions {
    /// True when no role in `self` is older than in `earlier`.
    ///
    /// A delegated role trusted in `earlier` but absent from `self` counts as
    /// a regression.
    pub fn never_regress_from(&self, earlier: &RoleVersions) -> bool {
        fn ge(now: Option<u64>, before: Option<u64>) -> bool {
            match (now, before) {
                (_, None) => true,
                (Some(now), Some(before)) => now >= before,
                (None, Some(_)) => false,
            }
        }
        self.root >= earlier.root
            && ge(self.timestamp, earlier.timestamp)
            && ge(self.snapshot, earlier.snapshot)
            && ge(self.targets, earlier.targets)
            && earlier.delegations.iter().all(|(role, before)| {
                ge(self.delegations.get(role).copied(), Some(*before))
            })
    }
}

/// Currently accepted documents of one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedState {
    pub(crate) gun: Gun,
    pub(crate) root: Verified<RootMetadata>,
    pub(crate) timestamp: Option<Verified<TimestampMetadata>>,
    pub(crate) snapshot: Option<Verified<SnapshotMetadata>>,
    pub(crate) targets: Option<Verified<TargetsMetadata>>,
    pub(crate) delegations: BTreeMap<RoleName, TrustedDelegation>,
}

impl TrustedState {
    /// State holding only a root accepted by pinning.
    pub(crate) fn with_root(gun: Gun, root: Verified<RootMetadata>) -> Self {
        TrustedState {
            gun,
            root,
            timestamp: None,
            snapshot: None,
            targets: None,
            delegations: BTreeMap::new(),
        }
    }

    pub fn gun(&self) -> &Gun {
        &self.gun
    }

    pub fn root(&self) -> &Verified<RootMetadata> {
        &self.root
    }

    pub fn timestamp(&self) -> Option<&Verified<TimestampMetadata>> {
        self.timestamp.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Verified<SnapshotMetadata>> {
        self.snapshot.as_ref()
    }

    pub fn targets(&self) -> Option<&TargetsMetadata> {
        self.targets.as_deref()
    }

    pub fn delegation(&self, name: &RoleName) -> Option<&TrustedDelegation> {
        self.delegations.get(name)
    }

    pub fn delegations(&self) -> impl Iterator<Item = (&RoleName, &TrustedDelegation)> {
        self.delegations.iter()
    }

    pub fn delegated_document(&self, name: &RoleName) -> Option<&TargetsMetadata> {
        self.delegations.get(name).map(|d| &*d.document)
    }

    /// Trusted key set and threshold of a role.
    pub fn role(&self, name: &RoleName) -> Result<Role> {
        match name.kind() {
            RoleKind::Delegated => self
                .delegations
                .get(name)
                .map(|d| d.role.clone())
                .ok_or_else(|| TrustError::UnknownRole(name.to_string())),
            _ => self.root.role(name),
        }
    }

    pub fn versions(&self) -> RoleVersions {
        RoleVersions {
            root: self.root.version,
            timestamp: self.timestamp.as_ref().map(|t| t.version),
            snapshot: self.snapshot.as_ref().map(|s| s.version),
            targets: self.targets.as_ref().map(|t| t.version),
            delegations: self
                .delegations
                .iter()
                .map(|(name, d)| (name.clone(), d.document.version))
                .collect(),
        }
    }

    /// Finds the role authoritative for `path` and its signed description.
    pub fn resolve_target(&self, path: &str) -> Result<ResolvedTarget> {
        resolve_target_owner(self, path)
    }

    /// Raw bytes of every trusted document, keyed by role.
    pub fn raw_documents(&self) -> BTreeMap<RoleName, Vec<u8>> {
        let mut docs = BTreeMap::new();
        docs.insert(RoleName::root(), self.root.raw().to_vec());
        if let Some(ts) = &self.timestamp {
            docs.insert(RoleName::timestamp(), ts.raw().to_vec());
        }
        if let Some(snap) = &self.snapshot {
            docs.insert(RoleName::snapshot(), snap.raw().to_vec());
        }
        if let Some(targets) = &self.targets {
            docs.insert(RoleName::targets(), targets.raw().to_vec());
        }
        for (name, delegation) in &self.delegations {
            docs.insert(name.clone(), delegation.document.raw().to_vec());
        }
        docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_regression_detection() {
        let before = RoleVersions {
            root: 2,
            timestamp: Some(5),
            snapshot: Some(10),
            targets: Some(3),
            delegations: BTreeMap::new(),
        };
        let mut after = before.clone();
        assert!(after.never_regress_from(&before));
        after.snapshot = Some(9);
        assert!(!after.never_regress_from(&before));
        after.snapshot = None;
        assert!(!after.never_regress_from(&before));
        assert!(before.never_regress_from(&RoleVersions::default()));
    }

    #[test]
    /// Delegated targets versions count toward monotonicity, and dropping one is a regression.
    fn delegated_version_regression_detection() {
        let releases = RoleName::new("targets/releases").unwrap();
        let nightly = RoleName::new("targets/nightly").unwrap();
        let before = RoleVersions {
            root: 1,
            timestamp: Some(4),
            snapshot: Some(4),
            targets: Some(4),
            delegations: BTreeMap::from([(releases.clone(), 6)]),
        };

        let mut after = before.clone();
        after.delegations.insert(nightly, 1);
        assert!(after.never_regress_from(&before));
        assert!(!before.never_regress_from(&after));

        after.delegations.insert(releases.clone(), 5);
        assert!(!after.never_regress_from(&before));
        after.delegations.remove(&releases);
        assert!(!after.never_regress_from(&before));
        after.delegations.insert(releases, 7);
        assert!(after.never_regress_from(&before));
    }
}
