//! Caller-supplied metadata for offline or push-style updates.

use std::collections::BTreeMap;

use crate::role::{RoleKind, RoleName};

/// Every document an update needs, already fetched by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBundle {
    /// Successor roots in ascending version order; empty when root is unchanged.
    pub roots: Vec<Vec<u8>>,
    pub timestamp: Vec<u8>,
    pub snapshot: Vec<u8>,
    pub targets: Vec<u8>,
    pub delegated: BTreeMap<RoleName, Vec<u8>>,
}

impl UpdateBundle {
    pub fn new(timestamp: Vec<u8>, snapshot: Vec<u8>, targets: Vec<u8>) -> Self {
        UpdateBundle {
            roots: Vec::new(),
            timestamp,
            snapshot,
            targets,
            delegated: BTreeMap::new(),
        }
    }

    pub fn with_root(mut self, root: Vec<u8>) -> Self {
        self.roots.push(root);
        self
    }

    pub fn with_delegation(mut self, role: RoleName, document: Vec<u8>) -> Self {
        self.delegated.insert(role, document);
        self
    }

    /// The non-root document supplied for `role`, if any.
    pub(crate) fn document(&self, role: &RoleName) -> Option<&[u8]> {
        match role.kind() {
            RoleKind::Root => None,
            RoleKind::Timestamp => Some(self.timestamp.as_slice()),
            RoleKind::Snapshot => Some(self.snapshot.as_slice()),
            RoleKind::Targets => Some(self.targets.as_slice()),
            RoleKind::Delegated => self.delegated.get(role).map(Vec::as_slice),
        }
    }
}
