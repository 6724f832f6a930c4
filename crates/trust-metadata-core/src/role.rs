//! Role names and threshold policies.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{Key, KeyId, PublicKey};
use crate::error::{Result, TrustError};

const ROOT: &str = "root";
const TIMESTAMP: &str = "timestamp";
const SNAPSHOT: &str = "snapshot";
const TARGETS: &str = "targets";
const DELEGATED_PREFIX: &str = "targets/";

/// Where a role sits in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Root,
    Timestamp,
    Snapshot,
    Targets,
    /// `targets/<...>`, declared by a targets-family document.
    Delegated,
}

/// Validated role name: one of the four canonical roles or `targets/<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    pub fn root() -> Self {
        RoleName(ROOT.to_owned())
    }

    pub fn timestamp() -> Self {
        RoleName(TIMESTAMP.to_owned())
    }

    pub fn snapshot() -> Self {
        RoleName(SNAPSHOT.to_owned())
    }

    pub fn targets() -> Self {
        RoleName(TARGETS.to_owned())
    }

    /// Parses and validates a role name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        match name.as_str() {
            ROOT | TIMESTAMP | SNAPSHOT | TARGETS => return Ok(RoleName(name)),
            _ => {}
        }
        let Some(rest) = name.strip_prefix(DELEGATED_PREFIX) else {
            return Err(TrustError::invalid_role(
                &name,
                "delegated roles must be named targets/<path>",
            ));
        };
        if rest.split('/').any(|segment| segment.is_empty()) {
            return Err(TrustError::invalid_role(
                &name,
                "delegated role name contains an empty segment",
            ));
        }
        if rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TrustError::invalid_role(
                &name,
                "delegated role name contains whitespace",
            ));
        }
        Ok(RoleName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> RoleKind {
        match self.0.as_str() {
            ROOT => RoleKind::Root,
            TIMESTAMP => RoleKind::Timestamp,
            SNAPSHOT => RoleKind::Snapshot,
            TARGETS => RoleKind::Targets,
            _ => RoleKind::Delegated,
        }
    }

    /// True for `targets` and every delegated role.
    pub fn is_targets_family(&self) -> bool {
        matches!(self.kind(), RoleKind::Targets | RoleKind::Delegated)
    }

    /// True when `self` is `ancestor` or lives below it in the name hierarchy.
    pub fn is_descendant_of(&self, ancestor: &RoleName) -> bool {
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl TryFrom<String> for RoleName {
    type Error = TrustError;

    fn try_from(value: String) -> Result<Self> {
        RoleName::new(value)
    }
}

impl From<RoleName> for String {
    fn from(value: RoleName) -> Self {
        value.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role's trusted key set and threshold. Invariant: `1 <= threshold <= keys.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    name: RoleName,
    keys: BTreeMap<KeyId, Key>,
    threshold: u32,
}

impl Role {
    pub fn new(name: RoleName, keys: impl IntoIterator<Item = Key>, threshold: u32) -> Result<Self> {
        let keys: BTreeMap<KeyId, Key> = keys
            .into_iter()
            .map(|key| (key.id().clone(), key))
            .collect();
        if threshold == 0 {
            return Err(TrustError::invalid_role(&name, "threshold must be at least 1"));
        }
        if threshold as usize > keys.len() {
            return Err(TrustError::invalid_role(
                &name,
                format!(
                    "threshold {threshold} exceeds the {} distinct key(s) of the role",
                    keys.len()
                ),
            ));
        }
        Ok(Role {
            name,
            keys,
            threshold,
        })
    }

    pub fn name(&self) -> &RoleName {
        &self.name
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.keys.values()
    }

    pub fn key(&self, id: &KeyId) -> Option<&Key> {
        self.keys.get(id)
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &KeyId> {
        self.keys.keys()
    }
}

/// Serialized role policy: key ids into a sibling key map plus a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

impl RoleKeys {
    /// Resolves key ids against `keys`, producing a validated [`Role`].
    pub fn resolve(&self, name: RoleName, keys: &BTreeMap<KeyId, PublicKey>) -> Result<Role> {
        let mut resolved = Vec::with_capacity(self.keyids.len());
        for id in &self.keyids {
            let public = keys.get(id).ok_or_else(|| TrustError::UnknownKey {
                key_id: id.clone(),
                reason: "role references a key missing from the key map",
            })?;
            resolved.push(Key::from_declared(id, public.clone())?);
        }
        Role::new(name, resolved, self.threshold)
    }
}
