//! Delegation path grants and target ownership resolution.
//!
//! Resolution walks the already-verified delegation tree in declared order.
//! Cycles and out-of-grant delegations are rejected while updating, so the
//! walk here only guards against revisiting a role.

use std::collections::HashSet;

use globset::{Glob, GlobMatcher};

use crate::crypto::sha256_hex;
use crate::error::{Result, TrustError};
use crate::metadata::{TargetDescription, TargetsMetadata};
use crate::role::RoleName;
use crate::state::TrustedState;

const GLOB_META: &[char] = &['*', '?', '['];

/// One entry of a `paths` grant: a literal prefix or a shell-style glob.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    glob: Option<GlobMatcher>,
}

impl PathPattern {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let glob = if raw.contains(GLOB_META) {
            let compiled = Glob::new(&raw)
                .map_err(|err| TrustError::Encoding(format!("invalid path pattern '{raw}': {err}")))?;
            Some(compiled.compile_matcher())
        } else {
            None
        };
        Ok(PathPattern { raw, glob })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_glob(&self) -> bool {
        self.glob.is_some()
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.glob {
            Some(glob) => glob.is_match(path),
            None => path.starts_with(&self.raw),
        }
    }

    /// True when every path this pattern admits is also admitted by `parent`.
    fn within(&self, parent: &PathPattern) -> bool {
        if parent.is_glob() {
            self.raw == parent.raw
        } else {
            self.raw.starts_with(&parent.raw)
        }
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathPattern {}

/// The set of target paths a delegation grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSet {
    Paths(Vec<PathPattern>),
    /// Hex prefixes of the SHA-256 of the target path.
    HashPrefixes(Vec<String>),
}

impl PathSet {
    pub fn paths<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        patterns
            .into_iter()
            .map(PathPattern::new)
            .collect::<Result<Vec<_>>>()
            .map(PathSet::Paths)
    }

    pub fn hash_prefixes<I, S>(prefixes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes: Vec<String> = prefixes
            .into_iter()
            .map(|p| p.into().to_ascii_lowercase())
            .collect();
        if let Some(bad) = prefixes.iter().find(|p| !p.chars().all(|c| c.is_ascii_hexdigit())) {
            return Err(TrustError::Encoding(format!("path hash prefix '{bad}' is not hex")));
        }
        Ok(PathSet::HashPrefixes(prefixes))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathSet::Paths(patterns) => patterns.iter().any(|p| p.matches(path)),
            PathSet::HashPrefixes(prefixes) => {
                let digest = sha256_hex(path.as_bytes());
                prefixes.iter().any(|prefix| digest.starts_with(prefix.as_str()))
            }
        }
    }

    fn grants_everything(&self) -> bool {
        match self {
            PathSet::Paths(patterns) => patterns.iter().any(|p| !p.is_glob() && p.raw.is_empty()),
            PathSet::HashPrefixes(prefixes) => prefixes.iter().any(String::is_empty),
        }
    }

    /// Checks that this grant lies inside `parent`. Returns the first offending pattern.
    pub fn within(&self, parent: &PathSet) -> std::result::Result<(), String> {
        if parent.grants_everything() {
            return Ok(());
        }
        match (self, parent) {
            (PathSet::Paths(child), PathSet::Paths(allowed)) => {
                match child.iter().find(|p| !allowed.iter().any(|q| p.within(q))) {
                    Some(outside) => Err(outside.raw.clone()),
                    None => Ok(()),
                }
            }
            (PathSet::HashPrefixes(child), PathSet::HashPrefixes(allowed)) => {
                match child
                    .iter()
                    .find(|p| !allowed.iter().any(|q| p.starts_with(q.as_str())))
                {
                    Some(outside) => Err(outside.clone()),
                    None => Ok(()),
                }
            }
            (PathSet::Paths(child), PathSet::HashPrefixes(_)) => Err(child
                .first()
                .map(|p| p.raw.clone())
                .unwrap_or_default()),
            (PathSet::HashPrefixes(child), PathSet::Paths(_)) => {
                Err(child.first().cloned().unwrap_or_default())
            }
        }
    }
}

/// The role that is authoritative for a target path, and how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub path: String,
    pub role: RoleName,
    pub description: TargetDescription,
    /// Roles walked from `targets` down to `role`, inclusive.
    pub chain: Vec<RoleName>,
}

enum Search {
    Found(ResolvedTarget),
    Miss,
    /// A terminating delegation claimed the path without providing it.
    Terminated(RoleName),
}

/// Finds the trusted role that provides `path`.
pub fn resolve_target_owner(state: &TrustedState, path: &str) -> Result<ResolvedTarget> {
    let not_found = || TrustError::TargetNotFound {
        path: path.to_owned(),
    };
    let targets = state.targets().ok_or_else(not_found)?;
    let mut visited = HashSet::new();
    let mut chain = vec![RoleName::targets()];
    match search(state, targets, path, &mut visited, &mut chain) {
        Search::Found(found) => Ok(found),
        Search::Miss => Err(not_found()),
        Search::Terminated(role) => {
            tracing::debug!(
                namespace = %state.gun(),
                target_path = path,
                role = %role,
                "trust: terminating delegation claimed path without providing it"
            );
            Err(not_found())
        }
    }
}

fn search(
    state: &TrustedState,
    document: &TargetsMetadata,
    path: &str,
    visited: &mut HashSet<RoleName>,
    chain: &mut Vec<RoleName>,
) -> Search {
    let current = chain.last().cloned().unwrap_or_else(RoleName::targets);
    visited.insert(current.clone());

    for delegation in document.delegated_roles() {
        let claims = delegation
            .path_set()
            .map(|grant| grant.matches(path))
            .unwrap_or(false);
        if !claims {
            continue;
        }
        if !visited.contains(&delegation.name) {
            if let Some(child) = state.delegated_document(&delegation.name) {
                chain.push(delegation.name.clone());
                let outcome = search(state, child, path, visited, chain);
                chain.pop();
                match outcome {
                    Search::Miss => {}
                    done => return done,
                }
            }
        }
        if delegation.terminating {
            return Search::Terminated(delegation.name.clone());
        }
    }

    match document.targets.get(path) {
        Some(description) => Search::Found(ResolvedTarget {
            path: path.to_owned(),
            role: current,
            description: description.clone(),
            chain: chain.clone(),
        }),
        None => Search::Miss,
    }
}
