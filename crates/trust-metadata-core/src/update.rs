//! Trust update state machine.
//!
//! Drives verification in the fixed order root, timestamp, snapshot, targets,
//! delegations. Every step either advances the phase or moves the update to
//! `Rejected`, which is terminal; the baseline state is never touched, and a
//! new [`TrustedState`] only exists once [`TrustUpdate::finish`] succeeds.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::TrustConfig;
use crate::delegation::PathSet;
use crate::error::{Result, TrustError};
use crate::metadata::{
    FileMeta, Metadata, RootMetadata, SnapshotMetadata, TargetsMetadata, TimestampMetadata,
};
use crate::role::{Role, RoleKind, RoleName};
use crate::rotation::{verify_root_update, verify_self_signed_root};
use crate::state::{Gun, TrustedDelegation, TrustedState};
use crate::verify::{verify_signatures, Verified};

/// Where an update currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Bootstrapping,
    RootVerified,
    TimestampVerified,
    SnapshotVerified,
    TargetsVerified,
    Trusted,
    Rejected,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdatePhase::Bootstrapping => "bootstrapping",
            UpdatePhase::RootVerified => "root-verified",
            UpdatePhase::TimestampVerified => "timestamp-verified",
            UpdatePhase::SnapshotVerified => "snapshot-verified",
            UpdatePhase::TargetsVerified => "targets-verified",
            UpdatePhase::Trusted => "trusted",
            UpdatePhase::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// Knobs for a single update attempt.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub now: DateTime<Utc>,
    /// Cache restores disable this; cached documents only serve as version baselines.
    pub enforce_expiry: bool,
    pub max_document_bytes: usize,
    pub max_delegation_depth: usize,
}

impl UpdateOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::from_config(&TrustConfig::default(), now)
    }

    pub fn from_config(config: &TrustConfig, now: DateTime<Utc>) -> Self {
        UpdateOptions {
            now,
            enforce_expiry: true,
            max_document_bytes: config.max_document_bytes,
            max_delegation_depth: config.max_delegation_depth,
        }
    }
}

/// The next delegated document the caller must supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    pub role: RoleName,
    pub parent: RoleName,
    /// Version pinned by the snapshot, when it pins one.
    pub version: Option<u64>,
}

#[derive(Debug, Clone)]
struct PendingDelegation {
    role: RoleName,
    parent: RoleName,
    keys: Role,
    paths: PathSet,
    terminating: bool,
    /// Walk path from `targets` to `parent`, used for cycle detection.
    ancestors: Vec<RoleName>,
    depth: usize,
}

/// One in-flight update of a namespace.
#[derive(Debug)]
pub struct TrustUpdate {
    baseline: Arc<TrustedState>,
    options: UpdateOptions,
    phase: UpdatePhase,
    root: Verified<RootMetadata>,
    rotations: usize,
    timestamp: Option<Verified<TimestampMetadata>>,
    snapshot: Option<Verified<SnapshotMetadata>>,
    targets: Option<Verified<TargetsMetadata>>,
    delegations: BTreeMap<RoleName, TrustedDelegation>,
    queue: VecDeque<PendingDelegation>,
}

impl TrustUpdate {
    pub fn new(baseline: Arc<TrustedState>, options: UpdateOptions) -> Self {
        let root = baseline.root.clone();
        TrustUpdate {
            baseline,
            options,
            phase: UpdatePhase::Bootstrapping,
            root,
            rotations: 0,
            timestamp: None,
            snapshot: None,
            targets: None,
            delegations: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub fn gun(&self) -> &Gun {
        &self.baseline.gun
    }

    /// Root that later steps are verified against.
    pub fn current_root(&self) -> &RootMetadata {
        &self.root
    }

    /// Number of root versions applied so far.
    pub fn rotations(&self) -> usize {
        self.rotations
    }

    fn step<T>(
        &mut self,
        expected: UpdatePhase,
        attempted: &'static str,
        run: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if self.phase != expected {
            let err = TrustError::OutOfOrder {
                phase: self.phase,
                attempted,
            };
            self.phase = UpdatePhase::Rejected;
            return Err(err);
        }
        let outcome = run(self);
        if outcome.is_err() {
            self.phase = UpdatePhase::Rejected;
        }
        outcome
    }

    fn check_size(&self, role: &RoleName, raw: &[u8]) -> Result<()> {
        if raw.len() > self.options.max_document_bytes {
            return Err(TrustError::Encoding(format!(
                "{role} document is {} bytes, limit is {}",
                raw.len(),
                self.options.max_document_bytes
            )));
        }
        Ok(())
    }

    fn check_expiry<M: Metadata>(&self, role: &RoleName, document: &M) -> Result<()> {
        if self.options.enforce_expiry && document.is_expired(self.options.now) {
            return Err(TrustError::Expired {
                role: role.clone(),
                expires: document.expires(),
            });
        }
        Ok(())
    }

    fn check_not_older(role: &RoleName, trusted: Option<u64>, offered: u64) -> Result<()> {
        match trusted {
            Some(trusted) if offered < trusted => Err(TrustError::VersionRollback {
                role: role.clone(),
                trusted,
                offered,
            }),
            _ => Ok(()),
        }
    }

    /// Applies the next root version. May be called repeatedly to walk N → N+1 → N+2.
    pub fn apply_root(&mut self, raw: &[u8]) -> Result<()> {
        self.step(UpdatePhase::Bootstrapping, "apply_root", |this| {
            this.check_size(&RoleName::root(), raw)?;
            let next = verify_root_update(&this.root, raw)?;
            tracing::info!(
                namespace = %this.baseline.gun,
                from_version = this.root.version,
                to_version = next.version,
                "trust: root rotation verified"
            );
            this.root = next;
            this.rotations += 1;
            Ok(())
        })
    }

    /// Ends the root walk. Only the final root's expiry matters.
    pub fn confirm_root(&mut self) -> Result<()> {
        self.step(UpdatePhase::Bootstrapping, "confirm_root", |this| {
            this.check_expiry(&RoleName::root(), &*this.root)?;
            this.phase = UpdatePhase::RootVerified;
            Ok(())
        })
    }

    pub fn verify_timestamp(&mut self, raw: &[u8]) -> Result<()> {
        self.step(UpdatePhase::RootVerified, "verify_timestamp", |this| {
            let name = RoleName::timestamp();
            this.check_size(&name, raw)?;
            let role = this.root.role(&name)?;
            let timestamp = verify_signatures::<TimestampMetadata>(raw, &role)?;

            let trusted = this.baseline.timestamp.as_ref().map(|t| t.version);
            Self::check_not_older(&name, trusted, timestamp.version)?;
            this.check_expiry(&name, &*timestamp)?;

            let snapshot = RoleName::snapshot();
            let descriptor = timestamp
                .snapshot_descriptor()
                .ok_or_else(|| TrustError::descriptor(&name, "timestamp does not describe snapshot"))?;
            if descriptor.length.is_none() || !descriptor.has_supported_hash() {
                return Err(TrustError::descriptor(
                    &name,
                    "snapshot descriptor must pin length and a supported digest",
                ));
            }
            if let Some(version) = descriptor.version {
                let trusted = this.baseline.snapshot.as_ref().map(|s| s.version);
                Self::check_not_older(&snapshot, trusted, version)?;
            }

            this.timestamp = Some(timestamp);
            this.phase = UpdatePhase::TimestampVerified;
            Ok(())
        })
    }

    /// Snapshot descriptor recorded by the verified timestamp.
    pub fn expected_snapshot(&self) -> Option<&FileMeta> {
        self.timestamp.as_ref().and_then(|t| t.snapshot_descriptor())
    }

    pub fn verify_snapshot(&mut self, raw: &[u8]) -> Result<()> {
        self.step(UpdatePhase::TimestampVerified, "verify_snapshot", |this| {
            let name = RoleName::snapshot();
            this.check_size(&name, raw)?;
            let descriptor = this
                .expected_snapshot()
                .cloned()
                .ok_or_else(|| TrustError::descriptor(&name, "no snapshot descriptor recorded"))?;
            descriptor.check_bytes(&name, raw)?;

            let role = this.root.role(&name)?;
            let snapshot = verify_signatures::<SnapshotMetadata>(raw, &role)?;
            descriptor.check_version(&name, snapshot.version)?;

            let trusted = this.baseline.snapshot.as_ref();
            Self::check_not_older(&name, trusted.map(|s| s.version), snapshot.version)?;
            this.check_expiry(&name, &*snapshot)?;

            if !snapshot.meta.contains_key(&RoleName::targets()) {
                return Err(TrustError::descriptor(&name, "snapshot does not list targets"));
            }
            if let Some(previous) = trusted {
                for (listed, before) in previous.meta.iter().filter(|(r, _)| r.is_targets_family()) {
                    let Some(now) = snapshot.meta.get(listed) else {
                        return Err(TrustError::VersionRollback {
                            role: listed.clone(),
                            trusted: before.version.unwrap_or_default(),
                            offered: 0,
                        });
                    };
                    if let (Some(before), Some(now)) = (before.version, now.version) {
                        Self::check_not_older(listed, Some(before), now)?;
                    }
                }
            }
            if let Some(root_meta) = snapshot.meta.get(&RoleName::root()) {
                let root = RoleName::root();
                root_meta.check_bytes(&root, this.root.raw())?;
                root_meta.check_version(&root, this.root.version)?;
            }

            this.snapshot = Some(snapshot);
            this.phase = UpdatePhase::SnapshotVerified;
            Ok(())
        })
    }

    /// Descriptor the trusted snapshot records for `role`.
    pub fn expected(&self, role: &RoleName) -> Option<&FileMeta> {
        self.snapshot.as_ref().and_then(|s| s.meta.get(role))
    }

    fn listed_descriptor(&self, role: &RoleName) -> Result<FileMeta> {
        self.expected(role)
            .cloned()
            .ok_or_else(|| TrustError::descriptor(role, "not listed by the trusted snapshot"))
    }

    pub fn verify_targets(&mut self, raw: &[u8]) -> Result<()> {
        self.step(UpdatePhase::SnapshotVerified, "verify_targets", |this| {
            let name = RoleName::targets();
            this.check_size(&name, raw)?;
            let descriptor = this.listed_descriptor(&name)?;
            descriptor.check_bytes(&name, raw)?;

            let role = this.root.role(&name)?;
            let targets = verify_signatures::<TargetsMetadata>(raw, &role)?;
            descriptor.check_version(&name, targets.version)?;
            let trusted = this.baseline.targets.as_ref().map(|t| t.version);
            Self::check_not_older(&name, trusted, targets.version)?;
            this.check_expiry(&name, &*targets)?;

            this.enqueue_children(&name, &targets, None, &[], 1)?;
            this.targets = Some(targets);
            this.phase = UpdatePhase::TargetsVerified;
            Ok(())
        })
    }

    fn enqueue_children(
        &mut self,
        parent: &RoleName,
        document: &TargetsMetadata,
        parent_grant: Option<&PathSet>,
        parent_ancestors: &[RoleName],
        depth: usize,
    ) -> Result<()> {
        let Some(delegations) = document.delegations.as_ref() else {
            return Ok(());
        };
        let mut ancestors = parent_ancestors.to_vec();
        ancestors.push(parent.clone());

        let mut seen = Vec::with_capacity(delegations.roles.len());
        for declared in &delegations.roles {
            let name = &declared.name;
            if name.kind() != RoleKind::Delegated {
                return Err(TrustError::invalid_role(name, "only targets/<path> roles can be delegated"));
            }
            if seen.contains(&name) {
                return Err(TrustError::invalid_role(name, format!("declared twice by {parent}")));
            }
            seen.push(name);
            if ancestors.contains(name) {
                return Err(TrustError::DelegationCycle { role: name.clone() });
            }
            let paths = declared.path_set()?;
            if let Some(grant) = parent_grant {
                paths
                    .within(grant)
                    .map_err(|pattern| TrustError::PathNotDelegated {
                        role: name.clone(),
                        pattern,
                    })?;
            }
            let keys = delegations.role(declared)?;

            if self.expected(name).is_none() {
                tracing::debug!(
                    namespace = %self.baseline.gun,
                    role = %name,
                    "trust: delegation not listed by snapshot, treating as absent"
                );
                continue;
            }
            if depth > self.options.max_delegation_depth {
                tracing::warn!(
                    namespace = %self.baseline.gun,
                    role = %name,
                    depth,
                    max_depth = self.options.max_delegation_depth,
                    "trust: delegation deeper than the configured limit, not trusting it"
                );
                continue;
            }
            self.queue.push_back(PendingDelegation {
                role: name.clone(),
                parent: parent.clone(),
                keys,
                paths,
                terminating: declared.terminating,
                ancestors: ancestors.clone(),
                depth,
            });
        }
        Ok(())
    }

    /// Next delegated document to supply, or `None` once the walk is complete.
    ///
    /// A role reached again through a second parent is re-verified against that
    /// parent's keys without being fetched again.
    pub fn next_delegation(&mut self) -> Result<Option<DelegationRequest>> {
        self.step(UpdatePhase::TargetsVerified, "next_delegation", |this| {
            while let Some(front) = this.queue.front() {
                let Some(existing) = this.delegations.get(&front.role) else {
                    return Ok(Some(DelegationRequest {
                        role: front.role.clone(),
                        parent: front.parent.clone(),
                        version: this.expected(&front.role).and_then(|m| m.version),
                    }));
                };
                verify_signatures::<TargetsMetadata>(existing.document.raw(), &front.keys)?;
                this.queue.pop_front();
            }
            Ok(None)
        })
    }

    /// Verifies the document requested by the last [`Self::next_delegation`] call.
    pub fn verify_delegation(&mut self, raw: &[u8]) -> Result<()> {
        self.step(UpdatePhase::TargetsVerified, "verify_delegation", |this| {
            let pending = this.queue.pop_front().ok_or(TrustError::OutOfOrder {
                phase: UpdatePhase::TargetsVerified,
                attempted: "verify_delegation",
            })?;
            let name = pending.role.clone();
            this.check_size(&name, raw)?;
            let descriptor = this.listed_descriptor(&name)?;
            descriptor.check_bytes(&name, raw)?;

            let document = verify_signatures::<TargetsMetadata>(raw, &pending.keys)?;
            descriptor.check_version(&name, document.version)?;
            let trusted = this.baseline.delegation(&name).map(|d| d.document.version);
            Self::check_not_older(&name, trusted, document.version)?;
            this.check_expiry(&name, &*document)?;

            this.enqueue_children(
                &name,
                &document,
                Some(&pending.paths),
                &pending.ancestors,
                pending.depth + 1,
            )?;
            tracing::debug!(
                namespace = %this.baseline.gun,
                role = %name,
                parent = %pending.parent,
                version = document.version,
                "trust: delegation verified"
            );
            this.delegations.insert(
                name,
                TrustedDelegation {
                    parent: pending.parent,
                    role: pending.keys,
                    paths: pending.paths,
                    terminating: pending.terminating,
                    document,
                },
            );
            Ok(())
        })
    }

    /// Produces the new trusted state once every step has passed.
    pub fn finish(mut self) -> Result<TrustedState> {
        self.step(UpdatePhase::TargetsVerified, "finish", |this| {
            if let Some(pending) = this.queue.front() {
                return Err(TrustError::descriptor(
                    &pending.role,
                    "listed by the snapshot but never supplied",
                ));
            }
            this.phase = UpdatePhase::Trusted;
            Ok(())
        })?;
        Ok(TrustedState {
            gun: self.baseline.gun.clone(),
            root: self.root,
            timestamp: self.timestamp,
            snapshot: self.snapshot,
            targets: self.targets,
            delegations: self.delegations,
        })
    }
}

/// Rebuilds a trusted state from cached documents.
///
/// The root only has to vouch for itself; everything else goes through the
/// normal chain with expiry disabled.
pub(crate) fn restore_state(
    gun: Gun,
    documents: &BTreeMap<RoleName, Vec<u8>>,
    options: UpdateOptions,
) -> Result<TrustedState> {
    let root_raw = documents
        .get(&RoleName::root())
        .ok_or_else(|| TrustError::BootstrapRequired(gun.clone()))?;
    let root = verify_self_signed_root(root_raw)?;
    restore_from_root(gun, root, documents, options)
}

/// Rebuilds a trusted state from cached documents on top of a root the
/// caller has already anchored. The cached root entry is not consulted.
pub(crate) fn restore_from_root(
    gun: Gun,
    root: Verified<RootMetadata>,
    documents: &BTreeMap<RoleName, Vec<u8>>,
    mut options: UpdateOptions,
) -> Result<TrustedState> {
    let root_only = TrustedState::with_root(gun, root);
    let Some(timestamp) = documents.get(&RoleName::timestamp()) else {
        return Ok(root_only);
    };

    options.enforce_expiry = false;
    let mut update = TrustUpdate::new(Arc::new(root_only), options);
    update.confirm_root()?;
    update.verify_timestamp(timestamp)?;
    update.verify_snapshot(cached(documents, &RoleName::snapshot())?)?;
    update.verify_targets(cached(documents, &RoleName::targets())?)?;
    while let Some(request) = update.next_delegation()? {
        update.verify_delegation(cached(documents, &request.role)?)?;
    }
    update.finish()
}

fn cached<'a>(documents: &'a BTreeMap<RoleName, Vec<u8>>, role: &RoleName) -> Result<&'a [u8]> {
    documents
        .get(role)
        .map(Vec::as_slice)
        .ok_or_else(|| TrustError::descriptor(role, "missing from the metadata cache"))
}
