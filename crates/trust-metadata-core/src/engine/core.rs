//! Per-namespace trust engine orchestration.
//!
//! Each namespace owns a slot: an async mutex that serialises updates and a
//! pointer to the current immutable [`TrustedState`]. Readers clone the
//! pointer without waiting on writers; a successful update persists its
//! documents and then swaps the pointer in one step.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bundle::UpdateBundle;
use super::telemetry::{NoopTelemetry, TrustTelemetry};
use crate::cache::MetadataCache;
use crate::config::TrustConfig;
use crate::delegation::ResolvedTarget;
use crate::error::{ErrorKind, Result, TrustError};
use crate::keystore::Keystore;
use crate::metadata::RootMetadata;
use crate::pin::TrustPin;
use crate::role::{Role, RoleName};
use crate::rotation::{rotate_root, verify_root_update, RootChanges};
use crate::signer::Signer;
use crate::state::{Gun, TrustedState};
use crate::transport::{MetadataTransport, TransportError};
use crate::update::{restore_from_root, restore_state, TrustUpdate, UpdateOptions};
use crate::verify::{Envelope, Verified};

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Lock and published state of one namespace.
#[derive(Default)]
struct NamespaceSlot {
    update_lock: Mutex<()>,
    current: RwLock<Option<Arc<TrustedState>>>,
}

impl NamespaceSlot {
    fn load(&self) -> Option<Arc<TrustedState>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, state: Arc<TrustedState>) {
        match self.current.write() {
            Ok(mut guard) => *guard = Some(state),
            Err(poisoned) => *poisoned.into_inner() = Some(state),
        }
    }
}

/// Where an update reads its documents from.
enum Source<'a> {
    Transport,
    Bundle(&'a UpdateBundle),
}

/// Trust engine holding the verified state of any number of namespaces.
pub struct TrustEngine {
    transport: Arc<dyn MetadataTransport>,
    cache: Arc<dyn MetadataCache>,
    telemetry: Arc<dyn TrustTelemetry>,
    config: TrustConfig,
    clock: Clock,
    slots: RwLock<HashMap<Gun, Arc<NamespaceSlot>>>,
}

impl fmt::Debug for TrustEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespaces = self.slots.read().map(|slots| slots.len()).unwrap_or(0);
        f.debug_struct("TrustEngine")
            .field("config", &self.config)
            .field("namespaces", &namespaces)
            .finish_non_exhaustive()
    }
}

impl TrustEngine {
    pub fn new(transport: Arc<dyn MetadataTransport>, cache: Arc<dyn MetadataCache>) -> Self {
        TrustEngine {
            transport,
            cache,
            telemetry: Arc::new(NoopTelemetry),
            config: TrustConfig::default(),
            clock: Arc::new(Utc::now),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: TrustConfig) -> Self {
        self.config = config.sanitise();
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TrustTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    fn existing_slot(&self, gun: &Gun) -> Option<Arc<NamespaceSlot>> {
        match self.slots.read() {
            Ok(slots) => slots.get(gun).cloned(),
            Err(poisoned) => poisoned.into_inner().get(gun).cloned(),
        }
    }

    fn slot(&self, gun: &Gun) -> Arc<NamespaceSlot> {
        if let Some(slot) = self.existing_slot(gun) {
            return slot;
        }
        let mut slots = match self.slots.write() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(gun.clone()).or_default().clone()
    }

    /// Current trusted state of `gun`, if it has been opened or bootstrapped.
    pub fn trusted(&self, gun: &Gun) -> Option<Arc<TrustedState>> {
        self.existing_slot(gun).and_then(|slot| slot.load())
    }

    fn require_trusted(&self, gun: &Gun) -> Result<Arc<TrustedState>> {
        self.trusted(gun)
            .ok_or_else(|| TrustError::BootstrapRequired(gun.clone()))
    }

    /// Trusted keys and threshold of `role` in `gun`.
    pub fn role(&self, gun: &Gun, role: &RoleName) -> Result<Role> {
        self.require_trusted(gun)?.role(role)
    }

    /// Finds the trusted role that provides `path` in `gun`.
    pub fn resolve_target(&self, gun: &Gun, path: &str) -> Result<ResolvedTarget> {
        self.require_trusted(gun)?.resolve_target(path)
    }

    /// Pins `gun` to an operator-supplied root.
    ///
    /// Repeating the call with the root already trusted (or one the namespace
    /// has since rotated past) is a no-op; any other root is refused.
    pub async fn bootstrap(&self, gun: &Gun, pin: TrustPin) -> Result<Arc<TrustedState>> {
        let slot = self.slot(gun);
        let _guard = slot.update_lock.lock().await;
        let root = pin.verify()?;

        if let Some(current) = slot.load() {
            if current.root().raw() == root.raw() || root.version < current.root().version {
                debug!(namespace = %gun, "trust: namespace already pinned, bootstrap is a no-op");
                return Ok(current);
            }
            return Err(TrustError::AlreadyBootstrapped(gun.clone()));
        }
        self.pin_locked(&slot, gun, root).await
    }

    async fn pin_locked(
        &self,
        slot: &NamespaceSlot,
        gun: &Gun,
        root: Verified<RootMetadata>,
    ) -> Result<Arc<TrustedState>> {
        let state = TrustedState::with_root(gun.clone(), root);
        self.cache.put_batch(gun, &state.raw_documents()).await?;
        let state = Arc::new(state);
        slot.publish(state.clone());
        info!(
            namespace = %gun,
            root_version = state.root().version,
            "trust: namespace pinned to operator-supplied root"
        );
        self.telemetry.on_bootstrap(gun);
        Ok(state)
    }

    /// Loads `gun`, restoring cached metadata or falling back to `pin`.
    ///
    /// With a pin, the cached root is only trusted when it is the pinned root
    /// or chains from it one version at a time through the transport.
    pub async fn open(&self, gun: &Gun, pin: Option<TrustPin>) -> Result<Arc<TrustedState>> {
        let slot = self.slot(gun);
        let _guard = slot.update_lock.lock().await;
        if let Some(current) = slot.load() {
            return Ok(current);
        }
        let pinned = pin.map(|pin| pin.verify()).transpose()?;

        if self.config.restore_from_cache {
            let documents = self.cache.list(gun).await?;
            if !documents.is_empty() {
                let options = UpdateOptions::from_config(&self.config, (self.clock)());
                let restored = match &pinned {
                    Some(pinned) => self.restore_anchored(gun, pinned, &documents, options).await,
                    None => restore_state(gun.clone(), &documents, options),
                };
                match restored {
                    Ok(state) => {
                        let state = Arc::new(state);
                        slot.publish(state.clone());
                        info!(
                            namespace = %gun,
                            root_version = state.root().version,
                            documents = documents.len(),
                            "trust: restored trusted metadata from cache"
                        );
                        return Ok(state);
                    }
                    Err(err) if pinned.is_some() => {
                        warn!(
                            namespace = %gun,
                            error = %err,
                            security_event = err.is_security_relevant(),
                            "trust: cached metadata failed verification, falling back to pinned root"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        match pinned {
            Some(root) => self.pin_locked(&slot, gun, root).await,
            None => Err(TrustError::BootstrapRequired(gun.clone())),
        }
    }

    async fn restore_anchored(
        &self,
        gun: &Gun,
        pinned: &Verified<RootMetadata>,
        documents: &BTreeMap<RoleName, Vec<u8>>,
        options: UpdateOptions,
    ) -> Result<TrustedState> {
        let root_role = RoleName::root();
        let cached = documents
            .get(&root_role)
            .ok_or_else(|| TrustError::descriptor(&root_role, "missing from the metadata cache"))?;
        let root = self.chain_from_pin(gun, pinned, cached).await?;
        restore_from_root(gun.clone(), root, documents, options)
    }

    /// Follows root versions from `pinned` up to the cached root's version and
    /// requires the last one to be byte-identical to `cached`.
    async fn chain_from_pin(
        &self,
        gun: &Gun,
        pinned: &Verified<RootMetadata>,
        cached: &[u8],
    ) -> Result<Verified<RootMetadata>> {
        let target = Envelope::parse(cached)?.decode::<RootMetadata>()?.version;
        let rotations = target.saturating_sub(pinned.version);
        if target < pinned.version || rotations > self.config.max_root_rotations as u64 {
            return Err(TrustError::PinMismatch(format!(
                "cached root v{target} is not reachable from pinned root v{}",
                pinned.version
            )));
        }

        let mut trusted = pinned.clone();
        while trusted.version < target {
            let raw = self
                .transport
                .fetch(gun, &RoleName::root(), Some(trusted.version + 1))
                .await?;
            trusted = verify_root_update(&trusted, &raw)?;
        }
        if trusted.raw() != cached {
            return Err(TrustError::PinMismatch(format!(
                "cached root v{target} does not descend from the pinned root"
            )));
        }
        debug!(
            namespace = %gun,
            pinned_version = pinned.version,
            root_version = target,
            "trust: cached root chains from pinned root"
        );
        Ok(trusted)
    }

    /// Updates `gun` from the transport with the configured deadline.
    pub async fn update(&self, gun: &Gun) -> Result<Arc<TrustedState>> {
        self.update_with(gun, self.config.update_timeout, &CancellationToken::new())
            .await
    }

    /// Updates `gun` from the transport, giving up at `deadline` or when `cancel` fires.
    pub async fn update_with(
        &self,
        gun: &Gun,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<TrustedState>> {
        self.guarded(gun, deadline, cancel, Source::Transport).await
    }

    /// Updates `gun` from documents the caller already holds.
    pub async fn update_from_bundle(
        &self,
        gun: &Gun,
        bundle: &UpdateBundle,
    ) -> Result<Arc<TrustedState>> {
        let cancel = CancellationToken::new();
        self.guarded(gun, self.config.update_timeout, &cancel, Source::Bundle(bundle))
            .await
    }

    async fn guarded(
        &self,
        gun: &Gun,
        deadline: Duration,
        cancel: &CancellationToken,
        source: Source<'_>,
    ) -> Result<Arc<TrustedState>> {
        let outcome = match self.existing_slot(gun) {
            None => Err(TrustError::BootstrapRequired(gun.clone())),
            Some(slot) => {
                let work = self.run_update(&slot, gun, source);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TrustError::Cancelled),
                    finished = tokio::time::timeout(deadline, work) => {
                        finished.unwrap_or(Err(TrustError::DeadlineExceeded))
                    }
                }
            }
        };
        match outcome {
            Ok(state) => {
                let versions = state.versions();
                info!(
                    namespace = %gun,
                    root_version = versions.root,
                    timestamp_version = versions.timestamp,
                    snapshot_version = versions.snapshot,
                    targets_version = versions.targets,
                    delegations = versions.delegations.len(),
                    "trust: update committed"
                );
                self.telemetry.on_update_success(gun, &versions);
                Ok(state)
            }
            Err(err) => {
                self.report_rejection(gun, &err);
                Err(err)
            }
        }
    }

    fn report_rejection(&self, gun: &Gun, err: &TrustError) {
        let kind = err.kind();
        if kind.is_security_relevant() {
            warn!(
                namespace = %gun,
                error_kind = %kind,
                security_event = true,
                error = %err,
                "trust: update rejected, trusted state unchanged"
            );
            self.telemetry.on_security_event(gun, kind);
        } else if kind == ErrorKind::Transport {
            info!(
                namespace = %gun,
                error_kind = %kind,
                security_event = false,
                error = %err,
                "trust: update aborted by transport failure, trusted state unchanged"
            );
        } else {
            info!(
                namespace = %gun,
                error_kind = %kind,
                security_event = false,
                error = %err,
                "trust: update abandoned, trusted state unchanged"
            );
        }
        self.telemetry.on_update_rejected(gun, kind);
    }

    async fn fetch(
        &self,
        source: &Source<'_>,
        gun: &Gun,
        role: &RoleName,
        version: Option<u64>,
    ) -> Result<Vec<u8>> {
        match source {
            Source::Transport => {
                debug!(namespace = %gun, role = %role, version, "trust: fetching metadata");
                Ok(self.transport.fetch(gun, role, version).await?)
            }
            Source::Bundle(bundle) => bundle.document(role).map(<[u8]>::to_vec).ok_or_else(|| {
                TransportError::NotFound {
                    gun: gun.clone(),
                    role: role.clone(),
                    version,
                }
                .into()
            }),
        }
    }

    /// Walks successor roots until the source has no newer version.
    async fn walk_roots(&self, update: &mut TrustUpdate, source: &Source<'_>, gun: &Gun) -> Result<()> {
        if let Source::Bundle(bundle) = source {
            for raw in &bundle.roots {
                let from = update.current_root().version;
                update.apply_root(raw)?;
                self.telemetry
                    .on_root_rotation(gun, from, update.current_root().version);
            }
            return Ok(());
        }

        while update.rotations() < self.config.max_root_rotations {
            let from = update.current_root().version;
            let raw = match self
                .transport
                .fetch(gun, &RoleName::root(), Some(from + 1))
                .await
            {
                Ok(raw) => raw,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            update.apply_root(&raw)?;
            self.telemetry.on_root_rotation(gun, from, from + 1);
        }
        warn!(
            namespace = %gun,
            max_root_rotations = self.config.max_root_rotations,
            "trust: stopped walking root versions at the configured limit"
        );
        Ok(())
    }

    async fn run_update(
        &self,
        slot: &NamespaceSlot,
        gun: &Gun,
        source: Source<'_>,
    ) -> Result<Arc<TrustedState>> {
        let _guard = slot.update_lock.lock().await;
        let baseline = slot
            .load()
            .ok_or_else(|| TrustError::BootstrapRequired(gun.clone()))?;
        let options = UpdateOptions::from_config(&self.config, (self.clock)());
        let mut update = TrustUpdate::new(baseline, options);

        self.walk_roots(&mut update, &source, gun).await?;
        update.confirm_root()?;

        // Consistent snapshots are addressed by the version their descriptor pins.
        let consistent = update.current_root().consistent_snapshot;

        let timestamp = self.fetch(&source, gun, &RoleName::timestamp(), None).await?;
        update.verify_timestamp(&timestamp)?;

        let version = update
            .expected_snapshot()
            .and_then(|meta| meta.version)
            .filter(|_| consistent);
        let snapshot = self.fetch(&source, gun, &RoleName::snapshot(), version).await?;
        update.verify_snapshot(&snapshot)?;

        let targets_role = RoleName::targets();
        let version = update
            .expected(&targets_role)
            .and_then(|meta| meta.version)
            .filter(|_| consistent);
        let targets = self.fetch(&source, gun, &targets_role, version).await?;
        update.verify_targets(&targets)?;

        while let Some(request) = update.next_delegation()? {
            let version = if consistent { request.version } else { None };
            let raw = self.fetch(&source, gun, &request.role, version).await?;
            update.verify_delegation(&raw)?;
        }

        let state = update.finish()?;
        self.cache.put_batch(gun, &state.raw_documents()).await?;
        let state = Arc::new(state);
        slot.publish(state.clone());
        Ok(state)
    }

    /// Produces root N+1 for `gun`, publishes it through the transport and returns it.
    ///
    /// The engine's own state picks the new root up on the next update.
    pub async fn rotate_root(
        &self,
        gun: &Gun,
        changes: RootChanges,
        keystore: &dyn Keystore,
        signer: &dyn Signer,
    ) -> Result<Verified<RootMetadata>> {
        let current = self.require_trusted(gun)?;
        let next = rotate_root(
            current.root(),
            changes,
            keystore,
            signer,
            self.config.signer_timeout,
        )
        .await?;
        self.transport
            .put(gun, &RoleName::root(), next.raw().to_vec())
            .await?;
        info!(
            namespace = %gun,
            root_version = next.version,
            "trust: published rotated root"
        );
        Ok(next)
    }
}
