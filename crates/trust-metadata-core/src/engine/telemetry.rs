//! Engine-level telemetry abstractions.
//!
//! Embedders implement [`TrustTelemetry`] to observe update outcomes and, in
//! particular, to route security events (rollback, descriptor mismatch,
//! forged signatures) apart from ordinary unavailability.

use crate::error::ErrorKind;
use crate::state::{Gun, RoleVersions};

/// Hooks invoked on significant engine events.
pub trait TrustTelemetry: Send + Sync {
    /// Called after a new trusted state has been published.
    fn on_update_success(&self, _gun: &Gun, _versions: &RoleVersions) {}
    /// Called when an update attempt is abandoned, for any reason.
    fn on_update_rejected(&self, _gun: &Gun, _kind: ErrorKind) {}
    /// Called in addition to `on_update_rejected` when the failure looks like an attack.
    fn on_security_event(&self, _gun: &Gun, _kind: ErrorKind) {}
    /// Called once a namespace has been pinned to its first root.
    fn on_bootstrap(&self, _gun: &Gun) {}
    /// Called for each root version accepted during an update.
    fn on_root_rotation(&self, _gun: &Gun, _from_version: u64, _to_version: u64) {}
}

/// Default telemetry implementation that performs no-ops.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TrustTelemetry for NoopTelemetry {}
