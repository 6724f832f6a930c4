//! Telemetry helpers for the trust engine.
//!
//! Drop-in implementations of [`TrustTelemetry`]: relaxed atomic counters
//! that embedders can export to their own metric backend, and a dispatcher
//! that fans events out to several observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::TrustTelemetry;
use crate::error::ErrorKind;
use crate::state::{Gun, RoleVersions};

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    update_success: AtomicU64,
    update_rejected: AtomicU64,
    security_events: AtomicU64,
    rollback_detected: AtomicU64,
    descriptor_mismatch: AtomicU64,
    signature_failures: AtomicU64,
    transport_failures: AtomicU64,
    bootstraps: AtomicU64,
    root_rotations: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            update_success: self.update_success.load(Ordering::Relaxed),
            update_rejected: self.update_rejected.load(Ordering::Relaxed),
            security_events: self.security_events.load(Ordering::Relaxed),
            rollback_detected: self.rollback_detected.load(Ordering::Relaxed),
            descriptor_mismatch: self.descriptor_mismatch.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            bootstraps: self.bootstraps.load(Ordering::Relaxed),
            root_rotations: self.root_rotations.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    pub update_success: u64,
    pub update_rejected: u64,
    /// Rejections whose kind is security relevant.
    pub security_events: u64,
    /// `VersionRollback` and `VersionGap` rejections.
    pub rollback_detected: u64,
    pub descriptor_mismatch: u64,
    /// Threshold, bad-signature and unknown-key rejections.
    pub signature_failures: u64,
    pub transport_failures: u64,
    pub bootstraps: u64,
    pub root_rotations: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "update_success={}, update_rejected={}, security_events={}, rollback_detected={}, descriptor_mismatch={}, signature_failures={}, transport_failures={}, bootstraps={}, root_rotations={}",
            self.update_success,
            self.update_rejected,
            self.security_events,
            self.rollback_detected,
            self.descriptor_mismatch,
            self.signature_failures,
            self.transport_failures,
            self.bootstraps,
            self.root_rotations
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every signal.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl TrustTelemetry for CountingTelemetry {
    fn on_update_success(&self, _gun: &Gun, _versions: &RoleVersions) {
        self.counters.update_success.fetch_add(1, Ordering::Relaxed);
    }

    fn on_update_rejected(&self, _gun: &Gun, kind: ErrorKind) {
        self.counters.update_rejected.fetch_add(1, Ordering::Relaxed);
        if kind == ErrorKind::Transport {
            self.counters
                .transport_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_security_event(&self, _gun: &Gun, kind: ErrorKind) {
        self.counters.security_events.fetch_add(1, Ordering::Relaxed);
        // Split the security events into the buckets dashboards usually alert on.
        let bucket = match kind {
            ErrorKind::VersionRollback | ErrorKind::VersionGap => &self.counters.rollback_detected,
            ErrorKind::DescriptorMismatch => &self.counters.descriptor_mismatch,
            ErrorKind::InsufficientSignatures | ErrorKind::BadSignature | ErrorKind::UnknownKey => {
                &self.counters.signature_failures
            }
            _ => return,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bootstrap(&self, _gun: &Gun) {
        self.counters.bootstraps.fetch_add(1, Ordering::Relaxed);
    }

    fn on_root_rotation(&self, _gun: &Gun, _from_version: u64, _to_version: u64) {
        self.counters.root_rotations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Telemetry implementation that forwards events to multiple observers.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn TrustTelemetry>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, telemetry: Arc<dyn TrustTelemetry>) -> Self {
        self.observers.push(telemetry);
        self
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl TrustTelemetry for CompositeTelemetry {
    fn on_update_success(&self, gun: &Gun, versions: &RoleVersions) {
        for observer in &self.observers {
            observer.on_update_success(gun, versions);
        }
    }

    fn on_update_rejected(&self, gun: &Gun, kind: ErrorKind) {
        for observer in &self.observers {
            observer.on_update_rejected(gun, kind);
        }
    }

    fn on_security_event(&self, gun: &Gun, kind: ErrorKind) {
        for observer in &self.observers {
            observer.on_security_event(gun, kind);
        }
    }

    fn on_bootstrap(&self, gun: &Gun) {
        for observer in &self.observers {
            observer.on_bootstrap(gun);
        }
    }

    fn on_root_rotation(&self, gun: &Gun, from_version: u64, to_version: u64) {
        for observer in &self.observers {
            observer.on_root_rotation(gun, from_version, to_version);
        }
    }
}
