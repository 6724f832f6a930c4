//! Engine settings, with environment-driven overrides.
//!
//! Every knob has a safe default; `TRUST_*` variables override them and
//! [`TrustConfig::sanitise`] clamps anything out of range.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Environment variable bounding a whole update attempt, in seconds.
const ENV_UPDATE_TIMEOUT: &str = "TRUST_UPDATE_TIMEOUT_SECS";
/// Environment variable bounding signer calls during rotation, in seconds.
const ENV_SIGNER_TIMEOUT: &str = "TRUST_SIGNER_TIMEOUT_SECS";
/// Environment variable capping root versions walked in one update.
const ENV_MAX_ROOT_ROTATIONS: &str = "TRUST_MAX_ROOT_ROTATIONS";
/// Environment variable capping delegation depth.
const ENV_MAX_DELEGATION_DEPTH: &str = "TRUST_MAX_DELEGATION_DEPTH";
/// Environment variable capping the size of a single metadata document.
const ENV_MAX_DOCUMENT_BYTES: &str = "TRUST_MAX_DOCUMENT_BYTES";
/// Environment variable toggling cache restore on open.
const ENV_RESTORE_FROM_CACHE: &str = "TRUST_RESTORE_FROM_CACHE";

const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SIGNER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_ROOT_ROTATIONS: usize = 32;
const DEFAULT_MAX_DELEGATION_DEPTH: usize = 8;
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

const MAX_DELEGATION_DEPTH_CEILING: usize = 64;
const MIN_DOCUMENT_BYTES: usize = 1024;

/// Settings shared by every namespace of a [`crate::TrustEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustConfig {
    /// Deadline applied to `update` when the caller gives none.
    pub update_timeout: Duration,
    /// Deadline applied to signer round-trips while producing documents.
    pub signer_timeout: Duration,
    /// Root versions walked in one update before giving up.
    pub max_root_rotations: usize,
    pub max_delegation_depth: usize,
    pub max_document_bytes: usize,
    /// Whether `open` rebuilds state from the metadata cache.
    pub restore_from_cache: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        TrustConfig {
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            signer_timeout: DEFAULT_SIGNER_TIMEOUT,
            max_root_rotations: DEFAULT_MAX_ROOT_ROTATIONS,
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            restore_from_cache: true,
        }
    }
}

impl TrustConfig {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let defaults = TrustConfig::default();

        let secs = |key: &str, default: Duration| {
            parse_number::<u64>(map.get(key).map(String::as_str))
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| {
            parse_number::<usize>(map.get(key).map(String::as_str)).unwrap_or(default)
        };

        let config = TrustConfig {
            update_timeout: secs(ENV_UPDATE_TIMEOUT, defaults.update_timeout),
            signer_timeout: secs(ENV_SIGNER_TIMEOUT, defaults.signer_timeout),
            max_root_rotations: count(ENV_MAX_ROOT_ROTATIONS, defaults.max_root_rotations),
            max_delegation_depth: count(ENV_MAX_DELEGATION_DEPTH, defaults.max_delegation_depth),
            max_document_bytes: count(ENV_MAX_DOCUMENT_BYTES, defaults.max_document_bytes),
            restore_from_cache: parse_bool(
                map.get(ENV_RESTORE_FROM_CACHE).map(String::as_str),
                defaults.restore_from_cache,
            ),
        };
        config.sanitise()
    }

    /// Clamps out-of-range values back to something usable.
    pub fn sanitise(mut self) -> Self {
        let defaults = TrustConfig::default();
        if self.update_timeout.is_zero() {
            tracing::warn!("trust: update timeout of zero is not allowed, using default");
            self.update_timeout = defaults.update_timeout;
        }
        if self.signer_timeout.is_zero() {
            tracing::warn!("trust: signer timeout of zero is not allowed, using default");
            self.signer_timeout = defaults.signer_timeout;
        }
        if self.max_root_rotations == 0 {
            tracing::warn!("trust: max root rotations must be at least 1, using default");
            self.max_root_rotations = defaults.max_root_rotations;
        }
        if self.max_delegation_depth > MAX_DELEGATION_DEPTH_CEILING {
            tracing::warn!(
                requested = self.max_delegation_depth,
                ceiling = MAX_DELEGATION_DEPTH_CEILING,
                "trust: delegation depth clamped"
            );
            self.max_delegation_depth = MAX_DELEGATION_DEPTH_CEILING;
        }
        if self.max_document_bytes < MIN_DOCUMENT_BYTES {
            tracing::warn!(
                requested = self.max_document_bytes,
                minimum = MIN_DOCUMENT_BYTES,
                "trust: document size limit raised to minimum"
            );
            self.max_document_bytes = MIN_DOCUMENT_BYTES;
        }
        self
    }
}

/// Parses a trimmed number, ignoring blanks and garbage.
fn parse_number<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}
