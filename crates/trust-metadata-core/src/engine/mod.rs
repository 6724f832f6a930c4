//! Trust engine module facade.
//!
//! Re-exports the namespace-level engine API while wiring the submodules
//! that hold caller-supplied bundles and telemetry hooks.

mod bundle;
mod core;
pub(crate) mod telemetry;

pub use self::core::*;
pub use bundle::UpdateBundle;
pub use telemetry::{NoopTelemetry, TrustTelemetry};
