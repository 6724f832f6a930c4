//! Canonical JSON encoding used for signing and descriptor hashing.

use olpc_cjson::CanonicalFormatter;
use serde::Serialize;

use crate::error::{Result, TrustError};

/// Serialises `value` into canonical JSON (sorted keys, no insignificant whitespace).
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .map_err(|err| TrustError::Encoding(format!("canonical json: {err}")))?;
    Ok(buf)
}
