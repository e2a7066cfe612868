//! Canonical JSON encoding for per-file metadata blobs.
//!
//! spec.md §9 leaves the canonicalization rule unspecified ("implementations
//! must pick one and document it"). This crate's rule: re-key every object
//! level through a `BTreeMap` (lexicographic key order) and serialize with
//! `serde_json`'s compact writer (no insignificant whitespace). Array order
//! and number formatting are left exactly as `serde_json::Value` produces
//! them — only object key order is normalized.

use serde_json::Value;

use crate::error::{DesError, DesResult};

/// Canonicalize `value` in place: sort object keys at every nesting level.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k, canonicalize(v));
            }
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Encode `meta` as canonical, compact JSON bytes.
pub fn encode(meta: &Value) -> DesResult<Vec<u8>> {
    let canon = canonicalize(meta.clone());
    serde_json::to_vec(&canon).map_err(|e| DesError::ConfigError(format!("meta serialization failed: {e}")))
}

/// Decode a meta blob back into a `Value`. Does not re-canonicalize — the
/// bytes on disk are already canonical by construction.
pub fn decode(bytes: &[u8]) -> DesResult<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| DesError::CorruptContainer(format!("meta blob is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_at_every_level() {
        let value = json!({"b": 1, "a": {"z": 1, "y": 2}});
        let encoded = encode(&value).unwrap();
        assert_eq!(encoded, br#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn round_trips() {
        let value = json!({"mime": "text/plain", "size": 5});
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }
}
