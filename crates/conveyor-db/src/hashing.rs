// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity hashing for resource configs, caches, and lock names.
//!
//! All identity digests are computed over a canonical JSON rendering in
//! which object keys are sorted at every level, so two semantically equal
//! maps always hash to the same value regardless of insertion order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value canonically: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key strings never fail to serialize.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Digest of a canonicalized source config.
pub fn source_hash(source: &Value) -> String {
    sha256_hex(canonical_json(source).as_bytes())
}

/// Digest of fetch params. A missing map hashes identically to an empty
/// map, so omitting `params` does not produce a distinct cache key.
pub fn params_hash(params: Option<&Value>) -> String {
    match params {
        Some(value) => sha256_hex(canonical_json(value).as_bytes()),
        None => sha256_hex(canonical_json(&Value::Object(Default::default())).as_bytes()),
    }
}

/// Derive an advisory lock name from an identity spec.
pub fn lock_name(spec: &Value) -> String {
    sha256_hex(canonical_json(spec).as_bytes())
}

/// Project a lock name onto the 64-bit keyspace of the database's advisory
/// locks, taking the first eight digest bytes big-endian.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
