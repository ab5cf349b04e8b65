// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task envelope signing and verification.
//!
//! Every server→agent `task.exec` frame and every agent→server
//! `task.result` frame carries an HMAC-SHA256 signature over the canonical
//! JSON of the frame minus its `signature` field, keyed by the active agent
//! key. Canonical JSON: recursively sorted object keys, no extraneous
//! whitespace.

use chrono::{SecondsFormat, Utc};
use ring::hmac;
use serde_json::Value;

use crate::wire::{Action, ServerFrame};

/// Serialize a JSON value with object keys sorted recursively and compact
/// separators, so both sides of the channel sign identical bytes.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
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
        other => out.push_str(&other.to_string()),
    }
}

/// HMAC-SHA256 over the canonical form of `payload`, hex-encoded.
pub fn sign(secret: &str, payload: &Value) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, canonical_json(payload).as_bytes());
    hex_encode(tag.as_ref())
}

/// Verify a detached signature against a payload (minus any `signature` key).
pub fn verify(secret: &str, payload: &Value, signature: &str) -> bool {
    let mut unsigned = payload.clone();
    if let Some(map) = unsigned.as_object_mut() {
        map.remove("signature");
    }
    constant_time_eq(&sign(secret, &unsigned), signature)
}

/// Build a signed `task.exec` frame for an agent.
pub fn signed_exec_frame(secret: &str, task_id: &str, actions: Vec<Action>) -> ServerFrame {
    let issued_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let unsigned = serde_json::json!({
        "type": "task.exec",
        "task_id": task_id,
        "issued_at": issued_at,
        "actions": actions,
    });
    let signature = sign(secret, &unsigned);
    ServerFrame::TaskExec { task_id: task_id.to_owned(), issued_at, actions, signature }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
