// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Artifact upload presigning.
//!
//! Storage itself is an external collaborator; only the presign contract
//! lives here. When an S3-compatible endpoint is configured, URLs point at
//! `{endpoint}/{bucket}/{task_id}/{filename}`; otherwise a locally signed
//! upload URL stands in so agents always have somewhere to PUT artifacts.

use chrono::{Duration, SecondsFormat, Utc};
use ring::hmac;
use serde::Serialize;

use crate::config::ServerConfig;

const UPLOAD_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUpload {
    pub url: String,
    pub method: String,
    pub expires_at: String,
}

pub struct Presigner {
    endpoint: Option<String>,
    bucket: Option<String>,
    signing_key: String,
}

impl Presigner {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            endpoint: config.artifacts_endpoint.clone(),
            bucket: config.artifacts_bucket.clone(),
            signing_key: config
                .artifacts_secret_key
                .clone()
                .unwrap_or_else(|| config.access_secret.clone()),
        }
    }

    /// Presign a PUT for one artifact of a task.
    pub fn presign_upload(&self, task_id: &str, filename: &str) -> PresignedUpload {
        let expires = Utc::now() + Duration::minutes(UPLOAD_TTL_MINUTES);
        let expires_ts = expires.timestamp();

        let base = match (&self.endpoint, &self.bucket) {
            (Some(endpoint), Some(bucket)) => {
                format!("{}/{bucket}", endpoint.trim_end_matches('/'))
            }
            _ => "/artifacts/upload".to_owned(),
        };
        let path = format!("{base}/{task_id}/{filename}");

        let key = hmac::Key::new(hmac::HMAC_SHA256, self.signing_key.as_bytes());
        let tag = hmac::sign(&key, format!("PUT\n{path}\n{expires_ts}").as_bytes());
        let sig: String = tag.as_ref().iter().map(|b| format!("{b:02x}")).collect();

        PresignedUpload {
            url: format!("{path}?expires={expires_ts}&signature={sig}"),
            method: "PUT".to_owned(),
            expires_at: expires.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Verify a locally signed upload URL (stub-store mode).
    pub fn verify_upload(&self, path: &str, expires_ts: i64, signature: &str) -> bool {
        if expires_ts < Utc::now().timestamp() {
            return false;
        }
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.signing_key.as_bytes());
        let tag = hmac::sign(&key, format!("PUT\n{path}\n{expires_ts}").as_bytes());
        let expected: String = tag.as_ref().iter().map(|b| format!("{b:02x}")).collect();
        crate::envelope::constant_time_eq(&expected, signature)
    }
}

#[cfg(test)]
#[path = "artifacts_tests.rs"]
mod tests;
