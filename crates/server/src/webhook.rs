// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound webhook delivery.
//!
//! At-least-once: each delivery POSTs the canonical payload with an HMAC
//! signature header, retries on non-2xx or transport errors with
//! exponential back-off (1 s, 2 s, 4 s), and is dropped with a log line
//! after the final failure. Deliveries run detached from the triggering
//! request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::envelope;
use crate::store::webhooks::WebhookRow;
use crate::store::Store;

/// Initial attempt plus three retries.
const MAX_ATTEMPTS: u32 = 4;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookSender {
    http: reqwest::Client,
}

impl WebhookSender {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("drover-webhooks")
            .build()?;
        Ok(Self { http })
    }

    /// Build the canonical wire body for an event.
    pub fn body(event: &str, data: &Value) -> String {
        let payload = serde_json::json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "data": data,
        });
        envelope::canonical_json(&payload)
    }

    /// `X-Webhook-Signature` value for a body under a subscription secret.
    pub fn signature(secret: &str, body: &str) -> String {
        use ring::hmac;
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let tag = hmac::sign(&key, body.as_bytes());
        let hex: String = tag.as_ref().iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256={hex}")
    }

    /// Deliver one event to one subscription, with retries.
    pub async fn deliver(&self, hook: &WebhookRow, event: &str, data: &Value) {
        let body = Self::body(event, data);

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            let mut req = self
                .http
                .post(&hook.url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if !hook.secret.is_empty() {
                req = req.header("X-Webhook-Signature", Self::signature(&hook.secret, &body));
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(webhook = %hook.id, url = %hook.url, event, "webhook delivered");
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(
                        webhook = %hook.id,
                        url = %hook.url,
                        status = %resp.status(),
                        attempt = attempt + 1,
                        "webhook delivery rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        webhook = %hook.id,
                        url = %hook.url,
                        err = %e,
                        attempt = attempt + 1,
                        "webhook delivery failed"
                    );
                }
            }
        }

        tracing::error!(webhook = %hook.id, url = %hook.url, event, "webhook dropped after {MAX_ATTEMPTS} attempts");
    }
}

/// Fan an event out to a user's active, matching subscriptions, detached.
pub fn spawn_fanout(
    sender: Arc<WebhookSender>,
    store: Arc<Store>,
    user_id: &str,
    event: &str,
    data: Value,
) {
    let user_id = user_id.to_owned();
    let event = event.to_owned();
    tokio::spawn(async move {
        let hooks = match store.active_webhooks(&user_id) {
            Ok(hooks) => hooks,
            Err(e) => {
                tracing::error!(user_id, err = %e, "webhook lookup failed");
                return;
            }
        };
        for hook in hooks.into_iter().filter(|h| h.wants(&event)) {
            let sender = Arc::clone(&sender);
            let event = event.clone();
            let data = data.clone();
            tokio::spawn(async move {
                sender.deliver(&hook, &event, &data).await;
            });
        }
    });
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
