// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process notification hub.
//!
//! Per-user subscriber channels fed by lifecycle events. Delivery is fire
//! and forget: a subscriber that cannot keep up or has gone away is dropped
//! on send failure, and missed notifications are not replayed.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Envelope pushed to notification subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    pub data: serde_json::Value,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Notification>,
}

#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's notifications. Returns the subscriber id for
    /// explicit unsubscribe on disconnect.
    pub fn subscribe(&self, user_id: &str) -> (u64, mpsc::Receiver<Notification>) {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .entry(user_id.to_owned())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, user_id: &str, id: u64) {
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.get_mut(user_id) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(user_id);
            }
        }
    }

    /// Emit an event to every live subscriber of a user, dropping the dead.
    pub fn notify(&self, user_id: &str, kind: &str, data: serde_json::Value) {
        let message = Notification {
            kind: kind.to_owned(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
        };
        let mut subs = self.subscribers.lock();
        let Some(list) = subs.get_mut(user_id) else {
            return;
        };
        list.retain(|s| s.tx.try_send(message.clone()).is_ok());
        if list.is_empty() {
            subs.remove(user_id);
        }
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.subscribers.lock().get(user_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
#[path = "notify_tests.rs"]
mod tests;
