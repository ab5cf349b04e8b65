// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Volatile presence and token-liveness store.
//!
//! Single source of truth for "is agent X deliverable right now". Two
//! complementary representations are kept: an online set updated on
//! connect/disconnect, and a per-agent metadata entry with a TTL refreshed
//! by heartbeats. Either surviving is enough for routing.
//!
//! The same store carries the volatile auth state the relational store
//! should not: active/revoked agent-token jtis, login failure counters,
//! account locks, and login rate windows. Updates are idempotent,
//! last-write-wins. A background sweep expires dead entries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Connection status kept per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Stale,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Stale => "stale",
            Self::Offline => "offline",
        }
    }
}

/// Serializable presence snapshot for device listings.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceSnapshot {
    pub status: PresenceStatus,
    pub capabilities: serde_json::Map<String, serde_json::Value>,
    pub last_heartbeat: DateTime<Utc>,
}

struct AgentEntry {
    status: PresenceStatus,
    capabilities: serde_json::Map<String, serde_json::Value>,
    last_heartbeat: DateTime<Utc>,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    online: HashSet<String>,
    agents: HashMap<String, AgentEntry>,
    active_jti: HashMap<String, HashSet<String>>,
    revoked_jti: HashSet<String>,
    login_windows: HashMap<String, (u32, Instant)>,
    login_failures: HashMap<String, u32>,
    locks: HashMap<String, Instant>,
}

/// In-process presence store.
pub struct Presence {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl Presence {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Mutex::new(Inner::default()), ttl }
    }

    // -- Liveness -------------------------------------------------------------

    /// Mark an agent online. Called on channel handshake.
    pub fn mark_online(
        &self,
        agent_id: &str,
        capabilities: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut inner = self.inner.lock();
        inner.online.insert(agent_id.to_owned());
        inner.agents.insert(
            agent_id.to_owned(),
            AgentEntry {
                status: PresenceStatus::Online,
                capabilities,
                last_heartbeat: Utc::now(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Refresh the TTL on heartbeat; re-promotes a stale agent.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        capabilities: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut inner = self.inner.lock();
        inner.online.insert(agent_id.to_owned());
        let entry = inner.agents.entry(agent_id.to_owned()).or_insert_with(|| AgentEntry {
            status: PresenceStatus::Online,
            capabilities: serde_json::Map::new(),
            last_heartbeat: Utc::now(),
            expires_at: Instant::now() + self.ttl,
        });
        entry.status = PresenceStatus::Online;
        if !capabilities.is_empty() {
            entry.capabilities = capabilities;
        }
        entry.last_heartbeat = Utc::now();
        entry.expires_at = Instant::now() + self.ttl;
    }

    /// Demote an agent that missed consecutive heartbeats. TTL expiry will
    /// finish the job if it never recovers.
    pub fn mark_stale(&self, agent_id: &str) {
        let mut inner = self.inner.lock();
        inner.online.remove(agent_id);
        if let Some(entry) = inner.agents.get_mut(agent_id) {
            entry.status = PresenceStatus::Stale;
        }
    }

    /// Mark an agent offline. Called on channel teardown.
    pub fn mark_offline(&self, agent_id: &str) {
        let mut inner = self.inner.lock();
        inner.online.remove(agent_id);
        inner.agents.remove(agent_id);
    }

    /// Routing query: set membership OR an unexpired online metadata entry.
    pub fn is_deliverable(&self, agent_id: &str) -> bool {
        let inner = self.inner.lock();
        if inner.online.contains(agent_id) {
            return true;
        }
        inner
            .agents
            .get(agent_id)
            .is_some_and(|e| e.status == PresenceStatus::Online && e.expires_at > Instant::now())
    }

    /// Presence snapshot for device listings, if any entry survives.
    pub fn snapshot(&self, agent_id: &str) -> Option<PresenceSnapshot> {
        let inner = self.inner.lock();
        inner.agents.get(agent_id).map(|e| PresenceSnapshot {
            status: if e.expires_at > Instant::now() { e.status } else { PresenceStatus::Offline },
            capabilities: e.capabilities.clone(),
            last_heartbeat: e.last_heartbeat,
        })
    }

    // -- Agent token liveness -------------------------------------------------

    pub fn store_active_jti(&self, agent_id: &str, jti: &str) {
        let mut inner = self.inner.lock();
        inner.active_jti.entry(agent_id.to_owned()).or_default().insert(jti.to_owned());
    }

    pub fn is_jti_revoked(&self, jti: &str) -> bool {
        self.inner.lock().revoked_jti.contains(jti)
    }

    /// Revoke every active token for an agent. Returns how many were revoked.
    pub fn revoke_all_tokens(&self, agent_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(jtis) = inner.active_jti.remove(agent_id) else {
            return 0;
        };
        let count = jtis.len();
        inner.revoked_jti.extend(jtis);
        count
    }

    // -- Login limits / lockout -----------------------------------------------

    /// Sliding one-minute window per key (IP or email). Returns false when
    /// the caller exceeded `per_minute` attempts.
    pub fn login_allowed(&self, key: &str, per_minute: u32) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let window = inner.login_windows.entry(key.to_owned()).or_insert((0, now));
        if now.duration_since(window.1) > Duration::from_secs(60) {
            *window = (0, now);
        }
        window.0 += 1;
        window.0 <= per_minute
    }

    pub fn is_locked(&self, email: &str) -> bool {
        let inner = self.inner.lock();
        inner.locks.get(email).is_some_and(|until| *until > Instant::now())
    }

    /// Count a failed login. Returns true when the failure crossed the
    /// lockout threshold and the account is now locked.
    pub fn record_login_failure(&self, email: &str, threshold: u32, lock_for: Duration) -> bool {
        let mut inner = self.inner.lock();
        let failures = inner.login_failures.entry(email.to_owned()).or_insert(0);
        *failures += 1;
        if *failures >= threshold {
            let locked = *failures;
            inner.locks.insert(email.to_owned(), Instant::now() + lock_for);
            tracing::warn!(email, failures = locked, "account locked after repeated failures");
            return true;
        }
        false
    }

    pub fn clear_login_failures(&self, email: &str) {
        let mut inner = self.inner.lock();
        inner.login_failures.remove(email);
    }

    // -- Expiry ---------------------------------------------------------------

    /// Drop expired metadata entries, locks, and rate windows.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .agents
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in expired {
            inner.agents.remove(&agent_id);
            inner.online.remove(&agent_id);
        }
        inner.locks.retain(|_, until| *until > now);
        inner
            .login_windows
            .retain(|_, (_, started)| now.duration_since(*started) <= Duration::from_secs(120));
    }
}

/// Spawn the periodic presence sweeper.
pub fn spawn_sweeper(presence: Arc<Presence>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => presence.sweep(),
            }
        }
        tracing::debug!("presence sweeper shutting down");
    });
}

#[cfg(test)]
#[path = "presence_tests.rs"]
mod tests;
