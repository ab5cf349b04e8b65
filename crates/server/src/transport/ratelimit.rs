// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-source-IP handshake rate limiting with cool-off blocking.
//!
//! A sliding window counts agent-channel handshakes per IP; crossing the
//! threshold blocks the IP for a cool-off period during which all
//! non-handshake HTTP requests get 429. Existing live channels are never
//! forcibly closed. A background sweep expires windows and blocks instead
//! of cleaning up inline during request handling.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub struct IpLimiter {
    windows: Mutex<HashMap<IpAddr, (u32, Instant)>>,
    blocked: Mutex<HashMap<IpAddr, Instant>>,
    max_per_window: u32,
    window: Duration,
    block_for: Duration,
}

impl IpLimiter {
    pub fn new(max_per_window: u32, window: Duration, block_for: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            max_per_window,
            window,
            block_for,
        }
    }

    /// Count a handshake from `ip`. Returns false when the IP crossed the
    /// threshold and is now blocked.
    pub fn allow_handshake(&self, ip: IpAddr) -> bool {
        if self.blocked_remaining(ip).is_some() {
            return false;
        }
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(ip).or_insert((0, now));
        if now.duration_since(entry.1) > self.window {
            *entry = (0, now);
        }
        entry.0 += 1;
        if entry.0 > self.max_per_window {
            drop(windows);
            self.blocked.lock().insert(ip, now + self.block_for);
            tracing::warn!(%ip, "handshake rate exceeded; IP blocked");
            return false;
        }
        true
    }

    /// How long a blocked IP still has to wait.
    pub fn blocked_remaining(&self, ip: IpAddr) -> Option<Duration> {
        let blocked = self.blocked.lock();
        let until = blocked.get(&ip)?;
        until.checked_duration_since(Instant::now())
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.blocked.lock().retain(|_, until| *until > now);
        self.windows
            .lock()
            .retain(|_, (_, started)| now.duration_since(*started) <= self.window * 2);
    }
}

/// Axum middleware rejecting non-handshake requests from blocked IPs.
///
/// WebSocket upgrade paths are exempt so a blocked IP cannot wedge the
/// agent channel; localhost is exempt for development.
pub async fn ip_block_layer(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();
    if ip.is_loopback() || req.uri().path().starts_with("/ws/") {
        return next.run(req).await;
    }

    if let Some(remaining) = state.limiter.blocked_remaining(ip) {
        tracing::warn!(%ip, path = %req.uri().path(), "rejecting request from blocked IP");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", remaining.as_secs().to_string())],
            "ip temporarily blocked",
        )
            .into_response();
    }

    next.run(req).await
}

/// Spawn the periodic limiter sweep.
pub fn spawn_limit_sweeper(state: Arc<AppState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => state.limiter.sweep(),
            }
        }
    });
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
