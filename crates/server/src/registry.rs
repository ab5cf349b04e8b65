// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live agent connection registry.
//!
//! Maps agent_id → the single live channel writer for that agent. A fresh
//! registration supersedes any prior channel (closed with code 4000), so
//! two agent processes racing for the same identity cannot split-brain.
//! Removal is compare-and-remove on the connection id: a stale teardown
//! never deletes a freshly replaced entry.
//!
//! The mutex guards only O(1) map operations; sends happen outside it
//! through cloned senders. The registry does not probe liveness — a failed
//! send is the caller's signal to schedule a removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::wire::{ServerFrame, CLOSE_SUPERSEDED};

/// Message pushed through a registered channel to its writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMsg {
    Frame(ServerFrame),
    Close { code: u16, reason: &'static str },
}

/// A registered channel writer.
#[derive(Debug, Clone)]
pub struct AgentChannel {
    pub conn_id: u64,
    pub tx: mpsc::Sender<ChannelMsg>,
}

/// Why a send into an agent channel failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NotConnected,
    Timeout,
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => f.write_str("agent not connected"),
            Self::Timeout => f.write_str("send deadline exceeded"),
            Self::Closed => f.write_str("channel closed"),
        }
    }
}

impl std::error::Error for SendError {}

#[derive(Default)]
pub struct Registry {
    channels: Mutex<HashMap<String, AgentChannel>>,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel writer for an agent, superseding any prior one.
    /// Returns the connection id the caller must present on removal.
    pub fn register(&self, agent_id: &str, tx: mpsc::Sender<ChannelMsg>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let prior = {
            let mut channels = self.channels.lock();
            channels.insert(agent_id.to_owned(), AgentChannel { conn_id, tx })
        };
        if let Some(old) = prior {
            tracing::info!(agent_id, old_conn = old.conn_id, new_conn = conn_id, "superseding agent connection");
            let _ = old
                .tx
                .try_send(ChannelMsg::Close { code: CLOSE_SUPERSEDED, reason: "superseded" });
        }
        conn_id
    }

    /// Remove the agent's entry only if it is still the given connection.
    /// Returns whether anything was removed.
    pub fn remove(&self, agent_id: &str, conn_id: u64) -> bool {
        let mut channels = self.channels.lock();
        if channels.get(agent_id).is_some_and(|c| c.conn_id == conn_id) {
            channels.remove(agent_id);
            return true;
        }
        false
    }

    pub fn lookup(&self, agent_id: &str) -> Option<AgentChannel> {
        self.channels.lock().get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Push a frame into an agent's channel with a bounded deadline.
    /// The lock is not held across the send.
    pub async fn send(
        &self,
        agent_id: &str,
        frame: ServerFrame,
        deadline: Duration,
    ) -> Result<(), SendError> {
        let channel = self.lookup(agent_id).ok_or(SendError::NotConnected)?;
        match channel.tx.send_timeout(ChannelMsg::Frame(frame), deadline).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SendError::Timeout),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SendError::Closed),
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
