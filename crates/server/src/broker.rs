// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker topics for task lifecycle events.
//!
//! NATS when configured, otherwise an in-process queue with the same
//! topics and delivery semantics (at-least-once, per-agent FIFO). Subjects
//! are keyed by agent id — `{prefix}.task.created.{agent_id}` — so
//! per-agent ordering holds when multiple assigner instances each own a
//! partition. The in-process queue is a single FIFO, which is trivially
//! ordered.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::wire::Action;

pub const TOPIC_TASK_CREATED: &str = "task.created";
pub const TOPIC_TASK_ASSIGNED: &str = "task.assigned";
pub const TOPIC_TASK_DLQ: &str = "task.dlq";

/// Payload on `task.created` (and, unchanged, on `task.dlq`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub agent_id: String,
    pub actions: Vec<Action>,
}

/// Payload on `task.assigned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub task_id: String,
    pub agent_id: String,
    pub at: String,
}

/// Broker handle shared across producers.
pub enum Broker {
    Nats {
        client: async_nats::Client,
        prefix: String,
    },
    Local {
        created_tx: mpsc::Sender<TaskCreated>,
        assigned_tx: broadcast::Sender<TaskAssigned>,
        dlq_tx: broadcast::Sender<TaskCreated>,
        dlq_count: AtomicU64,
    },
}

/// Consumer side of `task.created`, owned by the assigner loop.
pub enum CreatedStream {
    Nats(async_nats::Subscriber),
    Local(mpsc::Receiver<TaskCreated>),
}

impl Broker {
    /// Connect to NATS and subscribe the assigner queue group, or fall back
    /// to the in-process queue when no URL is configured.
    pub async fn connect(
        nats_url: Option<&str>,
        nats_token: Option<&str>,
        prefix: &str,
    ) -> anyhow::Result<(Self, CreatedStream)> {
        match nats_url {
            Some(url) => {
                let mut opts = async_nats::ConnectOptions::new();
                if let Some(token) = nats_token {
                    opts = opts.token(token.to_owned());
                }
                opts = opts.retry_on_initial_connect();

                tracing::info!(url, prefix, "connecting broker");
                let client = opts.connect(url).await?;
                tracing::info!("broker connected");

                let subject = format!("{prefix}.{TOPIC_TASK_CREATED}.>");
                let sub = client.queue_subscribe(subject, "assigner".to_owned()).await?;
                Ok((Self::Nats { client, prefix: prefix.to_owned() }, CreatedStream::Nats(sub)))
            }
            None => {
                tracing::info!("no broker configured; using in-process queue");
                let (created_tx, created_rx) = mpsc::channel(256);
                let (assigned_tx, _) = broadcast::channel(256);
                let (dlq_tx, _) = broadcast::channel(256);
                Ok((
                    Self::Local { created_tx, assigned_tx, dlq_tx, dlq_count: AtomicU64::new(0) },
                    CreatedStream::Local(created_rx),
                ))
            }
        }
    }

    pub async fn publish_created(&self, event: &TaskCreated) -> anyhow::Result<()> {
        match self {
            Self::Nats { client, prefix } => {
                let subject = format!("{prefix}.{TOPIC_TASK_CREATED}.{}", event.agent_id);
                client.publish(subject, serde_json::to_vec(event)?.into()).await?;
                Ok(())
            }
            Self::Local { created_tx, .. } => {
                created_tx
                    .send(event.clone())
                    .await
                    .map_err(|_| anyhow::anyhow!("assigner queue closed"))?;
                Ok(())
            }
        }
    }

    pub async fn publish_assigned(&self, event: &TaskAssigned) -> anyhow::Result<()> {
        match self {
            Self::Nats { client, prefix } => {
                let subject = format!("{prefix}.{TOPIC_TASK_ASSIGNED}.{}", event.agent_id);
                client.publish(subject, serde_json::to_vec(event)?.into()).await?;
                Ok(())
            }
            Self::Local { assigned_tx, .. } => {
                let _ = assigned_tx.send(event.clone());
                Ok(())
            }
        }
    }

    /// Dead-letter an undeliverable `task.created` event, unchanged.
    pub async fn publish_dlq(&self, event: &TaskCreated) -> anyhow::Result<()> {
        match self {
            Self::Nats { client, prefix } => {
                let subject = format!("{prefix}.{TOPIC_TASK_DLQ}.{}", event.agent_id);
                client.publish(subject, serde_json::to_vec(event)?.into()).await?;
                Ok(())
            }
            Self::Local { dlq_tx, dlq_count, .. } => {
                dlq_count.fetch_add(1, Ordering::Relaxed);
                let _ = dlq_tx.send(event.clone());
                Ok(())
            }
        }
    }

    /// Observe dead-letters (in-process mode only).
    pub fn subscribe_dlq(&self) -> Option<broadcast::Receiver<TaskCreated>> {
        match self {
            Self::Nats { .. } => None,
            Self::Local { dlq_tx, .. } => Some(dlq_tx.subscribe()),
        }
    }

    /// Observe assignments (in-process mode only).
    pub fn subscribe_assigned(&self) -> Option<broadcast::Receiver<TaskAssigned>> {
        match self {
            Self::Nats { .. } => None,
            Self::Local { assigned_tx, .. } => Some(assigned_tx.subscribe()),
        }
    }

    pub fn dlq_total(&self) -> u64 {
        match self {
            Self::Nats { .. } => 0,
            Self::Local { dlq_count, .. } => dlq_count.load(Ordering::Relaxed),
        }
    }
}

impl CreatedStream {
    /// Next `task.created` event. Malformed broker payloads are logged and
    /// skipped; `None` means the stream closed.
    pub async fn next(&mut self) -> Option<TaskCreated> {
        match self {
            Self::Local(rx) => rx.recv().await,
            Self::Nats(sub) => loop {
                let msg = sub.next().await?;
                match serde_json::from_slice::<TaskCreated>(&msg.payload) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        tracing::warn!(subject = %msg.subject, err = %e, "discarding malformed task.created event");
                    }
                }
            },
        }
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
