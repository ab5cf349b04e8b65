// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound fan-out of lifecycle events.
//!
//! Task intake, the assigner, the scheduler, and the agent channel emit
//! [`OutboundEvent`]s here and know nothing about notification channels or
//! webhook subscriptions. Notifications go to live in-process subscribers;
//! selected events additionally fan out to the owner's webhooks, detached
//! from the caller.

use std::sync::Arc;

use crate::notify::Notifier;
use crate::store::Store;
use crate::webhook::{spawn_fanout, WebhookSender};

/// Lifecycle events leaving the core.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    /// Task status changed (approved, rejected, completed, ...).
    TaskUpdate { user_id: String, task_id: String, status: String, title: String },
    /// A task is held for approval.
    ApprovalNeeded { user_id: String, task_id: String, title: String, risk_reasons: Vec<String> },
    /// An agent came online or went offline/stale.
    DeviceStatus { user_id: String, agent_id: String, name: String, status: String },
    /// A scheduled definition was skipped by the risk gate.
    ScheduledTaskBlocked {
        user_id: String,
        scheduled_task_id: String,
        name: String,
        risk_level: String,
        reasons: Vec<String>,
    },
    /// A scheduled definition minted a task.
    ScheduledTaskExecuted {
        user_id: String,
        scheduled_task_id: String,
        task_id: String,
        name: String,
    },
}

pub struct Outbound {
    notifier: Arc<Notifier>,
    webhooks: Arc<WebhookSender>,
    store: Arc<Store>,
}

impl Outbound {
    pub fn new(notifier: Arc<Notifier>, webhooks: Arc<WebhookSender>, store: Arc<Store>) -> Self {
        Self { notifier, webhooks, store }
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Dispatch an event. Never blocks and never fails; webhook delivery
    /// runs on detached tasks.
    pub fn emit(&self, event: OutboundEvent) {
        match event {
            OutboundEvent::TaskUpdate { user_id, task_id, status, title } => {
                self.notifier.notify(
                    &user_id,
                    "task_update",
                    serde_json::json!({ "task_id": task_id, "status": status, "title": title }),
                );
                let webhook_event = match status.as_str() {
                    "completed" => Some("task.completed"),
                    "failed" => Some("task.failed"),
                    _ => None,
                };
                if let Some(webhook_event) = webhook_event {
                    spawn_fanout(
                        Arc::clone(&self.webhooks),
                        Arc::clone(&self.store),
                        &user_id,
                        webhook_event,
                        serde_json::json!({ "task_id": task_id, "status": status, "title": title }),
                    );
                }
            }
            OutboundEvent::ApprovalNeeded { user_id, task_id, title, risk_reasons } => {
                self.notifier.notify(
                    &user_id,
                    "approval_needed",
                    serde_json::json!({
                        "task_id": task_id,
                        "title": title,
                        "risk_reasons": risk_reasons,
                    }),
                );
            }
            OutboundEvent::DeviceStatus { user_id, agent_id, name, status } => {
                self.notifier.notify(
                    &user_id,
                    "device_status",
                    serde_json::json!({
                        "device_id": agent_id,
                        "device_name": name,
                        "status": status,
                    }),
                );
                let webhook_event = match status.as_str() {
                    "online" => Some("device.online"),
                    "offline" => Some("device.offline"),
                    _ => None,
                };
                if let Some(webhook_event) = webhook_event {
                    spawn_fanout(
                        Arc::clone(&self.webhooks),
                        Arc::clone(&self.store),
                        &user_id,
                        webhook_event,
                        serde_json::json!({ "device_id": agent_id, "device_name": name }),
                    );
                }
            }
            OutboundEvent::ScheduledTaskBlocked {
                user_id,
                scheduled_task_id,
                name,
                risk_level,
                reasons,
            } => {
                self.notifier.notify(
                    &user_id,
                    "scheduled_task_blocked",
                    serde_json::json!({
                        "scheduled_task_id": scheduled_task_id,
                        "name": name,
                        "risk_level": risk_level,
                        "reasons": reasons,
                    }),
                );
            }
            OutboundEvent::ScheduledTaskExecuted { user_id, scheduled_task_id, task_id, name } => {
                self.notifier.notify(
                    &user_id,
                    "scheduled_task_executed",
                    serde_json::json!({
                        "scheduled_task_id": scheduled_task_id,
                        "task_id": task_id,
                        "name": name,
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "outbound_tests.rs"]
mod tests;
