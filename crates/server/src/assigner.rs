// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker assigner: consumes `task.created` and delivers or dead-letters.
//!
//! For each event the assigner consults presence, signs the envelope, and
//! pushes it through the live channel. An agent that stays unreachable
//! through the bounded retries gets the event republished to `task.dlq`,
//! with the task left `queued`. Duplicate events are harmless: only the
//! `queued → assigned` transition succeeds, so at-least-once delivery
//! cannot double-execute.
//!
//! The loop never crashes; per-event failures are logged with their
//! task/agent ids and skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::{CreatedStream, TaskAssigned, TaskCreated};
use crate::envelope;
use crate::error::ErrorKind;
use crate::outbound::OutboundEvent;
use crate::state::AppState;
use crate::store::TaskStatus;

/// Count of events dead-lettered by this instance.
pub static DLQ_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Handle one `task.created` event. Returns whether the envelope was
/// pushed to the agent.
pub async fn handle_event(state: &AppState, event: &TaskCreated) -> bool {
    let task = match state.store.get_task(&event.task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            tracing::warn!(task_id = %event.task_id, "assigner: unknown task, dropping event");
            return false;
        }
        Err(e) => {
            tracing::error!(task_id = %event.task_id, err = %e, "assigner: task lookup failed");
            return false;
        }
    };

    // Duplicate event, or the task was cancelled while queued.
    if task.status != TaskStatus::Queued {
        tracing::debug!(
            task_id = %event.task_id,
            status = %task.status,
            "assigner: task not queued, dropping event"
        );
        return false;
    }

    let attempts = state.config.assign_retries.max(1);
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(state.config.assign_retry_delay()).await;
        }

        if !state.presence.is_deliverable(&event.agent_id) {
            continue;
        }

        let frame =
            envelope::signed_exec_frame(state.active_secret(), &event.task_id, event.actions.clone());
        match state.registry.send(&event.agent_id, frame, state.config.send_deadline()).await {
            Ok(()) => {
                return finish_assignment(state, event).await;
            }
            Err(e) => {
                // Back-pressure or a dying channel: treat as offline and
                // let presence expire naturally.
                tracing::warn!(
                    task_id = %event.task_id,
                    agent_id = %event.agent_id,
                    attempt = attempt + 1,
                    err = %e,
                    "assigner: channel send failed"
                );
            }
        }
    }

    dead_letter(state, event).await;
    false
}

async fn finish_assignment(state: &AppState, event: &TaskCreated) -> bool {
    match state.store.transition_task(&event.task_id, TaskStatus::Queued, TaskStatus::Assigned) {
        Ok(()) => {}
        Err(e) if e.kind == ErrorKind::Conflict => {
            // A competing assigner won; the agent-side dedup on task_id
            // suppresses re-execution.
            tracing::debug!(task_id = %event.task_id, "assigner: lost assignment race");
            return false;
        }
        Err(e) => {
            tracing::error!(task_id = %event.task_id, err = %e, "assigner: transition failed");
            return false;
        }
    }

    let assigned = TaskAssigned {
        task_id: event.task_id.clone(),
        agent_id: event.agent_id.clone(),
        at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    if let Err(e) = state.broker.publish_assigned(&assigned).await {
        tracing::warn!(task_id = %event.task_id, err = %e, "assigner: publish task.assigned failed");
    }

    if let Ok(Some(task)) = state.store.get_task(&event.task_id) {
        state.outbound.emit(OutboundEvent::TaskUpdate {
            user_id: task.user_id,
            task_id: event.task_id.clone(),
            status: TaskStatus::Assigned.as_str().to_owned(),
            title: task.title,
        });
    }
    tracing::info!(task_id = %event.task_id, agent_id = %event.agent_id, "task assigned");
    true
}

async fn dead_letter(state: &AppState, event: &TaskCreated) {
    DLQ_TOTAL.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = state.broker.publish_dlq(event).await {
        tracing::error!(task_id = %event.task_id, err = %e, "assigner: dead-letter publish failed");
    } else {
        tracing::warn!(
            task_id = %event.task_id,
            agent_id = %event.agent_id,
            "assigner: agent unreachable, event dead-lettered"
        );
    }
}

/// Run the assigner consumer loop until shutdown.
pub async fn run(state: Arc<AppState>, mut stream: CreatedStream, shutdown: CancellationToken) {
    tracing::info!("assigner started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else { break };
                handle_event(&state, &event).await;
            }
        }
    }
    tracing::info!("assigner shutting down");
}

/// Spawn the assigner loop.
pub fn spawn_assigner(state: Arc<AppState>, stream: CreatedStream, shutdown: CancellationToken) {
    tokio::spawn(run(state, stream, shutdown));
}

#[cfg(test)]
#[path = "assigner_tests.rs"]
mod tests;
