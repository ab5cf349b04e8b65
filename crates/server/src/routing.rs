// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task intake and lifecycle routing.
//!
//! Intake classifies the action list, rejects critical tasks outright,
//! parks approval-required tasks, and publishes `task.created` for the
//! rest. The API returns as soon as the task row is persisted and the
//! event published — never waits on agent reachability.
//!
//! The same module applies agent-side lifecycle frames (ack, result,
//! cancel) against the guarded state machine. First terminal result wins;
//! later duplicates fall out as conflicts and are dropped.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::broker::TaskCreated;
use crate::error::{ApiError, ErrorKind};
use crate::outbound::OutboundEvent;
use crate::risk;
use crate::state::AppState;
use crate::store::users::User;
use crate::store::{IdempotencyOutcome, TaskPayload, TaskRow, TaskStatus};
use crate::wire::{Action, ActionResult, ResultStatus, ServerFrame};

pub const TASKS_ENDPOINT: &str = "/tasks";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub agent_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub actions: Vec<Action>,
}

/// Create a task for an owned agent, honoring an idempotency key.
pub async fn create_task(
    state: &AppState,
    user: &User,
    req: CreateTaskRequest,
    idempotency_key: Option<&str>,
) -> Result<TaskRow, ApiError> {
    if req.actions.is_empty() {
        return Err(ApiError::validation("actions must not be empty"));
    }

    state
        .store
        .get_agent_owned(&req.agent_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;

    let body_hash = request_hash(&req);

    // Replay of a completed request short-circuits before classification.
    if let Some(key) = idempotency_key {
        match state.store.find_idempotent(&user.id, TASKS_ENDPOINT, key, &body_hash)? {
            Some(IdempotencyOutcome::Existing(task_id)) => {
                return state
                    .store
                    .get_task(&task_id)?
                    .ok_or_else(|| ApiError::internal("idempotent task vanished"));
            }
            Some(IdempotencyOutcome::BodyMismatch) => {
                return Err(ApiError::conflict("idempotency key reused with different body"));
            }
            _ => {}
        }
    }

    let analysis = state.risk.classify(&req.actions);
    if risk::should_block(analysis.level) {
        tracing::warn!(
            user_id = %user.id,
            agent_id = %req.agent_id,
            reasons = ?analysis.reasons,
            "blocking critical task"
        );
        return Err(ApiError::forbidden(format!(
            "critical risk: {}",
            analysis.reasons.join("; ")
        )));
    }

    let task_id = uuid::Uuid::new_v4().to_string();

    // Claim before insert so concurrent identical requests collapse to one
    // task row; the loser reads the winner's resource id.
    if let Some(key) = idempotency_key {
        match state.store.claim_idempotency(
            &user.id,
            TASKS_ENDPOINT,
            key,
            "task",
            &task_id,
            &body_hash,
        )? {
            IdempotencyOutcome::Claimed => {}
            IdempotencyOutcome::Existing(existing) => {
                return match state.store.get_task(&existing)? {
                    Some(task) => Ok(task),
                    // The winner claimed the key but has not inserted yet.
                    None => Err(ApiError::conflict("identical request in flight, retry")),
                };
            }
            IdempotencyOutcome::BodyMismatch => {
                return Err(ApiError::conflict("idempotency key reused with different body"));
            }
        }
    }

    let needs_approval = analysis.requires_approval;
    let title = req.title.clone().unwrap_or_else(|| "Task".to_owned());
    let description = req.description.clone().unwrap_or_default();
    let payload = TaskPayload {
        actions: req.actions,
        risk_analysis: analysis,
        scheduled_task_id: None,
        results: None,
    };

    let task = state.store.insert_task(
        &task_id,
        &user.id,
        &req.agent_id,
        &title,
        &description,
        &payload,
        TaskStatus::Created,
    )?;

    if needs_approval {
        state.store.transition_task(&task.id, TaskStatus::Created, TaskStatus::AwaitingConfirmation)?;
        state.outbound.emit(OutboundEvent::ApprovalNeeded {
            user_id: user.id.clone(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            risk_reasons: task.payload.risk_analysis.reasons.clone(),
        });
        tracing::info!(task_id = %task.id, user_id = %user.id, "task parked for approval");
    } else {
        state.store.transition_task(&task.id, TaskStatus::Created, TaskStatus::Queued)?;
        publish_created(state, &task).await;
        tracing::info!(task_id = %task.id, agent_id = %task.agent_id, "task queued");
    }

    state
        .store
        .get_task(&task.id)?
        .ok_or_else(|| ApiError::internal("task vanished after insert"))
}

/// Publish `task.created` for a queued task. Publish failures are logged
/// and never fail the caller; the task stays `queued` for re-drive.
pub async fn publish_created(state: &AppState, task: &TaskRow) {
    let event = TaskCreated {
        task_id: task.id.clone(),
        agent_id: task.agent_id.clone(),
        actions: task.payload.actions.clone(),
    };
    if let Err(e) = state.broker.publish_created(&event).await {
        tracing::error!(task_id = %task.id, err = %e, "failed to publish task.created");
    }
}

fn request_hash(req: &CreateTaskRequest) -> String {
    let value = serde_json::to_value(req).unwrap_or_default();
    let canonical = crate::envelope::canonical_json(&value);
    Sha256::digest(canonical.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

// -- Agent-side lifecycle ------------------------------------------------------

/// Agent acknowledged a task: `assigned → in_progress`.
pub fn apply_ack(state: &AppState, agent_id: &str, task_id: &str) -> Result<(), ApiError> {
    let task = state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    if task.agent_id != agent_id {
        return Err(ApiError::forbidden("task belongs to another agent"));
    }
    state.store.transition_task(task_id, TaskStatus::Assigned, TaskStatus::InProgress)
}

/// Apply a terminal `task.result` frame.
///
/// The signature is verified over the frame minus its `signature` field
/// under the active agent key. A result for a cancelled task is recorded
/// but does not transition; a duplicate terminal result conflicts and is
/// dropped by the caller.
pub fn apply_result(
    state: &AppState,
    agent_id: &str,
    task_id: &str,
    results: &[ActionResult],
    raw_frame: &serde_json::Value,
    signature: &str,
) -> Result<(), ApiError> {
    if !crate::envelope::verify(state.active_secret(), raw_frame, signature) {
        return Err(ApiError::unauthenticated("result signature verification failed"));
    }

    let task = state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    if task.agent_id != agent_id {
        return Err(ApiError::forbidden("task belongs to another agent"));
    }

    if task.status == TaskStatus::Cancelled {
        // Late result from an agent that never saw the cancel frame.
        state.store.record_task_results(task_id, results)?;
        tracing::debug!(task_id, "recorded result for cancelled task");
        return Ok(());
    }

    // Agent may skip the ack under load; catch the state machine up.
    if task.status == TaskStatus::Assigned {
        state.store.transition_task(task_id, TaskStatus::Assigned, TaskStatus::InProgress)?;
    }

    let failed = results.iter().any(|r| r.status == ResultStatus::Error);
    let terminal = if failed { TaskStatus::Failed } else { TaskStatus::Completed };
    state.store.transition_task(task_id, TaskStatus::InProgress, terminal)?;
    state.store.record_task_results(task_id, results)?;

    state.outbound.emit(OutboundEvent::TaskUpdate {
        user_id: task.user_id.clone(),
        task_id: task_id.to_owned(),
        status: terminal.as_str().to_owned(),
        title: task.title.clone(),
    });
    tracing::info!(task_id, agent_id, status = %terminal, "task finished");
    Ok(())
}

/// Owner/admin cancel. Emits a `task.cancel` frame when the task was
/// already in flight.
pub async fn cancel_task(state: &AppState, user: &User, task_id: &str) -> Result<TaskRow, ApiError> {
    let task = state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    if task.user_id != user.id && !user.is_admin {
        return Err(ApiError::forbidden("not the task owner"));
    }

    let was = state.store.cancel_task(task_id)?;

    if matches!(was, TaskStatus::Assigned | TaskStatus::InProgress) {
        let frame = ServerFrame::TaskCancel { task_id: task_id.to_owned() };
        if let Err(e) =
            state.registry.send(&task.agent_id, frame, state.config.send_deadline()).await
        {
            tracing::debug!(task_id, agent_id = %task.agent_id, err = %e, "cancel frame not delivered");
        }
    }

    state.outbound.emit(OutboundEvent::TaskUpdate {
        user_id: task.user_id.clone(),
        task_id: task_id.to_owned(),
        status: TaskStatus::Cancelled.as_str().to_owned(),
        title: task.title.clone(),
    });

    state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::internal("task vanished after cancel"))
}

/// Whether an error from `apply_result` means a harmless duplicate.
pub fn is_duplicate_result(err: &ApiError) -> bool {
    err.kind == ErrorKind::Conflict
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
