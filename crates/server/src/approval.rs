// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Approval gate for high/critical tasks.
//!
//! Tasks sit in `awaiting_confirmation` until the owner (or an admin)
//! decides, or until the expiry sweep auto-cancels them after the
//! configured TTL.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::outbound::OutboundEvent;
use crate::routing;
use crate::state::AppState;
use crate::store::users::User;
use crate::store::{TaskRow, TaskStatus};

fn load_for_decision(state: &AppState, user: &User, task_id: &str) -> Result<TaskRow, ApiError> {
    let task = state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    if task.user_id != user.id && !user.is_admin {
        return Err(ApiError::forbidden("not the task owner"));
    }
    if task.status != TaskStatus::AwaitingConfirmation {
        return Err(ApiError::validation("task not awaiting approval"));
    }
    Ok(task)
}

/// Approve: `awaiting_confirmation → queued`, then the normal created-event
/// path delivers it.
pub async fn approve(state: &AppState, user: &User, task_id: &str) -> Result<TaskRow, ApiError> {
    let task = load_for_decision(state, user, task_id)?;

    state.store.transition_task(task_id, TaskStatus::AwaitingConfirmation, TaskStatus::Queued)?;
    routing::publish_created(state, &task).await;

    state.outbound.emit(OutboundEvent::TaskUpdate {
        user_id: task.user_id.clone(),
        task_id: task_id.to_owned(),
        status: "approved".to_owned(),
        title: task.title.clone(),
    });
    tracing::info!(task_id, user_id = %user.id, "task approved");

    state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::internal("task vanished after approve"))
}

/// Reject: `awaiting_confirmation → cancelled`, no delivery.
pub fn reject(state: &AppState, user: &User, task_id: &str) -> Result<TaskRow, ApiError> {
    let task = load_for_decision(state, user, task_id)?;

    state.store.transition_task(task_id, TaskStatus::AwaitingConfirmation, TaskStatus::Cancelled)?;

    state.outbound.emit(OutboundEvent::TaskUpdate {
        user_id: task.user_id.clone(),
        task_id: task_id.to_owned(),
        status: "rejected".to_owned(),
        title: task.title.clone(),
    });
    tracing::info!(task_id, user_id = %user.id, "task rejected");

    state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::internal("task vanished after reject"))
}

/// One expiry pass: auto-cancel everything awaiting confirmation since
/// before the TTL. Returns how many were cancelled.
pub fn expire_once(state: &AppState, ttl: std::time::Duration) -> usize {
    let cutoff = Utc::now() - Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1));
    let expired = match state.store.expired_approvals(cutoff) {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(err = %e, "approval expiry query failed");
            return 0;
        }
    };

    let mut cancelled = 0;
    for task in expired {
        match state.store.transition_task(
            &task.id,
            TaskStatus::AwaitingConfirmation,
            TaskStatus::Cancelled,
        ) {
            Ok(()) => {
                cancelled += 1;
                state.outbound.emit(OutboundEvent::TaskUpdate {
                    user_id: task.user_id.clone(),
                    task_id: task.id.clone(),
                    status: "auto_cancelled".to_owned(),
                    title: task.title.clone(),
                });
            }
            // Raced with an explicit decision; nothing to do.
            Err(e) => tracing::debug!(task_id = %task.id, err = %e, "expiry skipped"),
        }
    }
    if cancelled > 0 {
        tracing::info!(cancelled, "auto-cancelled expired approvals");
    }
    cancelled
}

/// Spawn the periodic approval-expiry sweeper. The same loop prunes aged
/// idempotency keys (kept 48 h) and expired refresh tokens.
pub fn spawn_expiry_sweeper(state: Arc<AppState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(state.config.approval_sweep_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    expire_once(&state, state.config.approval_ttl());
                    if let Err(e) = state.store.prune_idempotency(Utc::now() - Duration::hours(48)) {
                        tracing::error!(err = %e, "idempotency prune failed");
                    }
                    let refresh_cutoff =
                        Utc::now() - Duration::days(state.config.refresh_token_days as i64);
                    if let Err(e) = state.store.prune_refresh_tokens(refresh_cutoff) {
                        tracing::error!(err = %e, "refresh token prune failed");
                    }
                }
            }
        }
        tracing::debug!("approval expiry sweeper shutting down");
    });
}

#[cfg(test)]
#[path = "approval_tests.rs"]
mod tests;
