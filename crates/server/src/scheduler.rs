// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cron-driven scheduler.
//!
//! A single tick loop materializes due scheduled definitions into task
//! rows and publishes `task.created`, reusing the normal delivery path.
//! Firings missed while the scheduler was down are not backfilled —
//! `next_run` simply advances to the next future slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::TaskCreated;
use crate::cron;
use crate::outbound::OutboundEvent;
use crate::risk;
use crate::state::AppState;
use crate::store::schedules::ScheduleRow;
use crate::store::{TaskPayload, TaskStatus};

/// One scheduler pass at `now`. Returns how many tasks were minted.
/// Per-definition failures are logged and skipped; the pass never fails.
pub async fn tick_once(state: &AppState, now: DateTime<Utc>) -> usize {
    let due = match state.store.due_schedules(now) {
        Ok(due) => due,
        Err(e) => {
            tracing::error!(err = %e, "scheduler: due query failed");
            return 0;
        }
    };

    let mut minted = 0;
    for schedule in due {
        match fire(state, &schedule, now).await {
            Ok(true) => minted += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(schedule_id = %schedule.id, err = %e, "scheduler: firing failed");
            }
        }
    }
    minted
}

async fn fire(
    state: &AppState,
    schedule: &ScheduleRow,
    now: DateTime<Utc>,
) -> Result<bool, crate::error::ApiError> {
    let next_run = next_run_after(&schedule.cron_expression, now);

    if state.store.get_agent(&schedule.agent_id)?.is_none() {
        tracing::warn!(
            schedule_id = %schedule.id,
            agent_id = %schedule.agent_id,
            "scheduler: target agent missing, skipping"
        );
        return Ok(false);
    }

    let analysis = state.risk.classify(&schedule.actions);
    if risk::should_block(analysis.level) || risk::requires_approval(analysis.level) {
        tracing::warn!(
            schedule_id = %schedule.id,
            risk = analysis.level.as_str(),
            reasons = ?analysis.reasons,
            "scheduler: firing blocked by risk gate"
        );
        state.outbound.emit(OutboundEvent::ScheduledTaskBlocked {
            user_id: schedule.user_id.clone(),
            scheduled_task_id: schedule.id.clone(),
            name: schedule.name.clone(),
            risk_level: analysis.level.as_str().to_owned(),
            reasons: analysis.reasons,
        });
        state.store.advance_schedule(&schedule.id, next_run)?;
        return Ok(false);
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    let payload = TaskPayload {
        actions: schedule.actions.clone(),
        risk_analysis: analysis,
        scheduled_task_id: Some(schedule.id.clone()),
        results: None,
    };
    let task = state.store.insert_task(
        &task_id,
        &schedule.user_id,
        &schedule.agent_id,
        &format!("Scheduled: {}", schedule.name),
        &format!("Auto-generated from scheduled task '{}'", schedule.name),
        &payload,
        TaskStatus::Queued,
    )?;

    state.store.mark_schedule_run(&schedule.id, now, next_run)?;

    let event = TaskCreated {
        task_id: task.id.clone(),
        agent_id: task.agent_id.clone(),
        actions: task.payload.actions.clone(),
    };
    if let Err(e) = state.broker.publish_created(&event).await {
        tracing::error!(task_id = %task.id, err = %e, "scheduler: publish task.created failed");
    }

    state.outbound.emit(OutboundEvent::ScheduledTaskExecuted {
        user_id: schedule.user_id.clone(),
        scheduled_task_id: schedule.id.clone(),
        task_id: task.id.clone(),
        name: schedule.name.clone(),
    });
    tracing::info!(schedule_id = %schedule.id, task_id = %task.id, "scheduled task fired");
    Ok(true)
}

/// Next future slot for an expression, or `None` when it no longer parses
/// (the definition was validated at creation, but defend anyway).
pub fn next_run_after(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match cron::parse(expr) {
        Ok(parsed) => parsed.next_after(now),
        Err(e) => {
            tracing::error!(expr, err = %e, "scheduler: stored cron expression invalid");
            None
        }
    }
}

/// Spawn the scheduler tick loop.
pub fn spawn_scheduler(state: Arc<AppState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(state.config.scheduler_tick_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(tick_secs = state.config.scheduler_tick_secs, "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    tick_once(&state, Utc::now()).await;
                }
            }
        }
        tracing::info!("scheduler shutting down");
    });
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
