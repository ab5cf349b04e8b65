// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task persistence and the lifecycle state machine.
//!
//! Transition legality lives in [`TaskStatus::can_transition`]; the store
//! enforces it with a single atomic compare-and-set UPDATE. Zero affected
//! rows means the task moved underneath the caller and surfaces as
//! `conflict`.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::risk::RiskAnalysis;
use crate::wire::Action;

use super::{now_ts, ts, ts_col, Store};

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Assigned,
    InProgress,
    AwaitingConfirmation,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(Self::Created),
            "queued" => Some(Self::Queued),
            "assigned" => Some(Self::Assigned),
            "in_progress" => Some(Self::InProgress),
            "awaiting_confirmation" => Some(Self::AwaitingConfirmation),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → to` is a legal lifecycle transition.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, to) {
            (Created, Queued) | (Created, AwaitingConfirmation) => true,
            (Queued, Assigned) => true,
            (Assigned, InProgress) => true,
            (InProgress, Completed) | (InProgress, Failed) => true,
            (AwaitingConfirmation, Queued) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured task payload column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub actions: Vec<Action>,
    pub risk_analysis: RiskAnalysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<crate::wire::ActionResult>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub title: String,
    pub description: String,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const TASK_COLS: &str =
    "id, user_id, agent_id, title, description, payload, status, created_at, updated_at";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let status_raw: String = row.get(6)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown task status `{status_raw}`").into(),
        )
    })?;
    Ok(TaskRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        payload: super::json_col(row, 5)?,
        status,
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}

impl Store {
    /// Insert a task under a caller-chosen id (minted before any
    /// idempotency claim) at its initial status.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_task(
        &self,
        id: &str,
        user_id: &str,
        agent_id: &str,
        title: &str,
        description: &str,
        payload: &TaskPayload,
        status: TaskStatus,
    ) -> Result<TaskRow, ApiError> {
        self.with_conn(|conn| {
            let payload_json = serde_json::to_string(payload)
                .map_err(|e| ApiError::internal(format!("serialize payload: {e}")))?;
            let now = now_ts();
            conn.execute(
                "INSERT INTO tasks (id, user_id, agent_id, title, description, payload, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![id, user_id, agent_id, title, description, payload_json, status.as_str(), now],
            )?;
            let task = conn.query_row(
                &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
                rusqlite::params![id],
                task_from_row,
            )?;
            Ok(task)
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRow>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    task_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_tasks(&self, user_id: &str, limit: u32) -> Result<Vec<TaskRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], task_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Tasks held for approval, newest first.
    pub fn list_awaiting(&self, user_id: &str) -> Result<Vec<TaskRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks
                 WHERE user_id = ?1 AND status = 'awaiting_confirmation'
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(rusqlite::params![user_id], task_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Atomic guarded transition `from → to`. Both the status and
    /// `updated_at` change in one UPDATE; an illegal pair or a task that
    /// moved underneath the caller yields `conflict`.
    pub fn transition_task(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<(), ApiError> {
        if !from.can_transition(to) {
            return Err(ApiError::conflict(format!("illegal transition {from} -> {to}")));
        }
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                rusqlite::params![id, from.as_str(), to.as_str(), now_ts()],
            )?;
            if changed == 0 {
                let exists: bool = conn.query_row(
                    "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(ApiError::not_found("task not found"));
                }
                return Err(ApiError::conflict(format!("task not in {from}")));
            }
            Ok(())
        })
    }

    /// Cancel from whatever non-terminal state the task is in. Returns the
    /// state it was cancelled out of, so callers can decide whether an
    /// in-flight `task.cancel` frame is needed.
    pub fn cancel_task(&self, id: &str) -> Result<TaskStatus, ApiError> {
        loop {
            let task = self.get_task(id)?.ok_or_else(|| ApiError::not_found("task not found"))?;
            if task.status.is_terminal() {
                return Err(ApiError::conflict(format!("task already {}", task.status)));
            }
            match self.transition_task(id, task.status, TaskStatus::Cancelled) {
                Ok(()) => return Ok(task.status),
                // Lost a race with another transition; re-read and retry.
                Err(e) if e.kind == crate::error::ErrorKind::Conflict => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Attach agent results to the payload without touching status.
    pub fn record_task_results(
        &self,
        id: &str,
        results: &[crate::wire::ActionResult],
    ) -> Result<(), ApiError> {
        let task = self.get_task(id)?.ok_or_else(|| ApiError::not_found("task not found"))?;
        let mut payload = task.payload;
        payload.results = Some(results.to_vec());
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| ApiError::internal(format!("serialize payload: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET payload = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, payload_json, now_ts()],
            )?;
            Ok(())
        })
    }

    /// Tasks awaiting confirmation since before `cutoff` (expiry sweep).
    pub fn expired_approvals(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks
                 WHERE status = 'awaiting_confirmation' AND created_at < ?1"
            ))?;
            let rows = stmt.query_map(rusqlite::params![ts(cutoff)], task_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}
