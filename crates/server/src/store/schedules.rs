// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scheduled-task definitions consumed by the scheduler tick loop.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::error::ApiError;
use crate::wire::Action;

use super::{now_ts, opt_ts_col, ts, ts_col, Store};

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRow {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub name: String,
    pub cron_expression: String,
    pub actions: Vec<Action>,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
}

const SCHEDULE_COLS: &str = "id, user_id, agent_id, name, cron_expression, actions, is_active, \
                             last_run, next_run, run_count, created_at";

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_id: row.get(2)?,
        name: row.get(3)?,
        cron_expression: row.get(4)?,
        actions: super::json_col(row, 5)?,
        is_active: row.get(6)?,
        last_run: opt_ts_col(row, 7)?,
        next_run: opt_ts_col(row, 8)?,
        run_count: row.get::<_, i64>(9)? as u64,
        created_at: ts_col(row, 10)?,
    })
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn create_schedule(
        &self,
        user_id: &str,
        agent_id: &str,
        name: &str,
        cron_expression: &str,
        actions: &[Action],
        is_active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<ScheduleRow, ApiError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let actions_json = serde_json::to_string(actions)
                .map_err(|e| ApiError::internal(format!("serialize actions: {e}")))?;
            conn.execute(
                "INSERT INTO scheduled_tasks
                     (id, user_id, agent_id, name, cron_expression, actions, is_active, next_run, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    user_id,
                    agent_id,
                    name,
                    cron_expression,
                    actions_json,
                    is_active,
                    next_run.map(ts),
                    now_ts()
                ],
            )?;
            let schedule = conn.query_row(
                &format!("SELECT {SCHEDULE_COLS} FROM scheduled_tasks WHERE id = ?1"),
                rusqlite::params![id],
                schedule_from_row,
            )?;
            Ok(schedule)
        })
    }

    pub fn get_schedule(&self, id: &str, user_id: &str) -> Result<Option<ScheduleRow>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SCHEDULE_COLS} FROM scheduled_tasks
                         WHERE id = ?1 AND user_id = ?2"
                    ),
                    rusqlite::params![id, user_id],
                    schedule_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_schedules(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        is_active: Option<bool>,
        limit: u32,
    ) -> Result<Vec<ScheduleRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLS} FROM scheduled_tasks
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR agent_id = ?2)
                   AND (?3 IS NULL OR is_active = ?3)
                 ORDER BY created_at DESC LIMIT ?4"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, agent_id, is_active, limit],
                schedule_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Partial update; `next_run` is recomputed by the caller when the cron
    /// expression changes.
    pub fn update_schedule(
        &self,
        id: &str,
        user_id: &str,
        cron_expression: Option<&str>,
        is_active: Option<bool>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduleRow>, ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET
                     cron_expression = COALESCE(?3, cron_expression),
                     is_active = COALESCE(?4, is_active),
                     next_run = COALESCE(?5, next_run)
                 WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id, user_id, cron_expression, is_active, next_run.map(ts)],
            )?;
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SCHEDULE_COLS} FROM scheduled_tasks
                         WHERE id = ?1 AND user_id = ?2"
                    ),
                    rusqlite::params![id, user_id],
                    schedule_from_row,
                )
                .optional()?)
        })
    }

    pub fn delete_schedule(&self, id: &str, user_id: &str) -> Result<bool, ApiError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM scheduled_tasks WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id, user_id],
            )?;
            Ok(n > 0)
        })
    }

    /// Definitions due at `now`: active with `next_run` elapsed or unset.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLS} FROM scheduled_tasks
                 WHERE is_active = 1 AND (next_run IS NULL OR next_run <= ?1)"
            ))?;
            let rows = stmt.query_map(rusqlite::params![ts(now)], schedule_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Record a completed firing: bump `run_count`, stamp `last_run`, and
    /// advance `next_run`.
    pub fn mark_schedule_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET run_count = run_count + 1, last_run = ?2, next_run = ?3
                 WHERE id = ?1",
                rusqlite::params![id, ts(last_run), next_run.map(ts)],
            )?;
            Ok(())
        })
    }

    /// Advance `next_run` without counting a firing (risk-gated skip).
    pub fn advance_schedule(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
                rusqlite::params![id, next_run.map(ts)],
            )?;
            Ok(())
        })
    }
}
