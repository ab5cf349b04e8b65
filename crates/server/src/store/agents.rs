// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent (device) persistence. Rows survive revocation for audit.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::error::ApiError;

use super::{now_ts, opt_ts_col, ts, ts_col, Store};

#[derive(Debug, Clone, Serialize)]
pub struct AgentRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub platform: String,
    pub capabilities: serde_json::Value,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection_status: String,
    pub created_at: DateTime<Utc>,
}

const AGENT_COLS: &str =
    "id, user_id, name, platform, capabilities, last_seen, connection_status, created_at";

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        platform: row.get(3)?,
        capabilities: super::json_col(row, 4)?,
        last_seen: opt_ts_col(row, 5)?,
        connection_status: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

impl Store {
    /// Insert an agent under a caller-chosen id (minted before any
    /// idempotency claim).
    pub fn create_agent(
        &self,
        id: &str,
        user_id: &str,
        name: &str,
        platform: &str,
        capabilities: &serde_json::Value,
    ) -> Result<AgentRow, ApiError> {
        self.with_conn(|conn| {
            let caps = serde_json::to_string(capabilities)
                .map_err(|e| ApiError::validation(format!("bad capabilities: {e}")))?;
            conn.execute(
                "INSERT INTO agents (id, user_id, name, platform, capabilities, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, user_id, name, platform, caps, now_ts()],
            )?;
            let agent = conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                rusqlite::params![id],
                agent_from_row,
            )?;
            Ok(agent)
        })
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRow>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
                    rusqlite::params![id],
                    agent_from_row,
                )
                .optional()?)
        })
    }

    /// Fetch an agent enforcing ownership.
    pub fn get_agent_owned(&self, id: &str, user_id: &str) -> Result<Option<AgentRow>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1 AND user_id = ?2"),
                    rusqlite::params![id, user_id],
                    agent_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_agents(&self, user_id: &str) -> Result<Vec<AgentRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AGENT_COLS} FROM agents WHERE user_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(rusqlite::params![user_id], agent_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Record a connection status change; `last_seen` is stamped when the
    /// agent leaves `online`.
    pub fn set_agent_connection(
        &self,
        id: &str,
        status: &str,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET connection_status = ?2, last_seen = COALESCE(?3, last_seen)
                 WHERE id = ?1",
                rusqlite::params![id, status, last_seen.map(ts)],
            )?;
            Ok(())
        })
    }
}
