// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite persistence for the control plane.
//!
//! A single `Mutex<Connection>` shared via `Arc<Store>`; every operation
//! takes the lock synchronously and is short. Timestamps are stored as
//! RFC 3339 UTC text, structured columns as JSON text.

pub mod agents;
pub mod schedules;
pub mod tasks;
pub mod users;
pub mod webhooks;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

pub use tasks::{TaskPayload, TaskRow, TaskStatus};

pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store   = MEMORY;",
        )?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // -- Idempotency keys -----------------------------------------------------

    /// Claim an idempotency key for a freshly created resource.
    ///
    /// First writer wins under the UNIQUE constraint. Returns the outcome the
    /// caller must act on: the claim succeeded, an identical request already
    /// created `resource_id`, or the key was reused with a different body.
    pub fn claim_idempotency(
        &self,
        user_id: &str,
        endpoint: &str,
        key: &str,
        resource_type: &str,
        resource_id: &str,
        body_hash: &str,
    ) -> Result<IdempotencyOutcome, ApiError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO idempotency_keys
                 (user_id, endpoint, idem_key, resource_type, resource_id, request_body_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![user_id, endpoint, key, resource_type, resource_id, body_hash, now_ts()],
        )?;
        if inserted == 1 {
            return Ok(IdempotencyOutcome::Claimed);
        }

        let (existing_id, existing_hash): (String, String) = conn
            .query_row(
                "SELECT resource_id, request_body_hash FROM idempotency_keys
                 WHERE user_id = ?1 AND endpoint = ?2 AND idem_key = ?3",
                rusqlite::params![user_id, endpoint, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
        if existing_hash == body_hash {
            Ok(IdempotencyOutcome::Existing(existing_id))
        } else {
            Ok(IdempotencyOutcome::BodyMismatch)
        }
    }

    /// Look up a prior claim before doing any work.
    pub fn find_idempotent(
        &self,
        user_id: &str,
        endpoint: &str,
        key: &str,
        body_hash: &str,
    ) -> Result<Option<IdempotencyOutcome>, ApiError> {
        use rusqlite::OptionalExtension;
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT resource_id, request_body_hash FROM idempotency_keys
                 WHERE user_id = ?1 AND endpoint = ?2 AND idem_key = ?3",
                rusqlite::params![user_id, endpoint, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(id, hash)| {
            if hash == body_hash {
                IdempotencyOutcome::Existing(id)
            } else {
                IdempotencyOutcome::BodyMismatch
            }
        }))
    }

    /// Drop idempotency keys older than the retention horizon (≥ 24 h).
    pub fn prune_idempotency(&self, cutoff: DateTime<Utc>) -> Result<usize, ApiError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM idempotency_keys WHERE created_at < ?1",
            rusqlite::params![ts(cutoff)],
        )?;
        Ok(n)
    }
}

/// Outcome of an idempotency-key claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// Key claimed; the caller's resource stands.
    Claimed,
    /// An identical request already created this resource.
    Existing(String),
    /// Same key, different request body.
    BodyMismatch,
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            email         TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin      INTEGER NOT NULL DEFAULT 0,
            is_active     INTEGER NOT NULL DEFAULT 1,
            preferences   TEXT NOT NULL DEFAULT '{}',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS refresh_tokens (
            token_hash  TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            revoked     INTEGER NOT NULL DEFAULT 0,
            replaced_by TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL REFERENCES users(id),
            name              TEXT NOT NULL,
            platform          TEXT NOT NULL,
            capabilities      TEXT NOT NULL DEFAULT '{}',
            last_seen         TEXT,
            connection_status TEXT NOT NULL DEFAULT 'offline',
            created_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            agent_id    TEXT NOT NULL REFERENCES agents(id),
            title       TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            payload     TEXT NOT NULL,
            status      TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            user_id           TEXT NOT NULL,
            endpoint          TEXT NOT NULL,
            idem_key          TEXT NOT NULL,
            resource_type     TEXT NOT NULL,
            resource_id       TEXT NOT NULL,
            request_body_hash TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            UNIQUE(user_id, endpoint, idem_key)
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES users(id),
            agent_id        TEXT NOT NULL REFERENCES agents(id),
            name            TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            actions         TEXT NOT NULL,
            is_active       INTEGER NOT NULL DEFAULT 1,
            last_run        TEXT,
            next_run        TEXT,
            run_count       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS webhooks (
            id         TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL REFERENCES users(id),
            name       TEXT NOT NULL,
            url        TEXT NOT NULL,
            secret     TEXT NOT NULL DEFAULT '',
            events     TEXT NOT NULL DEFAULT '[]',
            is_active  INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

// -- Column helpers ------------------------------------------------------------

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    ts(Utc::now())
}

pub(crate) fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw, idx)
}

pub(crate) fn opt_ts_col(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s, idx)).transpose()
}

fn parse_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn json_col<T: DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
