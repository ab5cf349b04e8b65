// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Webhook subscription persistence. Delivery attempts are not recorded.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApiError;

use super::{now_ts, ts_col, Store};

#[derive(Debug, Clone, Serialize)]
pub struct WebhookRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookRow {
    /// Whether this subscription wants `event` (`*` subscribes to all).
    pub fn wants(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event || e == "*")
    }
}

const WEBHOOK_COLS: &str = "id, user_id, name, url, secret, events, is_active, created_at";

fn webhook_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookRow> {
    Ok(WebhookRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        secret: row.get(4)?,
        events: super::json_col(row, 5)?,
        is_active: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

impl Store {
    pub fn create_webhook(
        &self,
        user_id: &str,
        name: &str,
        url: &str,
        secret: &str,
        events: &[String],
    ) -> Result<WebhookRow, ApiError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let events_json = serde_json::to_string(events)
                .map_err(|e| ApiError::internal(format!("serialize events: {e}")))?;
            conn.execute(
                "INSERT INTO webhooks (id, user_id, name, url, secret, events, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, user_id, name, url, secret, events_json, now_ts()],
            )?;
            let webhook = conn.query_row(
                &format!("SELECT {WEBHOOK_COLS} FROM webhooks WHERE id = ?1"),
                rusqlite::params![id],
                webhook_from_row,
            )?;
            Ok(webhook)
        })
    }

    pub fn list_webhooks(&self, user_id: &str) -> Result<Vec<WebhookRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WEBHOOK_COLS} FROM webhooks WHERE user_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(rusqlite::params![user_id], webhook_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn delete_webhook(&self, id: &str, user_id: &str) -> Result<bool, ApiError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM webhooks WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id, user_id],
            )?;
            Ok(n > 0)
        })
    }

    /// Active subscriptions for a user, consulted by the fan-out.
    pub fn active_webhooks(&self, user_id: &str) -> Result<Vec<WebhookRow>, ApiError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WEBHOOK_COLS} FROM webhooks WHERE user_id = ?1 AND is_active = 1"
            ))?;
            let rows = stmt.query_map(rusqlite::params![user_id], webhook_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}
