// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User and refresh-token persistence, plus password hashing.
//!
//! Password handling is deliberately thin: salted SHA-256, enough for the
//! login/lockout surface this plane owns. Users are soft-deactivated, never
//! deleted.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::error::ApiError;

use super::{now_ts, ts, ts_col, Store};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub preferences: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRow {
    pub token_hash: String,
    pub user_id: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        is_admin: row.get(3)?,
        is_active: row.get(4)?,
        preferences: super::json_col(row, 5)?,
        created_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}

const USER_COLS: &str =
    "id, email, password_hash, is_admin, is_active, preferences, created_at, updated_at";

impl Store {
    pub fn create_user(&self, email: &str, password_hash: &str) -> Result<User, ApiError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_ts();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, email, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![id, email, password_hash, now],
            )?;
            if inserted == 0 {
                return Err(ApiError::conflict("email already in use"));
            }
            let user = conn.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                rusqlite::params![id],
                user_from_row,
            )?;
            Ok(user)
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                    rusqlite::params![id],
                    user_from_row,
                )
                .optional()?)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {USER_COLS} FROM users WHERE email = ?1"),
                    rusqlite::params![email],
                    user_from_row,
                )
                .optional()?)
        })
    }

    /// Grant or drop the admin flag (operator tooling).
    pub fn set_user_admin(&self, id: &str, is_admin: bool) -> Result<(), ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_admin = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, is_admin, now_ts()],
            )?;
            Ok(())
        })
    }

    // -- Refresh tokens -------------------------------------------------------

    pub fn insert_refresh_token(&self, user_id: &str, token_hash: &str) -> Result<(), ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO refresh_tokens (token_hash, user_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![token_hash, user_id, now_ts()],
            )?;
            Ok(())
        })
    }

    pub fn get_refresh_token(&self, token_hash: &str) -> Result<Option<RefreshTokenRow>, ApiError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT token_hash, user_id, revoked, created_at
                     FROM refresh_tokens WHERE token_hash = ?1",
                    rusqlite::params![token_hash],
                    |row| {
                        Ok(RefreshTokenRow {
                            token_hash: row.get(0)?,
                            user_id: row.get(1)?,
                            revoked: row.get(2)?,
                            created_at: ts_col(row, 3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Revoke a refresh token, optionally recording its rotated successor.
    pub fn revoke_refresh_token(
        &self,
        token_hash: &str,
        replaced_by: Option<&str>,
    ) -> Result<(), ApiError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE refresh_tokens SET revoked = 1, replaced_by = ?2 WHERE token_hash = ?1",
                rusqlite::params![token_hash, replaced_by],
            )?;
            Ok(())
        })
    }

    /// Drop refresh tokens past their lifetime.
    pub fn prune_refresh_tokens(&self, cutoff: DateTime<Utc>) -> Result<usize, ApiError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM refresh_tokens WHERE created_at < ?1",
                rusqlite::params![ts(cutoff)],
            )?)
        })
    }
}

// -- Password hashing ----------------------------------------------------------

/// Salted SHA-256, stored as `salt$digest` hex.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let salt_hex: String = salt.iter().map(|b| format!("{b:02x}")).collect();
    format!("{salt_hex}${}", digest_hex(&salt_hex, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest)) = stored.split_once('$') else {
        return false;
    };
    crate::envelope::constant_time_eq(&digest_hex(salt_hex, password), digest)
}

fn digest_hex(salt_hex: &str, password: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}
