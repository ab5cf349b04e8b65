// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request authentication helpers for the HTTP surface.

use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::state::AppState;
use crate::store::users::User;
use crate::token;

/// Extract the Bearer token from an Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolve the calling user from a raw access token.
pub fn user_from_token(state: &AppState, raw: &str) -> Result<User, ApiError> {
    let claims = token::verify_access(&state.config.access_secret, raw)
        .map_err(|e| ApiError::unauthenticated(e.to_string()))?;
    let user = state
        .store
        .get_user(&claims.sub)?
        .ok_or_else(|| ApiError::unauthenticated("unknown user"))?;
    if !user.is_active {
        return Err(ApiError::unauthenticated("account deactivated"));
    }
    Ok(user)
}

/// Authenticate an API request. Every protected handler calls this first.
pub fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let raw = bearer_token(headers)
        .ok_or_else(|| ApiError::unauthenticated("missing bearer token"))?;
    user_from_token(state, raw)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
