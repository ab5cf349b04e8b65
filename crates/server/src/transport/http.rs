// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers: auth, devices, tasks, approvals, artifacts, health.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::approval;
use crate::error::ApiError;
use crate::presence::PresenceSnapshot;
use crate::registry::ChannelMsg;
use crate::routing::{self, CreateTaskRequest};
use crate::state::AppState;
use crate::store::users::{hash_password, verify_password};
use crate::store::IdempotencyOutcome;
use crate::token;
use crate::transport::auth::require_user;
use crate::wire::{ServerFrame, CLOSE_NORMAL};

const ENROLL_ENDPOINT: &str = "/devices/enroll";

// -- Request/Response types ----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub agent_id: String,
    pub agent_token: String,
    pub ws_url: String,
    pub kid: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub agent_id: String,
    pub revoked_count: usize,
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: crate::store::agents::AgentRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub task_id: String,
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents_connected: usize,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub status: String,
    pub task_id: String,
}

// -- Helpers -------------------------------------------------------------------

fn idempotency_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("idempotency-key").and_then(|v| v.to_str().ok()).filter(|k| !k.is_empty())
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

fn ws_url(state: &AppState) -> String {
    format!("ws://{}:{}/ws/agent", state.config.host, state.config.port)
}

/// Mint and register a fresh agent token.
fn issue_agent_token(state: &AppState, agent_id: &str) -> Result<EnrollResponse, ApiError> {
    let (agent_token, jti, kid) = token::mint_agent(
        &state.config.agent_keys,
        &state.config.agent_active_kid,
        agent_id,
        state.config.agent_token_hours,
    )
    .map_err(|e| ApiError::internal(e.to_string()))?;
    state.presence.store_active_jti(agent_id, &jti);
    let expires_at = Utc::now() + Duration::hours(state.config.agent_token_hours as i64);
    Ok(EnrollResponse {
        agent_id: agent_id.to_owned(),
        agent_token,
        ws_url: ws_url(state),
        kid,
        expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

// -- Auth ----------------------------------------------------------------------

/// `POST /auth/signup`
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.email.is_empty() || !req.email.contains('@') {
        return Err(ApiError::validation("invalid email"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }
    let user = state.store.create_user(&req.email, &hash_password(&req.password))?;
    Ok((StatusCode::CREATED, Json(SignupResponse { id: user.id, email: user.email })))
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let limits_on = !state.config.disable_rate_limiting;

    if limits_on {
        let ip_key = format!("rl:login:ip:{}", addr.ip());
        let email_key = format!("rl:login:email:{}", req.email);
        let per_minute = state.config.login_per_minute;
        if !state.presence.login_allowed(&ip_key, per_minute)
            || !state.presence.login_allowed(&email_key, per_minute)
        {
            return Err(ApiError::rate_limited("too many login attempts"));
        }
        if state.presence.is_locked(&req.email) {
            return Err(ApiError::locked("account temporarily locked"));
        }
    }

    let user = state.store.get_user_by_email(&req.email)?;
    let authenticated = user
        .as_ref()
        .filter(|u| u.is_active)
        .is_some_and(|u| verify_password(&req.password, &u.password_hash));

    if !authenticated {
        if limits_on {
            state.presence.record_login_failure(
                &req.email,
                state.config.lockout_threshold,
                std::time::Duration::from_secs(state.config.lockout_minutes * 60),
            );
        }
        return Err(ApiError::unauthenticated("invalid credentials"));
    }
    let user = user.ok_or_else(|| ApiError::unauthenticated("invalid credentials"))?;

    state.presence.clear_login_failures(&req.email);

    let (access_token, _) = token::mint_access(
        &state.config.access_secret,
        &user.id,
        state.config.access_token_minutes,
    );
    let (raw_refresh, hashed) = token::new_refresh_token();
    state.store.insert_refresh_token(&user.id, &hashed)?;

    Ok(Json(TokenResponse {
        access_token,
        refresh_token: raw_refresh,
        token_type: "bearer".to_owned(),
    }))
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let hashed = token::hash_refresh_token(&req.token);
    let row = state
        .store
        .get_refresh_token(&hashed)?
        .ok_or_else(|| ApiError::unauthenticated("invalid refresh token"))?;
    if row.revoked {
        return Err(ApiError::unauthenticated("invalid refresh token"));
    }
    let max_age = Duration::days(state.config.refresh_token_days as i64);
    if Utc::now() - row.created_at > max_age {
        state.store.revoke_refresh_token(&hashed, None)?;
        return Err(ApiError::unauthenticated("refresh token expired"));
    }

    // Rotate.
    let (raw_refresh, new_hashed) = token::new_refresh_token();
    state.store.revoke_refresh_token(&hashed, Some(&new_hashed))?;
    state.store.insert_refresh_token(&row.user_id, &new_hashed)?;

    let (access_token, _) = token::mint_access(
        &state.config.access_secret,
        &row.user_id,
        state.config.access_token_minutes,
    );
    Ok(Json(TokenResponse {
        access_token,
        refresh_token: raw_refresh,
        token_type: "bearer".to_owned(),
    }))
}

/// `POST /auth/logout` — always 200 to avoid information leakage.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hashed = token::hash_refresh_token(&req.token);
    if state.store.get_refresh_token(&hashed)?.is_some() {
        state.store.revoke_refresh_token(&hashed, None)?;
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// -- Devices -------------------------------------------------------------------

/// `POST /devices/enroll` — Idempotency-Key honored.
pub async fn enroll_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EnrollRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    if req.name.is_empty() || req.platform.is_empty() {
        return Err(ApiError::validation("name and platform are required"));
    }

    let body_hash = sha256_hex(
        crate::envelope::canonical_json(&serde_json::json!({
            "name": req.name,
            "platform": req.platform,
            "capabilities": req.capabilities,
        }))
        .as_bytes(),
    );

    let agent_id = uuid::Uuid::new_v4().to_string();
    let agent_id = match idempotency_key(&headers) {
        Some(key) => {
            match state.store.claim_idempotency(
                &user.id,
                ENROLL_ENDPOINT,
                key,
                "agent",
                &agent_id,
                &body_hash,
            )? {
                IdempotencyOutcome::Claimed => {
                    state.store.create_agent(
                        &agent_id,
                        &user.id,
                        &req.name,
                        &req.platform,
                        &req.capabilities,
                    )?;
                    agent_id
                }
                IdempotencyOutcome::Existing(existing) => existing,
                IdempotencyOutcome::BodyMismatch => {
                    return Err(ApiError::conflict("idempotency key reused with different body"));
                }
            }
        }
        None => {
            state.store.create_agent(
                &agent_id,
                &user.id,
                &req.name,
                &req.platform,
                &req.capabilities,
            )?;
            agent_id
        }
    };

    let response = issue_agent_token(&state, &agent_id)?;
    tracing::info!(agent_id = %response.agent_id, user_id = %user.id, "agent enrolled");
    Ok((StatusCode::CREATED, Json(response)))
}

/// `POST /devices/{id}/token/refresh`
pub async fn refresh_device_token(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EnrollResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    state
        .store
        .get_agent_owned(&agent_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;
    Ok(Json(issue_agent_token(&state, &agent_id)?))
}

/// `POST /devices/{id}/revoke` — revoke all active tokens; a live channel
/// is told and then closed.
pub async fn revoke_device(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RevokeResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    state
        .store
        .get_agent_owned(&agent_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;

    let revoked_count = state.presence.revoke_all_tokens(&agent_id);

    if let Some(channel) = state.registry.lookup(&agent_id) {
        let _ = channel.tx.try_send(ChannelMsg::Frame(ServerFrame::TokenRevoked));
        let _ = channel
            .tx
            .try_send(ChannelMsg::Close { code: CLOSE_NORMAL, reason: "token revoked" });
    }

    tracing::info!(agent_id, revoked_count, "agent tokens revoked");
    Ok(Json(RevokeResponse { agent_id, revoked_count }))
}

/// `GET /devices`
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AgentView>>, ApiError> {
    let user = require_user(&state, &headers)?;
    let agents = state.store.list_agents(&user.id)?;
    let views = agents
        .into_iter()
        .map(|agent| {
            let presence = state.presence.snapshot(&agent.id);
            AgentView { agent, presence }
        })
        .collect();
    Ok(Json(views))
}

/// `GET /devices/{id}`
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AgentView>, ApiError> {
    let user = require_user(&state, &headers)?;
    let agent = state
        .store
        .get_agent_owned(&agent_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;
    let presence = state.presence.snapshot(&agent.id);
    Ok(Json(AgentView { agent, presence }))
}

// -- Tasks ---------------------------------------------------------------------

/// `POST /tasks` — 201 with `queued` or `awaiting_confirmation`, 403 when
/// risk-blocked.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let task = routing::create_task(&state, &user, req, idempotency_key(&headers)).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks`
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let tasks = state.store.list_tasks(&user.id, query.limit.min(200))?;
    Ok(Json(tasks))
}

/// `GET /tasks/{id}`
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let task = state
        .store
        .get_task(&task_id)?
        .filter(|t| t.user_id == user.id || user.is_admin)
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    Ok(Json(task))
}

/// `POST /tasks/{id}/cancel`
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let task = routing::cancel_task(&state, &user, &task_id).await?;
    Ok(Json(task))
}

// -- Approvals -----------------------------------------------------------------

/// `GET /approvals`
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let tasks = state.store.list_awaiting(&user.id)?;
    Ok(Json(tasks))
}

/// `POST /approvals/{task_id}/approve`
pub async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DecisionResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    approval::approve(&state, &user, &task_id).await?;
    Ok(Json(DecisionResponse { status: "approved".to_owned(), task_id }))
}

/// `POST /approvals/{task_id}/reject`
pub async fn reject_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DecisionResponse>, ApiError> {
    let user = require_user(&state, &headers)?;
    approval::reject(&state, &user, &task_id)?;
    Ok(Json(DecisionResponse { status: "rejected".to_owned(), task_id }))
}

// -- Artifacts -----------------------------------------------------------------

/// `POST /artifacts/presign` — only for the caller's own tasks.
pub async fn presign_artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PresignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    if req.filename.is_empty() || req.filename.contains("..") || req.filename.contains('/') {
        return Err(ApiError::validation("invalid filename"));
    }
    state
        .store
        .get_task(&req.task_id)?
        .filter(|t| t.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    Ok(Json(state.artifacts.presign_upload(&req.task_id, &req.filename)))
}

// -- Health / debug ------------------------------------------------------------

/// `GET /healthz` — no auth.
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_owned(), agents_connected: state.registry.len() })
}

/// `GET /debug/queues` — assigner counters (debug builds of the API only).
pub async fn debug_queues(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let _ = require_user(&state, &headers)?;
    Ok(Json(serde_json::json!({
        "dlq_total": crate::assigner::DLQ_TOTAL.load(std::sync::atomic::Ordering::Relaxed),
        "broker_dlq_total": state.broker.dlq_total(),
        "agents_connected": state.registry.len(),
    })))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
