// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for scheduled-task definitions and webhook subscriptions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::cron;
use crate::error::ApiError;
use crate::scheduler;
use crate::state::AppState;
use crate::transport::auth::require_user;
use crate::wire::Action;

// -- Scheduled tasks -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub agent_id: String,
    pub name: String,
    pub cron_expression: String,
    pub actions: Vec<Action>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    /// Pull `next_run` back to now so the next tick fires immediately.
    #[serde(default)]
    pub run_now: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListSchedulesQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// `POST /scheduled-tasks`
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    if req.name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if req.actions.is_empty() {
        return Err(ApiError::validation("actions must not be empty"));
    }
    if !cron::validate(&req.cron_expression) {
        return Err(ApiError::validation("invalid cron expression"));
    }
    state
        .store
        .get_agent_owned(&req.agent_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;

    let next_run = scheduler::next_run_after(&req.cron_expression, Utc::now());
    let schedule = state.store.create_schedule(
        &user.id,
        &req.agent_id,
        &req.name,
        &req.cron_expression,
        &req.actions,
        req.is_active,
        next_run,
    )?;
    tracing::info!(schedule_id = %schedule.id, user_id = %user.id, "scheduled task created");
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// `GET /scheduled-tasks`
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSchedulesQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let schedules = state.store.list_schedules(
        &user.id,
        query.agent_id.as_deref(),
        query.is_active,
        query.limit.min(200),
    )?;
    Ok(Json(schedules))
}

/// `GET /scheduled-tasks/{id}`
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    let schedule = state
        .store
        .get_schedule(&schedule_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("scheduled task not found"))?;
    Ok(Json(schedule))
}

/// `PATCH /scheduled-tasks/{id}` — a changed cron expression is revalidated
/// and `next_run` recomputed.
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    state
        .store
        .get_schedule(&schedule_id, &user.id)?
        .ok_or_else(|| ApiError::not_found("scheduled task not found"))?;

    if let Some(expr) = req.cron_expression.as_deref() {
        if !cron::validate(expr) {
            return Err(ApiError::validation("invalid cron expression"));
        }
    }
    let next_run = if req.run_now {
        Some(Utc::now())
    } else {
        req.cron_expression.as_deref().and_then(|expr| scheduler::next_run_after(expr, Utc::now()))
    };

    let schedule = state
        .store
        .update_schedule(
            &schedule_id,
            &user.id,
            req.cron_expression.as_deref(),
            req.is_active,
            next_run,
        )?
        .ok_or_else(|| ApiError::not_found("scheduled task not found"))?;
    Ok(Json(schedule))
}

/// `DELETE /scheduled-tasks/{id}`
pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    if !state.store.delete_schedule(&schedule_id, &user.id)? {
        return Err(ApiError::not_found("scheduled task not found"));
    }
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

// -- Webhooks ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub events: Vec<String>,
}

/// `POST /webhooks`
pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    if req.name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(ApiError::validation("url must be http(s)"));
    }
    let webhook =
        state.store.create_webhook(&user.id, &req.name, &req.url, &req.secret, &req.events)?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

/// `GET /webhooks`
pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    Ok(Json(state.store.list_webhooks(&user.id)?))
}

/// `DELETE /webhooks/{id}`
pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    if !state.store.delete_webhook(&webhook_id, &user.id)? {
        return Err(ApiError::not_found("webhook not found"));
    }
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}
