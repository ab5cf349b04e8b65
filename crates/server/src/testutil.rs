// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit tests: an in-memory state graph with the
//! in-process broker and rate limiting disabled.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::CreatedStream;
use crate::config::{KeySet, ServerConfig};
use crate::state::AppState;
use crate::store::users::{hash_password, User};
use crate::store::TaskStatus;
use crate::wire::{Action, ActionKind};

pub fn test_config() -> ServerConfig {
    let mut keys = HashMap::new();
    keys.insert("v1".to_owned(), "agent-secret-one".to_owned());
    keys.insert("v0".to_owned(), "agent-secret-zero".to_owned());
    ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        db_path: ":memory:".into(),
        nats_url: None,
        nats_token: None,
        nats_prefix: "drover".to_owned(),
        access_secret: "access-secret".to_owned(),
        access_token_minutes: 15,
        refresh_token_days: 30,
        agent_keys: KeySet::new(keys),
        agent_active_kid: "v1".to_owned(),
        agent_token_hours: 24,
        allowed_origins: "*".to_owned(),
        disable_rate_limiting: true,
        login_per_minute: 30,
        lockout_threshold: 5,
        lockout_minutes: 15,
        ws_handshakes_per_window: 20,
        ws_window_secs: 60,
        ip_block_secs: 300,
        heartbeat_secs: 30,
        presence_ttl_secs: 120,
        approval_ttl_secs: 3600,
        approval_sweep_secs: 600,
        scheduler_tick_secs: 60,
        assign_retries: 2,
        assign_retry_ms: 10,
        send_deadline_ms: 200,
        artifacts_endpoint: None,
        artifacts_access_key: None,
        artifacts_secret_key: None,
        artifacts_bucket: None,
        debug_routes: true,
    }
}

pub async fn test_state() -> anyhow::Result<(Arc<AppState>, CreatedStream)> {
    test_state_with(test_config()).await
}

pub async fn test_state_with(
    config: ServerConfig,
) -> anyhow::Result<(Arc<AppState>, CreatedStream)> {
    // The HTTP client needs a process-level crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();
    Ok(AppState::new(config, CancellationToken::new()).await?)
}

pub fn seed_user(state: &AppState) -> anyhow::Result<User> {
    let email = format!("{}@x.com", uuid::Uuid::new_v4().simple());
    Ok(state.store.create_user(&email, &hash_password("Password1!"))?)
}

pub fn seed_agent(state: &AppState, user_id: &str) -> anyhow::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    Ok(state.store.create_agent(&id, user_id, "laptop", "linux", &serde_json::json!({}))?.id)
}

pub fn noop_actions() -> Vec<Action> {
    vec![Action { action_id: "a1".to_owned(), kind: ActionKind::Noop }]
}

pub fn shell_actions(command: &str) -> Vec<Action> {
    vec![Action {
        action_id: "a1".to_owned(),
        kind: ActionKind::Shell { command: command.to_owned() },
    }]
}

/// Insert a task directly at a given status, bypassing intake.
pub fn seed_task(
    state: &AppState,
    user_id: &str,
    agent_id: &str,
    status: TaskStatus,
    actions: Vec<Action>,
) -> anyhow::Result<String> {
    let analysis = state.risk.classify(&actions);
    let payload = crate::store::TaskPayload {
        actions,
        risk_analysis: analysis,
        scheduled_task_id: None,
        results: None,
    };
    let id = uuid::Uuid::new_v4().to_string();
    Ok(state.store.insert_task(&id, user_id, agent_id, "test task", "", &payload, status)?.id)
}
