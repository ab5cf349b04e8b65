// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User notification stream at `/ws/notifications`.
//!
//! Subscribes the connection to the caller's notification channel. No
//! persistence: a client that reconnects missed whatever it missed.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::state::AppState;
use crate::transport::auth;
use crate::wire::CLOSE_AUTH;

#[derive(Debug, Deserialize)]
pub struct UserWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/notifications?token=<access_token>`.
pub async fn ws_user_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = query
        .token
        .as_deref()
        .ok_or_else(|| crate::error::ApiError::unauthenticated("missing token"))
        .and_then(|raw| auth::user_from_token(&state, raw));

    match user {
        Ok(user) => ws
            .on_upgrade(move |socket| handle_user_socket(state, socket, user.id))
            .into_response(),
        Err(e) => {
            tracing::debug!(err = %e, "notification socket rejected");
            ws.on_upgrade(move |mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_AUTH,
                        reason: "unauthorized".into(),
                    })))
                    .await;
            })
            .into_response()
        }
    }
}

async fn handle_user_socket(state: Arc<AppState>, socket: WebSocket, user_id: String) {
    let notifier = Arc::clone(state.outbound.notifier());
    let (sub_id, mut rx) = notifier.subscribe(&user_id);
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Connection confirmation.
    let hello = serde_json::json!({
        "type": "connected",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if ws_tx.send(Message::Text(hello.to_string().into())).await.is_err() {
        notifier.unsubscribe(&user_id, sub_id);
        return;
    }

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::debug!(user_id, "notification socket connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            msg = rx.recv() => {
                let Some(notification) = msg else { break };
                let Ok(json) = serde_json::to_string(&notification) else { continue };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping"
                            && ws_tx.send(Message::Text("pong".into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            // Server-side heartbeat keeps idle connections warm.
            _ = heartbeat.tick() => {
                let beat = serde_json::json!({
                    "type": "heartbeat",
                    "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                });
                if ws_tx.send(Message::Text(beat.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    notifier.unsubscribe(&user_id, sub_id);
    tracing::debug!(user_id, "notification socket disconnected");
}
