// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent channel: authenticated duplex WebSocket at `/ws/agent`.
//!
//! Handshake: token from the query string, `kid` resolved against the key
//! set, jti checked against the revoked set. Auth failures close the
//! channel with code 4401; a newer connection closes the old one with
//! 4000; normal shutdown uses 1000.
//!
//! One reader/writer pair per agent. The writer drains the registry
//! channel; the reader applies heartbeat/ack/result frames. Two missed
//! heartbeats demote the agent to stale, and presence TTL does the rest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::outbound::OutboundEvent;
use crate::registry::ChannelMsg;
use crate::routing;
use crate::state::AppState;
use crate::token;
use crate::wire::{AgentFrame, CLOSE_AUTH, CLOSE_NORMAL};

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/agent?token=<agent_token>` — agent channel upgrade.
pub async fn ws_agent_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<AgentWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = addr.ip();
    if !ip.is_loopback() && !state.limiter.allow_handshake(ip) {
        return (StatusCode::TOO_MANY_REQUESTS, "handshake rate exceeded").into_response();
    }

    let denial = match query.token.as_deref() {
        None => Some("missing token"),
        Some(raw) => match token::verify_agent(&state.config.agent_keys, raw) {
            Err(e) => {
                tracing::info!(%ip, err = %e, "agent handshake rejected");
                Some("invalid token")
            }
            Ok(claims) if state.presence.is_jti_revoked(&claims.jti) => {
                tracing::info!(agent_id = %claims.agent_id, "agent handshake with revoked token");
                Some("token revoked")
            }
            Ok(claims) => {
                match state.store.get_agent(&claims.agent_id) {
                    Ok(Some(agent)) => {
                        let user_id = agent.user_id;
                        let name = agent.name;
                        return ws
                            .on_upgrade(move |socket| {
                                handle_agent_socket(state, socket, claims.agent_id, user_id, name)
                            })
                            .into_response();
                    }
                    Ok(None) => Some("unknown agent"),
                    Err(e) => {
                        tracing::error!(agent_id = %claims.agent_id, err = %e, "agent lookup failed");
                        Some("unavailable")
                    }
                }
            }
        },
    };

    // Accept, then close with the coded auth reason.
    let reason = denial.unwrap_or("unauthorized");
    ws.on_upgrade(move |socket| close_with(socket, CLOSE_AUTH, reason)).into_response()
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

async fn handle_agent_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    agent_id: String,
    user_id: String,
    agent_name: String,
) {
    let (channel_tx, mut channel_rx) = tokio::sync::mpsc::channel::<ChannelMsg>(32);
    let conn_id = state.registry.register(&agent_id, channel_tx);

    state.presence.mark_online(&agent_id, serde_json::Map::new());
    if let Err(e) = state.store.set_agent_connection(&agent_id, "online", Some(Utc::now())) {
        tracing::error!(agent_id, err = %e, "failed to persist online status");
    }
    state.outbound.emit(OutboundEvent::DeviceStatus {
        user_id: user_id.clone(),
        agent_id: agent_id.clone(),
        name: agent_name.clone(),
        status: "online".to_owned(),
    });
    tracing::info!(agent_id, conn_id, "agent connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = Duration::from_secs(state.config.heartbeat_secs);
    let mut last_heartbeat = Instant::now();
    let mut marked_stale = false;
    let mut superseded = false;
    let mut stale_timer = tokio::time::interval(heartbeat);
    stale_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame { code: CLOSE_NORMAL, reason: "shutting down".into() })))
                    .await;
                break;
            }

            // Registry channel -> agent.
            msg = channel_rx.recv() => {
                match msg {
                    Some(ChannelMsg::Frame(frame)) => {
                        if !send_frame(&mut ws_tx, &frame).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close { code, reason }) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        superseded = code == crate::wire::CLOSE_SUPERSEDED;
                        break;
                    }
                    None => break,
                }
            }

            // Agent -> server.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_text(&state, &agent_id, &text, &mut last_heartbeat).await;
                        marked_stale = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(agent_id, err = %e, "agent socket error");
                        break;
                    }
                    _ => {}
                }
            }

            // Two consecutive heartbeat misses demote to stale.
            _ = stale_timer.tick() => {
                if !marked_stale && last_heartbeat.elapsed() > heartbeat * 2 {
                    tracing::warn!(agent_id, "agent missed heartbeats, marking stale");
                    state.presence.mark_stale(&agent_id);
                    if let Err(e) = state.store.set_agent_connection(&agent_id, "stale", None) {
                        tracing::error!(agent_id, err = %e, "failed to persist stale status");
                    }
                    marked_stale = true;
                }
            }
        }
    }

    // Compare-and-remove: a superseding connection owns presence now.
    let removed = state.registry.remove(&agent_id, conn_id);
    if removed && !superseded {
        state.presence.mark_offline(&agent_id);
        if let Err(e) = state.store.set_agent_connection(&agent_id, "offline", Some(Utc::now())) {
            tracing::error!(agent_id, err = %e, "failed to persist offline status");
        }
        state.outbound.emit(OutboundEvent::DeviceStatus {
            user_id,
            agent_id: agent_id.clone(),
            name: agent_name,
            status: "offline".to_owned(),
        });
    }
    tracing::info!(agent_id, conn_id, superseded, "agent disconnected");
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &crate::wire::ServerFrame,
) -> bool {
    let Ok(json) = serde_json::to_string(frame) else {
        return true;
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Apply one agent frame. Unknown frame types are validation errors at the
/// boundary: logged, never forwarded.
async fn handle_agent_text(
    state: &AppState,
    agent_id: &str,
    text: &str,
    last_heartbeat: &mut Instant,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(agent_id, err = %e, "discarding non-JSON agent frame");
            return;
        }
    };
    let frame: AgentFrame = match serde_json::from_value(raw.clone()) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(agent_id, err = %e, "discarding unknown agent frame");
            return;
        }
    };

    match frame {
        AgentFrame::Heartbeat { capabilities, .. } => {
            *last_heartbeat = Instant::now();
            state.presence.heartbeat(agent_id, capabilities);
        }
        AgentFrame::TaskAck { task_id } => {
            if let Err(e) = routing::apply_ack(state, agent_id, &task_id) {
                tracing::warn!(agent_id, task_id, err = %e, "task.ack rejected");
            }
        }
        AgentFrame::TaskResult { task_id, results, signature } => {
            match routing::apply_result(state, agent_id, &task_id, &results, &raw, &signature) {
                Ok(()) => {}
                Err(e) if routing::is_duplicate_result(&e) => {
                    // At-least-once delivery: coalesce on task_id, first
                    // terminal result wins.
                    tracing::debug!(agent_id, task_id, "duplicate task.result dropped");
                }
                Err(e) => {
                    tracing::warn!(agent_id, task_id, err = %e, "task.result rejected");
                }
            }
        }
    }
}
