// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the control plane.

pub mod auth;
pub mod http;
pub mod http_sched;
pub mod ratelimit;
pub mod ws_agent;
pub mod ws_user;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum `Router` with all control-plane routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);

    let mut router = Router::new()
        // Health (no auth)
        .route("/healthz", get(http::healthz))
        // Auth
        .route("/auth/signup", post(http::signup))
        .route("/auth/login", post(http::login))
        .route("/auth/refresh", post(http::refresh))
        .route("/auth/logout", post(http::logout))
        // Devices
        .route("/devices/enroll", post(http::enroll_device))
        .route("/devices", get(http::list_devices))
        .route("/devices/{id}", get(http::get_device))
        .route("/devices/{id}/token/refresh", post(http::refresh_device_token))
        .route("/devices/{id}/revoke", post(http::revoke_device))
        // Tasks
        .route("/tasks", post(http::create_task).get(http::list_tasks))
        .route("/tasks/{id}", get(http::get_task))
        .route("/tasks/{id}/cancel", post(http::cancel_task))
        // Approvals
        .route("/approvals", get(http::list_approvals))
        .route("/approvals/{task_id}/approve", post(http::approve_task))
        .route("/approvals/{task_id}/reject", post(http::reject_task))
        // Scheduled tasks
        .route(
            "/scheduled-tasks",
            post(http_sched::create_schedule).get(http_sched::list_schedules),
        )
        .route(
            "/scheduled-tasks/{id}",
            get(http_sched::get_schedule)
                .patch(http_sched::update_schedule)
                .delete(http_sched::delete_schedule),
        )
        // Webhooks
        .route("/webhooks", post(http_sched::create_webhook).get(http_sched::list_webhooks))
        .route("/webhooks/{id}", delete(http_sched::delete_webhook))
        // Artifacts
        .route("/artifacts/presign", post(http::presign_artifact))
        // Agent channel + notification stream
        .route("/ws/agent", get(ws_agent::ws_agent_handler))
        .route("/ws/notifications", get(ws_user::ws_user_handler));

    if state.config.debug_routes {
        router = router.route("/debug/queues", get(http::debug_queues));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), ratelimit::ip_block_layer))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.config.origins();
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> =
        origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
