// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Drover: a control plane brokering automation tasks between API callers
//! and a fleet of remote desktop agents.

pub mod approval;
pub mod artifacts;
pub mod assigner;
pub mod broker;
pub mod config;
pub mod cron;
pub mod envelope;
pub mod error;
pub mod notify;
pub mod outbound;
pub mod presence;
pub mod registry;
pub mod risk;
pub mod routing;
pub mod scheduler;
pub mod state;
pub mod store;
#[cfg(test)]
pub mod testutil;
pub mod token;
pub mod transport;
pub mod webhook;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::state::AppState;
use crate::transport::build_router;

/// Run the control plane until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let (state, created_stream) = AppState::new(config, shutdown.clone()).await?;

    // Background loops, all supervised by the shutdown token.
    presence::spawn_sweeper(Arc::clone(&state.presence), shutdown.clone());
    transport::ratelimit::spawn_limit_sweeper(Arc::clone(&state), shutdown.clone());
    assigner::spawn_assigner(Arc::clone(&state), created_stream, shutdown.clone());
    scheduler::spawn_scheduler(Arc::clone(&state), shutdown.clone());
    approval::spawn_expiry_sweeper(Arc::clone(&state), shutdown.clone());

    tracing::info!("drover listening on {addr}");
    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(err = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    }
}
