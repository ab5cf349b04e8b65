// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::artifacts::Presigner;
use crate::broker::{Broker, CreatedStream};
use crate::config::ServerConfig;
use crate::notify::Notifier;
use crate::outbound::Outbound;
use crate::presence::Presence;
use crate::registry::Registry;
use crate::risk::RiskPolicy;
use crate::store::Store;
use crate::transport::ratelimit::IpLimiter;
use crate::webhook::WebhookSender;

/// Shared control-plane state, constructed once at startup.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub presence: Arc<Presence>,
    pub registry: Registry,
    pub broker: Broker,
    pub risk: RiskPolicy,
    pub outbound: Outbound,
    pub limiter: IpLimiter,
    pub artifacts: Presigner,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the full state graph and the assigner's consumer stream.
    pub async fn new(
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> anyhow::Result<(Arc<Self>, CreatedStream)> {
        // Fail fast on a bad key set.
        config.active_agent_secret()?;

        let store = Arc::new(Store::open(&config.db_path)?);
        let presence = Arc::new(Presence::new(config.presence_ttl()));
        let (broker, created_stream) = Broker::connect(
            config.nats_url.as_deref(),
            config.nats_token.as_deref(),
            &config.nats_prefix,
        )
        .await?;
        let notifier = Arc::new(Notifier::new());
        let webhooks = Arc::new(WebhookSender::new()?);
        let outbound = Outbound::new(notifier, webhooks, Arc::clone(&store));
        let limiter = IpLimiter::new(
            config.ws_handshakes_per_window,
            std::time::Duration::from_secs(config.ws_window_secs),
            std::time::Duration::from_secs(config.ip_block_secs),
        );
        let artifacts = Presigner::new(&config);

        let state = Arc::new(Self {
            config,
            store,
            presence,
            registry: Registry::new(),
            broker,
            risk: RiskPolicy::new()?,
            outbound,
            limiter,
            artifacts,
            shutdown,
        });
        Ok((state, created_stream))
    }

    /// Secret for the active agent key. The key set was validated at
    /// startup, so the fallback is unreachable in practice.
    pub fn active_secret(&self) -> &str {
        self.config.active_agent_secret().unwrap_or("")
    }
}
