// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the drover control plane.
#[derive(Debug, Clone, clap::Args)]
pub struct ServerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "DROVER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9400, env = "DROVER_PORT")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "drover.db", env = "DROVER_DB_PATH")]
    pub db_path: std::path::PathBuf,

    /// NATS server URL. If unset, an in-process queue stands in for the broker.
    #[arg(long, env = "DROVER_NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS auth token.
    #[arg(long, env = "DROVER_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// Subject prefix for broker topics.
    #[arg(long, default_value = "drover", env = "DROVER_NATS_PREFIX")]
    pub nats_prefix: String,

    /// Secret for signing user access tokens.
    #[arg(long, env = "DROVER_ACCESS_SECRET")]
    pub access_secret: String,

    /// Access token lifetime in minutes.
    #[arg(long, default_value_t = 15, env = "DROVER_ACCESS_TOKEN_MINUTES")]
    pub access_token_minutes: u64,

    /// Refresh token lifetime in days.
    #[arg(long, default_value_t = 30, env = "DROVER_REFRESH_TOKEN_DAYS")]
    pub refresh_token_days: u64,

    /// Agent signing keys as `kid=secret[,kid=secret...]`.
    #[arg(long, env = "DROVER_AGENT_KEYS", value_parser = parse_key_set)]
    pub agent_keys: KeySet,

    /// Key id used for newly minted agent tokens and envelope signatures.
    #[arg(long, env = "DROVER_AGENT_ACTIVE_KID")]
    pub agent_active_kid: String,

    /// Agent token lifetime in hours.
    #[arg(long, default_value_t = 24, env = "DROVER_AGENT_TOKEN_HOURS")]
    pub agent_token_hours: u64,

    /// Allowed CORS origins, comma-separated, or `*`.
    #[arg(long, default_value = "*", env = "DROVER_ALLOWED_ORIGINS")]
    pub allowed_origins: String,

    /// Disable login rate limiting and account lockout (dev only).
    #[arg(long, default_value_t = false, env = "DROVER_DISABLE_RATE_LIMITING")]
    pub disable_rate_limiting: bool,

    /// Max login attempts per minute per IP and per email.
    #[arg(long, default_value_t = 30, env = "DROVER_LOGIN_PER_MINUTE")]
    pub login_per_minute: u32,

    /// Consecutive login failures before an account is locked.
    #[arg(long, default_value_t = 5, env = "DROVER_LOCKOUT_THRESHOLD")]
    pub lockout_threshold: u32,

    /// Account lock duration in minutes.
    #[arg(long, default_value_t = 15, env = "DROVER_LOCKOUT_MINUTES")]
    pub lockout_minutes: u64,

    /// Agent channel handshakes allowed per IP per window.
    #[arg(long, default_value_t = 20, env = "DROVER_WS_HANDSHAKES_PER_WINDOW")]
    pub ws_handshakes_per_window: u32,

    /// Handshake rate-limit window in seconds.
    #[arg(long, default_value_t = 60, env = "DROVER_WS_WINDOW_SECS")]
    pub ws_window_secs: u64,

    /// IP block cool-off after a handshake-rate breach, in seconds.
    #[arg(long, default_value_t = 300, env = "DROVER_IP_BLOCK_SECS")]
    pub ip_block_secs: u64,

    /// Expected agent heartbeat interval in seconds.
    #[arg(long, default_value_t = 30, env = "DROVER_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// Presence TTL in seconds; heartbeats refresh it.
    #[arg(long, default_value_t = 120, env = "DROVER_PRESENCE_TTL_SECS")]
    pub presence_ttl_secs: u64,

    /// How long a task may sit awaiting approval before auto-cancel, in seconds.
    #[arg(long, default_value_t = 3600, env = "DROVER_APPROVAL_TTL_SECS")]
    pub approval_ttl_secs: u64,

    /// Approval expiry sweep interval in seconds.
    #[arg(long, default_value_t = 600, env = "DROVER_APPROVAL_SWEEP_SECS")]
    pub approval_sweep_secs: u64,

    /// Scheduler tick interval in seconds.
    #[arg(long, default_value_t = 60, env = "DROVER_SCHEDULER_TICK_SECS")]
    pub scheduler_tick_secs: u64,

    /// Delivery attempts before an undeliverable task is dead-lettered.
    #[arg(long, default_value_t = 3, env = "DROVER_ASSIGN_RETRIES")]
    pub assign_retries: u32,

    /// Delay between delivery attempts in milliseconds.
    #[arg(long, default_value_t = 1000, env = "DROVER_ASSIGN_RETRY_MS")]
    pub assign_retry_ms: u64,

    /// Deadline for pushing a frame into an agent channel, in milliseconds.
    #[arg(long, default_value_t = 2000, env = "DROVER_SEND_DEADLINE_MS")]
    pub send_deadline_ms: u64,

    /// Artifact store endpoint (S3-compatible). If unset, presign returns
    /// locally signed upload URLs.
    #[arg(long, env = "DROVER_ARTIFACTS_ENDPOINT")]
    pub artifacts_endpoint: Option<String>,

    /// Artifact store access key.
    #[arg(long, env = "DROVER_ARTIFACTS_ACCESS_KEY")]
    pub artifacts_access_key: Option<String>,

    /// Artifact store secret key.
    #[arg(long, env = "DROVER_ARTIFACTS_SECRET_KEY")]
    pub artifacts_secret_key: Option<String>,

    /// Artifact bucket name.
    #[arg(long, env = "DROVER_ARTIFACTS_BUCKET")]
    pub artifacts_bucket: Option<String>,

    /// Expose debug routes.
    #[arg(long, default_value_t = false, env = "DROVER_DEBUG_ROUTES")]
    pub debug_routes: bool,
}

impl ServerConfig {
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn approval_ttl(&self) -> Duration {
        Duration::from_secs(self.approval_ttl_secs)
    }

    pub fn send_deadline(&self) -> Duration {
        Duration::from_millis(self.send_deadline_ms)
    }

    pub fn assign_retry_delay(&self) -> Duration {
        Duration::from_millis(self.assign_retry_ms)
    }

    /// Secret for the active agent key id. Validated at startup.
    pub fn active_agent_secret(&self) -> anyhow::Result<&str> {
        self.agent_keys
            .get(&self.agent_active_kid)
            .ok_or_else(|| anyhow::anyhow!("active kid {} not in agent key set", self.agent_active_kid))
    }

    pub fn origins(&self) -> Vec<String> {
        let raw = self.allowed_origins.trim();
        if raw.is_empty() || raw == "*" {
            return vec!["*".to_owned()];
        }
        raw.split(',').map(|o| o.trim().to_owned()).filter(|o| !o.is_empty()).collect()
    }
}

/// Agent signing keys indexed by key id.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, String>,
}

impl KeySet {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn get(&self, kid: &str) -> Option<&str> {
        self.keys.get(kid).map(String::as_str)
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }
}

/// Parse `kid=secret[,kid=secret...]` into a [`KeySet`].
fn parse_key_set(raw: &str) -> Result<KeySet, String> {
    let mut keys = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (kid, secret) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected kid=secret, got `{pair}`"))?;
        if kid.is_empty() || secret.is_empty() {
            return Err(format!("empty kid or secret in `{pair}`"));
        }
        keys.insert(kid.trim().to_owned(), secret.trim().to_owned());
    }
    if keys.is_empty() {
        return Err("agent key set is empty".to_owned());
    }
    Ok(KeySet { keys })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
