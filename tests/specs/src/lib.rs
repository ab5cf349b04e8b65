// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end lifecycle tests.
//!
//! Spawns the real `droverd` binary as a subprocess and exercises it over
//! HTTP and the agent WebSocket channel.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// The agent signing secret every spec server is started with.
pub const AGENT_SECRET: &str = "spec-agent-secret";
/// Its key id.
pub const AGENT_KID: &str = "v1";

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `droverd` binary.
pub fn drover_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("droverd")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `droverd` process, killed on drop.
pub struct DroverProcess {
    child: Child,
    port: u16,
    _db_dir: tempfile::TempDir,
}

impl DroverProcess {
    /// Spawn droverd with fast timings for tests: 1 s scheduler tick and
    /// approval sweep, short assigner retries, rate limiting off.
    pub fn start() -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = drover_binary();
        anyhow::ensure!(binary.exists(), "droverd binary not found at {}", binary.display());

        let port = free_port()?;
        let db_dir = tempfile::tempdir()?;
        let db_path = db_dir.path().join("drover.db");

        let child = Command::new(&binary)
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--db-path",
                &db_path.to_string_lossy(),
                "--access-secret",
                "spec-access-secret",
                "--agent-keys",
                &format!("{AGENT_KID}={AGENT_SECRET}"),
                "--agent-active-kid",
                AGENT_KID,
                "--disable-rate-limiting",
                "--assign-retries",
                "3",
                "--assign-retry-ms",
                "100",
                "--scheduler-tick-secs",
                "1",
                "--approval-ttl-secs",
                "1",
                "--approval-sweep-secs",
                "1",
                "--debug-routes",
            ])
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, _db_dir: db_dir })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn agent_ws_url(&self, token: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/agent?token={token}", self.port)
    }

    /// Poll `/healthz` until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/healthz", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("droverd did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for DroverProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// -- API client helpers --------------------------------------------------------

/// Signed-up, logged-in user with one enrolled agent.
pub struct Session {
    pub http: reqwest::Client,
    pub base_url: String,
    pub access_token: String,
    pub agent_id: String,
    pub agent_token: String,
}

impl Session {
    /// Sign up, log in, and enroll one agent.
    pub async fn bootstrap(server: &DroverProcess, email: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::new();
        let base_url = server.base_url();

        let resp = http
            .post(format!("{base_url}/auth/signup"))
            .json(&serde_json::json!({ "email": email, "password": "Password1!" }))
            .send()
            .await?;
        anyhow::ensure!(resp.status().as_u16() == 201, "signup failed: {}", resp.status());

        let tokens: serde_json::Value = http
            .post(format!("{base_url}/auth/login"))
            .json(&serde_json::json!({ "email": email, "password": "Password1!" }))
            .send()
            .await?
            .json()
            .await?;
        let access_token = tokens["access_token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no access token"))?
            .to_owned();

        let enrolled: serde_json::Value = http
            .post(format!("{base_url}/devices/enroll"))
            .bearer_auth(&access_token)
            .json(&serde_json::json!({ "name": "laptop", "platform": "linux" }))
            .send()
            .await?
            .json()
            .await?;
        let agent_id = enrolled["agent_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no agent id"))?
            .to_owned();
        let agent_token = enrolled["agent_token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no agent token"))?
            .to_owned();

        Ok(Self { http, base_url, access_token, agent_id, agent_token })
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    pub async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        Ok(self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .json()
            .await?)
    }

    /// Poll a task until it reaches `status` or the timeout lapses.
    pub async fn wait_task_status(
        &self,
        task_id: &str,
        status: &str,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                let task = self.get_json(&format!("/tasks/{task_id}")).await?;
                anyhow::bail!("task never reached {status}; currently {}", task["status"]);
            }
            let task = self.get_json(&format!("/tasks/{task_id}")).await?;
            if task["status"] == status {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// -- Agent channel helpers -----------------------------------------------------

pub type AgentSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Open the agent channel and send an initial heartbeat.
pub async fn connect_agent(server: &DroverProcess, token: &str) -> anyhow::Result<AgentSocket> {
    let (mut ws, _) = tokio_tungstenite::connect_async(server.agent_ws_url(token)).await?;
    ws.send(Message::Text(
        serde_json::json!({ "type": "heartbeat", "capabilities": { "platform": "linux" } })
            .to_string()
            .into(),
    ))
    .await?;
    Ok(ws)
}

/// Read frames until a `task.exec` arrives, returning its JSON.
pub async fn next_exec_frame(
    ws: &mut AgentSocket,
    timeout: Duration,
) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("no task.exec frame within {timeout:?}"))?;
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("no task.exec frame within {timeout:?}"))?
            .ok_or_else(|| anyhow::anyhow!("agent channel closed"))??;
        if let Message::Text(text) = msg {
            let frame: serde_json::Value = serde_json::from_str(&text)?;
            if frame["type"] == "task.exec" {
                return Ok(frame);
            }
        }
    }
}

/// Expect no `task.exec` within the window.
pub async fn expect_no_exec_frame(ws: &mut AgentSocket, window: Duration) -> anyhow::Result<()> {
    match tokio::time::timeout(window, next_exec_frame(ws, window)).await {
        Err(_) => Ok(()),
        Ok(Err(_)) => Ok(()),
        Ok(Ok(frame)) => anyhow::bail!("unexpected task.exec: {frame}"),
    }
}

/// Send a signed `task.result` the way an agent would.
pub async fn send_result(
    ws: &mut AgentSocket,
    task_id: &str,
    results: serde_json::Value,
) -> anyhow::Result<()> {
    let mut frame = serde_json::json!({
        "type": "task.result",
        "task_id": task_id,
        "results": results,
    });
    let signature = drover::envelope::sign(AGENT_SECRET, &frame);
    frame["signature"] = serde_json::json!(signature);
    ws.send(Message::Text(frame.to_string().into())).await?;
    Ok(())
}
