// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format types for the agent channel.
//!
//! Every frame is a JSON object with a `type` discriminator. Unknown frame
//! or action types fail deserialization at the boundary and are rejected as
//! validation errors rather than forwarded.

use serde::{Deserialize, Serialize};

/// WebSocket close code for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code when a newer connection superseded this one.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// WebSocket close code for authentication failures.
pub const CLOSE_AUTH: u16 = 4401;

// -- Actions -------------------------------------------------------------------

/// A single automation step inside a task.
///
/// `action_id` is caller-assigned and echoed back in the corresponding
/// [`ActionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub action_id: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// Typed action variants. The `params` object carries variant payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum ActionKind {
    /// Does nothing on the agent; used for connectivity checks.
    Noop,
    /// Run a shell command.
    Shell { command: String },
    /// Delete a file or directory.
    FileDelete { path: String },
    /// Fetch a URL.
    NetworkRequest { url: String },
    /// Capture the screen; the result carries an artifact URL.
    Screenshot,
    /// Type a text sequence into the focused window.
    UiInput { text: String },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Shell { .. } => "shell",
            Self::FileDelete { .. } => "file_delete",
            Self::NetworkRequest { .. } => "network_request",
            Self::Screenshot => "screenshot",
            Self::UiInput { .. } => "ui_input",
        }
    }
}

// -- Results -------------------------------------------------------------------

/// Terminal status of a single action, reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Done,
    Error,
}

/// Per-action outcome inside a `task.result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
}

// -- Server → agent frames -----------------------------------------------------

/// Frames pushed from the control plane to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Execute a task. Fields mirror the signed task envelope.
    #[serde(rename = "task.exec")]
    TaskExec {
        task_id: String,
        issued_at: String,
        actions: Vec<Action>,
        signature: String,
    },
    /// Drop an in-flight task.
    #[serde(rename = "task.cancel")]
    TaskCancel { task_id: String },
    /// The agent's token was revoked; the server closes shortly after.
    #[serde(rename = "token.revoked")]
    TokenRevoked,
}

// -- Agent → server frames -----------------------------------------------------

/// Frames received from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentFrame {
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        ts: Option<i64>,
        #[serde(default)]
        capabilities: serde_json::Map<String, serde_json::Value>,
    },
    /// Agent accepted a task; transitions it to `in_progress`.
    #[serde(rename = "task.ack")]
    TaskAck { task_id: String },
    /// Terminal result for a task. `signature` covers the frame minus itself.
    #[serde(rename = "task.result")]
    TaskResult {
        task_id: String,
        results: Vec<ActionResult>,
        signature: String,
    },
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
