// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn action_deserializes_with_nested_params() -> anyhow::Result<()> {
    let action: Action = serde_json::from_value(serde_json::json!({
        "action_id": "a1",
        "type": "shell",
        "params": { "command": "ls -la" }
    }))?;
    assert_eq!(action.action_id, "a1");
    assert_eq!(action.kind, ActionKind::Shell { command: "ls -la".to_owned() });
    Ok(())
}

#[test]
fn noop_action_needs_no_params() -> anyhow::Result<()> {
    let action: Action = serde_json::from_value(serde_json::json!({
        "action_id": "a1",
        "type": "noop"
    }))?;
    assert_eq!(action.kind, ActionKind::Noop);
    Ok(())
}

#[test]
fn unknown_action_type_is_rejected() {
    let result: Result<Action, _> = serde_json::from_value(serde_json::json!({
        "action_id": "a1",
        "type": "reboot_reactor",
        "params": {}
    }));
    assert!(result.is_err(), "unknown action types must fail at the boundary");
}

#[test]
fn server_frame_exec_round_trips_with_type_tag() -> anyhow::Result<()> {
    let frame = ServerFrame::TaskExec {
        task_id: "t-1".to_owned(),
        issued_at: "2026-03-01T12:00:00Z".to_owned(),
        actions: vec![Action { action_id: "a1".to_owned(), kind: ActionKind::Noop }],
        signature: "abc123".to_owned(),
    };
    let json = serde_json::to_value(&frame)?;
    assert_eq!(json["type"], "task.exec");
    let back: ServerFrame = serde_json::from_value(json)?;
    assert_eq!(back, frame);
    Ok(())
}

#[test]
fn token_revoked_frame_is_bare() -> anyhow::Result<()> {
    let json = serde_json::to_value(ServerFrame::TokenRevoked)?;
    assert_eq!(json, serde_json::json!({ "type": "token.revoked" }));
    Ok(())
}

#[test]
fn agent_heartbeat_tolerates_missing_fields() -> anyhow::Result<()> {
    let frame: AgentFrame = serde_json::from_value(serde_json::json!({ "type": "heartbeat" }))?;
    match frame {
        AgentFrame::Heartbeat { ts, capabilities } => {
            assert!(ts.is_none());
            assert!(capabilities.is_empty());
        }
        other => anyhow::bail!("expected Heartbeat, got {other:?}"),
    }
    Ok(())
}

#[test]
fn task_result_parses_action_results() -> anyhow::Result<()> {
    let frame: AgentFrame = serde_json::from_value(serde_json::json!({
        "type": "task.result",
        "task_id": "t-9",
        "results": [
            { "action_id": "a1", "status": "done" },
            { "action_id": "a2", "status": "error", "error": "no such file" }
        ],
        "signature": "feed"
    }))?;
    match frame {
        AgentFrame::TaskResult { task_id, results, .. } => {
            assert_eq!(task_id, "t-9");
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].status, ResultStatus::Done);
            assert_eq!(results[1].status, ResultStatus::Error);
            assert_eq!(results[1].error.as_deref(), Some("no such file"));
        }
        other => anyhow::bail!("expected TaskResult, got {other:?}"),
    }
    Ok(())
}

#[test]
fn unknown_frame_type_is_rejected() {
    let result: Result<AgentFrame, _> =
        serde_json::from_value(serde_json::json!({ "type": "task.teleport" }));
    assert!(result.is_err());
}
