// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end lifecycle tests: task delivery, risk gating, approvals,
//! dead-lettering, connection supersede, and scheduled execution.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use drover_specs::{
    connect_agent, expect_no_exec_frame, next_exec_frame, send_result, DroverProcess, Session,
    AGENT_SECRET,
};

const TIMEOUT: Duration = Duration::from_secs(10);

// -- Happy path ---------------------------------------------------------------

#[tokio::test]
async fn task_executes_end_to_end() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;
    let mut agent = connect_agent(&server, &session.agent_token).await?;

    let (status, task) = session
        .post_json(
            "/tasks",
            &serde_json::json!({
                "agent_id": session.agent_id,
                "actions": [{ "action_id": "a1", "type": "noop" }],
            }),
        )
        .await?;
    anyhow::ensure!(status == 201, "create returned {status}: {task}");
    let task_id = task["id"].as_str().unwrap_or_default().to_owned();
    assert_eq!(task["status"], "queued");

    // The agent receives a signed exec envelope for exactly this task.
    let frame = next_exec_frame(&mut agent, TIMEOUT).await?;
    assert_eq!(frame["task_id"], task_id.as_str());
    let signature = frame["signature"].as_str().unwrap_or_default();
    assert!(drover::envelope::verify(AGENT_SECRET, &frame, signature));
    assert_eq!(frame["actions"][0]["type"], "noop");

    // Ack, then report success.
    agent
        .send(Message::Text(
            serde_json::json!({ "type": "task.ack", "task_id": task_id }).to_string().into(),
        ))
        .await?;
    session.wait_task_status(&task_id, "in_progress", TIMEOUT).await?;

    send_result(
        &mut agent,
        &task_id,
        serde_json::json!([{ "action_id": "a1", "status": "done" }]),
    )
    .await?;
    session.wait_task_status(&task_id, "completed", TIMEOUT).await?;
    Ok(())
}

// -- Risk gating --------------------------------------------------------------

#[tokio::test]
async fn critical_task_is_blocked_and_never_delivered() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;
    let mut agent = connect_agent(&server, &session.agent_token).await?;

    let (status, body) = session
        .post_json(
            "/tasks",
            &serde_json::json!({
                "agent_id": session.agent_id,
                "actions": [
                    { "action_id": "a1", "type": "shell", "params": { "command": "rm -rf /" } }
                ],
            }),
        )
        .await?;
    assert_eq!(status, 403);
    assert!(body["error"]["message"].as_str().is_some_and(|m| m.contains("critical")));

    // Nothing was persisted and nothing reaches the agent.
    let tasks = session.get_json("/tasks").await?;
    assert_eq!(tasks.as_array().map(Vec::len), Some(0));
    expect_no_exec_frame(&mut agent, Duration::from_secs(2)).await?;
    Ok(())
}

#[tokio::test]
async fn approval_round_trip() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;
    let mut agent = connect_agent(&server, &session.agent_token).await?;

    let shell_task = serde_json::json!({
        "agent_id": session.agent_id,
        "actions": [{ "action_id": "a1", "type": "shell", "params": { "command": "ls" } }],
    });

    // Reject path: parked, then cancelled, never delivered.
    let (status, rejected) = session.post_json("/tasks", &shell_task).await?;
    assert_eq!(status, 201);
    assert_eq!(rejected["status"], "awaiting_confirmation");
    let rejected_id = rejected["id"].as_str().unwrap_or_default().to_owned();
    let (status, _) =
        session.post_json(&format!("/approvals/{rejected_id}/reject"), &serde_json::json!({})).await?;
    assert_eq!(status, 200);
    session.wait_task_status(&rejected_id, "cancelled", TIMEOUT).await?;
    expect_no_exec_frame(&mut agent, Duration::from_secs(2)).await?;

    // Approve path: queued, assigned, delivered with the same task id.
    let (_, approved) = session.post_json("/tasks", &shell_task).await?;
    let approved_id = approved["id"].as_str().unwrap_or_default().to_owned();
    let (status, _) = session
        .post_json(&format!("/approvals/{approved_id}/approve"), &serde_json::json!({}))
        .await?;
    assert_eq!(status, 200);

    let frame = next_exec_frame(&mut agent, TIMEOUT).await?;
    assert_eq!(frame["task_id"], approved_id.as_str());
    session.wait_task_status(&approved_id, "assigned", TIMEOUT).await?;
    Ok(())
}

#[tokio::test]
async fn unapproved_task_auto_cancels_after_ttl() -> anyhow::Result<()> {
    // Server runs with a 1 s approval TTL and sweep.
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;

    let (_, task) = session
        .post_json(
            "/tasks",
            &serde_json::json!({
                "agent_id": session.agent_id,
                "actions": [{ "action_id": "a1", "type": "shell", "params": { "command": "ls" } }],
            }),
        )
        .await?;
    let task_id = task["id"].as_str().unwrap_or_default().to_owned();
    assert_eq!(task["status"], "awaiting_confirmation");

    session.wait_task_status(&task_id, "cancelled", TIMEOUT).await?;
    Ok(())
}

// -- Offline agent ------------------------------------------------------------

#[tokio::test]
async fn offline_agent_leaves_task_queued() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;
    // No agent channel opened.

    let (status, task) = session
        .post_json(
            "/tasks",
            &serde_json::json!({
                "agent_id": session.agent_id,
                "actions": [{ "action_id": "a1", "type": "noop" }],
            }),
        )
        .await?;
    assert_eq!(status, 201);
    let task_id = task["id"].as_str().unwrap_or_default().to_owned();

    // Give the assigner time to exhaust retries and dead-letter.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let task = session.get_json(&format!("/tasks/{task_id}")).await?;
    assert_eq!(task["status"], "queued", "undeliverable task stays queued");

    let queues = session.get_json("/debug/queues").await?;
    assert!(queues["dlq_total"].as_u64().is_some_and(|n| n >= 1), "event dead-lettered");
    Ok(())
}

// -- Duplicate connect --------------------------------------------------------

#[tokio::test]
async fn second_connection_supersedes_first() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;

    let mut first = connect_agent(&server, &session.agent_token).await?;
    let mut second = connect_agent(&server, &session.agent_token).await?;

    // First channel is closed with the superseded code.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let code = loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("first channel never closed"))?;
        match tokio::time::timeout(remaining, first.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => break u16::from(frame.code),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => anyhow::bail!("first channel ended without close"),
            Err(_) => anyhow::bail!("first channel never closed"),
        }
    };
    assert_eq!(code, 4000);

    // Subsequent exec frames arrive only on the second channel.
    let (_, task) = session
        .post_json(
            "/tasks",
            &serde_json::json!({
                "agent_id": session.agent_id,
                "actions": [{ "action_id": "a1", "type": "noop" }],
            }),
        )
        .await?;
    let task_id = task["id"].as_str().unwrap_or_default().to_owned();
    let frame = next_exec_frame(&mut second, TIMEOUT).await?;
    assert_eq!(frame["task_id"], task_id.as_str());
    Ok(())
}

// -- Scheduled execution ------------------------------------------------------

#[tokio::test]
async fn scheduled_definition_mints_and_delivers() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;
    let mut agent = connect_agent(&server, &session.agent_token).await?;

    let (status, schedule) = session
        .post_json(
            "/scheduled-tasks",
            &serde_json::json!({
                "agent_id": session.agent_id,
                "name": "probe",
                "cron_expression": "*/5 * * * *",
                "actions": [{ "action_id": "a1", "type": "noop" }],
            }),
        )
        .await?;
    assert_eq!(status, 201);
    let schedule_id = schedule["id"].as_str().unwrap_or_default().to_owned();

    // Pull next_run back so the 1 s tick fires now instead of at the next
    // five-minute boundary.
    let resp = session
        .http
        .patch(format!("{}/scheduled-tasks/{schedule_id}", session.base_url))
        .bearer_auth(&session.access_token)
        .json(&serde_json::json!({ "run_now": true }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success());

    // The agent receives the exec envelope for the minted task.
    let frame = next_exec_frame(&mut agent, TIMEOUT).await?;
    let task_id = frame["task_id"].as_str().unwrap_or_default().to_owned();
    assert!(!task_id.is_empty());

    // Bookkeeping advanced: one run counted, next_run pushed to the future.
    let updated = session.get_json(&format!("/scheduled-tasks/{schedule_id}")).await?;
    assert_eq!(updated["run_count"], 1);
    assert!(updated["last_run"].as_str().is_some());
    assert!(updated["next_run"].as_str().is_some());

    // And the minted task is a normal task owned by the user.
    let task = session.get_json(&format!("/tasks/{task_id}")).await?;
    assert_eq!(task["payload"]["scheduled_task_id"], schedule_id.as_str());
    Ok(())
}
