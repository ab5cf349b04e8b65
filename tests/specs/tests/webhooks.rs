// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Webhook fan-out: signed, delivered on task completion.

use std::time::Duration;

use drover_specs::{connect_agent, next_exec_frame, send_result, DroverProcess, Session};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal capturing HTTP receiver for webhook deliveries.
async fn spawn_receiver(
) -> anyhow::Result<(String, tokio::sync::mpsc::Receiver<(String, Option<String>)>)> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = tokio::sync::mpsc::channel(8);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                // Read until the full body arrived (Content-Length framed).
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else { return };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf);
                    if let Some((head, body)) = text.split_once("\r\n\r\n") {
                        // Header names may arrive in any case.
                        let header = |name: &str| {
                            head.lines().find_map(|l| {
                                let (key, value) = l.split_once(':')?;
                                key.eq_ignore_ascii_case(name).then(|| value.trim().to_owned())
                            })
                        };
                        let content_length = header("content-length")
                            .and_then(|v| v.parse::<usize>().ok())
                            .unwrap_or(0);
                        if body.len() >= content_length {
                            let signature = header("x-webhook-signature");
                            let _ = tx.send((body[..content_length].to_owned(), signature)).await;
                            let _ = stream
                                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                                .await;
                            return;
                        }
                    }
                }
            });
        }
    });

    Ok((format!("http://{addr}/hook"), rx))
}

#[tokio::test]
async fn task_completion_delivers_signed_webhook() -> anyhow::Result<()> {
    let server = DroverProcess::start()?;
    server.wait_healthy(TIMEOUT).await?;
    let session = Session::bootstrap(&server, "a@x.com").await?;
    let (hook_url, mut deliveries) = spawn_receiver().await?;

    let (status, _) = session
        .post_json(
            "/webhooks",
            &serde_json::json!({
                "name": "ci",
                "url": hook_url,
                "secret": "hook-secret",
                "events": ["task.completed"],
            }),
        )
        .await?;
    assert_eq!(status, 201);

    // Drive a task to completion.
    let mut agent = connect_agent(&server, &session.agent_token).await?;
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
    next_exec_frame(&mut agent, TIMEOUT).await?;
    send_result(
        &mut agent,
        &task_id,
        serde_json::json!([{ "action_id": "a1", "status": "done" }]),
    )
    .await?;
    session.wait_task_status(&task_id, "completed", TIMEOUT).await?;

    // The webhook arrives with a verifiable signature over the exact body.
    let (body, signature) = tokio::time::timeout(TIMEOUT, deliveries.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no webhook delivery"))?
        .ok_or_else(|| anyhow::anyhow!("receiver closed"))?;

    let payload: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(payload["event"], "task.completed");
    assert_eq!(payload["data"]["task_id"], task_id.as_str());
    assert!(payload["timestamp"].as_str().is_some());

    let signature = signature.ok_or_else(|| anyhow::anyhow!("missing signature header"))?;
    let expected = {
        use drover::webhook::WebhookSender;
        WebhookSender::signature("hook-secret", &body)
    };
    assert_eq!(signature, expected);
    Ok(())
}
