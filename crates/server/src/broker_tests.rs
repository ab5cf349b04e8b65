// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::wire::{Action, ActionKind};

fn event(task_id: &str, agent_id: &str) -> TaskCreated {
    TaskCreated {
        task_id: task_id.to_owned(),
        agent_id: agent_id.to_owned(),
        actions: vec![Action { action_id: "a1".to_owned(), kind: ActionKind::Noop }],
    }
}

#[tokio::test]
async fn local_broker_delivers_created_in_order() -> anyhow::Result<()> {
    let (broker, mut stream) = Broker::connect(None, None, "drover").await?;
    broker.publish_created(&event("t-1", "agent-1")).await?;
    broker.publish_created(&event("t-2", "agent-1")).await?;

    let first = stream.next().await;
    let second = stream.next().await;
    assert_eq!(first.map(|e| e.task_id), Some("t-1".to_owned()));
    assert_eq!(second.map(|e| e.task_id), Some("t-2".to_owned()));
    Ok(())
}

#[tokio::test]
async fn local_dlq_is_observable_and_counted() -> anyhow::Result<()> {
    let (broker, _stream) = Broker::connect(None, None, "drover").await?;
    let Some(mut dlq_rx) = broker.subscribe_dlq() else {
        anyhow::bail!("local broker must expose the DLQ");
    };

    broker.publish_dlq(&event("t-1", "agent-1")).await?;
    let dead = dlq_rx.recv().await?;
    assert_eq!(dead.task_id, "t-1");
    assert_eq!(broker.dlq_total(), 1);
    Ok(())
}

#[tokio::test]
async fn local_assigned_fans_out_to_subscribers() -> anyhow::Result<()> {
    let (broker, _stream) = Broker::connect(None, None, "drover").await?;
    let Some(mut assigned_rx) = broker.subscribe_assigned() else {
        anyhow::bail!("local broker must expose assignments");
    };

    broker
        .publish_assigned(&TaskAssigned {
            task_id: "t-1".to_owned(),
            agent_id: "agent-1".to_owned(),
            at: "2026-03-01T00:00:00Z".to_owned(),
        })
        .await?;
    let assigned = assigned_rx.recv().await?;
    assert_eq!(assigned.task_id, "t-1");
    Ok(())
}

#[tokio::test]
async fn assigned_without_subscribers_does_not_error() -> anyhow::Result<()> {
    let (broker, _stream) = Broker::connect(None, None, "drover").await?;
    broker
        .publish_assigned(&TaskAssigned {
            task_id: "t-1".to_owned(),
            agent_id: "agent-1".to_owned(),
            at: "2026-03-01T00:00:00Z".to_owned(),
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn created_event_round_trips_json() -> anyhow::Result<()> {
    let original = event("t-1", "agent-1");
    let bytes = serde_json::to_vec(&original)?;
    let back: TaskCreated = serde_json::from_slice(&bytes)?;
    assert_eq!(back, original);
    Ok(())
}
