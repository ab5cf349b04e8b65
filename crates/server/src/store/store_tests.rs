// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{Duration, Utc};

use super::tasks::{TaskPayload, TaskStatus};
use super::users::{hash_password, verify_password};
use super::{IdempotencyOutcome, Store};
use crate::error::ErrorKind;
use crate::risk::{RiskAnalysis, RiskLevel};
use crate::wire::{Action, ActionKind, ActionResult, ResultStatus};

fn store() -> anyhow::Result<Store> {
    Ok(Store::open_in_memory()?)
}

fn seed_user(store: &Store) -> anyhow::Result<String> {
    let email = format!("{}@x.com", uuid::Uuid::new_v4().simple());
    Ok(store.create_user(&email, &hash_password("Password1!"))?.id)
}

fn seed_agent(store: &Store, user_id: &str) -> anyhow::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    Ok(store.create_agent(&id, user_id, "laptop", "linux", &serde_json::json!({}))?.id)
}

fn payload() -> TaskPayload {
    TaskPayload {
        actions: vec![Action { action_id: "a1".to_owned(), kind: ActionKind::Noop }],
        risk_analysis: RiskAnalysis {
            level: RiskLevel::Low,
            reasons: vec![],
            requires_approval: false,
        },
        scheduled_task_id: None,
        results: None,
    }
}

fn seed_task(store: &Store, status: TaskStatus) -> anyhow::Result<String> {
    let user_id = seed_user(store)?;
    let agent_id = seed_agent(store, &user_id)?;
    let id = uuid::Uuid::new_v4().to_string();
    let task = store.insert_task(&id, &user_id, &agent_id, "t", "", &payload(), status)?;
    Ok(task.id)
}

// ── Users ─────────────────────────────────────────────────────────────────

#[test]
fn duplicate_email_conflicts() -> anyhow::Result<()> {
    let s = store()?;
    s.create_user("a@x.com", &hash_password("Password1!"))?;
    let err = s.create_user("a@x.com", "whatever");
    assert!(matches!(err, Err(e) if e.kind == ErrorKind::Conflict));
    Ok(())
}

#[test]
fn user_round_trips_by_id_and_email() -> anyhow::Result<()> {
    let s = store()?;
    let id = s.create_user("a@x.com", &hash_password("Password1!"))?.id;
    let Some(by_id) = s.get_user(&id)? else { anyhow::bail!("missing by id") };
    assert_eq!(by_id.email, "a@x.com");
    assert!(!by_id.is_admin);
    assert!(by_id.is_active);
    let Some(by_email) = s.get_user_by_email("a@x.com")? else {
        anyhow::bail!("missing by email")
    };
    assert_eq!(by_email.id, id);
    Ok(())
}

#[test]
fn password_hash_verifies_and_rejects() {
    let hashed = hash_password("Password1!");
    assert!(verify_password("Password1!", &hashed));
    assert!(!verify_password("password1!", &hashed));
    assert!(!verify_password("Password1!", "garbage"));
    // Salted: two hashes of the same password differ.
    assert_ne!(hashed, hash_password("Password1!"));
}

#[test]
fn refresh_token_lifecycle() -> anyhow::Result<()> {
    let s = store()?;
    let user_id = seed_user(&s)?;
    s.insert_refresh_token(&user_id, "hash-1")?;
    let Some(row) = s.get_refresh_token("hash-1")? else { anyhow::bail!("missing") };
    assert!(!row.revoked);
    assert_eq!(row.user_id, user_id);

    s.revoke_refresh_token("hash-1", Some("hash-2"))?;
    let Some(row) = s.get_refresh_token("hash-1")? else { anyhow::bail!("missing") };
    assert!(row.revoked);
    Ok(())
}

// ── Task state machine ────────────────────────────────────────────────────

#[test]
fn happy_path_transitions() -> anyhow::Result<()> {
    let s = store()?;
    let id = seed_task(&s, TaskStatus::Created)?;
    s.transition_task(&id, TaskStatus::Created, TaskStatus::Queued)?;
    s.transition_task(&id, TaskStatus::Queued, TaskStatus::Assigned)?;
    s.transition_task(&id, TaskStatus::Assigned, TaskStatus::InProgress)?;
    s.transition_task(&id, TaskStatus::InProgress, TaskStatus::Completed)?;
    let Some(task) = s.get_task(&id)? else { anyhow::bail!("missing") };
    assert_eq!(task.status, TaskStatus::Completed);
    Ok(())
}

#[test]
fn illegal_transition_is_conflict() -> anyhow::Result<()> {
    let s = store()?;
    let id = seed_task(&s, TaskStatus::Created)?;
    let err = s.transition_task(&id, TaskStatus::Created, TaskStatus::Completed);
    assert!(matches!(err, Err(e) if e.kind == ErrorKind::Conflict));
    Ok(())
}

#[test]
fn stale_expected_state_is_conflict() -> anyhow::Result<()> {
    let s = store()?;
    let id = seed_task(&s, TaskStatus::Queued)?;
    s.transition_task(&id, TaskStatus::Queued, TaskStatus::Assigned)?;
    // A duplicate `task.created` event retries the same transition.
    let err = s.transition_task(&id, TaskStatus::Queued, TaskStatus::Assigned);
    assert!(matches!(err, Err(e) if e.kind == ErrorKind::Conflict));
    Ok(())
}

#[test]
fn transition_on_missing_task_is_not_found() -> anyhow::Result<()> {
    let s = store()?;
    let err = s.transition_task("ghost", TaskStatus::Queued, TaskStatus::Assigned);
    assert!(matches!(err, Err(e) if e.kind == ErrorKind::NotFound));
    Ok(())
}

#[test]
fn cancel_from_any_non_terminal_state() -> anyhow::Result<()> {
    let s = store()?;
    for status in [
        TaskStatus::Created,
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::AwaitingConfirmation,
    ] {
        let id = seed_task(&s, status)?;
        let was = s.cancel_task(&id)?;
        assert_eq!(was, status);
        let Some(task) = s.get_task(&id)? else { anyhow::bail!("missing") };
        assert_eq!(task.status, TaskStatus::Cancelled);
    }
    Ok(())
}

#[test]
fn cancel_terminal_task_is_conflict() -> anyhow::Result<()> {
    let s = store()?;
    let id = seed_task(&s, TaskStatus::Completed)?;
    let err = s.cancel_task(&id);
    assert!(matches!(err, Err(e) if e.kind == ErrorKind::Conflict));
    Ok(())
}

#[test]
fn results_recorded_without_status_change() -> anyhow::Result<()> {
    let s = store()?;
    let id = seed_task(&s, TaskStatus::Cancelled)?;
    let results = vec![ActionResult {
        action_id: "a1".to_owned(),
        status: ResultStatus::Done,
        output: None,
        error: None,
        artifact_url: None,
    }];
    s.record_task_results(&id, &results)?;
    let Some(task) = s.get_task(&id)? else { anyhow::bail!("missing") };
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.payload.results.as_deref(), Some(results.as_slice()));
    Ok(())
}

#[test]
fn expired_approvals_respect_cutoff() -> anyhow::Result<()> {
    let s = store()?;
    let id = seed_task(&s, TaskStatus::AwaitingConfirmation)?;
    assert!(s.expired_approvals(Utc::now() - Duration::hours(1))?.is_empty());
    let expired = s.expired_approvals(Utc::now() + Duration::seconds(1))?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, id);
    Ok(())
}

// ── Idempotency ───────────────────────────────────────────────────────────

#[test]
fn first_claim_wins_and_replays_return_existing() -> anyhow::Result<()> {
    let s = store()?;
    let outcome = s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-1", "hash-a")?;
    assert_eq!(outcome, IdempotencyOutcome::Claimed);

    let replay = s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-other", "hash-a")?;
    assert_eq!(replay, IdempotencyOutcome::Existing("t-1".to_owned()));
    Ok(())
}

#[test]
fn same_key_different_body_is_mismatch() -> anyhow::Result<()> {
    let s = store()?;
    s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-1", "hash-a")?;
    let outcome = s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-2", "hash-b")?;
    assert_eq!(outcome, IdempotencyOutcome::BodyMismatch);
    Ok(())
}

#[test]
fn idempotency_scoped_to_user_and_endpoint() -> anyhow::Result<()> {
    let s = store()?;
    s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-1", "hash-a")?;
    // Same key under a different user or endpoint claims independently.
    let other_user = s.claim_idempotency("u2", "/tasks", "key-1", "task", "t-2", "hash-a")?;
    assert_eq!(other_user, IdempotencyOutcome::Claimed);
    let other_endpoint =
        s.claim_idempotency("u1", "/devices/enroll", "key-1", "device", "d-1", "hash-a")?;
    assert_eq!(other_endpoint, IdempotencyOutcome::Claimed);
    Ok(())
}

#[test]
fn find_idempotent_sees_prior_claim() -> anyhow::Result<()> {
    let s = store()?;
    assert_eq!(s.find_idempotent("u1", "/tasks", "key-1", "hash-a")?, None);
    s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-1", "hash-a")?;
    assert_eq!(
        s.find_idempotent("u1", "/tasks", "key-1", "hash-a")?,
        Some(IdempotencyOutcome::Existing("t-1".to_owned()))
    );
    assert_eq!(
        s.find_idempotent("u1", "/tasks", "key-1", "hash-b")?,
        Some(IdempotencyOutcome::BodyMismatch)
    );
    Ok(())
}

#[test]
fn prune_drops_old_keys() -> anyhow::Result<()> {
    let s = store()?;
    s.claim_idempotency("u1", "/tasks", "key-1", "task", "t-1", "hash-a")?;
    assert_eq!(s.prune_idempotency(Utc::now() - Duration::hours(24))?, 0);
    assert_eq!(s.prune_idempotency(Utc::now() + Duration::seconds(1))?, 1);
    Ok(())
}

// ── Schedules ─────────────────────────────────────────────────────────────

#[test]
fn due_schedules_selects_elapsed_and_null() -> anyhow::Result<()> {
    let s = store()?;
    let user_id = seed_user(&s)?;
    let agent_id = seed_agent(&s, &user_id)?;
    let actions = vec![Action { action_id: "a1".to_owned(), kind: ActionKind::Noop }];
    let now = Utc::now();

    let past =
        s.create_schedule(&user_id, &agent_id, "past", "* * * * *", &actions, true, Some(now - Duration::minutes(5)))?;
    let null_run =
        s.create_schedule(&user_id, &agent_id, "null", "* * * * *", &actions, true, None)?;
    let future =
        s.create_schedule(&user_id, &agent_id, "future", "* * * * *", &actions, true, Some(now + Duration::minutes(5)))?;
    let inactive =
        s.create_schedule(&user_id, &agent_id, "off", "* * * * *", &actions, false, Some(now - Duration::minutes(5)))?;

    let due: Vec<String> = s.due_schedules(now)?.into_iter().map(|r| r.id).collect();
    assert!(due.contains(&past.id));
    assert!(due.contains(&null_run.id));
    assert!(!due.contains(&future.id));
    assert!(!due.contains(&inactive.id));
    Ok(())
}

#[test]
fn mark_run_bumps_count_and_advances() -> anyhow::Result<()> {
    let s = store()?;
    let user_id = seed_user(&s)?;
    let agent_id = seed_agent(&s, &user_id)?;
    let actions = vec![Action { action_id: "a1".to_owned(), kind: ActionKind::Noop }];
    let row = s.create_schedule(&user_id, &agent_id, "s", "*/5 * * * *", &actions, true, None)?;

    let now = Utc::now();
    let next = now + Duration::minutes(5);
    s.mark_schedule_run(&row.id, now, Some(next))?;

    let Some(updated) = s.get_schedule(&row.id, &user_id)? else { anyhow::bail!("missing") };
    assert_eq!(updated.run_count, 1);
    assert!(updated.last_run.is_some());
    let Some(next_run) = updated.next_run else { anyhow::bail!("next_run unset") };
    assert!(next_run > now);
    Ok(())
}

// ── Webhooks ──────────────────────────────────────────────────────────────

#[test]
fn webhook_event_matching() -> anyhow::Result<()> {
    let s = store()?;
    let user_id = seed_user(&s)?;
    let hook = s.create_webhook(
        &user_id,
        "ci",
        "https://hooks.test/x",
        "shh",
        &["task.completed".to_owned()],
    )?;
    assert!(hook.wants("task.completed"));
    assert!(!hook.wants("device.online"));

    let all = s.create_webhook(&user_id, "all", "https://hooks.test/y", "", &["*".to_owned()])?;
    assert!(all.wants("device.online"));
    Ok(())
}

#[test]
fn active_webhooks_excludes_deleted() -> anyhow::Result<()> {
    let s = store()?;
    let user_id = seed_user(&s)?;
    let hook =
        s.create_webhook(&user_id, "ci", "https://hooks.test/x", "", &["*".to_owned()])?;
    assert_eq!(s.active_webhooks(&user_id)?.len(), 1);
    assert!(s.delete_webhook(&hook.id, &user_id)?);
    assert!(s.active_webhooks(&user_id)?.is_empty());
    // Deleting again is a no-op.
    assert!(!s.delete_webhook(&hook.id, &user_id)?);
    Ok(())
}

// ── State-machine safety (property) ───────────────────────────────────────

mod transitions {
    use super::*;
    use proptest::prelude::*;

    const ALL: [TaskStatus; 8] = [
        TaskStatus::Created,
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::AwaitingConfirmation,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    fn status_strategy() -> impl Strategy<Value = TaskStatus> {
        prop::sample::select(ALL.to_vec())
    }

    proptest! {
        /// For any attempt sequence, a task only ever moves along legal
        /// edges: attempts from a stale or illegal source state fail with
        /// `conflict` and leave the status untouched.
        #[test]
        fn tasks_only_move_along_legal_edges(attempts in prop::collection::vec(status_strategy(), 1..12)) {
            let s = Store::open_in_memory().map_err(|e| TestCaseError::fail(e.to_string()))?;
            let user = s.create_user("p@x.com", "h").map_err(|e| TestCaseError::fail(e.to_string()))?;
            let agent = s.create_agent("agent-prop", &user.id, "box", "linux", &serde_json::json!({}))
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let task = s.insert_task("task-prop", &user.id, &agent.id, "t", "", &payload(), TaskStatus::Created)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let mut current = TaskStatus::Created;
            for target in attempts {
                let legal = current.can_transition(target);
                let outcome = s.transition_task(&task.id, current, target);
                prop_assert_eq!(outcome.is_ok(), legal);
                if legal {
                    current = target;
                }
                let stored = s.get_task(&task.id)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?
                    .map(|t| t.status);
                prop_assert_eq!(stored, Some(current));
            }
        }
    }
}
