//! Conversation pipeline scenarios: parse-only turns, clarification,
//! approval-gated funding, transient retry, and hard rejection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use brain::planner::{PlanEvent, PlanEventType, PlanStatus};
use brain::server::{run_converse, ConverseUpdate, ServiceState};
use brain::types::{ActionKind, ConfirmationMode};

use crate::support::{default_state, StubSoul, VerifyBehavior};

/// Run one utterance to completion and collect every update.
async fn converse_collect(
    state: &Arc<ServiceState>,
    session_id: &str,
    user_id: &str,
    message: &str,
) -> Vec<ConverseUpdate> {
    let (tx, mut rx) = mpsc::channel(64);
    let pipeline = run_converse(
        Arc::clone(state),
        session_id.to_owned(),
        user_id.to_owned(),
        message.to_owned(),
        tx,
    );
    let (result, updates) = tokio::join!(pipeline, async move {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    });
    result.expect("pipeline accepts non-empty input");
    updates
}

fn plan_events(updates: &[ConverseUpdate]) -> Vec<&PlanEvent> {
    updates
        .iter()
        .filter_map(|u| match u {
            ConverseUpdate::Event(event) => Some(event),
            _ => None,
        })
        .collect()
}

fn event_types(updates: &[ConverseUpdate]) -> Vec<PlanEventType> {
    plan_events(updates).iter().map(|e| e.event_type).collect()
}

#[tokio::test]
async fn balance_question_replies_without_a_plan() {
    let soul = Arc::new(StubSoul::default());
    let state = default_state(Arc::clone(&soul));

    let updates = converse_collect(&state, "s1", "u1", "what's my balance").await;

    assert!(plan_events(&updates).is_empty(), "no plan events expected");

    let reply = updates
        .iter()
        .find_map(|u| match u {
            ConverseUpdate::Reply(reply) => Some(reply),
            _ => None,
        })
        .expect("assistant reply");
    assert_eq!(reply.intent.action, ActionKind::CheckBalance);
    assert!(reply.confidence >= 0.7);

    match updates.last() {
        Some(ConverseUpdate::Done { plan_id, status }) => {
            assert!(plan_id.is_none());
            assert!(status.is_none());
        }
        other => panic!("expected Done terminator, got {other:?}"),
    }

    // The balance check itself went through the enclave.
    assert_eq!(soul.balance_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_amount_asks_for_clarification_and_creates_no_plan() {
    let soul = Arc::new(StubSoul::default());
    let state = default_state(Arc::clone(&soul));

    let updates = converse_collect(&state, "s1", "u1", "send money to alice").await;

    let clarification = updates
        .iter()
        .find_map(|u| match u {
            ConverseUpdate::Clarification(c) => Some(c),
            _ => None,
        })
        .expect("clarification");
    assert!(clarification.question.to_lowercase().contains("how much"));
    for expected in ["$10", "$50", "$100"] {
        assert!(
            clarification.options.iter().any(|o| o == expected),
            "options should offer {expected}"
        );
    }

    assert!(plan_events(&updates).is_empty());
    assert_eq!(soul.verify_calls.load(Ordering::SeqCst), 0);

    // The clarification is recorded as an assistant turn.
    let snapshot = state.context.snapshot("s1").await.expect("session");
    assert_eq!(snapshot.history.len(), 2);
    assert!(snapshot.history[1].content.to_lowercase().contains("how much"));
}

#[tokio::test]
async fn funding_with_always_confirmation_pauses_for_approval() {
    let soul = Arc::new(StubSoul::default());
    let state = default_state(Arc::clone(&soul));
    state
        .context
        .update_user_state("u1", |user| {
            user.card_id = Some("card-9".to_owned());
            user.wallet_address = Some("0xwallet".to_owned());
            user.preferences.confirmation_mode = ConfirmationMode::Always;
        })
        .await;

    let (tx, mut rx) = mpsc::channel(64);
    let pipeline = tokio::spawn(run_converse(
        Arc::clone(&state),
        "s1".to_owned(),
        "u1".to_owned(),
        "add $50 to my card".to_owned(),
        tx,
    ));

    // Drain until the fund step pauses for approval.
    let mut updates = Vec::new();
    let (plan_id, step_id) = loop {
        let update = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("update before timeout")
            .expect("stream open");
        let ids = match &update {
            ConverseUpdate::Event(event)
                if event.event_type == PlanEventType::StepAwaitingApproval =>
            {
                Some((event.plan_id, event.step_id.expect("step id")))
            }
            _ => None,
        };
        updates.push(update);
        if let Some(ids) = ids {
            break ids;
        }
    };

    assert_eq!(
        event_types(&updates),
        vec![
            PlanEventType::PlanStarted,
            PlanEventType::StepStarted,
            PlanEventType::StepVerified,
            PlanEventType::StepAwaitingApproval,
        ]
    );

    let outcome = state
        .engine
        .approve_step(plan_id, step_id, true, "u1", None)
        .await;
    assert_eq!(outcome, brain::planner::engine::ApproveOutcome::Applied);

    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    pipeline.await.expect("join").expect("pipeline");

    assert_eq!(
        event_types(&updates),
        vec![
            PlanEventType::PlanStarted,
            PlanEventType::StepStarted,
            PlanEventType::StepVerified,
            PlanEventType::StepAwaitingApproval,
            PlanEventType::StepStarted,
            PlanEventType::StepCompleted,
            PlanEventType::PlanCompleted,
        ]
    );

    // The closing reply carries the enclave's attestation.
    let reply = updates
        .iter()
        .find_map(|u| match u {
            ConverseUpdate::Reply(reply) => Some(reply),
            _ => None,
        })
        .expect("reply");
    let attestation = reply.attestation.as_ref().expect("attestation on reply");
    assert!(!attestation.quote_base64.is_empty());
    assert!(attestation.verified);

    match updates.last() {
        Some(ConverseUpdate::Done { status, .. }) => {
            assert_eq!(*status, Some(PlanStatus::Completed));
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_enclave_failure_retries_once_then_completes() {
    let soul = Arc::new(StubSoul {
        fund_failures_before_success: 1,
        ..StubSoul::default()
    });
    let state = default_state(Arc::clone(&soul));

    let updates = converse_collect(&state, "s1", "u1", "add $50 to my card").await;

    let types = event_types(&updates);
    let retries = types
        .iter()
        .filter(|t| **t == PlanEventType::StepRetrying)
        .count();
    assert_eq!(retries, 1, "exactly one retry event");
    assert!(types.contains(&PlanEventType::StepCompleted));
    assert!(types.contains(&PlanEventType::PlanCompleted));
    assert_eq!(soul.fund_calls.load(Ordering::SeqCst), 2);

    // The fund step finished with retry_count = 1.
    let plan_id = plan_events(&updates)[0].plan_id;
    let plan = state.engine.get_plan(plan_id).await.expect("plan");
    let fund = plan
        .steps
        .iter()
        .find(|s| s.action == brain::planner::StepAction::FundCard)
        .expect("fund step");
    assert_eq!(fund.retry_count, 1);
}

#[tokio::test]
async fn soul_rejection_fails_the_plan_and_runs_nothing_else() {
    let soul = Arc::new(StubSoul {
        verify: VerifyBehavior::Reject { recoverable: false },
        ..StubSoul::default()
    });
    let state = default_state(Arc::clone(&soul));

    let updates = converse_collect(&state, "s1", "u1", "send $25 to alice").await;

    assert_eq!(
        event_types(&updates),
        vec![
            PlanEventType::PlanStarted,
            PlanEventType::StepStarted,
            PlanEventType::StepFailed,
            PlanEventType::PlanFailed,
        ]
    );
    assert_eq!(soul.balance_calls.load(Ordering::SeqCst), 0);
    assert_eq!(soul.transfer_calls.load(Ordering::SeqCst), 0);

    match updates.last() {
        Some(ConverseUpdate::Done { status, .. }) => {
            assert_eq!(*status, Some(PlanStatus::Failed));
        }
        other => panic!("expected Done, got {other:?}"),
    }

    // Terminal bookkeeping holds on the failed plan.
    let plan_id = plan_events(&updates)[0].plan_id;
    let plan = state.engine.get_plan(plan_id).await.expect("plan");
    use brain::planner::StepStatus;
    let accounted = plan.count_status(StepStatus::Completed)
        + plan.count_status(StepStatus::Failed)
        + plan.count_status(StepStatus::Skipped)
        + plan.count_status(StepStatus::RolledBack);
    assert_eq!(accounted, plan.total_steps);
}

#[tokio::test]
async fn empty_message_is_rejected_as_invalid_input() {
    let state = default_state(Arc::new(StubSoul::default()));
    let (tx, _rx) = mpsc::channel(8);
    let result = run_converse(
        Arc::clone(&state),
        "s1".to_owned(),
        "u1".to_owned(),
        "   ".to_owned(),
        tx,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn repeated_parse_is_structurally_identical() {
    let state = default_state(Arc::new(StubSoul::default()));
    let a = converse_collect(&state, "s1", "u1", "what's my balance").await;
    let b = converse_collect(&state, "s2", "u1", "what's my balance").await;

    let reply = |updates: &[ConverseUpdate]| {
        updates
            .iter()
            .find_map(|u| match u {
                ConverseUpdate::Reply(reply) => Some(reply.clone()),
                _ => None,
            })
            .expect("reply")
    };
    let (ra, rb) = (reply(&a), reply(&b));
    assert_ne!(ra.intent.intent_id, rb.intent.intent_id);
    assert_eq!(ra.intent.action, rb.intent.action);
    assert_eq!(ra.intent.confidence, rb.intent.confidence);
    assert_eq!(ra.intent.parameters, rb.intent.parameters);
}
