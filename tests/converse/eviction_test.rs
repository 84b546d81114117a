//! Session eviction: TTL sweep removes the session, user state survives.

use std::sync::Arc;

use brain::config::ContextConfig;
use brain::server::{run_converse, ConverseUpdate};
use tokio::sync::mpsc;

use crate::support::{build_state, StubSoul};

#[tokio::test]
async fn expired_session_is_swept_but_user_state_survives() {
    let context_config = ContextConfig {
        ttl_seconds: 0,
        persist_user_state: true,
        ..ContextConfig::default()
    };
    let state = build_state(Arc::new(StubSoul::default()), context_config);

    state
        .context
        .update_user_state("u1", |user| {
            user.card_id = Some("card-7".to_owned());
            user.preferred_currency = Some("USD".to_owned());
        })
        .await;

    // One conversational turn establishes the session.
    let (tx, mut rx) = mpsc::channel::<ConverseUpdate>(64);
    let pipeline = run_converse(
        Arc::clone(&state),
        "s-evict".to_owned(),
        "u1".to_owned(),
        "what's my balance".to_owned(),
        tx,
    );
    let (result, _) = tokio::join!(pipeline, async move {
        while rx.recv().await.is_some() {}
    });
    result.expect("pipeline");

    assert!(state.context.snapshot("s-evict").await.is_ok());

    // TTL of zero: the next sweep evicts it.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let outcome = state.context.sweep().await;
    assert!(outcome.evicted.iter().any(|(s, _)| s == "s-evict"));

    // Snapshot now reports not-found...
    assert!(state.context.snapshot("s-evict").await.is_err());

    // ...while user state still answers with the last known values.
    let user = state.context.user_state("u1").await;
    assert_eq!(user.card_id.as_deref(), Some("card-7"));
    assert_eq!(user.preferred_currency.as_deref(), Some("USD"));
    assert_eq!(user.action_counts["check_balance"], 1);
}

#[tokio::test]
async fn eviction_cancels_plans_owned_by_the_session() {
    let context_config = ContextConfig {
        ttl_seconds: 0,
        ..ContextConfig::default()
    };
    let state = build_state(Arc::new(StubSoul::default()), context_config);

    // Create (but do not execute) a plan owned by the session.
    let outcome = state.parser.parse("add $50 to my card", None);
    let user_state = state.context.user_state("u1").await;
    let plan = state
        .engine
        .create_plan_from_intent(&outcome.intent, "s-evict", "u1", &user_state)
        .await
        .expect("plan");

    state.context.get_or_create("s-evict", "u1").await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let swept = state.context.sweep().await;
    for (session_id, _) in &swept.evicted {
        state.engine.cancel_for_session(session_id).await;
    }

    let cancelled = state.engine.get_plan(plan.plan_id).await.expect("plan");
    assert_eq!(cancelled.status, brain::planner::PlanStatus::Cancelled);
}
