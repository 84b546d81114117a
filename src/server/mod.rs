//! External surface: conversation pipeline, gRPC service, HTTP
//! diagnostics.
//!
//! The pipeline in this module is shared by both transports: validate
//! the utterance, append the user turn, parse, short-circuit on
//! clarification, otherwise create a plan and stream its execution,
//! closing with an assistant reply that carries the enclave's
//! attestation.

pub mod http;
pub mod metrics;
pub mod rpc;

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BrainConfig;
use crate::context::ContextManager;
use crate::intent::IntentParser;
use crate::llm::ChatClient;
use crate::planner::engine::PlanningEngine;
use crate::planner::{PlanEvent, PlanStatus};
use crate::soul::attestation::{AttestationVerifier, ChainAttestation};
use crate::tools::orchestrator::ToolOrchestrator;
use crate::types::{ActionKind, Clarification, ConversationTurn, Intent, ToolCallRecord, TurnRole};

use self::metrics::Metrics;

/// Everything the transports need, wired once at startup.
pub struct ServiceState {
    /// Deterministic intent parser.
    pub parser: IntentParser,
    /// Session and user-state store.
    pub context: Arc<ContextManager>,
    /// Plan factory and executor.
    pub engine: Arc<PlanningEngine>,
    /// Tool registry and dispatcher.
    pub orchestrator: Arc<ToolOrchestrator>,
    /// Attestation verifier for caller-facing quotes.
    pub verifier: Arc<AttestationVerifier>,
    /// Optional reply generator.
    pub llm: Arc<ChatClient>,
    /// Service counters.
    pub metrics: Metrics,
    /// Loaded configuration.
    pub config: BrainConfig,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Final assistant message for one turn.
#[derive(Debug, Clone)]
pub struct AssistantReply {
    /// Reply text (LLM-generated or intent-derived).
    pub text: String,
    /// The parsed intent behind the turn.
    pub intent: Intent,
    /// Parser confidence.
    pub confidence: f64,
    /// Enclave attestation, when the turn touched Soul.
    pub attestation: Option<ChainAttestation>,
    /// Time spent in the parser.
    pub parse_time_ms: u64,
    /// Time spent waiting on the LLM, when it was used.
    pub llm_latency_ms: Option<u64>,
}

/// One update on a converse stream.
#[derive(Debug, Clone)]
pub enum ConverseUpdate {
    /// A blocking follow-up question; no plan was created.
    Clarification(Clarification),
    /// Plan execution progress.
    Event(PlanEvent),
    /// The closing assistant message.
    Reply(AssistantReply),
    /// Stream terminator.
    Done {
        /// Plan the turn produced, if any.
        plan_id: Option<Uuid>,
        /// Its terminal status, if a plan ran.
        status: Option<PlanStatus>,
    },
}

/// Errors that reject a converse request before any work happens.
#[derive(Debug, thiserror::Error)]
pub enum ConverseError {
    /// Empty or whitespace-only message.
    #[error("invalid_input: message must not be empty")]
    EmptyMessage,
}

/// Run one user utterance through the full pipeline, emitting updates
/// on `tx` and always closing with [`ConverseUpdate::Done`].
pub async fn run_converse(
    state: Arc<ServiceState>,
    session_id: String,
    user_id: String,
    message: String,
    tx: mpsc::Sender<ConverseUpdate>,
) -> Result<(), ConverseError> {
    if message.trim().is_empty() {
        state.metrics.inc_errors();
        return Err(ConverseError::EmptyMessage);
    }
    state.metrics.inc_requests();

    // Parse against the user's accumulated state.
    let user_state = state.context.user_state(&user_id).await;
    let parse_started = Instant::now();
    let outcome = state.parser.parse(&message, Some(&user_state));
    let parse_time_ms = u64::try_from(parse_started.elapsed().as_millis()).unwrap_or(u64::MAX);
    state.metrics.inc_intents();

    // Record the user turn, intent attached.
    let mut user_turn = ConversationTurn::new(TurnRole::User, message.clone());
    user_turn.intent = Some(outcome.intent.clone());
    state
        .context
        .append_turn(&session_id, &user_id, user_turn)
        .await;

    let intent = outcome.intent;

    // Clarification short-circuits: ask, record, stop.
    if let Some(clarification) = outcome.clarification {
        state
            .context
            .mark_clarification_pending(&session_id, intent.intent_id)
            .await;
        state
            .context
            .append_turn(
                &session_id,
                &user_id,
                ConversationTurn::new(TurnRole::Assistant, clarification.question.clone()),
            )
            .await;
        let _ = tx.send(ConverseUpdate::Clarification(clarification)).await;
        let _ = tx
            .send(ConverseUpdate::Done {
                plan_id: None,
                status: None,
            })
            .await;
        return Ok(());
    }

    // Plannable actions execute; everything else is answered directly.
    match state
        .engine
        .create_plan_from_intent(&intent, &session_id, &user_id, &user_state)
        .await
    {
        Ok(plan) => {
            state
                .context
                .mark_intent_active(&session_id, intent.intent_id)
                .await;

            let (event_tx, mut event_rx) = mpsc::channel::<PlanEvent>(64);
            let engine = Arc::clone(&state.engine);
            let plan_id = plan.plan_id;
            let exec = tokio::spawn(async move { engine.execute_plan(plan_id, event_tx).await });

            while let Some(event) = event_rx.recv().await {
                let _ = tx.send(ConverseUpdate::Event(event)).await;
            }

            let status = match exec.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(%plan_id, error = %e, "plan execution error");
                    state.metrics.inc_errors();
                    PlanStatus::Failed
                }
                Err(e) => {
                    warn!(%plan_id, error = %e, "plan execution task panicked");
                    state.metrics.inc_errors();
                    PlanStatus::Failed
                }
            };
            state.metrics.inc_plans();
            if status == PlanStatus::Failed {
                state.metrics.inc_errors();
            }

            let reply = build_plan_reply(&state, &intent, plan_id, status, parse_time_ms).await;
            record_assistant_turn(&state, &session_id, &user_id, &reply).await;
            let _ = tx.send(ConverseUpdate::Reply(reply)).await;
            let _ = tx
                .send(ConverseUpdate::Done {
                    plan_id: Some(plan_id),
                    status: Some(status),
                })
                .await;
        }
        Err(_) => {
            // Conversational path: no plan, direct answer.
            let reply =
                build_conversational_reply(&state, &intent, &user_id, parse_time_ms).await;
            record_assistant_turn(&state, &session_id, &user_id, &reply).await;
            let _ = tx.send(ConverseUpdate::Reply(reply)).await;
            let _ = tx
                .send(ConverseUpdate::Done {
                    plan_id: None,
                    status: None,
                })
                .await;
        }
    }

    Ok(())
}

async fn record_assistant_turn(
    state: &Arc<ServiceState>,
    session_id: &str,
    user_id: &str,
    reply: &AssistantReply,
) {
    let mut turn = ConversationTurn::new(TurnRole::Assistant, reply.text.clone());
    if let Some(attestation) = &reply.attestation {
        turn.tool_calls.push(ToolCallRecord {
            tool: "soul".to_owned(),
            success: attestation.verified,
            duration_ms: 0,
        });
    }
    state.context.append_turn(session_id, user_id, turn).await;
}

/// Closing reply after a plan reached a terminal status.
async fn build_plan_reply(
    state: &Arc<ServiceState>,
    intent: &Intent,
    plan_id: Uuid,
    status: PlanStatus,
    parse_time_ms: u64,
) -> AssistantReply {
    // Pull the failure message (if any) from the plan for the fallback
    // text: the first non-recoverable error, else the last error seen
    // (a recoverable failure that exhausted its retries).
    let failure_message = match state.engine.get_plan(plan_id).await {
        Some(plan) => {
            let errors: Vec<&crate::types::StepError> = plan
                .steps
                .iter()
                .filter_map(|s| s.result.as_ref())
                .filter_map(|r| r.error.as_ref())
                .collect();
            errors
                .iter()
                .find(|e| !e.recoverable)
                .or_else(|| errors.last())
                .map(|e| e.message.clone())
        }
        None => None,
    };

    let fallback = match status {
        PlanStatus::Completed => match intent.action {
            ActionKind::FundCard => "Done. Your card has been funded.".to_owned(),
            ActionKind::Transfer => "Done. The transfer went through.".to_owned(),
            ActionKind::Swap => "Done. The swap completed.".to_owned(),
            ActionKind::CreateCard => "Done. Your new card is ready.".to_owned(),
            ActionKind::FreezeCard => "Done. The card is frozen.".to_owned(),
            _ => "Done.".to_owned(),
        },
        PlanStatus::Cancelled => "Okay, I cancelled that request.".to_owned(),
        _ => failure_message
            .map(|m| format!("I couldn't finish that: {m}"))
            .unwrap_or_else(|| "I couldn't finish that request.".to_owned()),
    };

    let (text, llm_latency_ms) = polish_reply(state, intent, &fallback).await;

    // Completed privileged plans carry the enclave's attestation.
    let attestation = if status == PlanStatus::Completed && intent.action.moves_value() {
        state.verifier.get_for_chain().await
    } else {
        None
    };

    AssistantReply {
        text,
        intent: intent.clone(),
        confidence: intent.confidence,
        attestation,
        parse_time_ms,
        llm_latency_ms,
    }
}

/// Direct answer for conversational actions (no plan).
async fn build_conversational_reply(
    state: &Arc<ServiceState>,
    intent: &Intent,
    user_id: &str,
    parse_time_ms: u64,
) -> AssistantReply {
    let mut attestation = None;
    let fallback = match intent.action {
        ActionKind::CheckBalance => {
            // Balance stays encrypted; Soul only attests that the card is
            // live and funded. Dispatch as a zero-minimum check.
            let user_state = state.context.user_state(user_id).await;
            let result = state
                .orchestrator
                .call_tool(
                    "check_encrypted_balance",
                    json!({
                        "card_id": user_state.card_id.as_deref().unwrap_or("primary"),
                        "minimum_required": "0",
                        "user_id": user_id,
                        "wallet_address": user_state.wallet_address.as_deref().unwrap_or(""),
                    }),
                )
                .await;
            if result.success {
                attestation = state.verifier.get_for_chain().await;
                "Your card is active and its encrypted balance is available. \
                 The enclave attested to this check."
                    .to_owned()
            } else {
                "I couldn't check your balance right now: the secure enclave \
                 didn't answer. Please try again shortly."
                    .to_owned()
            }
        }
        ActionKind::Query => {
            "I can fund or freeze cards, send transfers, swap assets, and \
             check balances. What would you like to do?"
                .to_owned()
        }
        _ => {
            "I didn't catch that. You can ask me to fund your card, send \
             money, swap assets, or check your balance."
                .to_owned()
        }
    };

    let (text, llm_latency_ms) = polish_reply(state, intent, &fallback).await;

    AssistantReply {
        text,
        intent: intent.clone(),
        confidence: intent.confidence,
        attestation,
        parse_time_ms,
        llm_latency_ms,
    }
}

/// Ask the LLM for nicer wording, falling back to the derived string.
async fn polish_reply(
    state: &Arc<ServiceState>,
    intent: &Intent,
    fallback: &str,
) -> (String, Option<u64>) {
    if !state.llm.enabled() {
        return (fallback.to_owned(), None);
    }
    let prompt = format!(
        "The user said: {:?}. The outcome to convey: {:?}. \
         Rewrite the outcome as one short, friendly sentence. \
         Do not add information.",
        intent.raw_text, fallback
    );
    let started = Instant::now();
    match state
        .llm
        .reply("You are the assistant of a privacy-first payments app.", &prompt)
        .await
    {
        Ok(text) => {
            let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            (text, Some(latency))
        }
        Err(e) => {
            info!(error = %e, "llm reply generation failed, using fallback");
            (fallback.to_owned(), None)
        }
    }
}
