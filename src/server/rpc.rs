//! gRPC surface (`BrainService`).
//!
//! `Converse` streams pipeline updates as they happen; the other three
//! methods are unary bookkeeping around running plans and sessions.

use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::warn;
use uuid::Uuid;

use crate::pb::brain as pb;
use crate::pb::brain::brain_service_server::{BrainService, BrainServiceServer};
use crate::planner::engine::ApproveOutcome;
use crate::planner::{PlanError, PlanEvent};
use crate::types::{ConversationTurn, SessionContext};

use super::{run_converse, AssistantReply, ConverseUpdate, ServiceState};

/// gRPC implementation over the shared service state.
pub struct BrainRpc {
    state: Arc<ServiceState>,
}

impl BrainRpc {
    /// Wrap the shared state.
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }

    /// Convert into the tonic server wrapper for `Server::add_service`.
    pub fn into_server(self) -> BrainServiceServer<Self> {
        BrainServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl BrainService for BrainRpc {
    type ConverseStream =
        Pin<Box<dyn Stream<Item = Result<pb::ConverseEvent, Status>> + Send + 'static>>;

    async fn converse(
        &self,
        request: Request<pb::ConverseRequest>,
    ) -> Result<Response<Self::ConverseStream>, Status> {
        let req = request.into_inner();
        if req.message.trim().is_empty() {
            self.state.metrics.inc_errors();
            return Err(Status::invalid_argument(
                "invalid_input: message must not be empty",
            ));
        }
        let session_id = if req.session_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.session_id
        };
        let user_id = if req.user_id.is_empty() {
            "anonymous".to_owned()
        } else {
            req.user_id
        };

        let (tx, rx) = mpsc::channel::<ConverseUpdate>(64);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Err(e) = run_converse(state, session_id, user_id, req.message, tx).await {
                warn!(error = %e, "converse pipeline rejected request");
            }
        });

        let stream = ReceiverStream::new(rx).map(|update| Ok(to_pb_event(update)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn approve_step(
        &self,
        request: Request<pb::ApproveStepRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let req = request.into_inner();
        let plan_id = parse_uuid(&req.plan_id, "plan_id")?;
        let step_id = parse_uuid(&req.step_id, "step_id")?;
        let comment = if req.comment.is_empty() {
            None
        } else {
            Some(req.comment)
        };

        let outcome = self
            .state
            .engine
            .approve_step(plan_id, step_id, req.approve, &req.approver, comment)
            .await;

        let ack = match outcome {
            ApproveOutcome::Applied => pb::Ack {
                accepted: true,
                message: "decision delivered".to_owned(),
            },
            ApproveOutcome::NotAwaiting => pb::Ack {
                accepted: false,
                message: "step is not awaiting approval".to_owned(),
            },
        };
        Ok(Response::new(ack))
    }

    async fn cancel_plan(
        &self,
        request: Request<pb::CancelPlanRequest>,
    ) -> Result<Response<pb::Ack>, Status> {
        let req = request.into_inner();
        let plan_id = parse_uuid(&req.plan_id, "plan_id")?;

        match self.state.engine.cancel(plan_id, &req.reason).await {
            Ok(outcome) => Ok(Response::new(pb::Ack {
                accepted: true,
                message: format!("{outcome:?}").to_lowercase(),
            })),
            Err(PlanError::PlanNotFound(_)) => Err(Status::not_found("plan not found")),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }

    async fn get_session_snapshot(
        &self,
        request: Request<pb::SessionSnapshotRequest>,
    ) -> Result<Response<pb::SessionSnapshot>, Status> {
        let req = request.into_inner();
        match self.state.context.snapshot(&req.session_id).await {
            Ok(snapshot) => {
                let mut mapped = to_pb_snapshot(&snapshot);
                // Aggregates leave the service noised when differential
                // privacy is configured; raw history is untouched.
                mapped.action_counts = self
                    .state
                    .context
                    .noisy_action_counts(&snapshot.user_id)
                    .await
                    .into_iter()
                    .map(|(action, count)| pb::ActionCount { action, count })
                    .collect();
                Ok(Response::new(mapped))
            }
            Err(_) => Err(Status::not_found("not_found")),
        }
    }
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw)
        .map_err(|_| Status::invalid_argument(format!("invalid_input: malformed {field}")))
}

/// Map a pipeline update onto the wire oneof.
pub(crate) fn to_pb_event(update: ConverseUpdate) -> pb::ConverseEvent {
    let event = match update {
        ConverseUpdate::Clarification(clarification) => {
            pb::converse_event::Event::Clarification(pb::ClarificationPrompt {
                question: clarification.question,
                options: clarification.options,
                blocking: clarification.blocking,
            })
        }
        ConverseUpdate::Event(event) => pb::converse_event::Event::PlanEvent(to_pb_plan_event(event)),
        ConverseUpdate::Reply(reply) => pb::converse_event::Event::Reply(to_pb_reply(reply)),
        ConverseUpdate::Done { plan_id, status } => {
            pb::converse_event::Event::Done(pb::ConverseDone {
                plan_id: plan_id.map(|id| id.to_string()).unwrap_or_default(),
                plan_status: status.map(|s| s.as_str().to_owned()).unwrap_or_default(),
            })
        }
    };
    pb::ConverseEvent { event: Some(event) }
}

fn to_pb_plan_event(event: PlanEvent) -> pb::PlanEvent {
    pb::PlanEvent {
        event_id: event.event_id.to_string(),
        plan_id: event.plan_id.to_string(),
        step_id: event.step_id.map(|id| id.to_string()).unwrap_or_default(),
        event_type: event.event_type.as_str().to_owned(),
        message: event.message,
        data_json: event
            .data
            .map(|data| data.to_string())
            .unwrap_or_default(),
        timestamp_ms: event.timestamp.timestamp_millis(),
    }
}

fn to_pb_reply(reply: AssistantReply) -> pb::AssistantReply {
    let attestation = reply.attestation.map(|chain| pb::QuoteMeta {
        quote: BASE64.decode(chain.quote_base64.as_bytes()).unwrap_or_default(),
        mr_enclave: chain.mr_enclave,
        mr_signer: chain.mr_signer,
        timestamp_ms: chain.timestamp.timestamp_millis(),
    });
    pb::AssistantReply {
        text: reply.text,
        intent_json: serde_json::to_string(&reply.intent).unwrap_or_default(),
        confidence: reply.confidence,
        attestation,
    }
}

fn to_pb_snapshot(snapshot: &SessionContext) -> pb::SessionSnapshot {
    pb::SessionSnapshot {
        session_id: snapshot.session_id.clone(),
        user_id: snapshot.user_id.clone(),
        created_at_ms: snapshot.created_at.timestamp_millis(),
        last_activity_at_ms: snapshot.last_activity_at.timestamp_millis(),
        expires_at_ms: snapshot.expires_at.timestamp_millis(),
        history: snapshot.history.iter().map(to_pb_turn).collect(),
        action_counts: Vec::new(),
    }
}

fn to_pb_turn(turn: &ConversationTurn) -> pb::Turn {
    pb::Turn {
        id: turn.id.to_string(),
        role: turn.role.to_string(),
        content: turn.content.clone(),
        timestamp_ms: turn.timestamp.timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{PlanEventType, PlanStatus};
    use crate::types::Clarification;
    use chrono::Utc;

    #[test]
    fn clarification_maps_onto_the_oneof() {
        let update = ConverseUpdate::Clarification(Clarification {
            question: "How much?".to_owned(),
            options: vec!["$10".to_owned(), "$50".to_owned()],
            blocking: true,
        });
        let event = to_pb_event(update);
        match event.event {
            Some(pb::converse_event::Event::Clarification(c)) => {
                assert_eq!(c.question, "How much?");
                assert_eq!(c.options.len(), 2);
                assert!(c.blocking);
            }
            other => panic!("expected clarification, got {other:?}"),
        }
    }

    #[test]
    fn plan_event_maps_ids_and_type() {
        let plan_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        let event = PlanEvent::new(
            plan_id,
            Some(step_id),
            PlanEventType::StepCompleted,
            "done",
        )
        .with_data(serde_json::json!({"k": 1}));

        let mapped = to_pb_plan_event(event);
        assert_eq!(mapped.plan_id, plan_id.to_string());
        assert_eq!(mapped.step_id, step_id.to_string());
        assert_eq!(mapped.event_type, "step_completed");
        assert_eq!(mapped.data_json, "{\"k\":1}");
        assert!(mapped.timestamp_ms > 0);
    }

    #[test]
    fn done_event_carries_terminal_status() {
        let plan_id = Uuid::new_v4();
        let event = to_pb_event(ConverseUpdate::Done {
            plan_id: Some(plan_id),
            status: Some(PlanStatus::Completed),
        });
        match event.event {
            Some(pb::converse_event::Event::Done(done)) => {
                assert_eq!(done.plan_id, plan_id.to_string());
                assert_eq!(done.plan_status, "completed");
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_maps_history_roles() {
        let now = Utc::now();
        let snapshot = SessionContext {
            session_id: "s1".to_owned(),
            user_id: "u1".to_owned(),
            created_at: now,
            last_activity_at: now,
            expires_at: now,
            history: vec![ConversationTurn::new(
                crate::types::TurnRole::Assistant,
                "hello",
            )]
            .into(),
            user_state: crate::types::UserState::default(),
            active_intent_ids: Default::default(),
            pending_clarification_ids: Default::default(),
        };
        let mapped = to_pb_snapshot(&snapshot);
        assert_eq!(mapped.session_id, "s1");
        assert_eq!(mapped.history.len(), 1);
        assert_eq!(mapped.history[0].role, "assistant");
        assert_eq!(mapped.history[0].content, "hello");
    }
}
