//! Plan execution engine.
//!
//! Owns the plan registry and drives each plan to a terminal status:
//! steps run in sequence order once their dependencies are satisfied,
//! sensitive steps pause on the approval queue, recoverable failures
//! retry with exponential backoff, and a fatal failure rolls back
//! completed steps in reverse order. Every transition is emitted on the
//! caller's event sink; a plan's stream is totally ordered because the
//! loop is the only emitter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PlannerConfig;
use crate::tools::orchestrator::ToolOrchestrator;
use crate::types::{ConfirmationMode, ErrorCode, Intent, StepError, StepResult, UserState};

use super::approval::{ApprovalDecision, ApprovalQueue, ApprovalRequest};
use super::templates::{build_plan, gated};
use super::{
    ExecutionPlan, PlanError, PlanEvent, PlanEventType, PlanStatus, StepAction, StepStatus,
};

/// Outcome of an approval submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproveOutcome {
    /// The decision was delivered to a waiting step.
    Applied,
    /// No step was awaiting approval; the call was a no-op.
    NotAwaiting,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The plan was already terminal; cancelling is a no-op success.
    AlreadyTerminal,
    /// The plan was cancelled before execution started.
    Cancelled,
    /// Cancellation was signalled to the running execution loop.
    Requested,
}

struct PlanHandle {
    plan: Arc<Mutex<ExecutionPlan>>,
    cancel: watch::Sender<bool>,
    confirmation_mode: ConfirmationMode,
}

/// Creates plans from intents and executes them.
pub struct PlanningEngine {
    config: PlannerConfig,
    orchestrator: Arc<ToolOrchestrator>,
    plans: RwLock<HashMap<Uuid, PlanHandle>>,
    approvals: Arc<Mutex<ApprovalQueue>>,
}

impl PlanningEngine {
    /// Build an engine over the tool orchestrator.
    pub fn new(config: PlannerConfig, orchestrator: Arc<ToolOrchestrator>) -> Self {
        let approvals = Arc::new(Mutex::new(ApprovalQueue::new(config.approval_timeout())));
        Self {
            config,
            orchestrator,
            plans: RwLock::new(HashMap::new()),
            approvals,
        }
    }

    /// Shared approval queue (the sweeper reaps expired entries).
    pub fn approvals(&self) -> Arc<Mutex<ApprovalQueue>> {
        Arc::clone(&self.approvals)
    }

    /// Instantiate and register a plan for an intent.
    ///
    /// Returns `PlanError::NoTemplate` for conversational actions, which
    /// the caller answers directly instead.
    pub async fn create_plan_from_intent(
        &self,
        intent: &Intent,
        session_id: &str,
        user_id: &str,
        state: &UserState,
    ) -> Result<ExecutionPlan, PlanError> {
        let plan = build_plan(intent, session_id, user_id, state, &self.config)?;
        let snapshot = plan.clone();
        let (cancel, _) = watch::channel(false);

        info!(
            plan_id = %plan.plan_id,
            action = intent.action.as_str(),
            steps = plan.total_steps,
            requires_approval = plan.requires_approval,
            "plan created"
        );

        self.plans.write().await.insert(
            plan.plan_id,
            PlanHandle {
                plan: Arc::new(Mutex::new(plan)),
                cancel,
                confirmation_mode: state.preferences.confirmation_mode,
            },
        );
        Ok(snapshot)
    }

    /// Point-in-time copy of a plan.
    pub async fn get_plan(&self, plan_id: Uuid) -> Option<ExecutionPlan> {
        let plans = self.plans.read().await;
        let handle = plans.get(&plan_id)?;
        let plan = handle.plan.lock().await.clone();
        Some(plan)
    }

    /// Deliver an approval decision to a step awaiting one.
    ///
    /// Approving a step that is not awaiting approval is a no-op
    /// rejection, not an error.
    pub async fn approve_step(
        &self,
        plan_id: Uuid,
        step_id: Uuid,
        approve: bool,
        approver: &str,
        comment: Option<String>,
    ) -> ApproveOutcome {
        let decision = if approve {
            ApprovalDecision::Approved {
                approver: approver.to_owned(),
                comment,
            }
        } else {
            ApprovalDecision::Denied {
                approver: approver.to_owned(),
                comment,
            }
        };
        match self.approvals.lock().await.resolve(plan_id, step_id, decision) {
            Ok(()) => ApproveOutcome::Applied,
            Err(_) => ApproveOutcome::NotAwaiting,
        }
    }

    /// Cancel a plan. Cancelling an already-terminal plan is a no-op
    /// success.
    pub async fn cancel(&self, plan_id: Uuid, reason: &str) -> Result<CancelOutcome, PlanError> {
        let plans = self.plans.read().await;
        let handle = plans.get(&plan_id).ok_or(PlanError::PlanNotFound(plan_id))?;

        let mut plan = handle.plan.lock().await;
        if plan.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        if plan.status == PlanStatus::Pending {
            // Not yet executing; finalize in place.
            for step in &mut plan.steps {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Skipped;
                }
            }
            plan.status = PlanStatus::Cancelled;
            plan.completed_at = Some(Utc::now());
            info!(%plan_id, reason, "plan cancelled before execution");
            return Ok(CancelOutcome::Cancelled);
        }

        info!(%plan_id, reason, "plan cancellation requested");
        let _ = handle.cancel.send(true);
        Ok(CancelOutcome::Requested)
    }

    /// Cancel every non-terminal plan owned by a session (eviction path).
    pub async fn cancel_for_session(&self, session_id: &str) -> usize {
        let plan_ids: Vec<Uuid> = {
            let plans = self.plans.read().await;
            let mut ids = Vec::new();
            for (plan_id, handle) in plans.iter() {
                let plan = handle.plan.lock().await;
                if plan.session_id == session_id && !plan.status.is_terminal() {
                    ids.push(*plan_id);
                }
            }
            ids
        };
        let mut cancelled = 0usize;
        for plan_id in &plan_ids {
            if self.cancel(*plan_id, "session evicted").await.is_ok() {
                cancelled = cancelled.saturating_add(1);
            }
        }
        cancelled
    }

    /// Drive a plan to a terminal status, emitting events on `sink`.
    ///
    /// The caller typically spawns this and consumes the sink as a
    /// stream; the loop keeps running even if the receiver goes away.
    pub async fn execute_plan(
        &self,
        plan_id: Uuid,
        sink: mpsc::Sender<PlanEvent>,
    ) -> Result<PlanStatus, PlanError> {
        let (plan_arc, mut cancel_rx, mode) = {
            let plans = self.plans.read().await;
            let handle = plans.get(&plan_id).ok_or(PlanError::PlanNotFound(plan_id))?;
            (
                Arc::clone(&handle.plan),
                handle.cancel.subscribe(),
                handle.confirmation_mode,
            )
        };

        {
            let mut plan = plan_arc.lock().await;
            if plan.status != PlanStatus::Pending {
                return Err(PlanError::AlreadyExecuting(plan_id));
            }
            plan.status = PlanStatus::Executing;
            plan.started_at = Some(Utc::now());
        }

        emit(
            &sink,
            PlanEvent::new(plan_id, None, PlanEventType::PlanStarted, "plan started"),
        )
        .await;

        // Steps approved once stay approved across retries.
        let mut approved: HashSet<Uuid> = HashSet::new();

        loop {
            if *cancel_rx.borrow() {
                return Ok(self.finish_cancelled(&plan_arc, &sink).await);
            }

            let Some(step) = next_pending(&plan_arc).await else {
                break;
            };

            // Approval gate.
            if gated(step.sensitivity, mode) && !approved.contains(&step.step_id) {
                set_step_status(&plan_arc, step.step_id, StepStatus::AwaitingApproval).await;
                set_plan_status(&plan_arc, PlanStatus::AwaitingApproval).await;
                emit(
                    &sink,
                    PlanEvent::new(
                        plan_id,
                        Some(step.step_id),
                        PlanEventType::StepAwaitingApproval,
                        format!("waiting for approval: {}", step.description),
                    )
                    .with_data(json!({ "action": step.action.as_str() })),
                )
                .await;

                let receiver = {
                    let mut approvals = self.approvals.lock().await;
                    approvals.submit(ApprovalRequest {
                        plan_id,
                        step_id: step.step_id,
                        action: step.action,
                        description: step.description.clone(),
                        created_at: Utc::now(),
                        timeout: self.config.approval_timeout(),
                    })
                };

                let decision = tokio::select! {
                    decision = receiver => decision.unwrap_or(ApprovalDecision::TimedOut),
                    _ = cancel_rx.changed() => {
                        let _ = self.approvals.lock().await.resolve(
                            plan_id,
                            step.step_id,
                            ApprovalDecision::TimedOut,
                        );
                        return Ok(self.finish_cancelled(&plan_arc, &sink).await);
                    }
                    _ = tokio::time::sleep(self.config.approval_timeout()) => {
                        let _ = self.approvals.lock().await.resolve(
                            plan_id,
                            step.step_id,
                            ApprovalDecision::TimedOut,
                        );
                        ApprovalDecision::TimedOut
                    }
                };

                set_plan_status(&plan_arc, PlanStatus::Executing).await;
                match decision {
                    ApprovalDecision::Approved { approver, .. } => {
                        debug!(%plan_id, step_id = %step.step_id, approver, "step approved");
                        approved.insert(step.step_id);
                        set_step_status(&plan_arc, step.step_id, StepStatus::Pending).await;
                        continue;
                    }
                    ApprovalDecision::Denied { approver, .. } => {
                        let error = StepError::new(
                            ErrorCode::ApprovalDenied,
                            format!("approval denied by {approver}"),
                            false,
                        );
                        return Ok(self
                            .fail_plan(&plan_arc, &sink, &step, failed_result(error))
                            .await);
                    }
                    ApprovalDecision::TimedOut => {
                        let error = StepError::new(
                            ErrorCode::ApprovalTimeout,
                            "approval request timed out",
                            false,
                        );
                        return Ok(self
                            .fail_plan(&plan_arc, &sink, &step, failed_result(error))
                            .await);
                    }
                }
            }

            // Execute.
            {
                let mut plan = plan_arc.lock().await;
                if let Some(s) = plan.steps.iter_mut().find(|s| s.step_id == step.step_id) {
                    s.status = StepStatus::Executing;
                    if s.started_at.is_none() {
                        s.started_at = Some(Utc::now());
                    }
                }
            }
            emit(
                &sink,
                PlanEvent::new(
                    plan_id,
                    Some(step.step_id),
                    PlanEventType::StepStarted,
                    step.description.clone(),
                )
                .with_data(json!({ "action": step.action.as_str() })),
            )
            .await;

            // Soul verification gate.
            if step.requires_soul_verification {
                let verification = self
                    .bounded_call(StepAction::VerifyWithSoul.tool_name(), step.parameters.clone())
                    .await;

                if verification.success {
                    if step.action == StepAction::VerifyWithSoul {
                        // Verification is the step's whole job.
                        complete_step(&plan_arc, step.step_id, verification).await;
                        emit(
                            &sink,
                            PlanEvent::new(
                                plan_id,
                                Some(step.step_id),
                                PlanEventType::StepVerified,
                                "Soul verified the intent",
                            ),
                        )
                        .await;
                        continue;
                    }
                    set_step_status(&plan_arc, step.step_id, StepStatus::VerifiedBySoul).await;
                    emit(
                        &sink,
                        PlanEvent::new(
                            plan_id,
                            Some(step.step_id),
                            PlanEventType::StepVerified,
                            "Soul verified the step",
                        ),
                    )
                    .await;
                } else {
                    match self.handle_failure(&plan_arc, &sink, &step, verification).await {
                        FailureFlow::Retrying | FailureFlow::SkippedOptional => continue,
                        FailureFlow::Fatal(status) => return Ok(status),
                    }
                }
            }

            if step.action == StepAction::VerifyWithSoul && !step.requires_soul_verification {
                // A verify step without the verification flag is a no-op.
                complete_step(&plan_arc, step.step_id, empty_result()).await;
                continue;
            }

            // Dispatch through the orchestrator, cancellable.
            let result = tokio::select! {
                result = self
                    .bounded_call(step.action.tool_name(), step.parameters.clone()) => result,
                _ = cancel_rx.changed() => {
                    return Ok(self.finish_cancelled(&plan_arc, &sink).await);
                }
            };

            if result.success {
                complete_step(&plan_arc, step.step_id, result).await;
                emit(
                    &sink,
                    PlanEvent::new(
                        plan_id,
                        Some(step.step_id),
                        PlanEventType::StepCompleted,
                        format!("completed: {}", step.description),
                    ),
                )
                .await;
            } else {
                match self.handle_failure(&plan_arc, &sink, &step, result).await {
                    FailureFlow::Retrying | FailureFlow::SkippedOptional => continue,
                    FailureFlow::Fatal(status) => return Ok(status),
                }
            }
        }

        // No pending steps remain; the plan completed.
        let status = {
            let mut plan = plan_arc.lock().await;
            for step in &mut plan.steps {
                if !step.status.is_terminal() {
                    // Unreachable steps (e.g. blocked on a skipped chain).
                    step.status = StepStatus::Skipped;
                }
            }
            finalize(&mut plan, PlanStatus::Completed);
            plan.status
        };
        emit(
            &sink,
            PlanEvent::new(plan_id, None, PlanEventType::PlanCompleted, "plan completed"),
        )
        .await;
        Ok(status)
    }

    /// Orchestrator call under the per-step deadline.
    ///
    /// The orchestrator already bounds handler time and permit waits;
    /// this is the outer safety net the plan contract promises.
    async fn bounded_call(
        &self,
        tool: &str,
        parameters: serde_json::Value,
    ) -> StepResult {
        let deadline = std::time::Duration::from_millis(self.config.step_deadline_ms);
        match tokio::time::timeout(deadline, self.orchestrator.call_tool(tool, parameters)).await {
            Ok(result) => result,
            Err(_) => failed_result(StepError::new(
                ErrorCode::Timeout,
                format!("step exceeded its {}ms deadline", self.config.step_deadline_ms),
                true,
            )),
        }
    }

    async fn handle_failure(
        &self,
        plan_arc: &Arc<Mutex<ExecutionPlan>>,
        sink: &mpsc::Sender<PlanEvent>,
        step: &StepSnapshot,
        result: StepResult,
    ) -> FailureFlow {
        let error = result.error.clone().unwrap_or_else(|| {
            StepError::new(ErrorCode::Internal, "tool returned no error detail", false)
        });

        // Retry while the error is recoverable and budget remains.
        if error.recoverable {
            let retry = {
                let mut plan = plan_arc.lock().await;
                let Some(s) = plan.steps.iter_mut().find(|s| s.step_id == step.step_id) else {
                    return FailureFlow::Fatal(PlanStatus::Failed);
                };
                if s.retry_count < s.max_retries {
                    s.retry_count = s.retry_count.saturating_add(1);
                    s.status = StepStatus::Pending;
                    Some(s.retry_count)
                } else {
                    None
                }
            };

            if let Some(retry_count) = retry {
                emit(
                    sink,
                    PlanEvent::new(
                        step.plan_id,
                        Some(step.step_id),
                        PlanEventType::StepRetrying,
                        format!("retrying after recoverable failure: {}", error.message),
                    )
                    .with_data(json!({ "retry_count": retry_count })),
                )
                .await;
                tokio::time::sleep(self.config.retry_backoff(retry_count)).await;
                return FailureFlow::Retrying;
            }
        }

        // Optional steps degrade to skipped.
        if step.optional {
            {
                let mut plan = plan_arc.lock().await;
                if let Some(s) = plan.steps.iter_mut().find(|s| s.step_id == step.step_id) {
                    s.status = StepStatus::Skipped;
                    s.result = Some(result);
                    s.completed_at = Some(Utc::now());
                }
            }
            emit(
                sink,
                PlanEvent::new(
                    step.plan_id,
                    Some(step.step_id),
                    PlanEventType::StepFailed,
                    format!("optional step failed, continuing: {}", error.message),
                )
                .with_data(json!({ "optional": true })),
            )
            .await;
            return FailureFlow::SkippedOptional;
        }

        FailureFlow::Fatal(self.fail_plan(plan_arc, sink, step, result).await)
    }

    async fn fail_plan(
        &self,
        plan_arc: &Arc<Mutex<ExecutionPlan>>,
        sink: &mpsc::Sender<PlanEvent>,
        step: &StepSnapshot,
        result: StepResult,
    ) -> PlanStatus {
        let error = result.error.clone().unwrap_or_else(|| {
            StepError::new(ErrorCode::Internal, "unspecified failure", false)
        });

        {
            let mut plan = plan_arc.lock().await;
            if let Some(s) = plan.steps.iter_mut().find(|s| s.step_id == step.step_id) {
                s.status = StepStatus::Failed;
                s.result = Some(result);
                s.completed_at = Some(Utc::now());
            }
        }
        emit(
            sink,
            PlanEvent::new(
                step.plan_id,
                Some(step.step_id),
                PlanEventType::StepFailed,
                format!("{}: {}", step.description, error.message),
            )
            .with_data(json!({ "code": error.code.as_str(), "recoverable": error.recoverable })),
        )
        .await;

        self.rollback_completed(plan_arc, sink).await;

        let message = user_facing_failure(&error);
        {
            let mut plan = plan_arc.lock().await;
            for s in &mut plan.steps {
                if !s.status.is_terminal() {
                    s.status = StepStatus::Skipped;
                }
            }
            finalize(&mut plan, PlanStatus::Failed);
        }
        emit(
            sink,
            PlanEvent::new(step.plan_id, None, PlanEventType::PlanFailed, message)
                .with_data(json!({ "code": error.code.as_str() })),
        )
        .await;
        PlanStatus::Failed
    }

    async fn finish_cancelled(
        &self,
        plan_arc: &Arc<Mutex<ExecutionPlan>>,
        sink: &mpsc::Sender<PlanEvent>,
    ) -> PlanStatus {
        let plan_id = { plan_arc.lock().await.plan_id };
        info!(%plan_id, "plan execution observed cancellation");

        self.rollback_completed(plan_arc, sink).await;

        {
            let mut plan = plan_arc.lock().await;
            for s in &mut plan.steps {
                if !s.status.is_terminal() {
                    s.status = StepStatus::Skipped;
                }
            }
            finalize(&mut plan, PlanStatus::Cancelled);
        }
        emit(
            sink,
            PlanEvent::new(plan_id, None, PlanEventType::PlanCancelled, "plan cancelled"),
        )
        .await;
        PlanStatus::Cancelled
    }

    /// Invert completed steps in reverse sequence order.
    ///
    /// Steps without an inverse are skipped without error. A failed
    /// inverse is emitted as an event and does not stop the sweep.
    async fn rollback_completed(
        &self,
        plan_arc: &Arc<Mutex<ExecutionPlan>>,
        sink: &mpsc::Sender<PlanEvent>,
    ) {
        let mut completed: Vec<StepSnapshot> = {
            let plan = plan_arc.lock().await;
            plan.steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .map(StepSnapshot::from_step)
                .collect()
        };
        completed.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        for step in completed {
            let tool = step.action.tool_name();
            if !self.orchestrator.tool_has_inverse(tool) {
                continue;
            }
            let result = self
                .orchestrator
                .call_inverse(tool, step.parameters.clone())
                .await;
            if result.success {
                set_step_status(plan_arc, step.step_id, StepStatus::RolledBack).await;
                debug!(step_id = %step.step_id, tool, "step rolled back");
            } else {
                let message = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "inverse failed".to_owned());
                warn!(step_id = %step.step_id, tool, message, "rollback failure");
                emit(
                    sink,
                    PlanEvent::new(
                        step.plan_id,
                        Some(step.step_id),
                        PlanEventType::StepFailed,
                        format!("rollback failed for {}: {message}", step.description),
                    )
                    .with_data(json!({ "code": ErrorCode::RollbackFailure.as_str() })),
                )
                .await;
            }
        }
    }
}

enum FailureFlow {
    Retrying,
    SkippedOptional,
    Fatal(PlanStatus),
}

/// Immutable copy of the step fields the loop needs across awaits.
#[derive(Debug, Clone)]
struct StepSnapshot {
    plan_id: Uuid,
    step_id: Uuid,
    sequence: usize,
    action: StepAction,
    description: String,
    parameters: serde_json::Value,
    requires_soul_verification: bool,
    sensitivity: super::StepSensitivity,
    optional: bool,
}

impl StepSnapshot {
    fn from_step(step: &super::PlanStep) -> Self {
        Self {
            plan_id: step.plan_id,
            step_id: step.step_id,
            sequence: step.sequence,
            action: step.action,
            description: step.description.clone(),
            parameters: step.parameters.clone(),
            requires_soul_verification: step.requires_soul_verification,
            sensitivity: step.sensitivity,
            optional: step.optional,
        }
    }
}

/// Unblock steps whose dependencies are now satisfied, then return the
/// lowest-sequence pending step.
async fn next_pending(plan_arc: &Arc<Mutex<ExecutionPlan>>) -> Option<StepSnapshot> {
    let mut plan = plan_arc.lock().await;

    let satisfied: HashSet<Uuid> = plan
        .steps
        .iter()
        .filter(|s| s.status.satisfies_dependency())
        .map(|s| s.step_id)
        .collect();
    for step in &mut plan.steps {
        if step.status == StepStatus::Blocked
            && step.depends_on.iter().all(|dep| satisfied.contains(dep))
        {
            step.status = StepStatus::Pending;
        }
    }

    plan.steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .min_by_key(|s| s.sequence)
        .map(StepSnapshot::from_step)
}

async fn set_step_status(plan_arc: &Arc<Mutex<ExecutionPlan>>, step_id: Uuid, status: StepStatus) {
    let mut plan = plan_arc.lock().await;
    if let Some(step) = plan.steps.iter_mut().find(|s| s.step_id == step_id) {
        step.status = status;
    }
}

async fn set_plan_status(plan_arc: &Arc<Mutex<ExecutionPlan>>, status: PlanStatus) {
    plan_arc.lock().await.status = status;
}

async fn complete_step(plan_arc: &Arc<Mutex<ExecutionPlan>>, step_id: Uuid, result: StepResult) {
    let mut plan = plan_arc.lock().await;
    if let Some(step) = plan.steps.iter_mut().find(|s| s.step_id == step_id) {
        step.status = StepStatus::Completed;
        step.result = Some(result);
        step.completed_at = Some(Utc::now());
    }
    plan.completed_steps = plan.count_status(StepStatus::Completed);
}

/// Stamp terminal state and recompute counters.
fn finalize(plan: &mut ExecutionPlan, status: PlanStatus) {
    plan.status = status;
    plan.completed_at = Some(Utc::now());
    plan.completed_steps = plan.count_status(StepStatus::Completed);
}

fn failed_result(error: StepError) -> StepResult {
    StepResult {
        success: false,
        output: None,
        error: Some(error),
        verification: None,
        attestation: None,
        duration_ms: 0,
    }
}

fn empty_result() -> StepResult {
    StepResult {
        success: true,
        output: None,
        error: None,
        verification: None,
        attestation: None,
        duration_ms: 0,
    }
}

/// Human-readable plan failure message, distinguishing a temporarily
/// unreachable enclave from a rejected attestation.
fn user_facing_failure(error: &StepError) -> String {
    match error.code {
        ErrorCode::SoulNotTrusted => {
            if error.message.contains("unavailable") {
                "The secure enclave is temporarily unavailable; please try again shortly."
                    .to_owned()
            } else {
                "The secure enclave's attestation was rejected; the request cannot proceed."
                    .to_owned()
            }
        }
        ErrorCode::SoulUnreachable => {
            "The secure enclave is temporarily unavailable; please try again shortly.".to_owned()
        }
        ErrorCode::ApprovalDenied => "The request was not approved.".to_owned(),
        ErrorCode::ApprovalTimeout => {
            "The approval request expired before a decision arrived.".to_owned()
        }
        _ => format!("The request failed: {}", error.message),
    }
}

async fn emit(sink: &mpsc::Sender<PlanEvent>, event: PlanEvent) {
    // The plan keeps executing even if the listener went away.
    if sink.send(event).await.is_err() {
        debug!("event sink dropped; continuing execution");
    }
}
