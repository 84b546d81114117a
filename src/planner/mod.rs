//! Planning engine -- turns intents into step DAGs and drives them to a
//! terminal status.
//!
//! A plan is an ordered list of steps instantiated from a static
//! template for the intent's action. The engine executes steps in
//! sequence order once their dependencies are satisfied, pausing for
//! human approval where required, retrying recoverable failures with
//! exponential backoff, and rolling back completed steps in reverse
//! order when a step fails for good. Execution progress is emitted as
//! an ordered event stream.

pub mod approval;
pub mod engine;
pub mod templates;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ActionKind, Intent, StepResult};

/// Lifecycle of a plan. `Completed`, `Failed` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created, not yet executing.
    Pending,
    /// Suspended on a human approval decision.
    AwaitingApproval,
    /// The execution loop is running.
    Executing,
    /// Execution suspended (reserved for operator tooling).
    Paused,
    /// All steps completed or were skipped.
    Completed,
    /// A step failed beyond recovery.
    Failed,
    /// Cancelled by the caller or by session eviction.
    Cancelled,
}

impl PlanStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Ready to execute.
    Pending,
    /// Waiting on unfinished dependencies.
    Blocked,
    /// Currently executing.
    Executing,
    /// Suspended on a human approval decision.
    AwaitingApproval,
    /// Soul verified the step; execution continues.
    VerifiedBySoul,
    /// Finished successfully.
    Completed,
    /// Failed beyond recovery.
    Failed,
    /// Never ran (optional failure, cancellation, or upstream failure).
    Skipped,
    /// Its inverse ran during rollback.
    RolledBack,
}

impl StepStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::RolledBack
        )
    }

    /// Whether a dependent step may start on top of this status.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::VerifiedBySoul)
    }
}

/// The action a step performs, dispatched by tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Re-parse an utterance (reserved; parsing happens before planning).
    ParseIntent,
    /// Ask Soul to verify the intent.
    VerifyWithSoul,
    /// Check an encrypted balance.
    CheckBalance,
    /// Execute a card-to-destination transfer.
    ExecuteTransfer,
    /// Execute an asset swap.
    ExecuteSwap,
    /// Fund a card.
    FundCard,
    /// Issue a new card.
    CreateCard,
    /// Freeze a card.
    FreezeCard,
    /// Tell the user something.
    NotifyUser,
    /// Explicit approval checkpoint (reserved; gating is a step attribute).
    RequestApproval,
    /// Wait for an external confirmation (reserved).
    WaitForConfirmation,
    /// Inverse-execution marker used during rollback.
    Rollback,
}

impl StepAction {
    /// Name of the registered tool this action dispatches to.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::ParseIntent => "parse_intent",
            Self::VerifyWithSoul => "verify_intent",
            Self::CheckBalance => "check_encrypted_balance",
            Self::ExecuteTransfer => "execute_encrypted_transfer",
            Self::ExecuteSwap => "execute_swap",
            Self::FundCard => "execute_encrypted_fund",
            Self::CreateCard => "create_card",
            Self::FreezeCard => "freeze_card",
            Self::NotifyUser => "notify_user",
            Self::RequestApproval => "request_approval",
            Self::WaitForConfirmation => "wait_for_confirmation",
            Self::Rollback => "rollback",
        }
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseIntent => "parse_intent",
            Self::VerifyWithSoul => "verify_with_soul",
            Self::CheckBalance => "check_balance",
            Self::ExecuteTransfer => "execute_transfer",
            Self::ExecuteSwap => "execute_swap",
            Self::FundCard => "fund_card",
            Self::CreateCard => "create_card",
            Self::FreezeCard => "freeze_card",
            Self::NotifyUser => "notify_user",
            Self::RequestApproval => "request_approval",
            Self::WaitForConfirmation => "wait_for_confirmation",
            Self::Rollback => "rollback",
        }
    }
}

/// How a step participates in approval gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSensitivity {
    /// Value-moving: gated under `always` and `high_risk`.
    Privileged,
    /// User-visible state change: gated under `always` only.
    Standard,
    /// Internal machinery: never gated.
    Internal,
}

/// A single step in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique step identifier.
    pub step_id: Uuid,
    /// Owning plan.
    pub plan_id: Uuid,
    /// 1-based position used for deterministic scheduling.
    pub sequence: usize,
    /// What the step does.
    pub action: StepAction,
    /// Human-readable description.
    pub description: String,
    /// Tool parameters, mapped from intent slots at instantiation.
    pub parameters: serde_json::Value,
    /// Steps that must finish before this one starts.
    pub depends_on: Vec<Uuid>,
    /// Whether Soul must verify this step before it executes.
    pub requires_soul_verification: bool,
    /// Approval gating class.
    pub sensitivity: StepSensitivity,
    /// A failure here skips the step instead of failing the plan.
    pub optional: bool,
    /// Current lifecycle state.
    pub status: StepStatus,
    /// Result once the step finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry budget for recoverable failures.
    pub max_retries: u32,
    /// When execution first started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A plan: the DAG of steps materializing one intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique plan identifier.
    pub plan_id: Uuid,
    /// Session that initiated the plan.
    pub session_id: String,
    /// User on whose behalf the plan runs.
    pub user_id: String,
    /// The intent that produced this plan.
    pub original_intent: Intent,
    /// Steps in sequence order.
    pub steps: Vec<PlanStep>,
    /// Current lifecycle state.
    pub status: PlanStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the plan reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Total number of steps.
    pub total_steps: usize,
    /// Steps completed so far.
    pub completed_steps: usize,
    /// Whether any step will pause for approval under the user's
    /// confirmation mode.
    pub requires_approval: bool,
}

impl ExecutionPlan {
    /// Find a step by id.
    pub fn step(&self, step_id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Count steps currently in `status`.
    pub fn count_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// Kind of event emitted during plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEventType {
    /// Execution began.
    PlanStarted,
    /// A step began executing.
    StepStarted,
    /// A step paused for human approval.
    StepAwaitingApproval,
    /// Soul verified a step.
    StepVerified,
    /// A step finished successfully.
    StepCompleted,
    /// A step failed (possibly an optional one, or a rollback failure).
    StepFailed,
    /// A recoverable failure triggered a retry.
    StepRetrying,
    /// The plan finished successfully.
    PlanCompleted,
    /// The plan failed.
    PlanFailed,
    /// The plan was cancelled.
    PlanCancelled,
}

impl PlanEventType {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanStarted => "plan_started",
            Self::StepStarted => "step_started",
            Self::StepAwaitingApproval => "step_awaiting_approval",
            Self::StepVerified => "step_verified",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepRetrying => "step_retrying",
            Self::PlanCompleted => "plan_completed",
            Self::PlanFailed => "plan_failed",
            Self::PlanCancelled => "plan_cancelled",
        }
    }
}

/// One entry in a plan's ordered event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Owning plan.
    pub plan_id: Uuid,
    /// Step the event concerns, absent for plan-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    /// Event kind.
    pub event_type: PlanEventType,
    /// Human-readable description.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Emission time; non-decreasing within one plan's stream.
    pub timestamp: DateTime<Utc>,
}

impl PlanEvent {
    /// Build an event stamped with the current time.
    pub fn new(
        plan_id: Uuid,
        step_id: Option<Uuid>,
        event_type: PlanEventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            plan_id,
            step_id,
            event_type,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Planning engine errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// No template exists for this action; the action is handled
    /// conversationally instead of through a plan.
    #[error("no plan template for action: {0}")]
    NoTemplate(ActionKind),
    /// Unknown plan identifier.
    #[error("plan not found: {0}")]
    PlanNotFound(Uuid),
    /// The plan exists but is already being executed.
    #[error("plan already executing: {0}")]
    AlreadyExecuting(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_final() {
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
        assert!(!PlanStatus::Executing.is_terminal());
        assert!(!PlanStatus::AwaitingApproval.is_terminal());
        assert!(!PlanStatus::Paused.is_terminal());
    }

    #[test]
    fn dependency_satisfaction_matches_contract() {
        assert!(StepStatus::Completed.satisfies_dependency());
        assert!(StepStatus::Skipped.satisfies_dependency());
        assert!(StepStatus::VerifiedBySoul.satisfies_dependency());
        assert!(!StepStatus::Pending.satisfies_dependency());
        assert!(!StepStatus::Failed.satisfies_dependency());
        assert!(!StepStatus::Executing.satisfies_dependency());
    }

    #[test]
    fn step_actions_map_to_registered_tool_names() {
        assert_eq!(StepAction::VerifyWithSoul.tool_name(), "verify_intent");
        assert_eq!(
            StepAction::CheckBalance.tool_name(),
            "check_encrypted_balance"
        );
        assert_eq!(StepAction::FundCard.tool_name(), "execute_encrypted_fund");
        assert_eq!(
            StepAction::ExecuteTransfer.tool_name(),
            "execute_encrypted_transfer"
        );
    }

    #[test]
    fn event_type_wire_names_are_stable() {
        assert_eq!(PlanEventType::PlanStarted.as_str(), "plan_started");
        assert_eq!(
            PlanEventType::StepAwaitingApproval.as_str(),
            "step_awaiting_approval"
        );
        assert_eq!(PlanEventType::StepRetrying.as_str(), "step_retrying");
        let json = serde_json::to_string(&PlanEventType::StepVerified).expect("serialize");
        assert_eq!(json, "\"step_verified\"");
    }
}
