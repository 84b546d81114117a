//! Static plan templates, one per plannable action.
//!
//! A template is an ordered list of step blueprints with dependency
//! indices. Instantiation substitutes intent slots and user state into
//! each step's tool parameters. Actions without a template
//! (balance checks, free-form queries) are answered conversationally
//! and never produce a plan.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::PlannerConfig;
use crate::types::{ActionKind, ConfirmationMode, Intent, UserState};

use super::{ExecutionPlan, PlanError, PlanStatus, PlanStep, StepAction, StepSensitivity, StepStatus};

/// Blueprint for one step of a template.
#[derive(Debug, Clone, Copy)]
pub struct StepTemplate {
    /// The action the step performs.
    pub action: StepAction,
    /// Description shown in events and approval prompts.
    pub description: &'static str,
    /// Indices (into the template) of prerequisite steps.
    pub depends_on: &'static [usize],
    /// Whether Soul must verify this step before it executes.
    pub requires_soul_verification: bool,
    /// A failure here skips the step instead of failing the plan.
    pub optional: bool,
    /// Approval gating class.
    pub sensitivity: StepSensitivity,
}

/// Blueprint for a whole plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanTemplate {
    /// Steps in execution order.
    pub steps: &'static [StepTemplate],
}

const FUND_CARD: PlanTemplate = PlanTemplate {
    steps: &[
        StepTemplate {
            action: StepAction::VerifyWithSoul,
            description: "Verify funding intent with Soul",
            depends_on: &[],
            requires_soul_verification: true,
            optional: false,
            sensitivity: StepSensitivity::Internal,
        },
        StepTemplate {
            action: StepAction::FundCard,
            description: "Fund card from wallet",
            depends_on: &[0],
            requires_soul_verification: false,
            optional: false,
            sensitivity: StepSensitivity::Privileged,
        },
    ],
};

const TRANSFER: PlanTemplate = PlanTemplate {
    steps: &[
        StepTemplate {
            action: StepAction::VerifyWithSoul,
            description: "Verify transfer intent with Soul",
            depends_on: &[],
            requires_soul_verification: true,
            optional: false,
            sensitivity: StepSensitivity::Internal,
        },
        StepTemplate {
            action: StepAction::CheckBalance,
            description: "Check encrypted balance covers the transfer",
            depends_on: &[0],
            requires_soul_verification: false,
            optional: false,
            sensitivity: StepSensitivity::Internal,
        },
        StepTemplate {
            action: StepAction::ExecuteTransfer,
            description: "Execute encrypted transfer",
            depends_on: &[1],
            requires_soul_verification: false,
            optional: false,
            sensitivity: StepSensitivity::Privileged,
        },
        StepTemplate {
            action: StepAction::NotifyUser,
            description: "Notify user of the transfer result",
            depends_on: &[2],
            requires_soul_verification: false,
            optional: true,
            sensitivity: StepSensitivity::Internal,
        },
    ],
};

const SWAP: PlanTemplate = PlanTemplate {
    steps: &[
        StepTemplate {
            action: StepAction::VerifyWithSoul,
            description: "Verify swap intent with Soul",
            depends_on: &[],
            requires_soul_verification: true,
            optional: false,
            sensitivity: StepSensitivity::Internal,
        },
        StepTemplate {
            action: StepAction::CheckBalance,
            description: "Check encrypted balance covers the swap",
            depends_on: &[0],
            requires_soul_verification: false,
            optional: false,
            sensitivity: StepSensitivity::Internal,
        },
        StepTemplate {
            action: StepAction::ExecuteSwap,
            description: "Execute asset swap",
            depends_on: &[1],
            requires_soul_verification: false,
            optional: false,
            sensitivity: StepSensitivity::Privileged,
        },
    ],
};

const CREATE_CARD: PlanTemplate = PlanTemplate {
    steps: &[StepTemplate {
        action: StepAction::CreateCard,
        description: "Issue a new card",
        depends_on: &[],
        requires_soul_verification: false,
        optional: false,
        sensitivity: StepSensitivity::Standard,
    }],
};

const FREEZE_CARD: PlanTemplate = PlanTemplate {
    steps: &[StepTemplate {
        action: StepAction::FreezeCard,
        description: "Freeze the card",
        depends_on: &[],
        requires_soul_verification: false,
        optional: false,
        sensitivity: StepSensitivity::Standard,
    }],
};

/// Template for an action, `None` for conversational actions.
pub fn template_for(action: ActionKind) -> Option<&'static PlanTemplate> {
    match action {
        ActionKind::FundCard => Some(&FUND_CARD),
        ActionKind::Transfer => Some(&TRANSFER),
        ActionKind::Swap => Some(&SWAP),
        ActionKind::CreateCard => Some(&CREATE_CARD),
        ActionKind::FreezeCard => Some(&FREEZE_CARD),
        ActionKind::CheckBalance | ActionKind::Query | ActionKind::Unknown => None,
    }
}

/// Whether a step of this sensitivity pauses for approval under `mode`.
pub fn gated(sensitivity: StepSensitivity, mode: ConfirmationMode) -> bool {
    match mode {
        ConfirmationMode::Never => false,
        ConfirmationMode::HighRisk => sensitivity == StepSensitivity::Privileged,
        ConfirmationMode::Always => sensitivity != StepSensitivity::Internal,
    }
}

/// Instantiate a plan from the template matching the intent's action.
pub fn build_plan(
    intent: &Intent,
    session_id: &str,
    user_id: &str,
    state: &UserState,
    config: &PlannerConfig,
) -> Result<ExecutionPlan, PlanError> {
    let template = template_for(intent.action).ok_or(PlanError::NoTemplate(intent.action))?;

    let plan_id = Uuid::new_v4();
    let step_ids: Vec<Uuid> = template.steps.iter().map(|_| Uuid::new_v4()).collect();
    let mode = state.preferences.confirmation_mode;

    let steps: Vec<PlanStep> = template
        .steps
        .iter()
        .enumerate()
        .map(|(index, blueprint)| PlanStep {
            step_id: step_ids[index],
            plan_id,
            sequence: index.saturating_add(1),
            action: blueprint.action,
            description: blueprint.description.to_owned(),
            parameters: step_parameters(blueprint.action, intent, user_id, state),
            depends_on: blueprint
                .depends_on
                .iter()
                .filter_map(|i| step_ids.get(*i).copied())
                .collect(),
            requires_soul_verification: blueprint.requires_soul_verification,
            sensitivity: blueprint.sensitivity,
            optional: blueprint.optional,
            status: if blueprint.depends_on.is_empty() {
                StepStatus::Pending
            } else {
                StepStatus::Blocked
            },
            result: None,
            retry_count: 0,
            max_retries: config.max_retries,
            started_at: None,
            completed_at: None,
        })
        .collect();

    let requires_approval = steps.iter().any(|s| gated(s.sensitivity, mode));
    let total_steps = steps.len();

    Ok(ExecutionPlan {
        plan_id,
        session_id: session_id.to_owned(),
        user_id: user_id.to_owned(),
        original_intent: intent.clone(),
        steps,
        status: PlanStatus::Pending,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        total_steps,
        completed_steps: 0,
        requires_approval,
    })
}

/// Map intent slots and user state into a step's tool parameters.
fn step_parameters(
    action: StepAction,
    intent: &Intent,
    user_id: &str,
    state: &UserState,
) -> serde_json::Value {
    let card_id = state.card_id.as_deref().unwrap_or("primary");
    let wallet = state.wallet_address.as_deref().unwrap_or_default();
    let amount = intent
        .amount
        .map(|a| a.to_string())
        .unwrap_or_else(|| "0".to_owned());
    let currency = intent
        .currency
        .clone()
        .or_else(|| state.preferred_currency.clone())
        .unwrap_or_else(|| "USD".to_owned());
    let target = intent
        .parameters
        .get("target")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    match action {
        StepAction::VerifyWithSoul => json!({
            "intent": intent,
            "user_id": user_id,
        }),
        StepAction::CheckBalance => json!({
            "card_id": card_id,
            "minimum_required": amount,
            "user_id": user_id,
            "wallet_address": wallet,
        }),
        StepAction::FundCard => json!({
            "card_id": card_id,
            "amount": amount,
            "user_id": user_id,
            "wallet_address": wallet,
            "source_type": intent.source_type.as_deref().unwrap_or("wallet"),
        }),
        StepAction::ExecuteTransfer => json!({
            "source_card_id": card_id,
            "amount": amount,
            "user_id": user_id,
            "wallet_address": wallet,
            "destination_type": intent.target_type.as_deref().unwrap_or("contact"),
            "destination_id": target,
        }),
        StepAction::ExecuteSwap => json!({
            "source_card_id": card_id,
            "amount": amount,
            "user_id": user_id,
            "wallet_address": wallet,
            "to_currency": currency,
        }),
        StepAction::CreateCard => json!({
            "user_id": user_id,
            "currency": currency,
        }),
        StepAction::FreezeCard => json!({
            "card_id": card_id,
            "user_id": user_id,
        }),
        StepAction::NotifyUser => json!({
            "user_id": user_id,
            "message": format!("Your {} request finished.", intent.action),
        }),
        StepAction::ParseIntent
        | StepAction::RequestApproval
        | StepAction::WaitForConfirmation
        | StepAction::Rollback => json!({ "user_id": user_id }),
    }
}
