//! Local tools with no enclave dependency.
//!
//! Card issuance and freezing are delegated to an external collaborator
//! in production; here they produce the structured outputs the plan and
//! the caller-facing pipeline consume. Notification is delivered
//! through the plan's event stream, so the tool only records the fact.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::types::StepError;

use super::soul::{optional_str, require_str};
use super::{Tool, ToolOutput};

/// `notify_user` -- surface a message to the user.
pub struct NotifyUserTool;

#[async_trait]
impl Tool for NotifyUserTool {
    fn name(&self) -> &'static str {
        "notify_user"
    }

    fn description(&self) -> &'static str {
        "Deliver a message to the user via the event stream"
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let user_id = require_str(&params, "user_id")?;
        let message = optional_str(&params, "message", "Your request finished.");
        info!(user_id, message, "user notification");
        Ok(ToolOutput::from_value(json!({
            "delivered": true,
            "message": message,
        })))
    }
}

/// `create_card` -- issue a new card identifier.
pub struct CreateCardTool;

#[async_trait]
impl Tool for CreateCardTool {
    fn name(&self) -> &'static str {
        "create_card"
    }

    fn description(&self) -> &'static str {
        "Issue a new card"
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        require_str(params, "user_id").map(|_| ())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let user_id = require_str(&params, "user_id")?;
        let currency = optional_str(&params, "currency", "USD");
        let card_id = format!("card-{}", Uuid::new_v4());
        info!(user_id, card_id, currency, "card issued");
        Ok(ToolOutput::from_value(json!({
            "card_id": card_id,
            "currency": currency,
            "status": "active",
        })))
    }
}

/// `freeze_card` -- freeze a card; invertible (unfreeze).
pub struct FreezeCardTool;

#[async_trait]
impl Tool for FreezeCardTool {
    fn name(&self) -> &'static str {
        "freeze_card"
    }

    fn description(&self) -> &'static str {
        "Freeze an existing card"
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        require_str(params, "card_id").map(|_| ())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let card_id = require_str(&params, "card_id")?;
        info!(card_id, "card frozen");
        Ok(ToolOutput::from_value(json!({
            "card_id": card_id,
            "frozen": true,
        })))
    }

    fn has_inverse(&self) -> bool {
        true
    }

    async fn invert(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let card_id = require_str(&params, "card_id")?;
        info!(card_id, "card unfrozen (rollback)");
        Ok(ToolOutput::from_value(json!({
            "card_id": card_id,
            "frozen": false,
        })))
    }
}
