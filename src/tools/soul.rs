//! Enclave-backed tools.
//!
//! These are the only tools with privileged side effects; every one of
//! them requires a trusted attestation at dispatch time and attaches
//! the enclave's quote to its result. Monetary amounts travel as
//! decimal strings end to end.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;

use crate::pb::soul as pb;
use crate::soul::{SoulApi, SoulClientError};
use crate::types::{ErrorCode, QuoteMeta, SoulVerification, StepError};

use super::{AttestationGate, Tool, ToolOutput};

/// Extract a required non-empty string field.
pub(crate) fn require_str(params: &serde_json::Value, key: &str) -> Result<String, StepError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            StepError::new(
                ErrorCode::InvalidInput,
                format!("missing required field: {key}"),
                false,
            )
        })
}

/// Extract a string field with a default.
pub(crate) fn optional_str(params: &serde_json::Value, key: &str, default: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default.to_owned())
}

/// Extract a decimal field (encoded as a string) and bound-check it.
fn require_decimal(
    params: &serde_json::Value,
    key: &str,
    allow_zero: bool,
) -> Result<Decimal, StepError> {
    let raw = require_str(params, key)?;
    let value = Decimal::from_str(&raw).map_err(|_| {
        StepError::new(
            ErrorCode::InvalidInput,
            format!("{key} is not a valid decimal: {raw}"),
            false,
        )
    })?;
    let in_range = if allow_zero {
        value >= Decimal::ZERO
    } else {
        value > Decimal::ZERO
    };
    if !in_range {
        return Err(StepError::new(
            ErrorCode::InvalidInput,
            format!(
                "{key} must be {} zero",
                if allow_zero { "at least" } else { "greater than" }
            ),
            false,
        ));
    }
    Ok(value)
}

/// Translate transport/status failures into structured step errors.
fn soul_error(error: SoulClientError) -> StepError {
    if error.is_unreachable() {
        StepError::new(ErrorCode::SoulUnreachable, error.to_string(), true)
            .with_suggestion("retry once the enclave is back")
    } else {
        StepError::new(ErrorCode::ToolError, error.to_string(), false)
    }
}

/// Translate an error reported inside a Soul response payload.
fn soul_payload_error(error: pb::SoulError) -> StepError {
    let code = match error.code.as_str() {
        "invalid_input" => ErrorCode::InvalidInput,
        "timeout" => ErrorCode::Timeout,
        "overloaded" => ErrorCode::Overloaded,
        _ => ErrorCode::ToolError,
    };
    StepError::new(code, error.message, error.recoverable)
}

/// Stamp a raw quote with the verifier's cached measurements.
async fn quote_meta(gate: &Arc<dyn AttestationGate>, quote: Vec<u8>) -> Option<QuoteMeta> {
    if quote.is_empty() {
        return None;
    }
    let (mr_enclave, mr_signer) = gate.measurements().await.unwrap_or_default();
    Some(QuoteMeta {
        quote,
        mr_enclave,
        mr_signer,
        timestamp: Utc::now(),
    })
}

/// `verify_intent` -- ask Soul to independently confirm a parsed intent.
pub struct VerifyIntentTool {
    soul: Arc<dyn SoulApi>,
    gate: Arc<dyn AttestationGate>,
}

impl VerifyIntentTool {
    /// Build over a Soul handle and the attestation gate.
    pub fn new(soul: Arc<dyn SoulApi>, gate: Arc<dyn AttestationGate>) -> Self {
        Self { soul, gate }
    }
}

#[async_trait]
impl Tool for VerifyIntentTool {
    fn name(&self) -> &'static str {
        "verify_intent"
    }

    fn description(&self) -> &'static str {
        "Verify a parsed intent with the Soul enclave before execution"
    }

    fn requires_remote_verification(&self) -> bool {
        true
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        if params.get("intent").is_none() {
            return Err(StepError::new(
                ErrorCode::InvalidInput,
                "missing required field: intent",
                false,
            ));
        }
        Ok(())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let intent_json = params
            .get("intent")
            .map(ToString::to_string)
            .unwrap_or_default();
        let context_json = params
            .get("context")
            .map(ToString::to_string)
            .unwrap_or_else(|| "{}".to_owned());

        let response = self
            .soul
            .verify_intent(intent_json, context_json)
            .await
            .map_err(soul_error)?;

        if !response.verified {
            let reason = if response.reason.is_empty() {
                "Soul rejected the intent".to_owned()
            } else {
                format!("Soul rejected the intent: {}", response.reason)
            };
            return Err(StepError::new(
                ErrorCode::ToolError,
                reason,
                response.recoverable,
            ));
        }

        Ok(
            ToolOutput::from_value(json!({ "verified": true }))
                .with_attestation(quote_meta(&self.gate, response.attestation_quote).await)
                .with_verification(SoulVerification {
                    verified: true,
                    reason: None,
                }),
        )
    }
}

/// `check_encrypted_balance` -- confirm a card covers a required minimum.
pub struct CheckBalanceTool {
    soul: Arc<dyn SoulApi>,
    gate: Arc<dyn AttestationGate>,
}

impl CheckBalanceTool {
    /// Build over a Soul handle and the attestation gate.
    pub fn new(soul: Arc<dyn SoulApi>, gate: Arc<dyn AttestationGate>) -> Self {
        Self { soul, gate }
    }
}

#[async_trait]
impl Tool for CheckBalanceTool {
    fn name(&self) -> &'static str {
        "check_encrypted_balance"
    }

    fn description(&self) -> &'static str {
        "Check an encrypted card balance against a required minimum"
    }

    fn requires_remote_verification(&self) -> bool {
        true
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        require_str(params, "card_id")?;
        require_str(params, "user_id")?;
        require_decimal(params, "minimum_required", true)?;
        Ok(())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let minimum = require_decimal(&params, "minimum_required", true)?;
        let request = pb::CheckBalanceRequest {
            card_id: require_str(&params, "card_id")?,
            minimum_required: minimum.to_string(),
            user_id: require_str(&params, "user_id")?,
            wallet_address: optional_str(&params, "wallet_address", ""),
        };

        let response = self.soul.check_balance(request).await.map_err(soul_error)?;

        if !response.sufficient && minimum > Decimal::ZERO {
            return Err(StepError::new(
                ErrorCode::ToolError,
                format!("balance below required minimum of {minimum}"),
                false,
            )
            .with_suggestion("add funds before retrying"));
        }

        Ok(ToolOutput::from_value(json!({
            "sufficient": response.sufficient,
            "attestation_timestamp": response.attestation_timestamp_ms,
        }))
        .with_attestation(quote_meta(&self.gate, response.attestation_quote).await))
    }
}

/// `execute_encrypted_fund` -- move funds onto a card.
///
/// Invertible: the inverse transfers the same amount from the card back
/// to the funding wallet.
pub struct ExecuteFundTool {
    soul: Arc<dyn SoulApi>,
    gate: Arc<dyn AttestationGate>,
}

impl ExecuteFundTool {
    /// Build over a Soul handle and the attestation gate.
    pub fn new(soul: Arc<dyn SoulApi>, gate: Arc<dyn AttestationGate>) -> Self {
        Self { soul, gate }
    }
}

#[async_trait]
impl Tool for ExecuteFundTool {
    fn name(&self) -> &'static str {
        "execute_encrypted_fund"
    }

    fn description(&self) -> &'static str {
        "Fund a card from a wallet or other source"
    }

    fn requires_remote_verification(&self) -> bool {
        true
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        require_str(params, "card_id")?;
        require_str(params, "user_id")?;
        require_decimal(params, "amount", false)?;
        Ok(())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let amount = require_decimal(&params, "amount", false)?;
        let request = pb::ExecuteFundRequest {
            card_id: require_str(&params, "card_id")?,
            amount: amount.to_string(),
            user_id: require_str(&params, "user_id")?,
            wallet_address: optional_str(&params, "wallet_address", ""),
            source_type: optional_str(&params, "source_type", "wallet"),
            source_id: optional_str(&params, "source_id", ""),
        };

        let response = self.soul.execute_fund(request).await.map_err(soul_error)?;

        if !response.success {
            return Err(response
                .error
                .map(soul_payload_error)
                .unwrap_or_else(|| {
                    StepError::new(ErrorCode::ToolError, "fund operation failed", false)
                }));
        }

        Ok(ToolOutput::from_value(json!({
            "new_handle": response.new_handle,
            "new_epoch": response.new_epoch,
        }))
        .with_attestation(quote_meta(&self.gate, response.attestation_quote).await))
    }

    fn has_inverse(&self) -> bool {
        true
    }

    async fn invert(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let amount = require_decimal(&params, "amount", false)?;
        let request = pb::ExecuteTransferRequest {
            source_card_id: require_str(&params, "card_id")?,
            amount: amount.to_string(),
            user_id: require_str(&params, "user_id")?,
            wallet_address: optional_str(&params, "wallet_address", ""),
            destination_type: "wallet".to_owned(),
            destination_id: optional_str(&params, "wallet_address", ""),
        };

        let response = self
            .soul
            .execute_transfer(request)
            .await
            .map_err(soul_error)?;

        if !response.success {
            return Err(response
                .error
                .map(soul_payload_error)
                .unwrap_or_else(|| {
                    StepError::new(ErrorCode::RollbackFailure, "refund transfer failed", false)
                }));
        }

        Ok(ToolOutput::from_value(json!({ "refunded": amount.to_string() }))
            .with_attestation(quote_meta(&self.gate, response.attestation_quote).await))
    }
}

/// `execute_encrypted_transfer` -- move funds from a card to an external
/// destination. Not invertible: sent funds cannot be clawed back.
pub struct ExecuteTransferTool {
    soul: Arc<dyn SoulApi>,
    gate: Arc<dyn AttestationGate>,
}

impl ExecuteTransferTool {
    /// Build over a Soul handle and the attestation gate.
    pub fn new(soul: Arc<dyn SoulApi>, gate: Arc<dyn AttestationGate>) -> Self {
        Self { soul, gate }
    }
}

#[async_trait]
impl Tool for ExecuteTransferTool {
    fn name(&self) -> &'static str {
        "execute_encrypted_transfer"
    }

    fn description(&self) -> &'static str {
        "Transfer from a card to an external destination"
    }

    fn requires_remote_verification(&self) -> bool {
        true
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        require_str(params, "source_card_id")?;
        require_str(params, "user_id")?;
        require_str(params, "destination_type")?;
        require_str(params, "destination_id")?;
        require_decimal(params, "amount", false)?;
        Ok(())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let amount = require_decimal(&params, "amount", false)?;
        let request = pb::ExecuteTransferRequest {
            source_card_id: require_str(&params, "source_card_id")?,
            amount: amount.to_string(),
            user_id: require_str(&params, "user_id")?,
            wallet_address: optional_str(&params, "wallet_address", ""),
            destination_type: require_str(&params, "destination_type")?,
            destination_id: require_str(&params, "destination_id")?,
        };

        let response = self
            .soul
            .execute_transfer(request)
            .await
            .map_err(soul_error)?;

        if !response.success {
            return Err(response
                .error
                .map(soul_payload_error)
                .unwrap_or_else(|| {
                    StepError::new(ErrorCode::ToolError, "transfer failed", false)
                }));
        }

        Ok(ToolOutput::from_value(json!({
            "new_source_handle": response.new_source_handle,
            "new_source_epoch": response.new_source_epoch,
        }))
        .with_attestation(quote_meta(&self.gate, response.attestation_quote).await))
    }
}

/// `execute_swap` -- exchange between assets, routed through Soul as a
/// transfer into the swap pool.
pub struct ExecuteSwapTool {
    soul: Arc<dyn SoulApi>,
    gate: Arc<dyn AttestationGate>,
}

impl ExecuteSwapTool {
    /// Build over a Soul handle and the attestation gate.
    pub fn new(soul: Arc<dyn SoulApi>, gate: Arc<dyn AttestationGate>) -> Self {
        Self { soul, gate }
    }
}

#[async_trait]
impl Tool for ExecuteSwapTool {
    fn name(&self) -> &'static str {
        "execute_swap"
    }

    fn description(&self) -> &'static str {
        "Swap between assets via the Soul enclave"
    }

    fn requires_remote_verification(&self) -> bool {
        true
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), StepError> {
        require_str(params, "source_card_id")?;
        require_str(params, "user_id")?;
        require_decimal(params, "amount", false)?;
        Ok(())
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError> {
        let amount = require_decimal(&params, "amount", false)?;
        let to_currency = optional_str(&params, "to_currency", "USDC");
        let request = pb::ExecuteTransferRequest {
            source_card_id: require_str(&params, "source_card_id")?,
            amount: amount.to_string(),
            user_id: require_str(&params, "user_id")?,
            wallet_address: optional_str(&params, "wallet_address", ""),
            destination_type: "swap".to_owned(),
            destination_id: to_currency.clone(),
        };

        let response = self
            .soul
            .execute_transfer(request)
            .await
            .map_err(soul_error)?;

        if !response.success {
            return Err(response
                .error
                .map(soul_payload_error)
                .unwrap_or_else(|| StepError::new(ErrorCode::ToolError, "swap failed", false)));
        }

        Ok(ToolOutput::from_value(json!({
            "swapped_to": to_currency,
            "new_source_handle": response.new_source_handle,
        }))
        .with_attestation(quote_meta(&self.gate, response.attestation_quote).await))
    }
}
