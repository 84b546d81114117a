//! Tool registry and dispatch.
//!
//! Every external side effect in this service is funnelled through a
//! named [`Tool`]. Tools are registered once at startup; the registry
//! is read-only thereafter. The [`orchestrator::ToolOrchestrator`] is
//! the single dispatch point and enforces attestation gating, a global
//! concurrency cap, and per-call deadlines.

pub mod local;
pub mod orchestrator;
pub mod soul;

use async_trait::async_trait;

use crate::types::{QuoteMeta, SoulVerification, StepError};

/// Structured output of a successful tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Key/value output payload.
    pub output: serde_json::Map<String, serde_json::Value>,
    /// Attestation attached by enclave-backed tools.
    pub attestation: Option<QuoteMeta>,
    /// Soul's verification record, for the verification tool.
    pub verification: Option<SoulVerification>,
}

impl ToolOutput {
    /// Build an output from a JSON object literal; non-objects become
    /// `{ "value": ... }`.
    pub fn from_value(value: serde_json::Value) -> Self {
        let output = match value {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_owned(), other);
                map
            }
        };
        Self {
            output,
            attestation: None,
            verification: None,
        }
    }

    /// Attach attestation metadata.
    pub fn with_attestation(mut self, attestation: Option<QuoteMeta>) -> Self {
        self.attestation = attestation;
        self
    }

    /// Attach a verification record.
    pub fn with_verification(mut self, verification: SoulVerification) -> Self {
        self.verification = Some(verification);
        self
    }
}

/// A named, side-effecting capability.
///
/// Implementations validate their inputs, execute, and optionally
/// invert. Handlers report failures as [`StepError`]; the orchestrator
/// guarantees nothing else escapes to the planning engine.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &'static str;

    /// One-line description for `list_tools`.
    fn description(&self) -> &'static str;

    /// Whether calls require a currently trusted enclave attestation.
    fn requires_remote_verification(&self) -> bool {
        false
    }

    /// Validate parameters before any side effect.
    fn validate(&self, _params: &serde_json::Value) -> Result<(), StepError> {
        Ok(())
    }

    /// Execute the tool.
    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, StepError>;

    /// Whether [`Tool::invert`] undoes a completed call.
    fn has_inverse(&self) -> bool {
        false
    }

    /// Undo a completed call during rollback.
    ///
    /// Only invoked when [`Tool::has_inverse`] is true.
    async fn invert(&self, _params: serde_json::Value) -> Result<ToolOutput, StepError> {
        Err(StepError::new(
            crate::types::ErrorCode::Internal,
            format!("tool {} has no inverse", self.name()),
            false,
        ))
    }
}

/// Metadata row returned by `list_tools`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolMetadata {
    /// Registry name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Whether calls are attestation-gated.
    pub requires_remote_verification: bool,
    /// Whether the tool can be inverted during rollback.
    pub has_inverse: bool,
}

/// Trust decisions consumed by the orchestrator's attestation gate.
#[async_trait]
pub trait AttestationGate: Send + Sync {
    /// Whether enclave-backed tools may be dispatched right now.
    async fn should_trust(&self) -> bool;

    /// Whether the last trust refusal was a reachability problem
    /// (as opposed to a rejected quote). Drives user-facing wording.
    async fn unreachable(&self) -> bool;

    /// Measurements of the currently cached attestation, when present.
    async fn measurements(&self) -> Option<(String, String)>;
}

/// Register the standard tool set on a freshly built orchestrator.
///
/// Called once during startup wiring, before the orchestrator is shared.
pub fn register_default_tools(
    orchestrator: &mut orchestrator::ToolOrchestrator,
    soul_api: std::sync::Arc<dyn crate::soul::SoulApi>,
    gate: std::sync::Arc<dyn AttestationGate>,
) -> Result<(), orchestrator::RegistryError> {
    use std::sync::Arc;

    orchestrator.register(Arc::new(soul::VerifyIntentTool::new(
        Arc::clone(&soul_api),
        Arc::clone(&gate),
    )))?;
    orchestrator.register(Arc::new(soul::CheckBalanceTool::new(
        Arc::clone(&soul_api),
        Arc::clone(&gate),
    )))?;
    orchestrator.register(Arc::new(soul::ExecuteFundTool::new(
        Arc::clone(&soul_api),
        Arc::clone(&gate),
    )))?;
    orchestrator.register(Arc::new(soul::ExecuteTransferTool::new(
        Arc::clone(&soul_api),
        Arc::clone(&gate),
    )))?;
    orchestrator.register(Arc::new(soul::ExecuteSwapTool::new(soul_api, gate)))?;
    orchestrator.register(Arc::new(local::NotifyUserTool))?;
    orchestrator.register(Arc::new(local::CreateCardTool))?;
    orchestrator.register(Arc::new(local::FreezeCardTool))?;
    Ok(())
}
