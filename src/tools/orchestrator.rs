//! Tool orchestrator -- the single dispatch point for side effects.
//!
//! Dispatch pipeline: registry lookup, input validation, attestation
//! gate, concurrency permit, deadline-bounded handler invocation.
//! Every failure mode is translated into a structured [`StepResult`];
//! handler errors never propagate raw to the planning engine. The
//! permit is released on all paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ToolsConfig;
use crate::types::{ErrorCode, StepError, StepResult};

use super::{AttestationGate, Tool, ToolMetadata, ToolOutput};

/// Registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A tool with this name is already registered.
    #[error("tool already registered: {0}")]
    Duplicate(String),
}

/// Typed registry plus dispatcher for named tools.
pub struct ToolOrchestrator {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    gate: Arc<dyn AttestationGate>,
    semaphore: Arc<Semaphore>,
    config: ToolsConfig,
}

impl ToolOrchestrator {
    /// Build an orchestrator with the given gate and limits.
    pub fn new(config: ToolsConfig, gate: Arc<dyn AttestationGate>) -> Self {
        Self {
            tools: HashMap::new(),
            gate,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            config,
        }
    }

    /// Register a tool. Names are unique; duplicates are rejected.
    ///
    /// Registration happens during startup wiring, before the
    /// orchestrator is shared; the registry is read-only afterwards.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name();
        if self.tools.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        debug!(tool = name, "tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Metadata for every registered tool, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolMetadata> {
        let mut rows: Vec<ToolMetadata> = self
            .tools
            .values()
            .map(|tool| ToolMetadata {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                requires_remote_verification: tool.requires_remote_verification(),
                has_inverse: tool.has_inverse(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Whether a registered tool can be inverted.
    pub fn tool_has_inverse(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.has_inverse())
    }

    /// Permits currently available (diagnostics).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Dispatch a tool call.
    ///
    /// Never returns a raw error: every failure becomes a
    /// `StepResult { success: false, error: Some(..) }`.
    pub async fn call_tool(&self, name: &str, params: serde_json::Value) -> StepResult {
        self.dispatch(name, params, Invocation::Execute).await
    }

    /// Dispatch a tool's inverse (rollback path).
    pub async fn call_inverse(&self, name: &str, params: serde_json::Value) -> StepResult {
        self.dispatch(name, params, Invocation::Invert).await
    }

    async fn dispatch(
        &self,
        name: &str,
        params: serde_json::Value,
        invocation: Invocation,
    ) -> StepResult {
        let started = Instant::now();

        // 1. Lookup.
        let Some(tool) = self.tools.get(name).cloned() else {
            return failure(
                StepError::new(
                    ErrorCode::ToolNotFound,
                    format!("no tool registered under '{name}'"),
                    false,
                ),
                started,
            );
        };

        // 2. Input validation.
        if let Err(error) = tool.validate(&params) {
            return failure(error, started);
        }

        // 3. Attestation gate.
        if tool.requires_remote_verification() && !self.gate.should_trust().await {
            let message = if self.gate.unreachable().await {
                "Soul is temporarily unavailable"
            } else {
                "Soul attestation was rejected"
            };
            return failure(
                StepError::new(ErrorCode::SoulNotTrusted, message, true)
                    .with_suggestion("retry after the enclave re-attests"),
                started,
            );
        }

        // 4. Concurrency permit, bounded wait.
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout(),
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return failure(
                    StepError::new(ErrorCode::Internal, "tool semaphore closed", false),
                    started,
                );
            }
            Err(_) => {
                return failure(
                    StepError::new(
                        ErrorCode::Overloaded,
                        "too many concurrent tool calls",
                        true,
                    ),
                    started,
                );
            }
        };

        // 5. Handler under deadline. The permit guard spans the await and
        // is released on every path when dropped.
        let deadline = self.config.call_deadline();
        let outcome = match invocation {
            Invocation::Execute => tokio::time::timeout(deadline, tool.execute(params)).await,
            Invocation::Invert => tokio::time::timeout(deadline, tool.invert(params)).await,
        };
        drop(permit);

        match outcome {
            Ok(Ok(output)) => success(output, started),
            Ok(Err(error)) => {
                warn!(tool = name, error = %error, "tool call failed");
                failure(error, started)
            }
            Err(_) => failure(
                StepError::new(
                    ErrorCode::Timeout,
                    format!("tool '{name}' exceeded {deadline:?}"),
                    true,
                ),
                started,
            ),
        }
    }
}

enum Invocation {
    Execute,
    Invert,
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn success(output: ToolOutput, started: Instant) -> StepResult {
    StepResult {
        success: true,
        output: Some(output.output),
        error: None,
        verification: output.verification,
        attestation: output.attestation,
        duration_ms: duration_ms(started),
    }
}

fn failure(error: StepError, started: Instant) -> StepResult {
    StepResult {
        success: false,
        output: None,
        error: Some(error),
        verification: None,
        attestation: None,
        duration_ms: duration_ms(started),
    }
}
