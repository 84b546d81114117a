//! Shared test rig: a scriptable Soul stub and service-state builder.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use brain::config::{
    AttestationConfig, BrainConfig, ContextConfig, PlannerConfig, ToolsConfig,
};
use brain::context::summarizer::ActionDigestSummarizer;
use brain::context::ContextManager;
use brain::intent::IntentParser;
use brain::llm::ChatClient;
use brain::pb::soul as pb;
use brain::planner::engine::PlanningEngine;
use brain::server::metrics::Metrics;
use brain::server::ServiceState;
use brain::soul::attestation::AttestationVerifier;
use brain::soul::{HealthReport, SoulApi, SoulClientError};
use brain::tools::orchestrator::ToolOrchestrator;
use brain::tools::{register_default_tools, AttestationGate};

/// How the stub answers `verify_intent`.
#[derive(Debug, Clone, Copy)]
pub enum VerifyBehavior {
    Accept,
    Reject { recoverable: bool },
}

/// Scriptable Soul double. Call counters are public so tests can assert
/// which privileged paths actually ran.
pub struct StubSoul {
    pub verify: VerifyBehavior,
    /// Number of leading `execute_fund` calls that fail recoverably.
    pub fund_failures_before_success: u32,
    pub sufficient: bool,

    pub verify_calls: AtomicU32,
    pub balance_calls: AtomicU32,
    pub fund_calls: AtomicU32,
    pub transfer_calls: AtomicU32,
}

impl Default for StubSoul {
    fn default() -> Self {
        Self {
            verify: VerifyBehavior::Accept,
            fund_failures_before_success: 0,
            sufficient: true,
            verify_calls: AtomicU32::new(0),
            balance_calls: AtomicU32::new(0),
            fund_calls: AtomicU32::new(0),
            transfer_calls: AtomicU32::new(0),
        }
    }
}

fn attestation(nonce: &str) -> pb::AttestationResponse {
    let now = Utc::now().timestamp_millis();
    pb::AttestationResponse {
        quote: vec![0xAB, 0xCD],
        mr_enclave: "aa".repeat(32),
        mr_signer: "bb".repeat(32),
        public_key: vec![1, 2],
        timestamp_ms: now,
        expires_at_ms: now.saturating_add(60_000),
        nonce: nonce.to_owned(),
    }
}

#[async_trait]
impl SoulApi for StubSoul {
    async fn get_attestation(
        &self,
        nonce: &str,
        _refresh: bool,
    ) -> Result<pb::AttestationResponse, SoulClientError> {
        Ok(attestation(nonce))
    }

    async fn verify_intent(
        &self,
        _intent_json: String,
        _context_json: String,
    ) -> Result<pb::VerifyIntentResponse, SoulClientError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        match self.verify {
            VerifyBehavior::Accept => Ok(pb::VerifyIntentResponse {
                verified: true,
                attestation_quote: vec![0xAB, 0xCD],
                reason: String::new(),
                recoverable: false,
            }),
            VerifyBehavior::Reject { recoverable } => Ok(pb::VerifyIntentResponse {
                verified: false,
                attestation_quote: vec![],
                reason: "policy violation".to_owned(),
                recoverable,
            }),
        }
    }

    async fn check_balance(
        &self,
        _request: pb::CheckBalanceRequest,
    ) -> Result<pb::CheckBalanceResponse, SoulClientError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(pb::CheckBalanceResponse {
            sufficient: self.sufficient,
            attestation_quote: vec![0xAB, 0xCD],
            attestation_timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    async fn execute_fund(
        &self,
        _request: pb::ExecuteFundRequest,
    ) -> Result<pb::ExecuteFundResponse, SoulClientError> {
        let call = self.fund_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fund_failures_before_success {
            return Ok(pb::ExecuteFundResponse {
                success: false,
                new_handle: String::new(),
                new_epoch: 0,
                attestation_quote: vec![],
                error: Some(pb::SoulError {
                    code: "timeout".to_owned(),
                    message: "enclave busy".to_owned(),
                    recoverable: true,
                }),
            });
        }
        Ok(pb::ExecuteFundResponse {
            success: true,
            new_handle: "handle-2".to_owned(),
            new_epoch: 2,
            attestation_quote: vec![0xAB, 0xCD],
            error: None,
        })
    }

    async fn execute_transfer(
        &self,
        _request: pb::ExecuteTransferRequest,
    ) -> Result<pb::ExecuteTransferResponse, SoulClientError> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        Ok(pb::ExecuteTransferResponse {
            success: true,
            new_source_handle: "handle-3".to_owned(),
            new_source_epoch: 3,
            attestation_quote: vec![0xAB, 0xCD],
            error: None,
        })
    }

    async fn health_check(&self) -> Result<HealthReport, SoulClientError> {
        Ok(HealthReport {
            healthy: true,
            latency_ms: 1,
        })
    }
}

/// Planner config with near-zero backoff so retry tests run fast.
pub fn fast_planner() -> PlannerConfig {
    PlannerConfig {
        max_retries: 3,
        step_deadline_ms: 5_000,
        retry_backoff_base_ms: 1,
        retry_backoff_cap_ms: 4,
        approval_timeout_seconds: 5,
    }
}

/// Build a fully wired service state over the given Soul stub.
pub fn build_state(soul: Arc<StubSoul>, context_config: ContextConfig) -> Arc<ServiceState> {
    let soul_api: Arc<dyn SoulApi> = soul;

    let mut config = BrainConfig::default();
    config.context = context_config;
    config.planner = fast_planner();

    let verifier = Arc::new(AttestationVerifier::new(
        Arc::clone(&soul_api),
        AttestationConfig::default(),
    ));
    let gate: Arc<dyn AttestationGate> = Arc::clone(&verifier) as Arc<dyn AttestationGate>;

    let mut orchestrator = ToolOrchestrator::new(ToolsConfig::default(), Arc::clone(&gate));
    register_default_tools(&mut orchestrator, Arc::clone(&soul_api), gate)
        .expect("register default tools");
    let orchestrator = Arc::new(orchestrator);

    let engine = Arc::new(PlanningEngine::new(
        fast_planner(),
        Arc::clone(&orchestrator),
    ));

    let context = Arc::new(ContextManager::new(
        config.context.clone(),
        config.privacy.clone(),
        Arc::new(ActionDigestSummarizer),
    ));

    Arc::new(ServiceState {
        parser: IntentParser::new(),
        context,
        engine,
        orchestrator,
        verifier,
        llm: Arc::new(ChatClient::new(config.llm.clone())),
        metrics: Metrics::default(),
        config,
        started_at: Instant::now(),
    })
}

/// Default-context convenience wrapper.
pub fn default_state(soul: Arc<StubSoul>) -> Arc<ServiceState> {
    build_state(soul, ContextConfig::default())
}
