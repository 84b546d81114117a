//! Remote-enclave ("Soul") integration.
//!
//! [`client::SoulClient`] is the thin gRPC connection layer;
//! [`attestation::AttestationVerifier`] turns Soul's quotes into trust
//! decisions for the tool orchestrator. Both sit behind the [`SoulApi`]
//! trait so higher layers (and tests) never depend on the transport.

pub mod attestation;
pub mod client;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pb::soul as pb;

/// Soul client errors.
#[derive(Debug, Error)]
pub enum SoulClientError {
    /// The enclave endpoint could not be reached.
    #[error("soul unreachable: {0}")]
    Unreachable(String),
    /// The call exceeded its deadline.
    #[error("soul call timed out after {0:?}")]
    Timeout(Duration),
    /// The enclave answered with a non-OK gRPC status.
    #[error("soul returned status: {0}")]
    Status(#[from] tonic::Status),
}

impl SoulClientError {
    /// Whether the failure is a connectivity problem rather than a
    /// rejection by the enclave.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => true,
            Self::Status(status) => status.code() == tonic::Code::Unavailable,
        }
    }
}

/// Result of a liveness probe against the enclave.
#[derive(Debug, Clone, Copy)]
pub struct HealthReport {
    /// Whether the enclave reported itself healthy.
    pub healthy: bool,
    /// Round-trip latency of the probe.
    pub latency_ms: u64,
}

/// The subset of Soul's RPC surface this service consumes.
#[async_trait]
pub trait SoulApi: Send + Sync {
    /// Fetch an attestation quote bound to `nonce`.
    async fn get_attestation(
        &self,
        nonce: &str,
        refresh: bool,
    ) -> Result<pb::AttestationResponse, SoulClientError>;

    /// Ask Soul to verify a parsed intent.
    async fn verify_intent(
        &self,
        intent_json: String,
        context_json: String,
    ) -> Result<pb::VerifyIntentResponse, SoulClientError>;

    /// Check an encrypted balance.
    async fn check_balance(
        &self,
        request: pb::CheckBalanceRequest,
    ) -> Result<pb::CheckBalanceResponse, SoulClientError>;

    /// Fund a card.
    async fn execute_fund(
        &self,
        request: pb::ExecuteFundRequest,
    ) -> Result<pb::ExecuteFundResponse, SoulClientError>;

    /// Transfer from a card.
    async fn execute_transfer(
        &self,
        request: pb::ExecuteTransferRequest,
    ) -> Result<pb::ExecuteTransferResponse, SoulClientError>;

    /// Probe liveness and measure round-trip latency.
    async fn health_check(&self) -> Result<HealthReport, SoulClientError>;
}
