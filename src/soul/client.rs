//! gRPC client for the sibling enclave.
//!
//! One persistent channel, established lazily and re-established on
//! failure with jittered exponential backoff (base 100 ms, cap 5 s).
//! Concurrent calls multiplex on the channel; each call carries the
//! configured deadline. This layer does transport only -- no business
//! decisions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::pb::soul as pb;
use crate::pb::soul::soul_service_client::SoulServiceClient;

use super::{HealthReport, SoulApi, SoulClientError};

/// Reconnect backoff floor.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Reconnect backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Persistent gRPC client for Soul.
pub struct SoulClient {
    endpoint: String,
    deadline: Duration,
    channel: RwLock<Option<SoulServiceClient<Channel>>>,
    consecutive_failures: AtomicU32,
}

impl SoulClient {
    /// Create a client for `endpoint` (scheme-prefixed host:port) with a
    /// per-call deadline. No connection is made until the first call.
    pub fn new(endpoint: impl Into<String>, deadline: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            deadline,
            channel: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Eagerly establish the connection.
    pub async fn connect(&self) -> Result<(), SoulClientError> {
        self.client().await.map(|_| ())
    }

    /// Drop the connection; the next call reconnects lazily.
    pub async fn close(&self) {
        *self.channel.write().await = None;
        debug!("soul connection closed");
    }

    /// Configured endpoint (diagnostics).
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn client(&self) -> Result<SoulServiceClient<Channel>, SoulClientError> {
        if let Some(existing) = self.channel.read().await.as_ref() {
            return Ok(existing.clone());
        }

        let mut slot = self.channel.write().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        // Jittered exponential backoff keyed on consecutive failures, so
        // a flapping enclave is not hammered by every queued caller.
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures > 0 {
            tokio::time::sleep(backoff_delay(failures)).await;
        }

        let endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| SoulClientError::Unreachable(format!("invalid endpoint: {e}")))?
            .connect_timeout(self.deadline)
            .timeout(self.deadline);

        match endpoint.connect().await {
            Ok(channel) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!(endpoint = %self.endpoint, "soul connected");
                let client = SoulServiceClient::new(channel);
                *slot = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                let failures = self
                    .consecutive_failures
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                warn!(endpoint = %self.endpoint, failures, error = %e, "soul connect failed");
                Err(SoulClientError::Unreachable(e.to_string()))
            }
        }
    }

    /// Run one RPC with the per-call deadline, resetting the channel on
    /// transport-level failure so the next call reconnects.
    async fn call<T, F, Fut>(&self, f: F) -> Result<T, SoulClientError>
    where
        F: FnOnce(SoulServiceClient<Channel>) -> Fut,
        Fut: std::future::Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        let client = self.client().await?;
        match tokio::time::timeout(self.deadline, f(client)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                if status.code() == tonic::Code::Unavailable {
                    self.close().await;
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(SoulClientError::Status(status))
            }
            Err(_) => {
                self.close().await;
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                Err(SoulClientError::Timeout(self.deadline))
            }
        }
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(8);
    let base_ms = u64::try_from(BACKOFF_BASE.as_millis()).unwrap_or(100);
    let capped = base_ms
        .saturating_mul(1_u64.checked_shl(shift).unwrap_or(u64::MAX))
        .min(u64::try_from(BACKOFF_CAP.as_millis()).unwrap_or(5_000));
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped.saturating_add(jitter))
}

#[async_trait]
impl SoulApi for SoulClient {
    async fn get_attestation(
        &self,
        nonce: &str,
        refresh: bool,
    ) -> Result<pb::AttestationResponse, SoulClientError> {
        let request = pb::AttestationRequest {
            nonce: nonce.to_owned(),
            refresh,
        };
        self.call(|mut c| async move { c.get_attestation(request).await })
            .await
    }

    async fn verify_intent(
        &self,
        intent_json: String,
        context_json: String,
    ) -> Result<pb::VerifyIntentResponse, SoulClientError> {
        let request = pb::VerifyIntentRequest {
            intent_json,
            context_json,
        };
        self.call(|mut c| async move { c.verify_intent(request).await })
            .await
    }

    async fn check_balance(
        &self,
        request: pb::CheckBalanceRequest,
    ) -> Result<pb::CheckBalanceResponse, SoulClientError> {
        self.call(|mut c| async move { c.check_balance(request).await })
            .await
    }

    async fn execute_fund(
        &self,
        request: pb::ExecuteFundRequest,
    ) -> Result<pb::ExecuteFundResponse, SoulClientError> {
        self.call(|mut c| async move { c.execute_fund(request).await })
            .await
    }

    async fn execute_transfer(
        &self,
        request: pb::ExecuteTransferRequest,
    ) -> Result<pb::ExecuteTransferResponse, SoulClientError> {
        self.call(|mut c| async move { c.execute_transfer(request).await })
            .await
    }

    async fn health_check(&self) -> Result<HealthReport, SoulClientError> {
        let started = Instant::now();
        let response = self
            .call(|mut c| async move { c.health_check(pb::HealthCheckRequest {}).await })
            .await?;
        Ok(HealthReport {
            healthy: response.healthy,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for failures in 1..12 {
            let delay = backoff_delay(failures);
            assert!(delay >= BACKOFF_BASE);
            // Cap plus maximum jitter (cap / 4).
            assert!(delay <= BACKOFF_CAP + BACKOFF_CAP / 4);
        }
    }

    #[tokio::test]
    async fn calls_against_unreachable_endpoint_fail_fast() {
        let client = SoulClient::new("http://127.0.0.1:1", Duration::from_millis(200));
        let result = client.get_attestation("nonce", false).await;
        match result {
            Err(e) => assert!(e.is_unreachable(), "expected unreachable, got {e}"),
            Ok(_) => panic!("connect to a closed port should fail"),
        }
    }

    #[tokio::test]
    async fn invalid_endpoint_is_reported_as_unreachable() {
        let client = SoulClient::new("not a url", Duration::from_millis(100));
        let result = client.connect().await;
        assert!(matches!(result, Err(SoulClientError::Unreachable(_))));
    }
}
