//! Attestation verifier -- trust decisions about the sibling enclave.
//!
//! Fetches Soul's attestation quote with a fresh nonce, checks
//! freshness, nonce echo, and expected measurements, and caches the
//! outcome. The quote's cryptographic signature check is a placeholder
//! (non-empty quote); strict deployments substitute a platform
//! verifier behind the same interface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::AttestationConfig;
use crate::tools::AttestationGate;
use crate::types::AttestationRecord;

use super::{SoulApi, SoulClientError};

/// Individual checks behind a verification decision.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VerificationDetails {
    /// Quote present and structurally plausible (placeholder check).
    pub signature_valid: bool,
    /// `now < expires_at` held at verification time.
    pub not_expired: bool,
    /// Measurement was in the expected set (or no set configured).
    pub mr_enclave_match: bool,
    /// Signer was in the expected set (or no set configured).
    pub mr_signer_match: bool,
    /// The enclave answered at all.
    pub reachable: bool,
}

/// Outcome of one verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    /// Whether every check passed.
    pub verified: bool,
    /// The fetched record, when the enclave answered.
    pub attestation: Option<AttestationRecord>,
    /// Per-check breakdown.
    pub details: VerificationDetails,
    /// Failure description, when not verified.
    pub error: Option<String>,
    /// When this pass ran.
    pub verified_at: DateTime<Utc>,
}

/// Attestation summary attached to caller-facing responses.
#[derive(Debug, Clone, Serialize)]
pub struct ChainAttestation {
    /// Base64 of the opaque quote.
    pub quote_base64: String,
    /// Enclave image measurement, hex.
    pub mr_enclave: String,
    /// Signer measurement, hex.
    pub mr_signer: String,
    /// Whether the quote passed verification.
    pub verified: bool,
    /// When the quote was verified.
    pub timestamp: DateTime<Utc>,
}

struct CachedResult {
    result: VerificationResult,
    cached_at: Instant,
    ttl: Duration,
    /// The quote's own expiry; a cached positive result must never
    /// outlive the attestation it vouches for.
    record_expires_at: Option<DateTime<Utc>>,
}

impl CachedResult {
    fn fresh(&self) -> bool {
        if self.cached_at.elapsed() >= self.ttl {
            return false;
        }
        self.record_expires_at
            .map_or(true, |expires_at| Utc::now() < expires_at)
    }
}

/// Verifies and caches the sibling enclave's attestation.
pub struct AttestationVerifier {
    soul: Arc<dyn SoulApi>,
    config: RwLock<AttestationConfig>,
    cache: RwLock<Option<CachedResult>>,
}

impl AttestationVerifier {
    /// Build a verifier over a Soul client.
    pub fn new(soul: Arc<dyn SoulApi>, config: AttestationConfig) -> Self {
        Self {
            soul,
            config: RwLock::new(config),
            cache: RwLock::new(None),
        }
    }

    /// Verify the enclave's attestation, reusing a fresh cached result
    /// unless `force_refresh` is set.
    pub async fn verify(&self, force_refresh: bool) -> VerificationResult {
        if !force_refresh {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.fresh() {
                    return cached.result.clone();
                }
            }
        }

        let config = self.config.read().await.clone();
        let result = self.verify_uncached(&config).await;

        // Positive results cache for the configured TTL. Failures are
        // cached only in non-strict mode, briefly, so a flapping enclave
        // is not polled on every tool call.
        let ttl = if result.verified {
            Some(Duration::from_millis(config.cache_ttl_ms))
        } else if !config.strict {
            Some(Duration::from_millis(config.negative_cache_ttl_ms))
        } else {
            None
        };

        let record_expires_at = result
            .verified
            .then(|| result.attestation.as_ref().map(|r| r.expires_at))
            .flatten();

        let mut cache = self.cache.write().await;
        match ttl {
            Some(ttl) => {
                *cache = Some(CachedResult {
                    result: result.clone(),
                    cached_at: Instant::now(),
                    ttl,
                    record_expires_at,
                });
            }
            None => *cache = None,
        }

        result
    }

    async fn verify_uncached(&self, config: &AttestationConfig) -> VerificationResult {
        let nonce = make_nonce();
        let verified_at = Utc::now();

        let response = match self.soul.get_attestation(&nonce, false).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "attestation fetch failed");
                return VerificationResult {
                    verified: false,
                    attestation: None,
                    details: VerificationDetails::default(),
                    error: Some(attestation_fetch_error(&e)),
                    verified_at,
                };
            }
        };

        let record = AttestationRecord {
            quote: response.quote,
            mr_enclave: response.mr_enclave,
            mr_signer: response.mr_signer,
            public_key: response.public_key,
            timestamp: from_millis(response.timestamp_ms),
            expires_at: from_millis(response.expires_at_ms),
            nonce: response.nonce,
        };

        let nonce_echoed = record.nonce == nonce;
        let details = VerificationDetails {
            signature_valid: !record.quote.is_empty(),
            not_expired: record.is_fresh(verified_at),
            mr_enclave_match: measurement_accepted(&config.expected_mr_enclave, &record.mr_enclave),
            mr_signer_match: measurement_accepted(&config.expected_mr_signer, &record.mr_signer),
            reachable: true,
        };

        let verified = nonce_echoed
            && details.signature_valid
            && details.not_expired
            && details.mr_enclave_match
            && details.mr_signer_match;

        let error = if verified {
            None
        } else if !nonce_echoed {
            Some("attestation nonce mismatch".to_owned())
        } else if !details.not_expired {
            Some("attestation quote expired".to_owned())
        } else if !details.mr_enclave_match || !details.mr_signer_match {
            Some("enclave measurement not in expected set".to_owned())
        } else {
            Some("attestation quote empty".to_owned())
        };

        if verified {
            debug!(mr_enclave = %record.mr_enclave, "attestation verified");
        } else {
            warn!(error = ?error, "attestation rejected");
        }

        VerificationResult {
            verified,
            attestation: Some(record),
            details,
            error,
            verified_at,
        }
    }

    /// Attestation summary for caller-facing responses, when available.
    pub async fn get_for_chain(&self) -> Option<ChainAttestation> {
        let result = self.verify(false).await;
        let record = result.attestation?;
        Some(ChainAttestation {
            quote_base64: BASE64.encode(&record.quote),
            mr_enclave: record.mr_enclave,
            mr_signer: record.mr_signer,
            verified: result.verified,
            timestamp: result.verified_at,
        })
    }

    /// Placeholder response-signature check against the cached enclave key.
    ///
    /// Strict deployments substitute a real signature verifier; this
    /// implementation only confirms that a key is on file and the
    /// signature is present.
    pub async fn verify_response(&self, signature: &[u8], data: &[u8]) -> bool {
        if signature.is_empty() || data.is_empty() {
            return false;
        }
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.result.attestation.as_ref())
            .is_some_and(|record| !record.public_key.is_empty())
    }

    /// Drop the cached verification outcome.
    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }

    /// Replace the accepted enclave measurements; invalidates the cache.
    pub async fn set_expected_mr_enclave(&self, expected: Vec<String>) {
        self.config.write().await.expected_mr_enclave = expected;
        self.clear_cache().await;
        info!("expected mr_enclave set updated");
    }

    /// Replace the accepted signer measurements; invalidates the cache.
    pub async fn set_expected_mr_signer(&self, expected: Vec<String>) {
        self.config.write().await.expected_mr_signer = expected;
        self.clear_cache().await;
        info!("expected mr_signer set updated");
    }
}

#[async_trait]
impl AttestationGate for AttestationVerifier {
    async fn should_trust(&self) -> bool {
        let strict = self.config.read().await.strict;
        let result = self.verify(false).await;
        if strict {
            result.verified
        } else {
            result.details.reachable
        }
    }

    async fn unreachable(&self) -> bool {
        let cache = self.cache.read().await;
        match cache.as_ref() {
            Some(cached) => !cached.result.details.reachable,
            // No cached outcome: the last strict failure was not cached;
            // report not-unreachable so the caller words it as rejection.
            None => false,
        }
    }

    async fn measurements(&self) -> Option<(String, String)> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.result.attestation.as_ref())
            .map(|record| (record.mr_enclave.clone(), record.mr_signer.clone()))
    }
}

fn measurement_accepted(expected: &[String], actual: &str) -> bool {
    expected.is_empty() || expected.iter().any(|e| e.eq_ignore_ascii_case(actual))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn attestation_fetch_error(error: &SoulClientError) -> String {
    if error.is_unreachable() {
        format!("soul unreachable: {error}")
    } else {
        format!("attestation fetch rejected: {error}")
    }
}

/// Fresh per-request nonce: `brain-<base36 millis>-<hex random>`.
fn make_nonce() -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis().max(0)).unwrap_or(0);
    let mut random = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut random);
    let hex: String = random.iter().map(|b| format!("{b:02x}")).collect();
    format!("brain-{}-{hex}", base36(millis))
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while value > 0 {
        let digit = usize::try_from(value % 36).unwrap_or(0);
        out.push(DIGITS[digit]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
