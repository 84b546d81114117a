//! Configuration loading and management.
//!
//! Loads brain configuration from `./config.toml` (or `$BRAIN_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level brain configuration loaded from TOML.
///
/// Path: `./config.toml` or `$BRAIN_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// RPC and HTTP listener settings.
    pub server: ServerConfig,
    /// Sibling-enclave endpoint settings.
    pub soul: SoulConfig,
    /// Session context limits.
    pub context: ContextConfig,
    /// Plan execution limits.
    pub planner: PlannerConfig,
    /// Tool dispatch limits.
    pub tools: ToolsConfig,
    /// Attestation verification policy.
    pub attestation: AttestationConfig,
    /// Optional LLM collaborator for reply generation.
    pub llm: LlmConfig,
    /// Optional differential-privacy noise on exposed aggregates.
    pub privacy: PrivacyConfig,
    /// Log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

/// RPC and HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// gRPC listener port.
    pub grpc_port: u16,
    /// HTTP health-surface port.
    pub http_port: u16,
    /// Whether the dev-convenience `POST /converse` route is served.
    pub http_converse_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50052,
            http_port: 8092,
            http_converse_enabled: true,
        }
    }
}

/// Sibling-enclave endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoulConfig {
    /// gRPC endpoint of the Soul service.
    pub grpc_url: String,
    /// Optional out-of-band attestation endpoint.
    pub attestation_url: Option<String>,
    /// Per-call deadline in milliseconds.
    pub call_deadline_ms: u64,
}

impl Default for SoulConfig {
    fn default() -> Self {
        Self {
            grpc_url: "http://localhost:50051".to_owned(),
            attestation_url: None,
            call_deadline_ms: 5_000,
        }
    }
}

impl SoulConfig {
    /// Per-call deadline as a [`Duration`].
    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms)
    }
}

/// Session context limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Idle seconds before a session becomes evictable.
    pub ttl_seconds: u64,
    /// Maximum turns kept per session before summarization.
    pub max_turns: usize,
    /// Soft cap on live sessions; LRU eviction applies past it.
    pub max_sessions: usize,
    /// Seconds between eviction sweeps.
    pub sweep_interval_seconds: u64,
    /// Whether user state survives session eviction.
    pub persist_user_state: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3_600,
            max_turns: 50,
            max_sessions: 1_024,
            sweep_interval_seconds: 30,
            persist_user_state: true,
        }
    }
}

impl ContextConfig {
    /// Number of oldest turns folded into one summary turn on overflow.
    pub fn summarize_threshold(&self) -> usize {
        (self.max_turns / 2).max(1)
    }

    /// Session TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Plan execution limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Retries per step for recoverable failures.
    pub max_retries: u32,
    /// Per-step deadline in milliseconds.
    pub step_deadline_ms: u64,
    /// Retry backoff base in milliseconds (doubles per retry).
    pub retry_backoff_base_ms: u64,
    /// Retry backoff cap in milliseconds.
    pub retry_backoff_cap_ms: u64,
    /// Seconds an approval request waits before auto-failing.
    pub approval_timeout_seconds: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step_deadline_ms: 30_000,
            retry_backoff_base_ms: 500,
            retry_backoff_cap_ms: 10_000,
            approval_timeout_seconds: 300,
        }
    }
}

impl PlannerConfig {
    /// Approval timeout as a [`Duration`].
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_seconds)
    }

    /// Backoff before retry number `retry` (1-based), exponential with cap.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(1_u64.checked_shl(shift).unwrap_or(u64::MAX))
            .min(self.retry_backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Tool dispatch limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Global cap on concurrent tool calls.
    pub max_concurrent_calls: usize,
    /// Per-call handler deadline in milliseconds.
    pub call_deadline_ms: u64,
    /// Milliseconds to wait for a concurrency permit before `overloaded`.
    pub acquire_timeout_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            call_deadline_ms: 10_000,
            acquire_timeout_ms: 2_000,
        }
    }
}

impl ToolsConfig {
    /// Handler deadline as a [`Duration`].
    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms)
    }

    /// Permit acquisition timeout as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Attestation verification policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// Strict mode requires a fully verified quote; non-strict settles
    /// for reachability.
    pub strict: bool,
    /// Accepted enclave image measurements (hex). Empty accepts any.
    pub expected_mr_enclave: Vec<String>,
    /// Accepted signer measurements (hex). Empty accepts any.
    pub expected_mr_signer: Vec<String>,
    /// Positive-result cache TTL in milliseconds.
    pub cache_ttl_ms: u64,
    /// Negative-result cache TTL in milliseconds (non-strict only).
    pub negative_cache_ttl_ms: u64,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            strict: true,
            expected_mr_enclave: Vec::new(),
            expected_mr_signer: Vec::new(),
            cache_ttl_ms: 60_000,
            negative_cache_ttl_ms: 5_000,
        }
    }
}

/// Optional LLM collaborator for reply generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Bearer token; absence disables the collaborator.
    pub api_key: Option<String>,
    /// Chat-completions base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Per-request deadline in milliseconds.
    pub request_deadline_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.redpill.ai/v1".to_owned(),
            model: "phala/llama-3.3-70b-instruct".to_owned(),
            request_deadline_ms: 8_000,
        }
    }
}

impl LlmConfig {
    /// Whether the collaborator is configured.
    pub fn enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Optional differential-privacy noise on exposed aggregates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Whether noise is added to exposed frequency counts.
    pub enabled: bool,
    /// Privacy budget epsilon.
    pub epsilon: f64,
    /// Privacy budget delta.
    pub delta: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            epsilon: 1.0,
            delta: 1e-5,
        }
    }
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            soul: SoulConfig::default(),
            context: ContextConfig::default(),
            planner: PlannerConfig::default(),
            tools: ToolsConfig::default(),
            attestation: AttestationConfig::default(),
            llm: LlmConfig::default(),
            privacy: PrivacyConfig::default(),
            log_level: "info".to_owned(),
        }
    }
}

impl BrainConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$BRAIN_CONFIG_PATH` or `./config.toml`.
    /// If the file does not exist, returns defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: BrainConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(BrainConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("BRAIN_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SOUL_GRPC_URL") {
            // Bare host:port is accepted and prefixed for the transport.
            self.soul.grpc_url = if v.contains("://") {
                v
            } else {
                format!("http://{v}")
            };
        }
        if let Some(v) = env("SOUL_ATTESTATION_URL") {
            self.soul.attestation_url = Some(v);
        }

        apply_parsed(&env, "GRPC_PORT", &mut self.server.grpc_port);
        apply_parsed(&env, "HTTP_PORT", &mut self.server.http_port);
        apply_parsed(&env, "CONTEXT_TTL_SECONDS", &mut self.context.ttl_seconds);
        apply_parsed(&env, "MAX_CONTEXT_TURNS", &mut self.context.max_turns);

        if let Some(v) = env("LOG_LEVEL") {
            self.log_level = v;
        }

        if let Some(key) = env("PHALA_AI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(v) = env("PHALA_AI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env("PHALA_AI_MODEL") {
            self.llm.model = v;
        }
    }
}

/// Parse and apply an env override, warning on malformed values.
fn apply_parsed<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => {
                tracing::warn!(var = key, value = %v, "ignoring invalid env override");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| (*v).to_owned())
    }

    #[test]
    fn defaults_match_service_contract() {
        let config = BrainConfig::default();
        assert_eq!(config.server.grpc_port, 50052);
        assert_eq!(config.server.http_port, 8092);
        assert_eq!(config.soul.grpc_url, "http://localhost:50051");
        assert_eq!(config.context.ttl_seconds, 3_600);
        assert_eq!(config.context.max_turns, 50);
        assert_eq!(config.context.summarize_threshold(), 25);
        assert_eq!(config.planner.max_retries, 3);
        assert_eq!(config.tools.max_concurrent_calls, 8);
        assert_eq!(config.attestation.cache_ttl_ms, 60_000);
        assert!(!config.llm.enabled());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = BrainConfig::default();
        config.apply_overrides(env_from(&[
            ("SOUL_GRPC_URL", "soul.internal:9000"),
            ("GRPC_PORT", "7001"),
            ("HTTP_PORT", "7002"),
            ("CONTEXT_TTL_SECONDS", "120"),
            ("MAX_CONTEXT_TURNS", "10"),
            ("LOG_LEVEL", "debug"),
            ("PHALA_AI_API_KEY", "sk-test"),
            ("PHALA_AI_MODEL", "phala/qwen-2.5-7b-instruct"),
        ]));

        assert_eq!(config.soul.grpc_url, "http://soul.internal:9000");
        assert_eq!(config.server.grpc_port, 7001);
        assert_eq!(config.server.http_port, 7002);
        assert_eq!(config.context.ttl_seconds, 120);
        assert_eq!(config.context.max_turns, 10);
        assert_eq!(config.log_level, "debug");
        assert!(config.llm.enabled());
        assert_eq!(config.llm.model, "phala/qwen-2.5-7b-instruct");
    }

    #[test]
    fn scheme_prefixed_soul_url_is_kept_verbatim() {
        let mut config = BrainConfig::default();
        config.apply_overrides(env_from(&[("SOUL_GRPC_URL", "https://soul.internal:9000")]));
        assert_eq!(config.soul.grpc_url, "https://soul.internal:9000");
    }

    #[test]
    fn malformed_numeric_override_is_ignored() {
        let mut config = BrainConfig::default();
        config.apply_overrides(env_from(&[("GRPC_PORT", "not-a-port")]));
        assert_eq!(config.server.grpc_port, 50052);
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let planner = PlannerConfig::default();
        assert_eq!(planner.retry_backoff(1), Duration::from_millis(500));
        assert_eq!(planner.retry_backoff(2), Duration::from_millis(1_000));
        assert_eq!(planner.retry_backoff(3), Duration::from_millis(2_000));
        assert_eq!(planner.retry_backoff(30), Duration::from_millis(10_000));
    }

    #[test]
    fn toml_sections_deserialize() {
        let toml_src = r#"
            log_level = "trace"

            [server]
            grpc_port = 6000
            http_converse_enabled = false

            [soul]
            grpc_url = "http://10.0.0.2:50051"

            [attestation]
            strict = false
            expected_mr_enclave = ["aa", "bb"]

            [privacy]
            enabled = true
            epsilon = 0.5
        "#;
        let config: BrainConfig = toml::from_str(toml_src).expect("parse");
        assert_eq!(config.server.grpc_port, 6000);
        assert!(!config.server.http_converse_enabled);
        assert_eq!(config.server.http_port, 8092);
        assert!(!config.attestation.strict);
        assert_eq!(config.attestation.expected_mr_enclave.len(), 2);
        assert!(config.privacy.enabled);
        assert_eq!(config.log_level, "trace");
    }
}
