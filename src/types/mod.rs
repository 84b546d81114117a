// Core domain types shared across the intent -> plan -> execution pipeline.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User-visible action a parsed request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Move funds onto a card.
    FundCard,
    /// Send funds to an external destination.
    Transfer,
    /// Exchange one asset for another.
    Swap,
    /// Issue a new card.
    CreateCard,
    /// Freeze an existing card.
    FreezeCard,
    /// Read-only balance query.
    CheckBalance,
    /// Informational question with no side effects.
    Query,
    /// Could not be classified.
    Unknown,
}

impl ActionKind {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FundCard => "fund_card",
            Self::Transfer => "transfer",
            Self::Swap => "swap",
            Self::CreateCard => "create_card",
            Self::FreezeCard => "freeze_card",
            Self::CheckBalance => "check_balance",
            Self::Query => "query",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this action moves value and therefore counts as high risk
    /// for approval gating.
    pub fn moves_value(&self) -> bool {
        matches!(self, Self::FundCard | Self::Transfer | Self::Swap)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Unique identifier for this parse result.
    pub intent_id: Uuid,
    /// Classified action.
    pub action: ActionKind,
    /// Where funds come from (e.g. "wallet", "card"), when stated.
    pub source_type: Option<String>,
    /// Where funds go (e.g. "card", "address", "contact"), when stated.
    pub target_type: Option<String>,
    /// Monetary amount, when stated.
    pub amount: Option<Decimal>,
    /// Currency code, when stated.
    pub currency: Option<String>,
    /// The original utterance.
    pub raw_text: String,
    /// Classification confidence in `[0, 1]`.
    pub confidence: f64,
    /// Extracted slots beyond the typed fields above.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Follow-up question emitted when intent confidence is insufficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    /// The question to put to the user.
    pub question: String,
    /// Up to four suggested answers, most likely first.
    pub options: Vec<String>,
    /// Whether execution is blocked until the user answers.
    pub blocking: bool,
}

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The human user.
    User,
    /// This service.
    Assistant,
    /// Synthetic turns (summaries).
    System,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
            Self::System => f.write_str("system"),
        }
    }
}

/// Record of a tool call made while handling a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Registered tool name.
    pub tool: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// A single turn in a session's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique turn identifier.
    pub id: Uuid,
    /// Who produced the turn.
    pub role: TurnRole,
    /// Turn text (for `System` summary turns, a JSON digest).
    pub content: String,
    /// When the turn was appended.
    pub timestamp: DateTime<Utc>,
    /// Parsed intent, for user turns that produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Tool calls made while handling this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ConversationTurn {
    /// Build a turn with a fresh id and the current timestamp.
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            intent: None,
            tool_calls: Vec::new(),
        }
    }
}

/// How eagerly the user wants to confirm actions before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// Every plan requires approval.
    Always,
    /// Only value-moving actions require approval.
    HighRisk,
    /// Nothing requires approval (opt-in to gating via preferences).
    #[default]
    Never,
}

/// Per-user presentation and safety preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    /// BCP-47 language tag.
    pub language: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Approval gating mode.
    pub confirmation_mode: ConfirmationMode,
    /// Reply verbosity: "terse" | "normal" | "detailed".
    pub verbosity: String,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            language: "en".to_owned(),
            timezone: "UTC".to_owned(),
            confirmation_mode: ConfirmationMode::default(),
            verbosity: "normal".to_owned(),
        }
    }
}

/// Capacity of the recent-merchants ring buffer.
pub const RECENT_MERCHANTS_CAPACITY: usize = 8;

/// Per-user state kept in memory across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserState {
    /// On-chain wallet address, once known.
    pub wallet_address: Option<String>,
    /// Primary card identifier, once known.
    pub card_id: Option<String>,
    /// Preferred settlement currency.
    pub preferred_currency: Option<String>,
    /// Ring buffer of recently seen merchants/destinations, newest last.
    #[serde(default)]
    pub recent_merchants: VecDeque<String>,
    /// Count of parsed actions by action name.
    #[serde(default)]
    pub action_counts: BTreeMap<String, u64>,
    /// Presentation and safety preferences.
    #[serde(default)]
    pub preferences: UserPreferences,
}

impl UserState {
    /// Record a merchant/destination, evicting the oldest past capacity.
    pub fn record_merchant(&mut self, merchant: impl Into<String>) {
        let merchant = merchant.into();
        if merchant.is_empty() {
            return;
        }
        self.recent_merchants.retain(|m| *m != merchant);
        if self.recent_merchants.len() >= RECENT_MERCHANTS_CAPACITY {
            self.recent_merchants.pop_front();
        }
        self.recent_merchants.push_back(merchant);
    }

    /// Increment the frequency counter for an action.
    pub fn record_action(&mut self, action: ActionKind) {
        let counter = self
            .action_counts
            .entry(action.as_str().to_owned())
            .or_insert(0);
        *counter = counter.saturating_add(1);
    }
}

/// A session's conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Caller-supplied session identifier.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last append or read-through-write activity.
    pub last_activity_at: DateTime<Utc>,
    /// `last_activity_at + ttl`; the session is evictable after this.
    pub expires_at: DateTime<Utc>,
    /// Ordered turns, oldest first.
    pub history: VecDeque<ConversationTurn>,
    /// Snapshot of the user's state at last access.
    pub user_state: UserState,
    /// Intents with a live plan.
    #[serde(default)]
    pub active_intent_ids: HashSet<Uuid>,
    /// Intents blocked on an open clarification.
    #[serde(default)]
    pub pending_clarification_ids: HashSet<Uuid>,
}

/// Structured error carried by step results and tool failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether a retry may succeed.
    pub recoverable: bool,
    /// Optional remediation hint for the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl StepError {
    /// Build an error with no suggestion.
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
            suggestion: None,
        }
    }

    /// Attach a remediation hint.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Caller-supplied parameters failed validation.
    InvalidInput,
    /// No tool registered under the requested name.
    ToolNotFound,
    /// The enclave's attestation is not currently trusted.
    SoulNotTrusted,
    /// The enclave could not be reached.
    SoulUnreachable,
    /// A deadline elapsed.
    Timeout,
    /// The concurrency cap could not be acquired in time.
    Overloaded,
    /// A human denied the approval request.
    ApprovalDenied,
    /// The approval request expired without a decision.
    ApprovalTimeout,
    /// An upstream step this step depends on failed.
    DependencyFailed,
    /// The tool handler itself failed.
    ToolError,
    /// An inverse action failed during rollback.
    RollbackFailure,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorCode {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::ToolNotFound => "tool_not_found",
            Self::SoulNotTrusted => "soul_not_trusted",
            Self::SoulUnreachable => "soul_unreachable",
            Self::Timeout => "timeout",
            Self::Overloaded => "overloaded",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::DependencyFailed => "dependency_failed",
            Self::ToolError => "tool_error",
            Self::RollbackFailure => "rollback_failure",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical attestation metadata attached to enclave-backed results.
///
/// Every tool that reaches the enclave attaches this same shape: the
/// opaque quote plus the measurement pair and a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteMeta {
    /// Opaque attestation quote, base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub quote: Vec<u8>,
    /// Enclave image measurement, hex.
    pub mr_enclave: String,
    /// Enclave signer measurement, hex.
    pub mr_signer: String,
    /// When the quote was obtained.
    pub timestamp: DateTime<Utc>,
}

/// Verification record returned by Soul's intent check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoulVerification {
    /// Whether Soul accepted the intent.
    pub verified: bool,
    /// Soul's stated reason when rejecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of one plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Whether the step succeeded.
    pub success: bool,
    /// Structured output from the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Map<String, serde_json::Value>>,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Soul's verification record, when the step was verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<SoulVerification>,
    /// Attestation attached by enclave-backed tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<QuoteMeta>,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
}

/// The enclave's attestation record as fetched by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Opaque attestation quote, base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub quote: Vec<u8>,
    /// Enclave image measurement, hex.
    pub mr_enclave: String,
    /// Enclave signer measurement, hex.
    pub mr_signer: String,
    /// Enclave public key for response-signature checks.
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// When the quote was produced.
    pub timestamp: DateTime<Utc>,
    /// Quote freshness horizon; the record is unusable after this.
    pub expires_at: DateTime<Utc>,
    /// Nonce echoed from the verifier's request.
    pub nonce: String,
}

impl AttestationRecord {
    /// Whether the record is still fresh at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

mod base64_bytes {
    //! Serde adapter rendering byte vectors as base64 strings in JSON.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_roundtrips_through_wire_name() {
        for action in [
            ActionKind::FundCard,
            ActionKind::Transfer,
            ActionKind::Swap,
            ActionKind::CreateCard,
            ActionKind::FreezeCard,
            ActionKind::CheckBalance,
            ActionKind::Query,
            ActionKind::Unknown,
        ] {
            let json = serde_json::to_string(&action).expect("serialize");
            assert_eq!(json, format!("\"{}\"", action.as_str()));
            let parsed: ActionKind = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn value_moving_actions_are_high_risk() {
        assert!(ActionKind::FundCard.moves_value());
        assert!(ActionKind::Transfer.moves_value());
        assert!(ActionKind::Swap.moves_value());
        assert!(!ActionKind::CheckBalance.moves_value());
        assert!(!ActionKind::Query.moves_value());
        assert!(!ActionKind::FreezeCard.moves_value());
    }

    #[test]
    fn recent_merchants_ring_buffer_evicts_oldest() {
        let mut state = UserState::default();
        for i in 0..10 {
            state.record_merchant(format!("merchant-{i}"));
        }
        assert_eq!(state.recent_merchants.len(), RECENT_MERCHANTS_CAPACITY);
        assert_eq!(state.recent_merchants[0], "merchant-2");
        assert_eq!(
            state.recent_merchants[RECENT_MERCHANTS_CAPACITY.saturating_sub(1)],
            "merchant-9"
        );
    }

    #[test]
    fn recording_a_repeat_merchant_moves_it_to_the_back() {
        let mut state = UserState::default();
        state.record_merchant("alice");
        state.record_merchant("bob");
        state.record_merchant("alice");
        assert_eq!(state.recent_merchants.len(), 2);
        assert_eq!(state.recent_merchants[0], "bob");
        assert_eq!(state.recent_merchants[1], "alice");
    }

    #[test]
    fn action_counts_accumulate() {
        let mut state = UserState::default();
        state.record_action(ActionKind::Transfer);
        state.record_action(ActionKind::Transfer);
        state.record_action(ActionKind::CheckBalance);
        assert_eq!(state.action_counts["transfer"], 2);
        assert_eq!(state.action_counts["check_balance"], 1);
    }

    #[test]
    fn quote_meta_uses_base64_in_json() {
        let meta = QuoteMeta {
            quote: vec![1, 2, 3, 4],
            mr_enclave: "ab".repeat(32),
            mr_signer: "cd".repeat(32),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(json["quote"], "AQIDBA==");
        let back: QuoteMeta = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.quote, vec![1, 2, 3, 4]);
    }

    #[test]
    fn attestation_freshness_respects_expiry() {
        let now = Utc::now();
        let record = AttestationRecord {
            quote: vec![1],
            mr_enclave: String::new(),
            mr_signer: String::new(),
            public_key: vec![],
            timestamp: now,
            expires_at: now + chrono::TimeDelta::seconds(60),
            nonce: "brain-abc-0102030405060708".to_owned(),
        };
        assert!(record.is_fresh(now));
        assert!(!record.is_fresh(now + chrono::TimeDelta::seconds(61)));
    }

    #[test]
    fn step_error_display_includes_code() {
        let err = StepError::new(ErrorCode::SoulNotTrusted, "attestation rejected", true);
        assert_eq!(err.to_string(), "soul_not_trusted: attestation rejected");
    }
}
