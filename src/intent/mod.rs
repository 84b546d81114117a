//! Intent parser -- deterministic natural-language classification.
//!
//! Maps a raw utterance to exactly one [`Intent`], optionally with a
//! [`Clarification`] when confidence lands between the clarification
//! and confidence thresholds. Uses weighted keyword/regex patterns
//! rather than LLM classification: parsing must be deterministic,
//! injection-resistant, and total (it never fails -- unclassifiable
//! input degrades to [`ActionKind::Unknown`]).

pub mod amount;

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;
use uuid::Uuid;

use crate::types::{ActionKind, Clarification, Intent, UserState};

/// Maximum accepted utterance length in bytes.
const MAX_INPUT_BYTES: usize = 4 * 1024;

/// Sum of matched weights that maps to full confidence.
const SATURATION_WEIGHT: f64 = 1.0;

/// Weight added when a stated amount is present, for actions that take one.
const AMOUNT_SLOT_WEIGHT: f64 = 0.15;

/// Default amount suggestions when the user has no usable history.
const DEFAULT_AMOUNT_OPTIONS: [&str; 4] = ["$10", "$50", "$100", "$500"];

/// Mandatory slot a pattern family may require before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Amount,
    Target,
}

/// One weighted pattern contributing evidence for an action.
struct ActionPattern {
    action: ActionKind,
    regex: Regex,
    weight: f64,
}

/// Result of parsing one utterance.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    /// The parsed intent; always present, possibly `Unknown`.
    pub intent: Intent,
    /// Whether execution should pause for a clarification answer.
    pub needs_clarification: bool,
    /// The question to ask, when `needs_clarification` is true.
    pub clarification: Option<Clarification>,
}

/// Deterministic intent parser over weighted action patterns.
///
/// Slot extractors are optional: a pattern that fails to compile is
/// skipped at construction (with a warning) and its slot simply never
/// matches, so a bad pattern degrades accuracy instead of availability.
pub struct IntentParser {
    patterns: Vec<ActionPattern>,
    target_re: Option<Regex>,
    source_re: Option<Regex>,
    confidence_threshold: f64,
    clarification_threshold: f64,
}

impl Default for IntentParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentParser {
    /// Build a parser with the default thresholds (0.7 / 0.4).
    pub fn new() -> Self {
        Self::with_thresholds(0.7, 0.4)
    }

    /// Build a parser with explicit confidence and clarification thresholds.
    pub fn with_thresholds(confidence_threshold: f64, clarification_threshold: f64) -> Self {
        Self {
            patterns: default_patterns(),
            target_re: compile(r"\bto\s+(?:my\s+)?(@?[a-z0-9][a-z0-9@._\-]*)"),
            source_re: compile(r"\bfrom\s+(?:my\s+)?(wallet|card|bank)\b"),
            confidence_threshold,
            clarification_threshold,
        }
    }

    /// Parse one utterance into an intent, never failing.
    ///
    /// `user_state`, when available, seeds clarification options from the
    /// user's recent history.
    pub fn parse(&self, raw_text: &str, user_state: Option<&UserState>) -> ParseOutcome {
        let normalized = normalize(raw_text);
        if normalized.is_empty() || raw_text.len() > MAX_INPUT_BYTES {
            return ParseOutcome {
                intent: unknown_intent(raw_text, 0.0),
                needs_clarification: false,
                clarification: None,
            };
        }

        // Evidence accumulation: sum matched pattern weights per action.
        let mut weights: BTreeMap<&'static str, (ActionKind, f64)> = BTreeMap::new();
        for pattern in &self.patterns {
            if pattern.regex.is_match(&normalized) {
                let entry = weights
                    .entry(pattern.action.as_str())
                    .or_insert((pattern.action, 0.0));
                entry.1 += pattern.weight;
            }
        }

        // Slot extraction runs once; the amount bonus applies only to
        // actions that actually take an amount.
        let parsed_amount = amount::find_amount(&normalized);
        let (target_type, target_name) = self.extract_target(&normalized);
        let source_type = self.extract_source(&normalized);

        let mut best: Option<(ActionKind, f64)> = None;
        for (_, (action, base_weight)) in weights {
            let mut weight = base_weight;
            if takes_amount(action) && parsed_amount.is_some() {
                weight += AMOUNT_SLOT_WEIGHT;
            }
            let better = match best {
                None => true,
                Some((best_action, best_weight)) => {
                    weight > best_weight
                        || (weight == best_weight
                            && slots_satisfied(action, parsed_amount.is_some(), &target_name)
                            && !slots_satisfied(
                                best_action,
                                parsed_amount.is_some(),
                                &target_name,
                            ))
                }
            };
            if better {
                best = Some((action, weight));
            }
        }

        let (action, matched_weight) = best.unwrap_or((ActionKind::Unknown, 0.0));
        let confidence = (matched_weight / SATURATION_WEIGHT).clamp(0.0, 1.0);

        if confidence < self.clarification_threshold {
            return ParseOutcome {
                intent: unknown_intent(raw_text, confidence),
                needs_clarification: false,
                clarification: None,
            };
        }

        let mut parameters = BTreeMap::new();
        if let Some(name) = &target_name {
            parameters.insert(
                "target".to_owned(),
                serde_json::Value::String(name.clone()),
            );
        }

        let intent = Intent {
            intent_id: Uuid::new_v4(),
            action,
            source_type,
            target_type,
            amount: parsed_amount.as_ref().map(|a| a.value),
            currency: parsed_amount.as_ref().and_then(|a| a.currency.clone()),
            raw_text: raw_text.to_owned(),
            confidence,
            parameters,
        };

        if confidence >= self.confidence_threshold {
            return ParseOutcome {
                intent,
                needs_clarification: false,
                clarification: None,
            };
        }

        // Clarification band: ask about the first missing mandatory slot.
        let clarification = missing_slot(action, intent.amount.is_some(), &target_name)
            .map(|slot| build_clarification(action, slot, user_state));
        let needs_clarification = clarification.is_some();

        ParseOutcome {
            intent,
            needs_clarification,
            clarification,
        }
    }

    fn extract_target(&self, text: &str) -> (Option<String>, Option<String>) {
        let Some(target_re) = &self.target_re else {
            return (None, None);
        };
        let Some(caps) = target_re.captures(text) else {
            return (None, None);
        };
        let Some(name) = caps.get(1).map(|m| m.as_str().to_owned()) else {
            return (None, None);
        };
        let target_type = if name == "card" {
            "card"
        } else if name.starts_with("0x") {
            "address"
        } else {
            // Usernames, handles, and email-like targets all resolve as
            // contacts; Soul does the real destination lookup.
            "contact"
        };
        (Some(target_type.to_owned()), Some(name))
    }

    fn extract_source(&self, text: &str) -> Option<String> {
        self.source_re
            .as_ref()
            .and_then(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
    }
}

/// Whether an action carries a monetary amount.
fn takes_amount(action: ActionKind) -> bool {
    action.moves_value()
}

/// Mandatory slots per action.
fn mandatory_slots(action: ActionKind) -> &'static [Slot] {
    match action {
        ActionKind::FundCard | ActionKind::Swap => &[Slot::Amount],
        ActionKind::Transfer => &[Slot::Amount, Slot::Target],
        _ => &[],
    }
}

fn slots_satisfied(action: ActionKind, has_amount: bool, target: &Option<String>) -> bool {
    mandatory_slots(action).iter().all(|slot| match slot {
        Slot::Amount => has_amount,
        Slot::Target => target.is_some(),
    })
}

/// First mandatory slot missing for an action, if any.
fn missing_slot(action: ActionKind, has_amount: bool, target: &Option<String>) -> Option<Slot> {
    mandatory_slots(action)
        .iter()
        .copied()
        .find(|slot| match slot {
            Slot::Amount => !has_amount,
            Slot::Target => target.is_none(),
        })
}

fn build_clarification(
    action: ActionKind,
    slot: Slot,
    user_state: Option<&UserState>,
) -> Clarification {
    match slot {
        Slot::Amount => {
            let verb = match action {
                ActionKind::FundCard => "add",
                ActionKind::Swap => "swap",
                _ => "send",
            };
            Clarification {
                question: format!("How much would you like to {verb}?"),
                options: DEFAULT_AMOUNT_OPTIONS
                    .iter()
                    .map(|s| (*s).to_owned())
                    .collect(),
                blocking: true,
            }
        }
        Slot::Target => {
            let options: Vec<String> = user_state
                .map(|state| {
                    state
                        .recent_merchants
                        .iter()
                        .rev()
                        .take(4)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Clarification {
                question: "Who should receive it?".to_owned(),
                options,
                blocking: true,
            }
        }
    }
}

fn unknown_intent(raw_text: &str, confidence: f64) -> Intent {
    Intent {
        intent_id: Uuid::new_v4(),
        action: ActionKind::Unknown,
        source_type: None,
        target_type: None,
        amount: None,
        currency: None,
        raw_text: raw_text.to_owned(),
        confidence,
        parameters: BTreeMap::new(),
    }
}

/// Lowercase, strip control characters, collapse runs of whitespace.
fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let cleaned: String = lowered.chars().filter(|c| !c.is_control()).collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compile a pattern, warning and returning `None` on failure so the
/// parser loses one signal instead of the process.
fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(pattern, error = %e, "skipping unparsable intent pattern");
            None
        }
    }
}

fn default_patterns() -> Vec<ActionPattern> {
    let table: [(ActionKind, &str, f64); 13] = [
        (
            ActionKind::FundCard,
            r"\b(?:add|load|top\s?up|fund|deposit|put)\b",
            0.35,
        ),
        (
            ActionKind::FundCard,
            r"\b(?:to|onto|on)\s+(?:my\s+)?card\b",
            0.25,
        ),
        (
            ActionKind::Transfer,
            r"\b(?:send|transfer|pay|wire)\b",
            0.5,
        ),
        (ActionKind::Transfer, r"\bto\s+[a-z0-9@]", 0.15),
        (
            ActionKind::Swap,
            r"\b(?:swap|convert|exchange|trade)\b",
            0.6,
        ),
        (
            ActionKind::CreateCard,
            r"\b(?:create|issue|open|set\s?up)\b",
            0.45,
        ),
        (ActionKind::CreateCard, r"\b(?:new\s+)?card\b", 0.3),
        (
            ActionKind::FreezeCard,
            r"\b(?:freeze|lock|block|disable|pause)\b",
            0.45,
        ),
        (ActionKind::FreezeCard, r"\bcard\b", 0.3),
        (ActionKind::CheckBalance, r"\bbalance\b", 0.7),
        (
            ActionKind::CheckBalance,
            r"\bhow much\b.*\b(?:have|left|money)\b",
            0.55,
        ),
        (
            ActionKind::Query,
            r"^(?:what|how|why|when|where|who|is|are|can|do|does)\b",
            0.35,
        ),
        (ActionKind::Query, r"\?", 0.1),
    ];

    table
        .into_iter()
        .filter_map(|(action, pattern, weight)| {
            compile(pattern).map(|regex| ActionPattern {
                action,
                regex,
                weight,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn parser() -> IntentParser {
        IntentParser::new()
    }

    #[test]
    fn balance_question_classifies_confidently() {
        let outcome = parser().parse("what's my balance", None);
        assert_eq!(outcome.intent.action, ActionKind::CheckBalance);
        assert!(outcome.intent.confidence >= 0.7);
        assert!(!outcome.needs_clarification);
    }

    #[test]
    fn transfer_without_amount_asks_how_much() {
        let outcome = parser().parse("send money to alice", None);
        assert_eq!(outcome.intent.action, ActionKind::Transfer);
        assert!(outcome.needs_clarification);
        let clarification = outcome.clarification.expect("clarification");
        assert!(clarification.question.to_lowercase().contains("how much"));
        for expected in ["$10", "$50", "$100"] {
            assert!(
                clarification.options.iter().any(|o| o == expected),
                "options should contain {expected}"
            );
        }
        assert!(clarification.options.len() <= 4);
        assert!(clarification.blocking);
    }

    #[test]
    fn fund_with_amount_executes_without_clarification() {
        let outcome = parser().parse("add $50 to my card", None);
        assert_eq!(outcome.intent.action, ActionKind::FundCard);
        assert!(outcome.intent.confidence >= 0.7);
        assert!(!outcome.needs_clarification);
        assert_eq!(outcome.intent.amount, Some(dec!(50)));
        assert_eq!(outcome.intent.currency.as_deref(), Some("USD"));
        assert_eq!(outcome.intent.target_type.as_deref(), Some("card"));
    }

    #[test]
    fn transfer_with_amount_and_target_is_complete() {
        let outcome = parser().parse("send $25 to alice", None);
        assert_eq!(outcome.intent.action, ActionKind::Transfer);
        assert!(!outcome.needs_clarification);
        assert_eq!(outcome.intent.amount, Some(dec!(25)));
        assert_eq!(
            outcome.intent.parameters["target"],
            serde_json::Value::String("alice".to_owned())
        );
    }

    #[test]
    fn transfer_missing_target_asks_for_recipient_from_history() {
        let mut state = UserState::default();
        state.record_merchant("coffee-shop");
        state.record_merchant("alice");

        let outcome = parser().parse("transfer fifty dollars", Some(&state));
        assert_eq!(outcome.intent.action, ActionKind::Transfer);
        assert_eq!(outcome.intent.amount, Some(dec!(50)));
        assert!(outcome.needs_clarification);
        let clarification = outcome.clarification.expect("clarification");
        assert!(clarification.question.contains("receive"));
        assert_eq!(clarification.options[0], "alice");
    }

    #[test]
    fn freeze_card_classifies() {
        let outcome = parser().parse("please freeze my card", None);
        assert_eq!(outcome.intent.action, ActionKind::FreezeCard);
        assert!(outcome.intent.confidence >= 0.7);
    }

    #[test]
    fn gibberish_degrades_to_unknown() {
        let outcome = parser().parse("purple monkey dishwasher", None);
        assert_eq!(outcome.intent.action, ActionKind::Unknown);
        assert!(outcome.intent.confidence < 0.4);
        assert!(!outcome.needs_clarification);
        assert!(outcome.clarification.is_none());
    }

    #[test]
    fn empty_and_oversized_input_degrade_to_unknown() {
        let outcome = parser().parse("   ", None);
        assert_eq!(outcome.intent.action, ActionKind::Unknown);
        assert_eq!(outcome.intent.confidence, 0.0);

        let oversized = "a".repeat(MAX_INPUT_BYTES.saturating_add(1));
        let outcome = parser().parse(&oversized, None);
        assert_eq!(outcome.intent.action, ActionKind::Unknown);
        assert_eq!(outcome.intent.confidence, 0.0);
    }

    #[test]
    fn parsing_is_deterministic_modulo_intent_id() {
        let a = parser().parse("swap 0.5 eth for usdc", None);
        let b = parser().parse("swap 0.5 eth for usdc", None);
        assert_ne!(a.intent.intent_id, b.intent.intent_id);
        assert_eq!(a.intent.action, b.intent.action);
        assert_eq!(a.intent.amount, b.intent.amount);
        assert_eq!(a.intent.currency, b.intent.currency);
        assert_eq!(a.intent.confidence, b.intent.confidence);
        assert_eq!(a.intent.parameters, b.intent.parameters);
    }

    #[test]
    fn equal_amount_forms_parse_identically() {
        let a = parser().parse("add $1,000.50 to my card", None);
        let b = parser().parse("add 1000.50 USD to my card", None);
        assert_eq!(a.intent.amount, b.intent.amount);
        assert_eq!(a.intent.amount, Some(dec!(1000.50)));
    }

    #[test]
    fn source_extraction_sees_wallet() {
        let outcome = parser().parse("add $20 to my card from my wallet", None);
        assert_eq!(outcome.intent.source_type.as_deref(), Some("wallet"));
    }

    #[test]
    fn control_characters_are_stripped() {
        let outcome = parser().parse("what's\u{7} my\tbalance", None);
        assert_eq!(outcome.intent.action, ActionKind::CheckBalance);
    }
}
