//! Session summarization strategies.
//!
//! When a session's history outgrows its window, the oldest turns are
//! folded into a single `system` turn. The summary content is a JSON
//! digest: `{key_topics, recent_intents, important_entities,
//! summarized_at, original_turn_count}`.
//!
//! Two strategies: [`ActionDigestSummarizer`] is pure and instant;
//! [`LlmSummarizer`] asks the chat collaborator for better prose but is
//! strictly time-bounded and degrades to the digest on any failure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::llm::ChatClient;
use crate::types::ConversationTurn;

/// Strategy producing the content of a `system` summary turn.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Fold `turns` (oldest first) into one summary string.
    ///
    /// Must not fail and must return promptly; implementations with
    /// unbounded work are required to time-bound themselves.
    async fn summarize(&self, turns: &[ConversationTurn]) -> String;
}

/// Pure summarizer concatenating the actions and entities seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionDigestSummarizer;

/// Build the canonical JSON digest for a slice of turns.
pub fn digest(turns: &[ConversationTurn]) -> String {
    let mut key_topics = BTreeSet::new();
    let mut recent_intents = Vec::new();
    let mut important_entities = BTreeSet::new();
    let mut original_turn_count: usize = 0;

    for turn in turns {
        // A leading summary turn folds in transparently: its counted
        // turns carry over so repeated summarization stays idempotent.
        if let Some(previous) = parse_digest(&turn.content) {
            for topic in previous.key_topics {
                key_topics.insert(topic);
            }
            for entity in previous.important_entities {
                important_entities.insert(entity);
            }
            recent_intents.extend(previous.recent_intents);
            original_turn_count = original_turn_count.saturating_add(previous.original_turn_count);
            continue;
        }

        original_turn_count = original_turn_count.saturating_add(1);
        if let Some(intent) = &turn.intent {
            key_topics.insert(intent.action.as_str().to_owned());
            recent_intents.push(intent.action.as_str().to_owned());
            if let Some(serde_json::Value::String(target)) = intent.parameters.get("target") {
                important_entities.insert(target.clone());
            }
        }
    }

    // Keep the intent tail bounded; the full history is gone anyway.
    const RECENT_INTENT_LIMIT: usize = 10;
    if recent_intents.len() > RECENT_INTENT_LIMIT {
        recent_intents = recent_intents
            .split_off(recent_intents.len().saturating_sub(RECENT_INTENT_LIMIT));
    }

    json!({
        "key_topics": key_topics,
        "recent_intents": recent_intents,
        "important_entities": important_entities,
        "summarized_at": Utc::now(),
        "original_turn_count": original_turn_count,
    })
    .to_string()
}

struct ParsedDigest {
    key_topics: Vec<String>,
    recent_intents: Vec<String>,
    important_entities: Vec<String>,
    original_turn_count: usize,
}

fn parse_digest(content: &str) -> Option<ParsedDigest> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let count = value.get("original_turn_count")?.as_u64()?;
    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(ToOwned::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(ParsedDigest {
        key_topics: strings("key_topics"),
        recent_intents: strings("recent_intents"),
        important_entities: strings("important_entities"),
        original_turn_count: usize::try_from(count).unwrap_or(usize::MAX),
    })
}

#[async_trait]
impl Summarizer for ActionDigestSummarizer {
    async fn summarize(&self, turns: &[ConversationTurn]) -> String {
        digest(turns)
    }
}

/// LLM-backed summarizer with a hard deadline and digest fallback.
pub struct LlmSummarizer {
    client: Arc<ChatClient>,
    deadline: Duration,
}

impl LlmSummarizer {
    /// Wrap a chat client with the given per-call deadline.
    pub fn new(client: Arc<ChatClient>, deadline: Duration) -> Self {
        Self { client, deadline }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, turns: &[ConversationTurn]) -> String {
        let fallback = digest(turns);
        let transcript: String = turns
            .iter()
            .map(|t| format!("{}: {}\n", t.role, t.content))
            .collect();
        let prompt = format!(
            "Summarize this conversation prefix as compact JSON with keys \
             key_topics, recent_intents, important_entities. Reply with JSON only.\n\n{transcript}"
        );

        match tokio::time::timeout(self.deadline, self.client.complete(&prompt)).await {
            Ok(Ok(reply)) if serde_json::from_str::<serde_json::Value>(&reply).is_ok() => {
                // Re-attach the bookkeeping fields the digest contract requires.
                let mut value: serde_json::Value =
                    serde_json::from_str(&reply).unwrap_or(serde_json::Value::Null);
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("summarized_at".to_owned(), json!(Utc::now()));
                    obj.insert("original_turn_count".to_owned(), json!(turns.len()));
                    return value.to_string();
                }
                fallback
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                warn!("llm summarizer returned unusable output, using digest");
                fallback
            }
            Err(_) => {
                warn!(deadline = ?self.deadline, "llm summarizer timed out, using digest");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, Intent, TurnRole};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn turn_with_intent(action: ActionKind, target: Option<&str>) -> ConversationTurn {
        let mut parameters = BTreeMap::new();
        if let Some(t) = target {
            parameters.insert("target".to_owned(), serde_json::json!(t));
        }
        let mut turn = ConversationTurn::new(TurnRole::User, "utterance");
        turn.intent = Some(Intent {
            intent_id: Uuid::new_v4(),
            action,
            source_type: None,
            target_type: None,
            amount: None,
            currency: None,
            raw_text: "utterance".to_owned(),
            confidence: 0.9,
            parameters,
        });
        turn
    }

    #[tokio::test]
    async fn digest_collects_topics_and_entities() {
        let turns = vec![
            turn_with_intent(ActionKind::Transfer, Some("alice")),
            turn_with_intent(ActionKind::CheckBalance, None),
            ConversationTurn::new(TurnRole::Assistant, "done"),
        ];
        let summary = ActionDigestSummarizer.summarize(&turns).await;
        let value: serde_json::Value = serde_json::from_str(&summary).expect("json digest");
        assert_eq!(value["original_turn_count"], 3);
        let topics = value["key_topics"].as_array().expect("topics");
        assert!(topics.iter().any(|t| t == "transfer"));
        assert!(topics.iter().any(|t| t == "check_balance"));
        let entities = value["important_entities"].as_array().expect("entities");
        assert!(entities.iter().any(|e| e == "alice"));
    }

    #[tokio::test]
    async fn digest_folds_in_a_previous_summary() {
        let first = vec![
            turn_with_intent(ActionKind::Transfer, Some("alice")),
            turn_with_intent(ActionKind::Transfer, Some("bob")),
        ];
        let first_summary = ActionDigestSummarizer.summarize(&first).await;

        let mut summary_turn = ConversationTurn::new(TurnRole::System, first_summary);
        summary_turn.intent = None;

        let second = vec![summary_turn, turn_with_intent(ActionKind::FundCard, None)];
        let second_summary = ActionDigestSummarizer.summarize(&second).await;
        let value: serde_json::Value = serde_json::from_str(&second_summary).expect("json");

        // 2 original turns from the first round + 1 new turn.
        assert_eq!(value["original_turn_count"], 3);
        let entities = value["important_entities"].as_array().expect("entities");
        assert!(entities.iter().any(|e| e == "alice"));
        assert!(entities.iter().any(|e| e == "bob"));
    }
}
