//! Session context manager.
//!
//! Per-session conversation history and per-user state with bounded
//! memory. Sessions live in a map guarded by an outer `RwLock`; each
//! session has its own `Mutex`, so distinct sessions are read and
//! written concurrently while per-session mutation stays serialized.
//! A periodic sweep evicts idle sessions (TTL) and trims past the soft
//! session cap (LRU by last activity). User state is kept in a separate
//! map so it can outlive session eviction.

pub mod privacy;
pub mod summarizer;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{ContextConfig, PrivacyConfig};
use crate::types::{ConversationTurn, SessionContext, TurnRole, UserState};

use self::summarizer::Summarizer;

/// Context manager errors.
#[derive(Debug, Error)]
pub enum ContextError {
    /// No live session under this identifier.
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// Sessions evicted by one sweep, with their owning users.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// `(session_id, user_id)` pairs removed this sweep.
    pub evicted: Vec<(String, String)>,
}

/// Per-session conversation history and per-user state store.
pub struct ContextManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionContext>>>>,
    users: RwLock<HashMap<String, UserState>>,
    config: ContextConfig,
    privacy: PrivacyConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextManager {
    /// Build a manager with the given limits and summarization strategy.
    pub fn new(
        config: ContextConfig,
        privacy: PrivacyConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            config,
            privacy,
            summarizer,
        }
    }

    fn ttl_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.ttl()).unwrap_or_else(|_| TimeDelta::seconds(3_600))
    }

    async fn handle(&self, session_id: &str, user_id: &str) -> Arc<Mutex<SessionContext>> {
        if let Some(existing) = self.sessions.read().await.get(session_id) {
            return Arc::clone(existing);
        }

        let mut sessions = self.sessions.write().await;
        // Re-check under the write lock; another task may have created it.
        if let Some(existing) = sessions.get(session_id) {
            return Arc::clone(existing);
        }

        let now = Utc::now();
        let user_state = self
            .users
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default();
        let session = SessionContext {
            session_id: session_id.to_owned(),
            user_id: user_id.to_owned(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.ttl_delta(),
            history: std::collections::VecDeque::new(),
            user_state,
            active_intent_ids: std::collections::HashSet::new(),
            pending_clarification_ids: std::collections::HashSet::new(),
        };
        debug!(session_id, user_id, "session created");
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(session_id.to_owned(), Arc::clone(&handle));
        handle
    }

    /// Get or create the session, returning a point-in-time snapshot.
    pub async fn get_or_create(&self, session_id: &str, user_id: &str) -> SessionContext {
        let handle = self.handle(session_id, user_id).await;
        let session = handle.lock().await;
        session.clone()
    }

    /// Append a turn, refreshing activity and summarizing on overflow.
    ///
    /// Creates the session if it does not exist. When the turn carries a
    /// parsed intent, the canonical user state records the action and any
    /// stated target before the session snapshot is refreshed.
    pub async fn append_turn(&self, session_id: &str, user_id: &str, turn: ConversationTurn) {
        if let Some(intent) = &turn.intent {
            let action = intent.action;
            let target = intent
                .parameters
                .get("target")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned);
            self.update_user_state(user_id, |state| {
                state.record_action(action);
                if let Some(target) = target {
                    state.record_merchant(target);
                }
            })
            .await;
        }

        let handle = self.handle(session_id, user_id).await;
        let user_state = self
            .users
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default();

        let mut session = handle.lock().await;
        session.history.push_back(turn);
        session.user_state = user_state;
        let now = Utc::now();
        session.last_activity_at = now;
        session.expires_at = now + self.ttl_delta();

        if session.history.len() > self.config.max_turns {
            let take = self
                .config
                .summarize_threshold()
                .min(session.history.len());
            let oldest: Vec<ConversationTurn> = session.history.drain(..take).collect();
            let summary = self.summarizer.summarize(&oldest).await;
            session
                .history
                .push_front(ConversationTurn::new(TurnRole::System, summary));
            debug!(
                session_id,
                folded = oldest.len(),
                "history summarized into system turn"
            );
        }
    }

    /// Point-in-time copy of a session, if it is live.
    pub async fn snapshot(&self, session_id: &str) -> Result<SessionContext, ContextError> {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| ContextError::SessionNotFound(session_id.to_owned()))?
        };
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Drop a session outright.
    pub async fn clear(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Track an intent with a live plan in its session.
    pub async fn mark_intent_active(&self, session_id: &str, intent_id: uuid::Uuid) {
        if let Some(handle) = self.sessions.read().await.get(session_id).cloned() {
            handle.lock().await.active_intent_ids.insert(intent_id);
        }
    }

    /// Record an open clarification for an intent.
    ///
    /// A session holds at most one open clarification per intent; the
    /// set makes re-marking idempotent.
    pub async fn mark_clarification_pending(&self, session_id: &str, intent_id: uuid::Uuid) {
        if let Some(handle) = self.sessions.read().await.get(session_id).cloned() {
            handle
                .lock()
                .await
                .pending_clarification_ids
                .insert(intent_id);
        }
    }

    /// Canonical user state, default when the user is new.
    pub async fn user_state(&self, user_id: &str) -> UserState {
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutate canonical user state in place.
    pub async fn update_user_state(&self, user_id: &str, f: impl FnOnce(&mut UserState)) {
        let mut users = self.users.write().await;
        let state = users.entry(user_id.to_owned()).or_default();
        f(state);
    }

    /// Action-frequency counts with privacy noise applied when enabled.
    ///
    /// The stored raw counts are never modified; only this exposed copy
    /// is noised.
    pub async fn noisy_action_counts(&self, user_id: &str) -> BTreeMap<String, u64> {
        let state = self.user_state(user_id).await;
        privacy::noisy_counts(&state.action_counts, &self.privacy)
    }

    /// Evict expired sessions, then LRU-trim past the soft cap.
    ///
    /// Returns the evicted sessions so the caller can cancel any plans
    /// they own. User state survives eviction unless
    /// `persist_user_state` is off and the user has no remaining session.
    pub async fn sweep(&self) -> SweepOutcome {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();

        let mut sessions = self.sessions.write().await;

        // Pass 1: TTL expiry.
        let mut expired = Vec::new();
        for (session_id, handle) in sessions.iter() {
            let session = handle.lock().await;
            if now > session.expires_at {
                expired.push((session_id.clone(), session.user_id.clone()));
            }
        }
        for (session_id, user_id) in expired {
            sessions.remove(&session_id);
            outcome.evicted.push((session_id, user_id));
        }

        // Pass 2: LRU past the soft cap.
        if sessions.len() > self.config.max_sessions {
            let mut by_activity = Vec::new();
            for (session_id, handle) in sessions.iter() {
                let session = handle.lock().await;
                by_activity.push((
                    session.last_activity_at,
                    session_id.clone(),
                    session.user_id.clone(),
                ));
            }
            by_activity.sort_by_key(|(activity, _, _)| *activity);
            let excess = sessions.len().saturating_sub(self.config.max_sessions);
            for (_, session_id, user_id) in by_activity.into_iter().take(excess) {
                sessions.remove(&session_id);
                outcome.evicted.push((session_id, user_id));
            }
        }

        if !outcome.evicted.is_empty() {
            info!(evicted = outcome.evicted.len(), "session sweep evicted sessions");
        }

        if !self.config.persist_user_state {
            // Drop user state for users with no remaining session.
            let mut live_users: std::collections::HashSet<String> =
                std::collections::HashSet::new();
            for handle in sessions.values() {
                live_users.insert(handle.lock().await.user_id.clone());
            }
            drop(sessions);
            let mut users = self.users.write().await;
            for (_, user_id) in &outcome.evicted {
                if !live_users.contains(user_id) {
                    users.remove(user_id);
                }
            }
        }

        outcome
    }
}
