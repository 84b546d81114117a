//! Approval queue -- human-in-the-loop gate for sensitive plan steps.
//!
//! When the execution loop reaches a step that requires approval, it
//! submits a request here and receives a `tokio::sync::oneshot`
//! receiver to await the decision. The RPC layer resolves requests when
//! the caller's approval arrives. Requests past their timeout are
//! auto-resolved as `TimedOut` by the periodic `cleanup_expired` sweep;
//! the execution loop also applies its own deadline as a backstop.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use super::StepAction;

/// An approval request pending a human decision.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Plan the step belongs to.
    pub plan_id: Uuid,
    /// Step awaiting the decision.
    pub step_id: Uuid,
    /// The action being gated.
    pub action: StepAction,
    /// Description shown to the approver.
    pub description: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// How long to wait before auto-resolving as timed out.
    pub timeout: Duration,
}

/// Decision for a pending approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// The approver allowed the step.
    Approved {
        /// Who approved.
        approver: String,
        /// Optional free-text note.
        comment: Option<String>,
    },
    /// The approver denied the step.
    Denied {
        /// Who denied.
        approver: String,
        /// Optional free-text note.
        comment: Option<String>,
    },
    /// No decision arrived before the timeout.
    TimedOut,
}

/// Approval queue errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request for this plan/step pair.
    #[error("no pending approval for plan {plan_id} step {step_id}")]
    NotFound {
        /// Plan queried.
        plan_id: Uuid,
        /// Step queried.
        step_id: Uuid,
    },
}

struct PendingEntry {
    request: ApprovalRequest,
    sender: oneshot::Sender<ApprovalDecision>,
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("request", &self.request)
            .field("sender", &"<oneshot::Sender>")
            .finish()
    }
}

/// Queue of approval requests keyed by `(plan_id, step_id)`.
#[derive(Debug)]
pub struct ApprovalQueue {
    pending: HashMap<(Uuid, Uuid), PendingEntry>,
    default_timeout: Duration,
}

impl ApprovalQueue {
    /// Create a queue with the given default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            default_timeout,
        }
    }

    /// Submit a request; await the returned receiver for the decision.
    ///
    /// A second submission for the same `(plan_id, step_id)` replaces the
    /// first, whose receiver then resolves as `TimedOut`.
    pub fn submit(&mut self, request: ApprovalRequest) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let key = (request.plan_id, request.step_id);

        info!(
            plan_id = %request.plan_id,
            step_id = %request.step_id,
            action = request.action.as_str(),
            "approval requested"
        );

        if let Some(replaced) = self.pending.insert(
            key,
            PendingEntry {
                request,
                sender: tx,
            },
        ) {
            let _ = replaced.sender.send(ApprovalDecision::TimedOut);
        }

        rx
    }

    /// Resolve a pending request with the caller's decision.
    ///
    /// If the execution loop already gave up on the step (receiver
    /// dropped), the send is silently ignored.
    pub fn resolve(
        &mut self,
        plan_id: Uuid,
        step_id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        let entry = self
            .pending
            .remove(&(plan_id, step_id))
            .ok_or(ApprovalError::NotFound { plan_id, step_id })?;

        info!(
            %plan_id,
            %step_id,
            action = entry.request.action.as_str(),
            decision = ?decision,
            "approval resolved"
        );

        let _ = entry.sender.send(decision);
        Ok(())
    }

    /// The pending request for a plan/step pair, if any.
    pub fn get_pending(&self, plan_id: Uuid, step_id: Uuid) -> Option<&ApprovalRequest> {
        self.pending.get(&(plan_id, step_id)).map(|e| &e.request)
    }

    /// Number of requests awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Auto-resolve requests past their timeout as `TimedOut`.
    ///
    /// Called periodically by the background sweeper; the execution loop
    /// holds its own deadline as well, so this is cleanup rather than
    /// the primary timeout mechanism.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Utc::now();
        let expired: Vec<(Uuid, Uuid)> = self
            .pending
            .iter()
            .filter(|(_, entry)| is_expired(&entry.request, now))
            .map(|(key, _)| *key)
            .collect();

        let count = expired.len();
        for key in expired {
            if let Some(entry) = self.pending.remove(&key) {
                warn!(
                    plan_id = %entry.request.plan_id,
                    step_id = %entry.request.step_id,
                    "approval request timed out"
                );
                let _ = entry.sender.send(ApprovalDecision::TimedOut);
            }
        }
        count
    }

    /// Default timeout applied to new requests.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

fn is_expired(request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
    let elapsed = now.signed_duration_since(request.created_at);
    let timeout = chrono::TimeDelta::from_std(request.timeout)
        .unwrap_or_else(|_| chrono::TimeDelta::seconds(300));
    elapsed > timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(plan_id: Uuid, step_id: Uuid) -> ApprovalRequest {
        ApprovalRequest {
            plan_id,
            step_id,
            action: StepAction::FundCard,
            description: "Fund card with $50".to_owned(),
            created_at: Utc::now(),
            timeout: Duration::from_secs(300),
        }
    }

    fn expired_request(plan_id: Uuid, step_id: Uuid) -> ApprovalRequest {
        let mut req = request(plan_id, step_id);
        req.created_at = Utc::now()
            .checked_sub_signed(chrono::TimeDelta::seconds(600))
            .expect("600s subtraction fits");
        req
    }

    #[tokio::test]
    async fn submit_and_approve() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(300));
        let (plan_id, step_id) = (Uuid::new_v4(), Uuid::new_v4());
        let rx = queue.submit(request(plan_id, step_id));
        assert_eq!(queue.pending_count(), 1);

        queue
            .resolve(
                plan_id,
                step_id,
                ApprovalDecision::Approved {
                    approver: "user-1".to_owned(),
                    comment: None,
                },
            )
            .expect("resolve");
        assert_eq!(queue.pending_count(), 0);

        let decision = rx.await.expect("decision");
        assert!(matches!(decision, ApprovalDecision::Approved { .. }));
    }

    #[tokio::test]
    async fn submit_and_deny_with_comment() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(300));
        let (plan_id, step_id) = (Uuid::new_v4(), Uuid::new_v4());
        let rx = queue.submit(request(plan_id, step_id));

        queue
            .resolve(
                plan_id,
                step_id,
                ApprovalDecision::Denied {
                    approver: "user-1".to_owned(),
                    comment: Some("not now".to_owned()),
                },
            )
            .expect("resolve");

        match rx.await.expect("decision") {
            ApprovalDecision::Denied { approver, comment } => {
                assert_eq!(approver, "user-1");
                assert_eq!(comment.as_deref(), Some("not now"));
            }
            other => panic!("expected Denied, got {other:?}"),
        }
    }

    #[test]
    fn resolving_unknown_request_errors() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(300));
        let result = queue.resolve(Uuid::new_v4(), Uuid::new_v4(), ApprovalDecision::TimedOut);
        assert!(matches!(result, Err(ApprovalError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cleanup_sends_timeout_to_expired_only() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(300));
        let (p1, s1) = (Uuid::new_v4(), Uuid::new_v4());
        let (p2, s2) = (Uuid::new_v4(), Uuid::new_v4());

        let expired_rx = queue.submit(expired_request(p1, s1));
        let _fresh_rx = queue.submit(request(p2, s2));

        let cleaned = queue.cleanup_expired();
        assert_eq!(cleaned, 1);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(
            expired_rx.await.expect("decision"),
            ApprovalDecision::TimedOut
        );
    }

    #[tokio::test]
    async fn resubmission_times_out_the_replaced_request() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(300));
        let (plan_id, step_id) = (Uuid::new_v4(), Uuid::new_v4());
        let first_rx = queue.submit(request(plan_id, step_id));
        let _second_rx = queue.submit(request(plan_id, step_id));

        assert_eq!(queue.pending_count(), 1);
        assert_eq!(first_rx.await.expect("decision"), ApprovalDecision::TimedOut);
    }

    #[test]
    fn resolve_after_receiver_dropped_is_ok() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(300));
        let (plan_id, step_id) = (Uuid::new_v4(), Uuid::new_v4());
        let rx = queue.submit(request(plan_id, step_id));
        drop(rx);

        let result = queue.resolve(
            plan_id,
            step_id,
            ApprovalDecision::Approved {
                approver: "user-1".to_owned(),
                comment: None,
            },
        );
        assert!(result.is_ok());
        assert_eq!(queue.pending_count(), 0);
    }
}
