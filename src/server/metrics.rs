//! Lock-free service counters surfaced by `GET /health`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared counter set; cloning shares the underlying atomics.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    total_requests: AtomicU64,
    intents_parsed: AtomicU64,
    plans_executed: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    /// Converse requests accepted.
    pub total_requests: u64,
    /// Utterances successfully parsed.
    pub intents_parsed: u64,
    /// Plans driven to a terminal status.
    pub plans_executed: u64,
    /// Requests that ended in an error.
    pub errors: u64,
}

impl Metrics {
    /// Record an accepted converse request.
    pub fn inc_requests(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a parsed intent.
    pub fn inc_intents(&self) {
        self.inner.intents_parsed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a plan reaching a terminal status.
    pub fn inc_plans(&self) {
        self.inner.plans_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request.
    pub fn inc_errors(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            intents_parsed: self.inner.intents_parsed.load(Ordering::Relaxed),
            plans_executed: self.inner.plans_executed.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::default();
        let clone = metrics.clone();
        metrics.inc_requests();
        clone.inc_requests();
        clone.inc_errors();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.plans_executed, 0);
    }
}
