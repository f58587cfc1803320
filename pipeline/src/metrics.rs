use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use utoipa::ToSchema;

/// In-process counters for the guard. The durable audit store is an
/// external collaborator, so observability here is a cheap snapshot the
/// metrics endpoint can serve on every poll.
#[derive(Debug, Default)]
pub struct GuardMetrics {
    /// Requests that passed through the gate (exempt ops paths excluded).
    pub requests_seen: AtomicU64,
    /// Requests slowed down by a delay-level mitigation.
    pub requests_delayed: AtomicU64,
    /// Captcha short-circuits returned to un-tokened callers.
    pub challenges_issued: AtomicU64,
    /// Requests rejected under temp_block or ban.
    pub requests_blocked: AtomicU64,
    /// Hot-path faults handled fail-open (actor derivation, body capture).
    pub hot_path_failures: AtomicU64,
    /// Non-empty batches handed to the pipeline.
    pub batches_dispatched: AtomicU64,
    /// Scheduler wakeups that found an empty queue.
    pub batches_empty: AtomicU64,
    /// Verdicts that survived validation.
    pub verdicts_accepted: AtomicU64,
    /// Verdicts discarded as malformed (unknown level or actor).
    pub verdicts_discarded: AtomicU64,
    /// Classifier calls that errored or timed out.
    pub classifier_failures: AtomicU64,
    /// Calibrated cases persisted.
    pub cases_written: AtomicU64,
    /// Feedback labels accepted.
    pub feedback_received: AtomicU64,
}

impl GuardMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_seen: self.requests_seen.load(Ordering::Relaxed),
            requests_delayed: self.requests_delayed.load(Ordering::Relaxed),
            challenges_issued: self.challenges_issued.load(Ordering::Relaxed),
            requests_blocked: self.requests_blocked.load(Ordering::Relaxed),
            hot_path_failures: self.hot_path_failures.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_empty: self.batches_empty.load(Ordering::Relaxed),
            verdicts_accepted: self.verdicts_accepted.load(Ordering::Relaxed),
            verdicts_discarded: self.verdicts_discarded.load(Ordering::Relaxed),
            classifier_failures: self.classifier_failures.load(Ordering::Relaxed),
            cases_written: self.cases_written.load(Ordering::Relaxed),
            feedback_received: self.feedback_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricsSnapshot {
    pub requests_seen: u64,
    pub requests_delayed: u64,
    pub challenges_issued: u64,
    pub requests_blocked: u64,
    pub hot_path_failures: u64,
    pub batches_dispatched: u64,
    pub batches_empty: u64,
    pub verdicts_accepted: u64,
    pub verdicts_discarded: u64,
    pub classifier_failures: u64,
    pub cases_written: u64,
    pub feedback_received: u64,
}

/// Relaxed increment; these counters order against nothing.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::{GuardMetrics, add, bump};

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = GuardMetrics::default();
        bump(&metrics.requests_seen);
        bump(&metrics.requests_seen);
        add(&metrics.verdicts_accepted, 7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_seen, 2);
        assert_eq!(snapshot.verdicts_accepted, 7);
        assert_eq!(snapshot.requests_blocked, 0);
    }
}
