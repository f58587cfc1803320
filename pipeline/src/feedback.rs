use std::sync::Arc;

use uuid::Uuid;

use warden_core::verdict::{CalibratedCase, FeedbackLabel};

use crate::error::{FeedbackError, MemoryError};
use crate::memory::CaseMemory;
use crate::metrics::{GuardMetrics, bump};

/// Out-of-band channel for human judgments on past decisions.
///
/// Feedback only ever touches case memory: it never rewrites a committed
/// mitigation, it changes what future calibrations retrieve. Attachment is
/// idempotent — resubmitting the same judgment leaves the store unchanged,
/// and a change of mind simply overwrites (last write wins).
#[derive(Clone)]
pub struct FeedbackChannel {
    memory: CaseMemory,
    metrics: Arc<GuardMetrics>,
}

impl FeedbackChannel {
    pub fn new(memory: CaseMemory, metrics: Arc<GuardMetrics>) -> Self {
        Self { memory, metrics }
    }

    pub async fn submit(
        &self,
        case_id: Uuid,
        correct: bool,
    ) -> Result<CalibratedCase, FeedbackError> {
        let label = if correct {
            FeedbackLabel::Correct
        } else {
            FeedbackLabel::Incorrect
        };
        match self.memory.attach_feedback(case_id, label).await {
            Ok(case) => {
                bump(&self.metrics.feedback_received);
                tracing::info!(
                    case_id = %case_id,
                    label = label.as_str(),
                    level = case.final_level.as_str(),
                    "feedback recorded"
                );
                Ok(case)
            }
            Err(MemoryError::NotFound(id)) => Err(FeedbackError::NotFound(id)),
            Err(err) => {
                tracing::error!(case_id = %case_id, error = %err, "feedback could not be stored");
                Err(FeedbackError::Storage(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FeedbackChannel;
    use crate::error::FeedbackError;
    use crate::memory::CaseMemory;
    use crate::metrics::GuardMetrics;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;
    use warden_core::actor::ActorIdentity;
    use warden_core::mitigation::MitigationLevel;
    use warden_core::verdict::{CalibratedCase, CalibrationDecision, FeedbackLabel};

    #[tokio::test]
    async fn submitting_twice_equals_submitting_once() {
        let memory = CaseMemory::in_memory();
        let case = CalibratedCase {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            actor: ActorIdentity::Account("mallory".into()),
            category: "auth".into(),
            fingerprint: "auth burst".into(),
            rationale: "burst".into(),
            suggested_level: MitigationLevel::TempBlock,
            final_level: MitigationLevel::TempBlock,
            decision: CalibrationDecision::Kept,
            feedback: None,
            feedback_at: None,
        };
        memory.insert(&case).await.expect("insert should succeed");
        let channel = FeedbackChannel::new(memory.clone(), Arc::new(GuardMetrics::default()));

        channel.submit(case.id, false).await.expect("first submit should succeed");
        let repeat = channel.submit(case.id, false).await.expect("second submit should succeed");
        assert_eq!(repeat.feedback, Some(FeedbackLabel::Incorrect));
        assert_eq!(memory.count().await.expect("count should succeed"), 1);
    }

    #[tokio::test]
    async fn unknown_case_is_reported_not_thrown() {
        let channel =
            FeedbackChannel::new(CaseMemory::in_memory(), Arc::new(GuardMetrics::default()));
        let result = channel.submit(Uuid::now_v7(), true).await;
        assert!(matches!(result, Err(FeedbackError::NotFound(_))));
    }
}
