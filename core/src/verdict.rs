use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::actor::ActorIdentity;
use crate::mitigation::MitigationLevel;

/// Raw classifier output for one suspect actor. Transient — consumed by the
/// calibrator within the same batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub actor: ActorIdentity,
    pub level: MitigationLevel,
    pub rationale: String,
    pub category: String,
    pub evidence: String,
}

/// Human judgment on a past decision. Attached once (last write wins) and
/// consulted by every future calibration that retrieves the case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackLabel {
    Correct,
    Incorrect,
}

impl FeedbackLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackLabel::Correct => "correct",
            FeedbackLabel::Incorrect => "incorrect",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "correct" => Some(FeedbackLabel::Correct),
            "incorrect" => Some(FeedbackLabel::Incorrect),
            _ => None,
        }
    }
}

/// What calibration did to the suggested level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationDecision {
    Kept,
    Amplified,
    Downgraded,
}

impl CalibrationDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            CalibrationDecision::Kept => "kept",
            CalibrationDecision::Amplified => "amplified",
            CalibrationDecision::Downgraded => "downgraded",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "kept" => Some(CalibrationDecision::Kept),
            "amplified" => Some(CalibrationDecision::Amplified),
            "downgraded" => Some(CalibrationDecision::Downgraded),
            _ => None,
        }
    }
}

/// One unit of institutional memory: a persisted calibrated decision.
/// Append-only; the only mutation ever applied is feedback attachment.
/// Every committed mitigation has exactly one case with the matching final
/// level.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CalibratedCase {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub actor: ActorIdentity,
    pub category: String,
    /// Similarity key: the normalized situation description retrieval
    /// queries are matched against.
    pub fingerprint: String,
    /// Verdict rationale plus the calibration note.
    pub rationale: String,
    pub suggested_level: MitigationLevel,
    pub final_level: MitigationLevel,
    pub decision: CalibrationDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_at: Option<DateTime<Utc>>,
}
