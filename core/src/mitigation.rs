use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::actor::ActorIdentity;

/// Progressive punishment ladder. The derived order is the escalation
/// direction: later variants are stricter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MitigationLevel {
    None,
    Delay,
    Captcha,
    TempBlock,
    Ban,
}

impl MitigationLevel {
    pub const ALL: [MitigationLevel; 5] = [
        MitigationLevel::None,
        MitigationLevel::Delay,
        MitigationLevel::Captcha,
        MitigationLevel::TempBlock,
        MitigationLevel::Ban,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MitigationLevel::None => "none",
            MitigationLevel::Delay => "delay",
            MitigationLevel::Captcha => "captcha",
            MitigationLevel::TempBlock => "temp_block",
            MitigationLevel::Ban => "ban",
        }
    }

    /// Parse the wire name. Anything outside the five defined levels is
    /// rejected; callers discard such verdicts rather than guessing.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "none" => Some(MitigationLevel::None),
            "delay" => Some(MitigationLevel::Delay),
            "captcha" => Some(MitigationLevel::Captcha),
            "temp_block" => Some(MitigationLevel::TempBlock),
            "ban" => Some(MitigationLevel::Ban),
            _ => None,
        }
    }

    /// One step up the ladder, saturating at `Ban`.
    pub fn escalate(self) -> Self {
        match self {
            MitigationLevel::None => MitigationLevel::Delay,
            MitigationLevel::Delay => MitigationLevel::Captcha,
            MitigationLevel::Captcha => MitigationLevel::TempBlock,
            MitigationLevel::TempBlock | MitigationLevel::Ban => MitigationLevel::Ban,
        }
    }

    /// One step down the ladder, saturating at `None`.
    pub fn de_escalate(self) -> Self {
        match self {
            MitigationLevel::None | MitigationLevel::Delay => MitigationLevel::None,
            MitigationLevel::Captcha => MitigationLevel::Delay,
            MitigationLevel::TempBlock => MitigationLevel::Captcha,
            MitigationLevel::Ban => MitigationLevel::TempBlock,
        }
    }
}

/// The mitigation currently enforced against one actor. Created and
/// overwritten by the calibrator, read by the gate on every request,
/// removed by expiry or operator override.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActiveMitigation {
    pub actor: ActorIdentity,
    pub level: MitigationLevel,
    /// `None` means permanent (only `ban` is committed without an expiry).
    pub expires_at: Option<DateTime<Utc>>,
    pub applied_at: DateTime<Utc>,
    /// The calibrated case that committed this decision.
    pub case_id: Uuid,
}

impl ActiveMitigation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}
