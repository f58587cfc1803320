use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actor::ActorIdentity;

/// Immutable snapshot of one completed request, created by the gate after
/// the downstream handler returned. Owned exclusively by the queue until a
/// batch drains it; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    /// Deterministic category assigned from method+path at capture time.
    pub category: String,
    /// Primary identity: the client IP when known, otherwise the account.
    pub actor: ActorIdentity,
    /// Account id when the request was authenticated, regardless of which
    /// identity is primary. Lets the classifier attribute verdicts to
    /// accounts that rotate through many addresses.
    pub account: Option<String>,
    pub status: u16,
    pub latency_ms: u32,
    /// Sanitized body excerpt — sensitive fields are reduced to
    /// deterministic hash markers before capture.
    pub payload_excerpt: Option<String>,
}

impl RequestRecord {
    /// One-line summary used when shipping batches to the classifier.
    pub fn summary_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.actor,
            self.method,
            self.path,
            self.status,
            self.account.as_deref().unwrap_or(""),
            self.payload_excerpt.as_deref().unwrap_or(""),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::RequestRecord;
    use crate::actor::ActorIdentity;
    use chrono::Utc;

    #[test]
    fn summary_line_is_stable_for_identical_requests() {
        let record = |latency_ms| RequestRecord {
            timestamp: Utc::now(),
            method: "POST".into(),
            path: "/v1/login".into(),
            category: "auth".into(),
            actor: ActorIdentity::Account("mallory".into()),
            account: Some("mallory".into()),
            status: 401,
            latency_ms,
            payload_excerpt: Some(r#"{"password":"hash_ab12_len8"}"#.into()),
        };
        // Timing fields are deliberately excluded so duplicates compress.
        assert_eq!(record(3).summary_line(), record(250).summary_line());
    }
}
