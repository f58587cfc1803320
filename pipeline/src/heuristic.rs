use std::collections::{HashMap, HashSet};

use warden_core::actor::ActorIdentity;
use warden_core::mitigation::MitigationLevel;
use warden_core::record::RequestRecord;
use warden_core::verdict::Verdict;

use crate::classifier::Classify;
use crate::error::ClassifyError;

const BURST_REQUEST_THRESHOLD: usize = 25;
const FAILURE_RATIO_THRESHOLD: f64 = 0.45;
const FAILURE_RATIO_BLOCK_THRESHOLD: f64 = 0.55;
const MIN_REQUESTS_FOR_FAILURE_RATIO: usize = 10;
const MIN_REQUESTS_FOR_FAILURE_BLOCK: usize = 30;
const UNIQUE_PATH_THRESHOLD: usize = 5;
const WRITE_BURST_THRESHOLD: usize = 12;
// Bayesian-style priors keep small samples from tripping the ratio signals.
const FAILURE_PRIOR_FAILED: f64 = 2.0;
const FAILURE_PRIOR_TOTAL: f64 = 8.0;
const NOT_FOUND_FAILURE_WEIGHT: f64 = 0.35;

const DELAY_SCORE_THRESHOLD: i32 = 20;
const CAPTCHA_SCORE_THRESHOLD: i32 = 60;
const BLOCK_SCORE_THRESHOLD: i32 = 90;

/// Deterministic in-process classifier: scores per-actor aggregates of the
/// drained batch into abuse signals and maps the score onto the ladder.
///
/// Runs when no LLM endpoint is configured. It never proposes `ban`
/// directly — permanent bans only come out of calibration escalating a
/// persistent offender.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

#[derive(Debug, Default)]
struct ActorWindow {
    total: usize,
    failed_authz: usize,
    not_found: usize,
    writes: usize,
    unique_paths: HashSet<String>,
}

impl ActorWindow {
    fn observe(&mut self, record: &RequestRecord) {
        self.total += 1;
        match record.status {
            401 | 403 | 429 => self.failed_authz += 1,
            404 => self.not_found += 1,
            _ => {}
        }
        if matches!(record.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE") {
            self.writes += 1;
        }
        self.unique_paths.insert(record.path.clone());
    }

    fn failed(&self) -> usize {
        self.failed_authz + self.not_found
    }

    fn smoothed_failure_ratio(&self) -> f64 {
        let total = self.total as f64;
        let weighted_failed =
            self.failed_authz as f64 + self.not_found as f64 * NOT_FOUND_FAILURE_WEIGHT;
        (weighted_failed + FAILURE_PRIOR_FAILED) / (total + FAILURE_PRIOR_TOTAL)
    }
}

struct Assessment {
    score: i32,
    signals: Vec<&'static str>,
}

fn assess(window: &ActorWindow) -> Assessment {
    let mut score = 0;
    let mut signals = Vec::new();
    let smoothed_ratio = window.smoothed_failure_ratio();

    if window.total >= BURST_REQUEST_THRESHOLD {
        score += 30;
        signals.push("burst_volume");
    }
    if window.total >= MIN_REQUESTS_FOR_FAILURE_RATIO && smoothed_ratio >= FAILURE_RATIO_THRESHOLD {
        score += 20;
        signals.push("failure_ratio_spike");
    }
    if window.total >= MIN_REQUESTS_FOR_FAILURE_BLOCK
        && smoothed_ratio >= FAILURE_RATIO_BLOCK_THRESHOLD
    {
        score += 25;
        signals.push("failure_ratio_high_confidence");
    }
    if window.total >= 12 && window.failed_authz >= 8 {
        score += 20;
        signals.push("authz_failure_burst");
    }
    if window.unique_paths.len() >= UNIQUE_PATH_THRESHOLD
        && window.failed() >= 3
        && window.total >= 12
    {
        score += 20;
        signals.push("endpoint_enumeration");
    }
    if window.writes >= WRITE_BURST_THRESHOLD {
        score += 25;
        signals.push("write_burst");
    }

    Assessment { score, signals }
}

fn level_for_score(score: i32) -> MitigationLevel {
    if score >= BLOCK_SCORE_THRESHOLD {
        MitigationLevel::TempBlock
    } else if score >= CAPTCHA_SCORE_THRESHOLD {
        MitigationLevel::Captcha
    } else if score >= DELAY_SCORE_THRESHOLD {
        MitigationLevel::Delay
    } else {
        MitigationLevel::None
    }
}

/// Aggregate the batch per actor. A record contributes to its primary
/// identity, and additionally to the account identity when the account
/// rode in on an IP-keyed record — mitigating both closes the rotating-IP
/// loophole.
fn aggregate(records: &[RequestRecord]) -> HashMap<ActorIdentity, ActorWindow> {
    let mut windows: HashMap<ActorIdentity, ActorWindow> = HashMap::new();
    for record in records {
        windows
            .entry(record.actor.clone())
            .or_default()
            .observe(record);
        if let (ActorIdentity::Ip(_), Some(account)) = (&record.actor, &record.account) {
            windows
                .entry(ActorIdentity::Account(account.clone()))
                .or_default()
                .observe(record);
        }
    }
    windows
}

impl Classify for HeuristicClassifier {
    async fn classify(
        &self,
        category: &str,
        records: &[RequestRecord],
        _ruleset: &str,
    ) -> Result<Vec<Verdict>, ClassifyError> {
        let mut verdicts = Vec::new();
        for (actor, window) in aggregate(records) {
            let assessment = assess(&window);
            let level = level_for_score(assessment.score);
            if level == MitigationLevel::None {
                continue;
            }
            verdicts.push(Verdict {
                rationale: format!(
                    "{} (score {}) in category {category}",
                    assessment.signals.join(", "),
                    assessment.score,
                ),
                evidence: format!(
                    "{} requests, {} failed, {} distinct paths, {} writes in batch window",
                    window.total,
                    window.failed(),
                    window.unique_paths.len(),
                    window.writes,
                ),
                actor,
                level,
                category: category.to_string(),
            });
        }
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::HeuristicClassifier;
    use crate::classifier::Classify;
    use chrono::Utc;
    use warden_core::actor::ActorIdentity;
    use warden_core::mitigation::MitigationLevel;
    use warden_core::record::RequestRecord;

    fn failed_login(octet: u8, account: Option<&str>) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            method: "POST".into(),
            path: "/login".into(),
            category: "auth".into(),
            actor: ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, octet])),
            account: account.map(str::to_string),
            status: 401,
            latency_ms: 12,
            payload_excerpt: None,
        }
    }

    fn browsing(octet: u8, path: &str) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            method: "GET".into(),
            path: path.into(),
            category: "general".into(),
            actor: ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, octet])),
            account: None,
            status: 200,
            latency_ms: 8,
            payload_excerpt: None,
        }
    }

    #[tokio::test]
    async fn failed_login_flood_is_flagged_for_blocking() {
        let records: Vec<_> = (0..50).map(|_| failed_login(5, None)).collect();
        let verdicts = HeuristicClassifier
            .classify("auth", &records, "")
            .await
            .expect("heuristic classification is infallible");
        assert_eq!(verdicts.len(), 1);
        assert_eq!(
            verdicts[0].actor,
            ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, 5]))
        );
        assert_eq!(verdicts[0].level, MitigationLevel::TempBlock);
        assert!(verdicts[0].rationale.contains("burst_volume"));
    }

    #[tokio::test]
    async fn quiet_traffic_yields_no_verdicts() {
        let records: Vec<_> = (0..8).map(|i| browsing(i, "/v1/widgets")).collect();
        let verdicts = HeuristicClassifier
            .classify("general", &records, "")
            .await
            .expect("heuristic classification is infallible");
        assert!(verdicts.is_empty());
    }

    #[tokio::test]
    async fn small_failure_samples_are_tempered_by_the_prior() {
        // 4 failures out of 10 would be a 40% raw ratio, but the prior keeps
        // the smoothed ratio below the spike threshold.
        let mut records: Vec<_> = (0..4).map(|_| failed_login(9, None)).collect();
        records.extend((0..6).map(|_| browsing(9, "/home")));
        let verdicts = HeuristicClassifier
            .classify("auth", &records, "")
            .await
            .expect("heuristic classification is infallible");
        assert!(verdicts.is_empty());
    }

    #[tokio::test]
    async fn path_enumeration_earns_a_delay() {
        let mut records = Vec::new();
        for i in 0..14u8 {
            let mut record = browsing(7, &format!("/admin/{i}"));
            record.status = 404;
            records.push(record);
        }
        let verdicts = HeuristicClassifier
            .classify("general", &records, "")
            .await
            .expect("heuristic classification is infallible");
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].level, MitigationLevel::Delay);
        assert!(verdicts[0].rationale.contains("endpoint_enumeration"));
    }

    #[tokio::test]
    async fn account_identity_is_attributed_alongside_the_ip() {
        let records: Vec<_> = (0..50).map(|_| failed_login(5, Some("mallory"))).collect();
        let mut verdicts = HeuristicClassifier
            .classify("auth", &records, "")
            .await
            .expect("heuristic classification is infallible");
        verdicts.sort_by_key(|v| v.actor.to_string());
        assert_eq!(verdicts.len(), 2);
        assert!(
            verdicts
                .iter()
                .any(|v| v.actor == ActorIdentity::Account("mallory".into()))
        );
        assert!(verdicts.iter().all(|v| v.level == MitigationLevel::TempBlock));
    }
}
