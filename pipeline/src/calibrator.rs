use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use warden_core::actor::ActorIdentity;
use warden_core::mitigation::{ActiveMitigation, MitigationLevel};
use warden_core::verdict::{CalibratedCase, CalibrationDecision, FeedbackLabel, Verdict};

use crate::config::GuardConfig;
use crate::error::PipelineError;
use crate::memory::{CaseMemory, ScoredCase};
use crate::metrics::{GuardMetrics, bump};
use crate::store::MitigationStore;

/// Turns raw verdicts into committed mitigations, adjusted against the
/// memory of how similar past decisions worked out.
///
/// Per verdict: retrieve the top-K similar cases, apply the deterministic
/// calibration policy, persist the calibrated case, then commit the
/// mitigation with a level-appropriate TTL. The case is written before the
/// store so a committed mitigation always has its matching case; if the
/// write fails the commit is skipped and the signal re-surfaces next batch.
#[derive(Clone)]
pub struct Calibrator {
    store: MitigationStore,
    memory: CaseMemory,
    metrics: Arc<GuardMetrics>,
    locks: ActorLocks,
    top_k: usize,
    delay_ttl: ChronoDuration,
    captcha_ttl: ChronoDuration,
    temp_block_ttl: ChronoDuration,
}

/// One async mutex per actor. Concurrent batch runs may both carry a
/// verdict for the same actor; the registry serializes those two
/// calibrations while unrelated actors proceed in parallel.
#[derive(Clone, Default)]
struct ActorLocks {
    inner: Arc<Mutex<HashMap<ActorIdentity, Arc<Mutex<()>>>>>,
}

impl ActorLocks {
    async fn acquire(&self, actor: &ActorIdentity) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut registry = self.inner.lock().await;
            registry
                .entry(actor.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Calibrator {
    pub fn new(
        store: MitigationStore,
        memory: CaseMemory,
        metrics: Arc<GuardMetrics>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            memory,
            metrics,
            locks: ActorLocks::default(),
            top_k: config.top_k,
            delay_ttl: config.delay_ttl,
            captcha_ttl: config.captcha_ttl,
            temp_block_ttl: config.temp_block_ttl,
        }
    }

    /// Calibrate one batch worth of verdicts: at most one decision per
    /// actor (the strictest suggestion wins), distinct actors in parallel.
    pub async fn calibrate_batch(&self, verdicts: Vec<Verdict>) {
        let mut tasks = JoinSet::new();
        for verdict in dedupe_by_actor(verdicts) {
            let calibrator = self.clone();
            tasks.spawn(async move {
                let actor = verdict.actor.clone();
                if let Err(err) = calibrator.calibrate_one(verdict).await {
                    tracing::warn!(actor = %actor, error = %err, "calibration skipped for this batch");
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "calibration task panicked");
            }
        }
    }

    pub async fn calibrate_one(&self, verdict: Verdict) -> Result<CalibratedCase, PipelineError> {
        let _guard = self.locks.acquire(&verdict.actor).await;
        let now = Utc::now();

        let current_level = self
            .store
            .get(&verdict.actor)
            .await
            .map(|m| m.level)
            .unwrap_or(MitigationLevel::None);

        let fingerprint = fingerprint(&verdict);
        // A retrieval failure is transient: calibrate as a first-time
        // scenario rather than dropping the verdict.
        let similar = match self
            .memory
            .similar(&fingerprint, Some(verdict.category.as_str()), Some(&verdict.actor), self.top_k)
            .await
        {
            Ok(similar) => similar,
            Err(err) => {
                tracing::warn!(actor = %verdict.actor, error = %err, "similarity retrieval failed, calibrating without history");
                Vec::new()
            }
        };

        let outcome = decide(verdict.level, current_level, &similar);
        tracing::info!(
            actor = %verdict.actor,
            category = %verdict.category,
            suggested = verdict.level.as_str(),
            current = current_level.as_str(),
            committed = outcome.level.as_str(),
            decision = outcome.decision.as_str(),
            precedents = similar.len(),
            "calibrated verdict"
        );

        let case = CalibratedCase {
            id: Uuid::now_v7(),
            created_at: now,
            actor: verdict.actor.clone(),
            category: verdict.category.clone(),
            fingerprint,
            rationale: format!("{}; calibration: {}", verdict.rationale, outcome.note),
            suggested_level: verdict.level,
            final_level: outcome.level,
            decision: outcome.decision,
            feedback: None,
            feedback_at: None,
        };
        self.memory.insert(&case).await?;
        bump(&self.metrics.cases_written);

        if outcome.level == MitigationLevel::None {
            // A decision calibrated all the way down lifts the episode.
            self.store.remove(&verdict.actor).await;
        } else {
            self.store
                .set(ActiveMitigation {
                    actor: verdict.actor,
                    level: outcome.level,
                    expires_at: self.expiry_for(outcome.level, now),
                    applied_at: now,
                    case_id: case.id,
                })
                .await;
        }
        Ok(case)
    }

    fn expiry_for(&self, level: MitigationLevel, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match level {
            MitigationLevel::None => None,
            MitigationLevel::Delay => Some(now + self.delay_ttl),
            MitigationLevel::Captcha => Some(now + self.captcha_ttl),
            MitigationLevel::TempBlock => Some(now + self.temp_block_ttl),
            MitigationLevel::Ban => None,
        }
    }
}

/// At most one in-flight decision per actor per batch: keep the strictest
/// suggestion for each actor, first seen wins ties.
fn dedupe_by_actor(verdicts: Vec<Verdict>) -> Vec<Verdict> {
    let mut kept: Vec<Verdict> = Vec::new();
    for verdict in verdicts {
        if verdict.level == MitigationLevel::None {
            continue;
        }
        match kept.iter_mut().find(|v| v.actor == verdict.actor) {
            Some(existing) => {
                if verdict.level > existing.level {
                    *existing = verdict;
                }
            }
            None => kept.push(verdict),
        }
    }
    kept
}

fn fingerprint(verdict: &Verdict) -> String {
    format!("{} {} {}", verdict.category, verdict.rationale, verdict.evidence)
}

struct Outcome {
    level: MitigationLevel,
    decision: CalibrationDecision,
    note: String,
}

/// The deterministic calibration policy.
///
/// 1. Downgrade one level when, among retrieved cases carrying feedback,
///    `incorrect` labels hold the majority and their modal final level
///    equals the suggestion — history says this punishment was wrong here.
/// 2. Escalate one level (capped at ban) when the actor still holds an
///    unexpired mitigation at or below the suggested severity: the prior
///    punishment did not stop the behavior.
/// 3. Otherwise adopt the suggestion, clamped so the committed level never
///    drops below the current one mid-episode — only the feedback rule,
///    expiry, or an operator override de-escalates.
fn decide(
    suggested: MitigationLevel,
    current: MitigationLevel,
    similar: &[ScoredCase],
) -> Outcome {
    let labeled: Vec<&ScoredCase> = similar
        .iter()
        .filter(|s| s.case.feedback.is_some())
        .collect();
    let incorrect: Vec<&ScoredCase> = labeled
        .iter()
        .filter(|s| s.case.feedback == Some(FeedbackLabel::Incorrect))
        .copied()
        .collect();

    let downgrade_authorized = !labeled.is_empty()
        && incorrect.len() * 2 > labeled.len()
        && modal_final_level(&incorrect) == Some(suggested);

    if downgrade_authorized {
        let level = suggested.de_escalate();
        return Outcome {
            level,
            decision: CalibrationDecision::Downgraded,
            note: format!(
                "{} of {} retrieved precedents marked incorrect at {}, stepping down to {}",
                incorrect.len(),
                labeled.len(),
                suggested.as_str(),
                level.as_str(),
            ),
        };
    }

    if current > MitigationLevel::None && suggested >= current {
        let level = current.escalate();
        return Outcome {
            level,
            decision: if level > current {
                CalibrationDecision::Amplified
            } else {
                CalibrationDecision::Kept
            },
            note: format!(
                "actor reappeared while mitigated at {}, escalating to {}",
                current.as_str(),
                level.as_str(),
            ),
        };
    }

    if suggested < current {
        return Outcome {
            level: current,
            decision: CalibrationDecision::Kept,
            note: format!(
                "suggestion {} below the active {}, holding the episode level",
                suggested.as_str(),
                current.as_str(),
            ),
        };
    }

    Outcome {
        level: suggested,
        decision: CalibrationDecision::Kept,
        note: if similar.is_empty() {
            "no similar precedent, adopting the suggested level".to_string()
        } else {
            format!("{} precedents retrieved, none override the suggestion", similar.len())
        },
    }
}

fn modal_final_level(cases: &[&ScoredCase]) -> Option<MitigationLevel> {
    let mut counts: HashMap<MitigationLevel, usize> = HashMap::new();
    for scored in cases {
        *counts.entry(scored.case.final_level).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(level, count)| (*count, *level))
        .map(|(level, _)| level)
}

#[cfg(test)]
mod tests {
    use super::{Calibrator, decide, dedupe_by_actor};
    use crate::config::GuardConfig;
    use crate::memory::{CaseMemory, ScoredCase};
    use crate::metrics::GuardMetrics;
    use crate::store::MitigationStore;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use uuid::Uuid;
    use warden_core::actor::ActorIdentity;
    use warden_core::mitigation::MitigationLevel;
    use warden_core::verdict::{
        CalibratedCase, CalibrationDecision, FeedbackLabel, Verdict,
    };

    fn ip_actor() -> ActorIdentity {
        ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, 5]))
    }

    fn verdict(level: MitigationLevel) -> Verdict {
        Verdict {
            actor: ip_actor(),
            level,
            rationale: "burst of failed logins".into(),
            category: "auth".into(),
            evidence: "50 requests in 3 seconds".into(),
        }
    }

    fn precedent(final_level: MitigationLevel, feedback: Option<FeedbackLabel>) -> ScoredCase {
        ScoredCase {
            case: CalibratedCase {
                id: Uuid::now_v7(),
                created_at: Utc::now() - Duration::days(1),
                actor: ip_actor(),
                category: "auth".into(),
                fingerprint: "auth burst of failed logins".into(),
                rationale: "burst of failed logins".into(),
                suggested_level: final_level,
                final_level,
                decision: CalibrationDecision::Kept,
                feedback,
                feedback_at: feedback.map(|_| Utc::now()),
            },
            score: 0.9,
        }
    }

    fn calibrator() -> Calibrator {
        Calibrator::new(
            MitigationStore::new(),
            CaseMemory::in_memory(),
            Arc::new(GuardMetrics::default()),
            &GuardConfig::default(),
        )
    }

    #[test]
    fn no_history_adopts_the_suggestion() {
        let outcome = decide(MitigationLevel::TempBlock, MitigationLevel::None, &[]);
        assert_eq!(outcome.level, MitigationLevel::TempBlock);
        assert_eq!(outcome.decision, CalibrationDecision::Kept);
    }

    #[test]
    fn majority_incorrect_precedent_at_the_suggested_level_downgrades() {
        let similar = vec![
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Incorrect)),
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Incorrect)),
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Incorrect)),
            precedent(MitigationLevel::TempBlock, None),
        ];
        let outcome = decide(MitigationLevel::TempBlock, MitigationLevel::None, &similar);
        assert_eq!(outcome.level, MitigationLevel::Captcha);
        assert_eq!(outcome.decision, CalibrationDecision::Downgraded);
    }

    #[test]
    fn minority_incorrect_feedback_does_not_downgrade() {
        let similar = vec![
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Incorrect)),
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Correct)),
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Correct)),
        ];
        let outcome = decide(MitigationLevel::TempBlock, MitigationLevel::None, &similar);
        assert_eq!(outcome.level, MitigationLevel::TempBlock);
        assert_eq!(outcome.decision, CalibrationDecision::Kept);
    }

    #[test]
    fn incorrect_feedback_at_a_different_level_does_not_authorize_a_downgrade() {
        let similar = vec![
            precedent(MitigationLevel::Delay, Some(FeedbackLabel::Incorrect)),
            precedent(MitigationLevel::Delay, Some(FeedbackLabel::Incorrect)),
        ];
        let outcome = decide(MitigationLevel::TempBlock, MitigationLevel::None, &similar);
        assert_eq!(outcome.level, MitigationLevel::TempBlock);
    }

    #[test]
    fn reappearing_while_mitigated_escalates_one_level() {
        let outcome = decide(MitigationLevel::TempBlock, MitigationLevel::TempBlock, &[]);
        assert_eq!(outcome.level, MitigationLevel::Ban);
        assert_eq!(outcome.decision, CalibrationDecision::Amplified);
    }

    #[test]
    fn escalation_is_capped_at_ban() {
        let outcome = decide(MitigationLevel::Ban, MitigationLevel::Ban, &[]);
        assert_eq!(outcome.level, MitigationLevel::Ban);
        assert_eq!(outcome.decision, CalibrationDecision::Kept);
    }

    #[test]
    fn milder_suggestion_never_lowers_an_active_episode() {
        let outcome = decide(MitigationLevel::Delay, MitigationLevel::TempBlock, &[]);
        assert_eq!(outcome.level, MitigationLevel::TempBlock);
        assert_eq!(outcome.decision, CalibrationDecision::Kept);
    }

    #[test]
    fn feedback_downgrade_may_cross_below_the_active_level() {
        let similar = vec![
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Incorrect)),
            precedent(MitigationLevel::TempBlock, Some(FeedbackLabel::Incorrect)),
        ];
        let outcome = decide(MitigationLevel::TempBlock, MitigationLevel::TempBlock, &similar);
        assert_eq!(outcome.level, MitigationLevel::Captcha);
        assert_eq!(outcome.decision, CalibrationDecision::Downgraded);
    }

    #[test]
    fn dedupe_keeps_the_strictest_verdict_per_actor() {
        let verdicts = vec![
            verdict(MitigationLevel::Delay),
            verdict(MitigationLevel::TempBlock),
            verdict(MitigationLevel::Captcha),
        ];
        let deduped = dedupe_by_actor(verdicts);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].level, MitigationLevel::TempBlock);
    }

    #[tokio::test]
    async fn first_time_offender_commits_the_suggested_block_with_a_ttl() {
        let calibrator = calibrator();
        let case = calibrator
            .calibrate_one(verdict(MitigationLevel::TempBlock))
            .await
            .expect("calibration should succeed");
        assert_eq!(case.final_level, MitigationLevel::TempBlock);

        let active = calibrator
            .store
            .get(&ip_actor())
            .await
            .expect("mitigation should be committed");
        assert_eq!(active.level, MitigationLevel::TempBlock);
        assert_eq!(active.case_id, case.id);
        let expiry = active.expires_at.expect("temp_block carries an expiry");
        let ttl = expiry - active.applied_at;
        assert_eq!(ttl.num_hours(), 1);
    }

    #[tokio::test]
    async fn committed_mitigations_always_have_a_matching_case() {
        let calibrator = calibrator();
        calibrator
            .calibrate_batch(vec![verdict(MitigationLevel::Captcha)])
            .await;
        let active = calibrator
            .store
            .get(&ip_actor())
            .await
            .expect("mitigation should be committed");
        let history = calibrator
            .memory
            .recent(&crate::memory::CaseFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .expect("history should be readable");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, active.case_id);
        assert_eq!(history[0].final_level, active.level);
    }

    #[tokio::test]
    async fn persistent_offender_walks_up_the_ladder_monotonically() {
        let calibrator = calibrator();
        let mut levels = Vec::new();
        for _ in 0..4 {
            let case = calibrator
                .calibrate_one(verdict(MitigationLevel::TempBlock))
                .await
                .expect("calibration should succeed");
            levels.push(case.final_level);
        }
        assert_eq!(levels[0], MitigationLevel::TempBlock);
        assert!(levels.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*levels.last().expect("four rounds ran"), MitigationLevel::Ban);
        // The ban is permanent.
        let active = calibrator
            .store
            .get(&ip_actor())
            .await
            .expect("ban should be committed");
        assert!(active.expires_at.is_none());
    }

    #[tokio::test]
    async fn historical_incorrect_blocks_downgrade_the_recurrence() {
        let calibrator = calibrator();
        // Three prior temp_block decisions for this pattern, all judged
        // incorrect by a human, from episodes that have since expired.
        for n in 0..3 {
            let mut prior = precedent(MitigationLevel::TempBlock, None).case;
            prior.fingerprint = format!("auth burst of failed logins {} requests in 3 seconds", 40 + n);
            calibrator
                .memory
                .insert(&prior)
                .await
                .expect("insert should succeed");
            calibrator
                .memory
                .attach_feedback(prior.id, FeedbackLabel::Incorrect)
                .await
                .expect("feedback should attach");
        }

        let case = calibrator
            .calibrate_one(verdict(MitigationLevel::TempBlock))
            .await
            .expect("calibration should succeed");
        assert_eq!(case.final_level, MitigationLevel::Captcha);
        assert_eq!(case.decision, CalibrationDecision::Downgraded);
    }

    #[tokio::test]
    async fn same_actor_calibrations_serialize_to_one_final_entry() {
        let calibrator = calibrator();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let calibrator = calibrator.clone();
            handles.push(tokio::spawn(async move {
                calibrator
                    .calibrate_one(verdict(MitigationLevel::TempBlock))
                    .await
            }));
        }
        for handle in handles {
            handle
                .await
                .expect("task should not panic")
                .expect("calibration should succeed");
        }
        // Every run serialized on the actor lock: exactly one active entry,
        // escalated monotonically, never past ban.
        let snapshot = calibrator.store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].level, MitigationLevel::Ban);
    }
}
