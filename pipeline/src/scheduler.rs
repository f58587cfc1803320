use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use warden_core::record::RequestRecord;

use crate::calibrator::Calibrator;
use crate::classifier::Classify;
use crate::config::GuardConfig;
use crate::metrics::{GuardMetrics, add, bump};
use crate::recorder::TrafficRecorder;
use crate::ruleset::Ruleset;

/// Drives the pipeline on a dual trigger: a fixed tick, or the recorder
/// reaching its size threshold — whichever fires first.
///
/// Each drain becomes an independent spawned run; a run still in flight
/// when the next trigger fires just keeps going. Case writes are
/// append-only with unique ids, so overlapping runs cannot corrupt memory,
/// and the per-actor locks inside the calibrator keep concurrent runs from
/// racing on one actor.
pub struct BatchScheduler<C: Classify> {
    recorder: TrafficRecorder,
    classifier: Arc<C>,
    calibrator: Calibrator,
    ruleset: Arc<Ruleset>,
    metrics: Arc<GuardMetrics>,
    tick: Duration,
    classify_timeout: Duration,
}

impl<C: Classify> BatchScheduler<C> {
    pub fn new(
        recorder: TrafficRecorder,
        classifier: C,
        calibrator: Calibrator,
        ruleset: Ruleset,
        metrics: Arc<GuardMetrics>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            recorder,
            classifier: Arc::new(classifier),
            calibrator,
            ruleset: Arc::new(ruleset),
            metrics,
            tick: config.batch_tick,
            classify_timeout: config.classifier_timeout,
        }
    }

    /// Runs forever; spawn it. Nothing inside a batch run can kill the
    /// loop — under total pipeline failure the guard degrades to enforcing
    /// existing mitigations until their TTLs lapse.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // loop starts with a full period.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.recorder.pressure() => {
                    // Size-triggered drain restarts the timer.
                    ticker.reset();
                }
            }
            self.dispatch();
        }
    }

    /// Drain whatever is queued and hand it to an independent batch run.
    /// An empty drain is a no-op.
    fn dispatch(&self) {
        let batch = self.recorder.drain();
        if batch.is_empty() {
            bump(&self.metrics.batches_empty);
            return;
        }
        bump(&self.metrics.batches_dispatched);
        tracing::debug!(records = batch.len(), "dispatching batch");
        tokio::spawn(run_batch(
            self.classifier.clone(),
            self.calibrator.clone(),
            self.ruleset.clone(),
            self.metrics.clone(),
            self.classify_timeout,
            batch,
        ));
    }
}

/// One pipeline run: partition by category, classify categories
/// concurrently (serialized within each category), calibrate the surviving
/// verdicts. A classifier error or timeout yields zero verdicts for that
/// category this batch; the signal re-surfaces next batch if it persists.
async fn run_batch<C: Classify>(
    classifier: Arc<C>,
    calibrator: Calibrator,
    ruleset: Arc<Ruleset>,
    metrics: Arc<GuardMetrics>,
    classify_timeout: Duration,
    batch: Vec<RequestRecord>,
) {
    let mut by_category: HashMap<String, Vec<RequestRecord>> = HashMap::new();
    for record in batch {
        by_category
            .entry(record.category.clone())
            .or_default()
            .push(record);
    }

    let mut tasks = JoinSet::new();
    for (category, records) in by_category {
        let classifier = classifier.clone();
        let rules = ruleset.for_category(&category).to_string();
        let metrics = metrics.clone();
        tasks.spawn(async move {
            match tokio::time::timeout(
                classify_timeout,
                classifier.classify(&category, &records, &rules),
            )
            .await
            {
                Ok(Ok(verdicts)) => verdicts,
                Ok(Err(err)) => {
                    tracing::warn!(category, error = %err, "classification failed, skipping category this batch");
                    bump(&metrics.classifier_failures);
                    Vec::new()
                }
                Err(_) => {
                    tracing::warn!(category, "classification timed out, skipping category this batch");
                    bump(&metrics.classifier_failures);
                    Vec::new()
                }
            }
        });
    }

    let mut verdicts = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(category_verdicts) => verdicts.extend(category_verdicts),
            Err(err) => tracing::error!(error = %err, "classification task panicked"),
        }
    }

    if verdicts.is_empty() {
        return;
    }
    add(&metrics.verdicts_accepted, verdicts.len() as u64);
    calibrator.calibrate_batch(verdicts).await;
}

#[cfg(test)]
mod tests {
    use super::BatchScheduler;
    use crate::calibrator::Calibrator;
    use crate::classifier::Classify;
    use crate::config::GuardConfig;
    use crate::error::ClassifyError;
    use crate::memory::CaseMemory;
    use crate::metrics::GuardMetrics;
    use crate::recorder::TrafficRecorder;
    use crate::ruleset::Ruleset;
    use crate::store::MitigationStore;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;
    use warden_core::actor::ActorIdentity;
    use warden_core::mitigation::MitigationLevel;
    use warden_core::record::RequestRecord;
    use warden_core::verdict::Verdict;

    /// Captures every classify call so tests can assert trigger behavior.
    #[derive(Clone, Default)]
    struct ScriptedClassifier {
        calls: Arc<Mutex<Vec<(String, usize)>>>,
        verdict_for: Option<ActorIdentity>,
    }

    impl Classify for ScriptedClassifier {
        async fn classify(
            &self,
            category: &str,
            records: &[RequestRecord],
            _ruleset: &str,
        ) -> Result<Vec<Verdict>, ClassifyError> {
            self.calls
                .lock()
                .expect("calls lock should not be poisoned")
                .push((category.to_string(), records.len()));
            Ok(self
                .verdict_for
                .iter()
                .map(|actor| Verdict {
                    actor: actor.clone(),
                    level: MitigationLevel::TempBlock,
                    rationale: "scripted".into(),
                    category: category.to_string(),
                    evidence: String::new(),
                })
                .collect())
        }
    }

    fn record(category: &str, path: &str) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            method: "POST".into(),
            path: path.into(),
            category: category.into(),
            actor: ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, 5])),
            account: None,
            status: 401,
            latency_ms: 9,
            payload_excerpt: None,
        }
    }

    fn scheduler_parts(
        threshold: usize,
        classifier: ScriptedClassifier,
    ) -> (TrafficRecorder, MitigationStore, BatchScheduler<ScriptedClassifier>) {
        let config = GuardConfig {
            batch_threshold: threshold,
            batch_tick: Duration::from_secs(5),
            ..GuardConfig::default()
        };
        let recorder = TrafficRecorder::new(config.queue_capacity, config.batch_threshold);
        let store = MitigationStore::new();
        let metrics = Arc::new(GuardMetrics::default());
        let calibrator = Calibrator::new(
            store.clone(),
            CaseMemory::in_memory(),
            metrics.clone(),
            &config,
        );
        let scheduler = BatchScheduler::new(
            recorder.clone(),
            classifier,
            calibrator,
            Ruleset::default(),
            metrics,
            &config,
        );
        (recorder, store, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_drains_before_the_timer() {
        let classifier = ScriptedClassifier::default();
        let calls = classifier.calls.clone();
        let (recorder, _store, scheduler) = scheduler_parts(10, classifier);
        tokio::spawn(scheduler.run());
        tokio::task::yield_now().await;

        for i in 0..10 {
            recorder.record(record("auth", &format!("/login/{i}")));
        }
        // Well under the 5s tick: the threshold trigger must have fired.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = calls.lock().expect("calls lock should not be poisoned").clone();
        assert_eq!(seen, vec![("auth".to_string(), 10)]);
        assert!(recorder.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_trickle_drains_on_the_timer_tick() {
        let classifier = ScriptedClassifier::default();
        let calls = classifier.calls.clone();
        let (recorder, _store, scheduler) = scheduler_parts(100, classifier);
        tokio::spawn(scheduler.run());
        tokio::task::yield_now().await;

        recorder.record(record("general", "/widgets"));
        recorder.record(record("general", "/widgets"));
        assert!(calls.lock().expect("calls lock should not be poisoned").is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let seen = calls.lock().expect("calls lock should not be poisoned").clone();
        assert_eq!(seen, vec![("general".to_string(), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ticks_are_no_ops() {
        let classifier = ScriptedClassifier::default();
        let calls = classifier.calls.clone();
        let (_recorder, _store, scheduler) = scheduler_parts(100, classifier);
        tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(calls.lock().expect("calls lock should not be poisoned").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_login_flood_ends_in_an_enforced_block() {
        // Full pipeline pass with the real heuristic classifier: a burst of
        // failed logins from one address drains at the size threshold,
        // classifies as a block, calibrates with no precedent, and lands in
        // the mitigation store with the temp_block TTL.
        let config = GuardConfig {
            batch_threshold: 50,
            ..GuardConfig::default()
        };
        let recorder = TrafficRecorder::new(config.queue_capacity, config.batch_threshold);
        let store = MitigationStore::new();
        let metrics = Arc::new(GuardMetrics::default());
        let calibrator = Calibrator::new(
            store.clone(),
            CaseMemory::in_memory(),
            metrics.clone(),
            &config,
        );
        let scheduler = BatchScheduler::new(
            recorder.clone(),
            crate::heuristic::HeuristicClassifier,
            calibrator,
            Ruleset::default(),
            metrics,
            &config,
        );
        tokio::spawn(scheduler.run());
        tokio::task::yield_now().await;

        for _ in 0..50 {
            recorder.record(record("auth", "/login"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let actor = ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, 5]));
        let active = store
            .get(&actor)
            .await
            .expect("the flood should have been mitigated");
        assert_eq!(active.level, MitigationLevel::TempBlock);
        let expiry = active.expires_at.expect("temp_block carries an expiry");
        assert_eq!((expiry - active.applied_at).num_hours(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn categories_classify_independently_and_verdicts_commit() {
        let classifier = ScriptedClassifier {
            verdict_for: Some(ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, 5]))),
            ..ScriptedClassifier::default()
        };
        let calls = classifier.calls.clone();
        let (recorder, store, scheduler) = scheduler_parts(4, classifier);
        tokio::spawn(scheduler.run());
        tokio::task::yield_now().await;

        recorder.record(record("auth", "/login"));
        recorder.record(record("auth", "/login"));
        recorder.record(record("search", "/search"));
        recorder.record(record("search", "/search"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut seen = calls.lock().expect("calls lock should not be poisoned").clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![("auth".to_string(), 2), ("search".to_string(), 2)]
        );
        // The duplicate per-category verdicts collapsed to one committed
        // mitigation for the actor.
        let active = store
            .get(&ActorIdentity::Ip(std::net::IpAddr::from([10, 0, 0, 5])))
            .await
            .expect("verdict should have been committed");
        assert_eq!(active.level, MitigationLevel::TempBlock);
    }
}
