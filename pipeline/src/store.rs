use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use warden_core::actor::ActorIdentity;
use warden_core::mitigation::{ActiveMitigation, MitigationLevel};

/// Live mitigation table sitting on the request hot path.
///
/// Reads take the shared lock only and are sub-millisecond under
/// contention. An entry whose expiry has passed is treated as absent at
/// read time; the background sweep evicts stale entries lazily. Writes
/// replace the whole entry, so a calibrator write racing a gate read
/// resolves last-write-wins with no torn state.
#[derive(Clone, Default)]
pub struct MitigationStore {
    entries: Arc<RwLock<HashMap<ActorIdentity, ActiveMitigation>>>,
}

impl MitigationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired mitigation for the actor, if any.
    pub async fn get(&self, actor: &ActorIdentity) -> Option<ActiveMitigation> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        entries
            .get(actor)
            .filter(|m| !m.is_expired_at(now))
            .cloned()
    }

    /// The strictest unexpired mitigation across several identities of the
    /// same caller (a request carries an IP and possibly an account; the
    /// higher punishment wins).
    pub async fn strictest(&self, actors: &[ActorIdentity]) -> Option<ActiveMitigation> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        actors
            .iter()
            .filter_map(|actor| entries.get(actor))
            .filter(|m| !m.is_expired_at(now))
            .max_by_key(|m| m.level)
            .cloned()
    }

    /// Commit a mitigation. Last write wins; at most one entry per actor.
    pub async fn set(&self, mitigation: ActiveMitigation) {
        let mut entries = self.entries.write().await;
        entries.insert(mitigation.actor.clone(), mitigation);
    }

    /// Operator override or episode reset. Returns the lifted entry.
    pub async fn remove(&self, actor: &ActorIdentity) -> Option<ActiveMitigation> {
        let mut entries = self.entries.write().await;
        entries.remove(actor)
    }

    /// All unexpired mitigations, newest first.
    pub async fn snapshot(&self) -> Vec<ActiveMitigation> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut active: Vec<ActiveMitigation> = entries
            .values()
            .filter(|m| !m.is_expired_at(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        active
    }

    /// Count of unexpired mitigations per level, in ladder order.
    pub async fn level_totals(&self) -> Vec<(MitigationLevel, usize)> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        MitigationLevel::ALL
            .into_iter()
            .filter(|level| *level != MitigationLevel::None)
            .map(|level| {
                let count = entries
                    .values()
                    .filter(|m| m.level == level && !m.is_expired_at(now))
                    .count();
                (level, count)
            })
            .collect()
    }

    /// Evict expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, m| !m.is_expired_at(now));
        before - entries.len()
    }

    /// Periodic eviction so expired entries do not accumulate. Expiry
    /// correctness never depends on this — reads already skip stale
    /// entries.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = store.sweep().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired mitigations");
                }
            }
        })
    }
}
