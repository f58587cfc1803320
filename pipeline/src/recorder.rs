use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use warden_core::record::RequestRecord;

/// Bounded, non-blocking sink between the request hot path and the batch
/// pipeline.
///
/// `record` never waits on pipeline work: the critical section is a short
/// in-memory push, and overflow drops the oldest record and bumps a counter
/// instead of exerting backpressure on the caller. Reaching the size
/// threshold nudges the scheduler so a hot burst is drained before the
/// next timer tick.
#[derive(Clone)]
pub struct TrafficRecorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    queue: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
    threshold: usize,
    pressure: Notify,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl TrafficRecorder {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity: capacity.max(1),
                threshold: threshold.max(1),
                pressure: Notify::new(),
                recorded: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Append a completed-request snapshot. On overflow the oldest queued
    /// record is dropped and counted; the caller is never blocked or failed.
    pub fn record(&self, record: RequestRecord) {
        let len = {
            let mut queue = match self.inner.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
            queue.len()
        };
        self.inner.recorded.fetch_add(1, Ordering::Relaxed);
        if len >= self.inner.threshold {
            self.inner.pressure.notify_one();
        }
    }

    /// Empty the queue atomically into a batch.
    pub fn drain(&self) -> Vec<RequestRecord> {
        let mut queue = match self.inner.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        match self.inner.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total records accepted since startup.
    pub fn recorded(&self) -> u64 {
        self.inner.recorded.load(Ordering::Relaxed)
    }

    /// Total records lost to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Completes when the queue has reached the size threshold since the
    /// last wait. Used by the scheduler as its second trigger.
    pub async fn pressure(&self) {
        self.inner.pressure.notified().await;
    }
}
