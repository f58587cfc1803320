use thiserror::Error;
use uuid::Uuid;

/// Failure while talking to the external classification capability. Always
/// transient from the pipeline's point of view: the affected category yields
/// zero verdicts this batch and is retried naturally on the next one.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier returned status {0}")]
    Status(u16),
    #[error("classifier response malformed: {0}")]
    Malformed(String),
}

/// Case-memory failure. `NotFound` is a normal outcome for feedback on an
/// unknown id; everything else is a storage-side fault.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("case {0} not found")]
    NotFound(Uuid),
    #[error("case store error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A unit of batch work that had to be skipped. Never fatal to the
/// scheduler: the worst case under total pipeline failure is that
/// mitigations stop updating while existing ones keep enforcing until
/// their TTLs lapse.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Outcome surface of the feedback channel. Unknown ids are reported, not
/// thrown.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("case {0} not found")]
    NotFound(Uuid),
    #[error("feedback could not be stored: {0}")]
    Storage(MemoryError),
}
