use thiserror::Error;

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error(transparent)]
    Ai(#[from] podpipe_ai::AiError),

    #[error(transparent)]
    GpuLock(#[from] podpipe_gpulock::GpuLockError),

    #[error(transparent)]
    Idempotency(#[from] podpipe_idempotency::IdempotencyError),

    #[error(transparent)]
    Store(#[from] podpipe_store::error::StoreError),

    #[error(transparent)]
    EventBus(#[from] podpipe_eventbus::EventBusError),

    #[error("failed to serialize summary payload: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("episode has no transcript text: {0}")]
    MissingTranscript(String),
}

pub type SummarizeResult<T> = std::result::Result<T, SummarizeError>;
