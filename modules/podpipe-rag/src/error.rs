use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
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

    #[error(transparent)]
    Keyword(#[from] crate::keyword::KeywordIndexError),

    #[error("episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("episode has no transcript text: {0}")]
    MissingTranscript(String),

    #[error("blocking task panicked")]
    BlockingTaskPanicked,
}

pub type RagResult<T> = std::result::Result<T, RagError>;
