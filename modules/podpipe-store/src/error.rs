use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unknown episode status: {0}")]
    UnknownStatus(String),

    #[error("cannot save a transcript into non-terminal status {0}")]
    NonTerminalStatus(String),

    #[error("invalid summary: {0}")]
    InvalidSummary(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
