//! Error types for jobtrack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("status record not found: {0}")]
    NotFound(String),

    /// A progress report supplied a non-positive total. Caller-side misuse;
    /// the record is left exactly as it was.
    #[error("invalid progress total: {0}")]
    InvalidProgress(i64),

    /// The cooperative cancellation signal. Surfaced from progress poll
    /// points, intercepted by the engine, never reaches the dispatcher.
    #[error("job was killed")]
    Killed,

    /// A failure raised by the job body.
    #[error("job execution failed: {0}")]
    Execution(String),

    /// A success hook failed during fan-in finalization. Always re-raised;
    /// no hook can absorb this case.
    #[error("fan-in finalization failed: {0}")]
    Coordination(String),

    /// A child enqueue was attempted before `init_parent` fixed the total.
    #[error("fan-out not initialized for parent {0}")]
    FanNotInitialized(String),

    #[error("unknown job type: {0}")]
    UnknownJob(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
