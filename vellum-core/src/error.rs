use thiserror::Error;

#[derive(Error, Debug)]
pub enum VellumError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("signature expired")]
    Expired,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("range not satisfiable for {size} byte blob")]
    RangeNotSatisfiable { size: u64 },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request body aborted: {0}")]
    BodyAborted(String),

    #[error("metadata index is locked by another process: {0}")]
    LockContention(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VellumError>;
