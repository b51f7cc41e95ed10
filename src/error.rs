//! Domain-specific error types for prompt-vault.

use thiserror::Error;

/// Failures from a `Store` realization (embedded or hosted).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Failures from a `VectorIndex` realization.
#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    #[error("vector upsert failed: {0}")]
    Upsert(String),

    #[error("vector search failed: {0}")]
    Search(String),
}

/// Failures from an `Embedder`/`EmbeddingProvider`.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("remote embedding provider failed: {0}")]
    Remote(String),

    #[error("local embedding provider failed: {0}")]
    Local(String),

    #[error("both embedding providers exhausted: {0}")]
    Exhausted(String),
}

/// Failures from the `TemplateRenderer`.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("missing required template variable: {0}")]
    MissingRequired(String),

    #[error("unsafe template content blocked")]
    UnsafeContent,

    #[error("template rendering failed: {0}")]
    Template(String),
}

/// Top-level error type returned by the `PromptManager` subsystem.
#[derive(Error, Debug)]
pub enum PromptError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("optimistic lock conflict: expected version_number {expected}, found {found}")]
    OptimisticLock { expected: i64, found: i64 },

    #[error("update queue is full")]
    QueueFull,

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("vector index error: {0}")]
    VectorIndex(#[from] VectorIndexError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::Internal(format!("serialization error: {err}"))
    }
}

impl From<surrealdb::Error> for PromptError {
    fn from(err: surrealdb::Error) -> Self {
        PromptError::Store(StoreError::Transient(err.to_string()))
    }
}

impl From<tokio_postgres::Error> for PromptError {
    fn from(err: tokio_postgres::Error) -> Self {
        PromptError::Store(StoreError::Transient(err.to_string()))
    }
}

impl From<deadpool_postgres::PoolError> for PromptError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        PromptError::Store(StoreError::Transient(err.to_string()))
    }
}

impl From<reqwest::Error> for PromptError {
    fn from(err: reqwest::Error) -> Self {
        PromptError::Embedding(EmbeddingError::Remote(err.to_string()))
    }
}

impl From<redis::RedisError> for PromptError {
    fn from(err: redis::RedisError) -> Self {
        // Cache is always best-effort/degraded-mode; callers that need a hard
        // failure should inspect the cache layer directly rather than via
        // PromptError.
        PromptError::Internal(format!("cache error: {err}"))
    }
}

impl From<tera::Error> for PromptError {
    fn from(err: tera::Error) -> Self {
        PromptError::Render(RenderError::Template(err.to_string()))
    }
}

/// Error taxonomy → suggested protocol code, per the external-interface
/// mapping. The core never emits these codes itself; an external transport
/// layer consumes this to shape its own responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCode {
    BadRequest,
    NotFound,
    Conflict,
    UnprocessableEntity,
    TooManyRequests,
    Internal,
}

impl PromptError {
    pub fn protocol_code(&self) -> ProtocolCode {
        match self {
            PromptError::NotFound(_) => ProtocolCode::NotFound,
            PromptError::Validation(_) => ProtocolCode::BadRequest,
            PromptError::OptimisticLock { .. } => ProtocolCode::Conflict,
            PromptError::QueueFull => ProtocolCode::TooManyRequests,
            PromptError::Render(_) => ProtocolCode::UnprocessableEntity,
            PromptError::Store(StoreError::NotFound(_)) => ProtocolCode::NotFound,
            PromptError::Store(StoreError::Conflict(_)) => ProtocolCode::Conflict,
            PromptError::Store(_) => ProtocolCode::Internal,
            PromptError::VectorIndex(_) => ProtocolCode::Internal,
            PromptError::Embedding(_) => ProtocolCode::Internal,
            PromptError::Cancelled => ProtocolCode::Internal,
            PromptError::Internal(_) => ProtocolCode::Internal,
        }
    }
}

/// Result type alias for prompt-vault operations.
pub type Result<T> = std::result::Result<T, PromptError>;
