//! Error types for the tributary engine
//!
//! Two error families: [`EngineError`] for the pipeline runtime (queue
//! transport, source, checkpoint) and [`DestinationError`] for the write path.
//! Destination errors never cross the writer boundary as raw errors; the
//! writer folds them into a [`WriteResult`](crate::destination::WriteResult)
//! and the consumer loop only observes the resulting status transition.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the pipeline runtime
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue backend unreachable or connection dropped mid-consume.
    ///
    /// Fatal to the current loop iteration; the loop terminates and reports
    /// failure upward. Retry policy belongs to the external runner.
    #[error("Queue transport error: {0}")]
    Transport(String),

    /// Source connector failure
    #[error("Source error: {0}")]
    Source(String),

    /// Checkpoint backend failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Envelope (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (task join failures and the like)
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this error is retryable by an external runner
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Checkpoint(_))
    }
}

/// Errors raised on the destination write path
#[derive(Error, Debug)]
pub enum DestinationError {
    /// A record carries a field the wire schema does not declare.
    ///
    /// Raised at decode time rather than deferred to the wire-encode step so
    /// schema drift produces an early, field-level error.
    #[error("Unknown field in record: {0}")]
    Parse(String),

    /// A record is missing a value for a REQUIRED wire field
    #[error("Missing required field: {0}")]
    Encode(String),

    /// Wire schema resolution or compilation failure
    #[error("Schema error: {0}")]
    Schema(String),

    /// Destination client connection or bootstrap failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Streaming append failure (any non-success chunk fails the batch)
    #[error("Append error: {0}")]
    Append(String),

    /// Destination configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DestinationError {
    /// Create an unknown-field parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a missing-field encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an append error
    pub fn append(msg: impl Into<String>) -> Self {
        Self::Append(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
