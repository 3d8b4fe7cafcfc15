use thiserror::Error;

/// Error types for SDK operations
///
/// Flag evaluation never returns these to the application; evaluation
/// failures are carried inside [`crate::eval::Reason::Error`] and the caller
/// receives its default value. This type covers component lifecycle and
/// transport failures.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP transport error (connection, TLS, request build)
    #[error("HTTP transport error: {0}")]
    Transport(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data store error
    #[error("Data store error: {0}")]
    Store(String),

    /// Big segment store error
    #[error("Big segment store error: {0}")]
    BigSegments(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The client has been shut down
    #[error("Client is closed")]
    Closed,
}

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, Error>;
