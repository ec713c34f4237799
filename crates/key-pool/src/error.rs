//! Error types for credential pool operations

/// Errors from credential pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no credentials loaded")]
    NoCredentials,

    #[error("credential source configuration error: {0}")]
    Config(String),

    #[error("credential source error: {0}")]
    Source(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
