//! Batch runner error types

use thiserror::Error;

/// Errors reading a batch input file.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("input line {line}: {reason}")]
    InvalidItem { line: usize, reason: String },

    #[error("input line {line}: duplicate item id {id}")]
    DuplicateId { line: usize, id: String },
}

/// Failure of a single completion attempt: no usable credential, or the
/// completion call itself failed. Display is passed through unchanged so the
/// invoker classifies the underlying message.
#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Pool(#[from] key_pool::Error),

    #[error(transparent)]
    Completion(#[from] completion::CompletionError),
}

/// Result alias for batch input handling
pub type Result<T> = std::result::Result<T, BatchError>;
