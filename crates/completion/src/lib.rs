//! Completion capability seam
//!
//! Everything the dispatch layer needs to know about an external completion
//! service, and nothing more: how to classify a failure from its message, what
//! counts as an acceptable answer, and how to ask for a different credential.
//! The dispatch crate depends on this crate only; the credential pool
//! implements `CredentialRotator` so it can be injected without a direct
//! dependency between the two.

pub mod chat;
pub mod classify;

pub use chat::ChatClient;
pub use classify::{RATE_LIMIT_MARKERS, classify_message, is_acceptable_text};

use std::future::Future;
use std::pin::Pin;

/// Classification of a failed completion call, driving the retry strategy.
///
/// - RateLimited: rotate once, then exponential backoff
/// - Fatal: never retried, propagated to the caller of that one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Quota or rate limit hit; another credential or a later attempt may succeed
    RateLimited,
    /// Configuration errors, malformed requests and anything unrecognised
    Fatal,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::Fatal => "fatal",
        }
    }
}

/// Why the invoker is asking for a different credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// The call failed with a rate-limit or quota error
    RateLimited,
    /// The call succeeded but returned an unacceptable (empty) result
    EmptyResult,
}

impl RotationReason {
    pub fn label(&self) -> &'static str {
        match self {
            RotationReason::RateLimited => "rate_limited",
            RotationReason::EmptyResult => "empty_result",
        }
    }
}

/// Capability to switch the active credential.
///
/// Injected into the retrying invoker. Uses a boxed future return type so it
/// can be held as `Arc<dyn CredentialRotator>`.
pub trait CredentialRotator: Send + Sync {
    fn rotate(&self, reason: RotationReason) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Errors from completion calls.
///
/// Display output is what the classifier inspects, so `Status` keeps the
/// numeric code and the upstream body in its message.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response decode failed: {0}")]
    Decode(String),
}

impl CompletionError {
    /// Classify this error from its rendered message.
    pub fn classification(&self) -> ErrorClassification {
        classify_message(&self.to_string())
    }
}

/// Result alias for completion calls.
pub type Result<T> = std::result::Result<T, CompletionError>;
