//! Failure and result classification for completion calls
//!
//! Completion services report quota and throttling problems in many shapes
//! (HTTP 429, gRPC RESOURCE_EXHAUSTED, vendor-specific prose), so detection
//! works on the rendered error message rather than on a status code.

use crate::ErrorClassification;

/// Case-insensitive substrings that mark an error as a rate-limit failure.
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate",
    "quota",
    "resource exhausted",
    "too many requests",
    "exceeded",
];

/// Classify an error message as rate-limited or fatal.
///
/// Any marker match returns `RateLimited`. Everything else is `Fatal`:
/// unrecognised failures are not retried.
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClassification::RateLimited
    } else {
        ErrorClassification::Fatal
    }
}

/// Default acceptability check: non-empty once whitespace is trimmed.
pub fn is_acceptable_text(text: &str) -> bool {
    !text.trim().is_empty()
}
