//! Retryable-vs-fatal classification of error messages.
//!
//! Matching is a lower-cased substring search. Non-retryable patterns take
//! precedence, and the two lists are kept disjoint (see the property tests).

/// Phrases that indicate a transient failure worth retrying.
pub const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "connection reset",
    "econnreset",
    "connection refused",
    "connection closed",
    "socket hang up",
    "broken pipe",
    "temporarily unavailable",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "model overloaded",
    "overloaded",
];

/// Phrases that indicate a deterministic failure; retrying cannot help.
pub const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "api key not valid",
    "unauthorized",
    "authentication failed",
    "invalid credentials",
    "forbidden",
    "permission denied",
    "invalid_grant",
    "not found",
    "quota exceeded",
    "insufficient_quota",
    "malformed",
    "invalid request",
    "bad request",
];

/// Outcome of classifying an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Matches a retryable pattern and no fatal pattern.
    Retryable,
    /// Matches a non-retryable pattern.
    Fatal,
    /// Matches neither list.
    Unknown,
}

impl ErrorClass {
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classifies a human-readable error message.
pub fn classify_error(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();
    if matches_any(&msg, NON_RETRYABLE_PATTERNS) {
        ErrorClass::Fatal
    } else if matches_any(&msg, RETRYABLE_PATTERNS) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Unknown
    }
}

/// Returns `true` when the message looks transient. Unknown messages are not retried.
pub fn is_retryable_error(message: &str) -> bool {
    classify_error(message).is_retryable()
}

/// Retryable/fatal patterns that would both match the same phrase.
///
/// Returns pairs `(retryable, non_retryable)` where one contains the other.
pub fn pattern_overlaps() -> Vec<(&'static str, &'static str)> {
    let mut overlaps = Vec::new();
    for r in RETRYABLE_PATTERNS {
        for n in NON_RETRYABLE_PATTERNS {
            if r.contains(n) || n.contains(r) {
                overlaps.push((*r, *n));
            }
        }
    }
    overlaps
}
