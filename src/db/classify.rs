//! Retry eligibility for driver errors.
//!
//! The decision is an exact lookup of the error's SQLSTATE or platform code in
//! a static table. Error messages are never inspected.

use crate::error::DbError;

/// Codes whose failures are expected to clear without application changes.
pub const RETRYABLE_CODES: &[(&str, &str)] = &[
    ("08000", "connection_exception"),
    ("08003", "connection_does_not_exist"),
    ("08006", "connection_failure"),
    ("40001", "serialization_failure"),
    ("40P01", "deadlock_detected"),
    ("53300", "too_many_connections"),
    ("57P03", "cannot_connect_now"),
    ("ECONNREFUSED", "connection_refused"),
    ("ETIMEDOUT", "connection_timed_out"),
];

/// Returns true if `code` is on the retryable allow-list.
pub fn is_retryable_code(code: &str) -> bool {
    RETRYABLE_CODES.iter().any(|(known, _)| *known == code)
}

/// Human-readable name for a retryable code, used in log fields.
pub fn code_name(code: &str) -> Option<&'static str> {
    RETRYABLE_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
}

/// Returns true if the error should be retried. Errors without a code never are.
pub fn is_retryable(err: &DbError) -> bool {
    err.code().is_some_and(is_retryable_code)
}
