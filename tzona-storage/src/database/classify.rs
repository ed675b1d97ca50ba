//! Persistence error classification.
//!
//! Codes follow Postgres SQLSTATE conventions. Connectivity errors trip the
//! availability breaker. Transient errors (a superset) are worth retrying.
//! Constraint violations are caller errors and never do either.

use serde::Serialize;

use crate::persistence::PersistenceError;

/// Individual SQLSTATEs that mean the server or pool went away.
const CONNECTIVITY_CODES: &[&str] = &[
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "53300", // too_many_connections
    "POOL_TIMEOUT",
    "POOL_CLOSED",
];

/// Retryable SQLSTATEs beyond connectivity loss.
const TRANSIENT_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled
];

const TRANSIENT_MESSAGE_INDICATORS: &[&str] = &[
    "timed out",
    "socket hang up",
    "econnreset",
    "database is locked",
    "could not serialize access",
    "deadlock detected",
    "connection closed",
    "connection terminated",
    "restart transaction",
];

/// Coarse class of a persistence failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Connectivity,
    Transient,
    Constraint,
    Other,
}

/// Server SQLSTATEs are five uppercase alphanumerics. Pool and guard codes
/// are longer.
fn is_sqlstate(code: &str) -> bool {
    code.len() == 5
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// A SQLSTATE decides on its own. Message indicators only apply to errors
/// without one.
pub fn classify(error: &PersistenceError) -> ErrorClass {
    let code = error.code().unwrap_or_default();
    if is_sqlstate(code) {
        return if code.starts_with("23") {
            ErrorClass::Constraint
        } else if code.starts_with("08") || CONNECTIVITY_CODES.contains(&code) {
            ErrorClass::Connectivity
        } else if TRANSIENT_CODES.contains(&code) {
            ErrorClass::Transient
        } else {
            ErrorClass::Other
        };
    }

    let message = error.message.to_lowercase();
    if CONNECTIVITY_CODES.contains(&code)
        || message.contains("connect")
        || message.contains("timeout")
    {
        return ErrorClass::Connectivity;
    }

    if TRANSIENT_MESSAGE_INDICATORS
        .iter()
        .any(|indicator| message.contains(indicator))
    {
        return ErrorClass::Transient;
    }

    ErrorClass::Other
}

pub fn is_connectivity_error(error: &PersistenceError) -> bool {
    classify(error) == ErrorClass::Connectivity
}

/// Connectivity errors plus retryable contention failures.
pub fn is_transient_error(error: &PersistenceError) -> bool {
    matches!(
        classify(error),
        ErrorClass::Connectivity | ErrorClass::Transient
    )
}

pub fn is_constraint_error(error: &PersistenceError) -> bool {
    classify(error) == ErrorClass::Constraint
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coded(code: &str) -> PersistenceError {
        PersistenceError::new(code, "query failed")
    }

    #[test]
    fn test_connection_exception_class_is_connectivity() {
        for code in ["08000", "08001", "08006", "57P01", "53300", "POOL_TIMEOUT"] {
            assert_eq!(classify(&coded(code)), ErrorClass::Connectivity, "{code}");
        }
    }

    #[test]
    fn test_message_indicators_are_connectivity() {
        let err = PersistenceError::from_message("Could not CONNECT to server");
        assert!(is_connectivity_error(&err));
        let err = PersistenceError::from_message("statement timeout");
        assert!(is_connectivity_error(&err));
    }

    #[test]
    fn test_contention_codes_are_transient_only() {
        for code in ["40001", "40P01", "55P03", "57014"] {
            let err = coded(code);
            assert!(is_transient_error(&err), "{code}");
            assert!(!is_connectivity_error(&err), "{code}");
        }
        let err = PersistenceError::from_message("deadlock detected while waiting");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_constraint_violations_never_trip_or_retry() {
        // Message mentions "connection" but the code wins.
        let err = PersistenceError::new("23505", "duplicate key in connections_pkey");
        assert!(is_constraint_error(&err));
        assert!(!is_connectivity_error(&err));
        assert!(!is_transient_error(&err));
    }

    #[test]
    fn test_sqlstate_wins_over_message_text() {
        let err = PersistenceError::new("57014", "canceling statement due to statement timeout");
        assert_eq!(classify(&err), ErrorClass::Transient);
        assert!(!is_connectivity_error(&err));

        let err = PersistenceError::new(
            "42P01",
            "relation \"user_connections\" does not exist",
        );
        assert_eq!(classify(&err), ErrorClass::Other);
        assert!(!is_transient_error(&err));

        let err = PersistenceError::new("40001", "could not connect the dots");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_pool_codes_still_read_message() {
        let err = PersistenceError::new("POOL_TIMEOUT", "timed out waiting for connection");
        assert!(is_connectivity_error(&err));
        let err = PersistenceError::new("DRIVER", "connection terminated unexpectedly");
        assert!(is_connectivity_error(&err));
    }

    #[test]
    fn test_unknown_errors_are_other() {
        assert_eq!(classify(&coded("42P01")), ErrorClass::Other);
        assert_eq!(
            classify(&PersistenceError::raw_query_disabled()),
            ErrorClass::Other
        );
    }
}
