//! Unified error interface for ember.
//!
//! Every ember error type implements [`ErrorCode`] so hosts can branch on
//! a stable machine-readable code and decide whether a retry makes sense.
//!
//! # Example
//!
//! ```
//! use ember_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     NotFound(String),
//!     Timeout,
//! }
//!
//! impl ErrorCode for MyError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::NotFound(_) => "MY_NOT_FOUND",
//!             Self::Timeout => "MY_TIMEOUT",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Timeout)
//!     }
//! }
//!
//! let err = MyError::Timeout;
//! assert_eq!(err.code(), "MY_TIMEOUT");
//! assert!(err.is_recoverable());
//! ```

/// Machine-readable error code and recoverability.
///
/// # Code Format
///
/// - **UPPER_SNAKE_CASE**, e.g. `"SESSION_NOT_FOUND"`
/// - **Prefixed by layer**: `ENV_`, `RUNTIME_`, `SESSION_`, `CONFIG_`, ...
/// - **Stable**: codes are part of the host-facing contract
///
/// # Recoverability
///
/// An error is recoverable when retrying (possibly after the caller fixes
/// something transient) may succeed: timeouts, busy resources. Invalid
/// state and missing entities are not recoverable by retry alone.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether a retry may succeed.
    fn is_recoverable(&self) -> bool;
}

/// Validates that an error code follows ember conventions.
///
/// # Panics
///
/// Panics if the code is empty, lacks `expected_prefix`, or is not
/// UPPER_SNAKE_CASE.
///
/// # Example
///
/// ```
/// use ember_types::{ErrorCode, assert_error_code};
///
/// #[derive(Debug)]
/// enum MyError { Timeout }
///
/// impl ErrorCode for MyError {
///     fn code(&self) -> &'static str { "MY_TIMEOUT" }
///     fn is_recoverable(&self) -> bool { true }
/// }
///
/// assert_error_code(&MyError::Timeout, "MY_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "Error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );
    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Validates every variant in `errors` with [`assert_error_code`].
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum TestError {
        Busy,
        Missing,
    }

    impl ErrorCode for TestError {
        fn code(&self) -> &'static str {
            match self {
                Self::Busy => "TEST_BUSY",
                Self::Missing => "TEST_MISSING",
            }
        }

        fn is_recoverable(&self) -> bool {
            matches!(self, Self::Busy)
        }
    }

    #[test]
    fn error_code_trait() {
        assert_eq!(TestError::Busy.code(), "TEST_BUSY");
        assert!(TestError::Busy.is_recoverable());
        assert!(!TestError::Missing.is_recoverable());
    }

    #[test]
    fn assert_error_codes_all_variants() {
        assert_error_codes(&[TestError::Busy, TestError::Missing], "TEST_");
    }

    #[test]
    #[should_panic(expected = "must start with prefix")]
    fn assert_error_code_wrong_prefix() {
        assert_error_code(&TestError::Busy, "OTHER_");
    }

    #[test]
    fn upper_snake_case_rules() {
        assert!(is_upper_snake_case("SESSION_NOT_FOUND"));
        assert!(is_upper_snake_case("ENV_2"));
        assert!(!is_upper_snake_case(""));
        assert!(!is_upper_snake_case("session"));
        assert!(!is_upper_snake_case("_LEADING"));
        assert!(!is_upper_snake_case("TRAILING_"));
        assert!(!is_upper_snake_case("DOUBLE__UNDERSCORE"));
    }
}
