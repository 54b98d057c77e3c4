//! Session manager errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`SessionError::NotFound`] | `SESSION_NOT_FOUND` | No |
//! | [`SessionError::AlreadyExists`] | `SESSION_ALREADY_EXISTS` | No |
//! | [`SessionError::InvalidState`] | `SESSION_INVALID_STATE` | No |
//! | [`SessionError::EnvironmentNotFound`] | `SESSION_ENVIRONMENT_NOT_FOUND` | No |
//! | [`SessionError::Environment`] | `SESSION_ENVIRONMENT` | Inherited |
//! | [`SessionError::Runtime`] | `SESSION_RUNTIME` | Inherited |

use crate::coordinator::CoordinatorError;
use crate::environment::EnvironmentError;
use ember_types::{EnvironmentId, ErrorCode, SessionId};
use thiserror::Error;

/// Errors from the [`SessionManager`](super::SessionManager).
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session already registered: {0}")]
    AlreadyExists(SessionId),

    /// The session is terminated or closing.
    #[error("session {session} cannot be used: {reason}")]
    InvalidState { session: SessionId, reason: String },

    #[error("environment not found: {0}")]
    EnvironmentNotFound(EnvironmentId),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Runtime(#[from] CoordinatorError),
}

impl SessionError {
    pub(crate) fn invalid_state(session: SessionId, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            session,
            reason: reason.into(),
        }
    }
}

impl ErrorCode for SessionError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::AlreadyExists(_) => "SESSION_ALREADY_EXISTS",
            Self::InvalidState { .. } => "SESSION_INVALID_STATE",
            Self::EnvironmentNotFound(_) => "SESSION_ENVIRONMENT_NOT_FOUND",
            Self::Environment(_) => "SESSION_ENVIRONMENT",
            Self::Runtime(_) => "SESSION_RUNTIME",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Environment(e) => e.is_recoverable(),
            Self::Runtime(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::assert_error_codes;
    use std::time::Duration;

    #[test]
    fn all_error_codes_follow_convention() {
        assert_error_codes(
            &[
                SessionError::NotFound(SessionId::new()),
                SessionError::AlreadyExists(SessionId::new()),
                SessionError::invalid_state(SessionId::new(), "terminated"),
                SessionError::EnvironmentNotFound(EnvironmentId::new()),
                SessionError::Environment(EnvironmentError::ResourceBusy("x".into())),
                SessionError::Runtime(CoordinatorError::NotInitialized),
            ],
            "SESSION_",
        );
    }

    #[test]
    fn recoverability_is_inherited() {
        let timeout = SessionError::Runtime(CoordinatorError::Timeout(Duration::from_secs(1)));
        assert!(timeout.is_recoverable());
        assert!(!SessionError::NotFound(SessionId::new()).is_recoverable());
    }
}
