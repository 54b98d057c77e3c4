//! Runtime coordinator errors.

use super::RuntimeState;
use crate::installation::InstallationError;
use ember_types::{EnvironmentId, ErrorCode, ScopeId, SessionId};
use std::time::Duration;
use thiserror::Error;

/// Errors from the [`RuntimeCoordinator`](super::RuntimeCoordinator).
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("runtime not initialized")]
    NotInitialized,

    #[error("runtime already initialized (state: {0})")]
    AlreadyInitialized(RuntimeState),

    /// The operation is not allowed in the current state or mode.
    #[error("invalid runtime state: {0}")]
    InvalidState(String),

    /// The session has no scope.
    #[error("no scope for session {0}")]
    ScopeNotFound(SessionId),

    /// The session's scope belongs to a runtime generation that no longer exists.
    #[error("scope {scope} of session {session} was invalidated by a restart")]
    ScopeInvalidated { session: SessionId, scope: ScopeId },

    /// SingleUser runtime is bound to a different environment.
    #[error("runtime is bound to environment {active}, not {requested}")]
    EnvironmentMismatch {
        requested: EnvironmentId,
        active: EnvironmentId,
    },

    #[error("restart failed: {0}")]
    RestartFailed(String),

    /// The caller stopped waiting. The native call may still be running.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Installation(#[from] InstallationError),

    /// The Lua state refused an operation.
    #[error("native error: {0}")]
    Native(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<mlua::Error> for CoordinatorError {
    fn from(err: mlua::Error) -> Self {
        Self::Native(err.to_string())
    }
}

impl ErrorCode for CoordinatorError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "RUNTIME_NOT_INITIALIZED",
            Self::AlreadyInitialized(_) => "RUNTIME_ALREADY_INITIALIZED",
            Self::InvalidState(_) => "RUNTIME_INVALID_STATE",
            Self::ScopeNotFound(_) => "RUNTIME_SCOPE_NOT_FOUND",
            Self::ScopeInvalidated { .. } => "RUNTIME_SCOPE_INVALIDATED",
            Self::EnvironmentMismatch { .. } => "RUNTIME_ENVIRONMENT_MISMATCH",
            Self::RestartFailed(_) => "RUNTIME_RESTART_FAILED",
            Self::Timeout(_) => "RUNTIME_TIMEOUT",
            Self::Installation(_) => "RUNTIME_INSTALLATION",
            Self::Native(_) => "RUNTIME_NATIVE",
            Self::Internal(_) => "RUNTIME_INTERNAL",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ScopeInvalidated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::assert_error_codes;

    #[test]
    fn all_error_codes_follow_convention() {
        assert_error_codes(
            &[
                CoordinatorError::NotInitialized,
                CoordinatorError::AlreadyInitialized(RuntimeState::Ready),
                CoordinatorError::InvalidState("restart requires single-user mode".into()),
                CoordinatorError::ScopeNotFound(SessionId::new()),
                CoordinatorError::ScopeInvalidated {
                    session: SessionId::new(),
                    scope: ScopeId::new(0, 1),
                },
                CoordinatorError::EnvironmentMismatch {
                    requested: EnvironmentId::new(),
                    active: EnvironmentId::new(),
                },
                CoordinatorError::RestartFailed("environment missing".into()),
                CoordinatorError::Timeout(Duration::from_millis(10)),
                CoordinatorError::Installation(InstallationError::NotFound("/x".into())),
                CoordinatorError::Native("boom".into()),
                CoordinatorError::Internal("join".into()),
            ],
            "RUNTIME_",
        );
    }

    #[test]
    fn timeout_is_recoverable() {
        assert!(CoordinatorError::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!CoordinatorError::NotInitialized.is_recoverable());
    }
}
