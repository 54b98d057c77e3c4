//! Execution results.
//!
//! Execution never returns `Err`: every failure is folded into an
//! [`ExecutionResult`] with `success = false` and an [`ExecutionError`]
//! whose kind tells a timeout apart from a failure inside Lua.

use crate::coordinator::CoordinatorError;
use crate::session::SessionError;
use serde::Serialize;
use std::time::Duration;

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The caller stopped waiting; the native call may still be finishing.
    Timeout,
    /// Lua raised an error (syntax, runtime, module loading).
    Native,
    /// Interrupted by [`stop_execution`](super::ExecutionEngine::stop_execution).
    Cancelled,
    /// The session, its scope or the runtime is not in a usable state.
    InvalidState,
    /// Session, environment or script file does not exist.
    NotFound,
    Internal,
}

impl ExecutionFailure {
    /// Failures that stop a batch: everything except errors raised by the code itself.
    #[must_use]
    pub fn is_engine_failure(self) -> bool {
        !matches!(self, Self::Native)
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Native => "native",
            Self::Cancelled => "cancelled",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Failure kind plus the message, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionError {
    pub kind: ExecutionFailure,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<CoordinatorError> for ExecutionError {
    fn from(err: CoordinatorError) -> Self {
        let kind = match &err {
            CoordinatorError::Timeout(_) => ExecutionFailure::Timeout,
            CoordinatorError::ScopeNotFound(_) => ExecutionFailure::NotFound,
            CoordinatorError::Native(_) => ExecutionFailure::Native,
            CoordinatorError::Internal(_) => ExecutionFailure::Internal,
            CoordinatorError::NotInitialized
            | CoordinatorError::AlreadyInitialized(_)
            | CoordinatorError::InvalidState(_)
            | CoordinatorError::ScopeInvalidated { .. }
            | CoordinatorError::EnvironmentMismatch { .. }
            | CoordinatorError::RestartFailed(_)
            | CoordinatorError::Installation(_) => ExecutionFailure::InvalidState,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<SessionError> for ExecutionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Runtime(e) => e.into(),
            SessionError::NotFound(_) | SessionError::EnvironmentNotFound(_) => {
                Self::new(ExecutionFailure::NotFound, err.to_string())
            }
            SessionError::AlreadyExists(_)
            | SessionError::InvalidState { .. }
            | SessionError::Environment(_) => {
                Self::new(ExecutionFailure::InvalidState, err.to_string())
            }
        }
    }
}

/// Timing and memory of one profiled call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// Time spent waiting for the session lock and the runtime gate.
    pub queued: Duration,
    /// Time spent running Lua.
    pub run: Duration,
    /// Lua heap bytes before and after the call.
    pub memory_before: usize,
    pub memory_after: usize,
}

impl Profile {
    /// Heap growth during the call (negative when the collector freed more).
    #[must_use]
    pub fn memory_delta(&self) -> i64 {
        self.memory_after as i64 - self.memory_before as i64
    }
}

/// Outcome of any execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Output captured by `print` during this call.
    pub output: String,
    /// First value returned by the code (JSON), `None` for nothing or `nil`.
    pub value: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    /// Wall time as seen by the caller.
    pub elapsed: Duration,
    /// Present for profiled calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl ExecutionResult {
    pub(crate) fn ok(value: Option<serde_json::Value>, output: String, elapsed: Duration) -> Self {
        Self {
            success: true,
            output,
            value,
            error: None,
            elapsed,
            profile: None,
        }
    }

    pub(crate) fn failed(error: ExecutionError, output: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            output,
            value: None,
            error: Some(error),
            elapsed,
            profile: None,
        }
    }

    /// Failure kind, `None` on success.
    #[must_use]
    pub fn failure(&self) -> Option<ExecutionFailure> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Error message, `None` on success.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}
