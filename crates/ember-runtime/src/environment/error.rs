//! Environment registry errors.

use crate::installation::InstallationError;
use ember_types::{EnvironmentId, ErrorCode};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the [`EnvironmentRegistry`](super::EnvironmentRegistry).
#[derive(Debug, Clone, Error)]
pub enum EnvironmentError {
    /// No tracked environment has this id.
    #[error("environment not found: {0}")]
    NotFound(EnvironmentId),

    /// The target path cannot hold an environment.
    #[error("invalid environment path '{path}': {reason}")]
    PathInvalid { path: PathBuf, reason: String },

    /// An existing environment lacks its linked runtime binary.
    #[error("environment binary missing: {0}")]
    BinaryMissing(PathBuf),

    /// An environment with this name or path is already tracked.
    #[error("environment already exists: {0}")]
    AlreadyExists(String),

    /// The environment is in use (bound sessions, or being created).
    #[error("environment busy: {0}")]
    ResourceBusy(String),

    /// The base installation cannot be used.
    #[error(transparent)]
    Installation(#[from] InstallationError),

    /// Filesystem failure while maintaining an environment.
    #[error("i/o error at '{path}': {message}")]
    Io { path: PathBuf, message: String },
}

impl EnvironmentError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl ErrorCode for EnvironmentError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "ENV_NOT_FOUND",
            Self::PathInvalid { .. } => "ENV_PATH_INVALID",
            Self::BinaryMissing(_) => "ENV_BINARY_MISSING",
            Self::AlreadyExists(_) => "ENV_ALREADY_EXISTS",
            Self::ResourceBusy(_) => "ENV_RESOURCE_BUSY",
            Self::Installation(_) => "ENV_INSTALLATION",
            Self::Io { .. } => "ENV_IO",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceBusy(_) | Self::Io { .. })
    }
}
