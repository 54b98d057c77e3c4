//! Process-wide engine mode and session lifecycle status.

use serde::{Deserialize, Serialize};

/// How sessions share the embedded runtime.
///
/// | Mode | Scopes | Environment switch |
/// |------|--------|--------------------|
/// | `SingleUser` | exactly one, shared by every session | full runtime restart |
/// | `MultiUser` | one per live session | rebinding only the affected sessions |
///
/// The mode is chosen once when the runtime is initialized and is only
/// read afterwards.
///
/// # Example
///
/// ```
/// use ember_types::EngineMode;
///
/// let mode: EngineMode = "multi-user".parse().unwrap();
/// assert_eq!(mode, EngineMode::MultiUser);
/// assert!(mode.is_multi_user());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// One shared scope; environment switches restart the runtime.
    SingleUser,
    /// Independent scopes inside one runtime.
    #[default]
    MultiUser,
}

impl EngineMode {
    /// Returns `true` for [`EngineMode::MultiUser`].
    #[must_use]
    pub fn is_multi_user(&self) -> bool {
        matches!(self, Self::MultiUser)
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleUser => f.write_str("single_user"),
            Self::MultiUser => f.write_str("multi_user"),
        }
    }
}

/// Error returned when parsing an unknown [`EngineMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError(pub String);

impl std::fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown engine mode '{}' (expected single_user or multi_user)",
            self.0
        )
    }
}

impl std::error::Error for ParseModeError {}

impl std::str::FromStr for EngineMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "single_user" | "single" => Ok(Self::SingleUser),
            "multi_user" | "multi" => Ok(Self::MultiUser),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Lifecycle status of a session.
///
/// ```text
/// Active ──cleanup──► Inactive ──terminate──► Terminated
///   ▲                    │
///   └────── reuse ───────┘
/// ```
///
/// `Terminated` is final: the session is immutable and must not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Bound to a live scope and accepting work.
    Active,
    /// Scope released; the next operation recreates it.
    Inactive,
    /// Shut down; no further operations are accepted.
    Terminated,
}

impl SessionStatus {
    /// Returns `true` for [`SessionStatus::Terminated`].
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Inactive => f.write_str("inactive"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}
