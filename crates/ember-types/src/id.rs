//! Identifier types for ember.
//!
//! Sessions and environments are identified by UUIDs so they can be
//! persisted and logged without coordination. Scopes are identified by an
//! arena-style handle that also records the runtime generation it was
//! created in.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a caller-visible [session](crate::SessionStatus).
///
/// # Example
///
/// ```
/// use ember_types::SessionId;
///
/// let a = SessionId::new();
/// let b = SessionId::new();
/// assert_ne!(a, b);
/// assert!(a.to_string().starts_with("ses:"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

#[allow(clippy::new_without_default)] // Session ids are minted by the session manager only
impl SessionId {
    /// Creates a new [`SessionId`] with a random UUID v4.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

// NOTE: SessionId intentionally does NOT implement Default.
// A default id would never be registered with the session manager.

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ses:{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("ses:").unwrap_or(s);
        Uuid::parse_str(raw).map(Self)
    }
}

/// Identifier for an isolated dependency environment.
///
/// # Example
///
/// ```
/// use ember_types::EnvironmentId;
///
/// let id = EnvironmentId::new();
/// let parsed: EnvironmentId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(pub Uuid);

#[allow(clippy::new_without_default)] // Environment ids are minted by the registry only
impl EnvironmentId {
    /// Creates a new [`EnvironmentId`] with a random UUID v4.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "env:{}", self.0)
    }
}

impl std::str::FromStr for EnvironmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("env:").unwrap_or(s);
        Uuid::parse_str(raw).map(Self)
    }
}

/// Opaque handle to a runtime-native execution namespace.
///
/// A scope lives inside the runtime coordinator; every other component
/// only ever holds this handle. The `generation` records which runtime
/// instance created the scope: after a restart the coordinator's
/// generation advances and older handles no longer resolve.
///
/// # Example
///
/// ```
/// use ember_types::ScopeId;
///
/// let scope = ScopeId::new(3, 1);
/// assert_eq!(scope.index(), 3);
/// assert_eq!(scope.generation(), 1);
/// assert_eq!(scope.to_string(), "scope:3@1");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId {
    index: u64,
    generation: u64,
}

impl ScopeId {
    /// Creates a handle from an arena index and runtime generation.
    #[must_use]
    pub const fn new(index: u64, generation: u64) -> Self {
        Self { index, generation }
    }

    /// Arena slot of the scope inside its runtime.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Runtime generation the scope belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope:{}@{}", self.index, self.generation)
    }
}
