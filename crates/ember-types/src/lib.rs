//! Core types for ember.
//!
//! This crate holds the small vocabulary every other ember crate shares:
//!
//! - identifiers for sessions, environments and scopes
//! - the process-wide [`EngineMode`] and per-session [`SessionStatus`]
//! - the [`ErrorCode`] trait implemented by every ember error
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ember-types   : ids, modes, ErrorCode          ◄── HERE    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ember-runtime : installations, environments, coordinator,  │
//! │                  sessions, execution engine, host           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ember-cli     : command-line host                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use ember_types::{EngineMode, EnvironmentId, ScopeId, SessionId};
//!
//! let session = SessionId::new();
//! let env = EnvironmentId::new();
//! let scope = ScopeId::new(0, 1);
//!
//! println!("{session} bound to {env} via {scope}");
//! assert_eq!(EngineMode::default(), EngineMode::MultiUser);
//! ```

mod error;
mod id;
mod mode;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use id::{EnvironmentId, ScopeId, SessionId};
pub use mode::{EngineMode, ParseModeError, SessionStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_uniqueness() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn session_id_display_and_parse() {
        let id = SessionId::new();
        let display = id.to_string();
        assert!(display.starts_with("ses:"));
        assert!(display.contains(&id.uuid().to_string()));
        assert_eq!(display.parse::<SessionId>().unwrap(), id);
        assert_eq!(id.uuid().to_string().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn environment_id_display() {
        let id = EnvironmentId::new();
        assert!(id.to_string().starts_with("env:"));
        assert_eq!(id.uuid(), id.0);
    }

    #[test]
    fn environment_id_rejects_garbage() {
        assert!("env:not-a-uuid".parse::<EnvironmentId>().is_err());
    }

    #[test]
    fn scope_id_generation_distinguishes_handles() {
        let before = ScopeId::new(0, 1);
        let after = ScopeId::new(0, 2);
        assert_eq!(before.index(), after.index());
        assert_ne!(before, after);
    }

    #[test]
    fn ids_serialize_as_uuid() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.uuid()));
    }
}
