//! The session record.

use chrono::{DateTime, Utc};
use ember_types::{EnvironmentId, SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A caller's logical execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Display name, `<username>-<short id>` unless set explicitly.
    pub name: String,
    pub username: String,
    pub environment_id: Option<EnvironmentId>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    /// `false` once setup (environment or scope) failed.
    pub was_successful: bool,
    pub notes: Vec<String>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, username: impl Into<String>) -> Self {
        let username = username.into();
        let short = id.uuid().simple().to_string();
        let now = Utc::now();
        Self {
            id,
            name: format!("{username}-{}", &short[..8]),
            username,
            environment_id: None,
            status: SessionStatus::Active,
            started_at: now,
            ended_at: None,
            last_activity: now,
            was_successful: true,
            notes: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.status.is_terminated()
    }

    /// Time since the last successful action, zero if the clock went backwards.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    pub(crate) fn fail(&mut self, note: impl Into<String>) {
        self.was_successful = false;
        self.notes.push(note.into());
    }

    pub(crate) fn terminate(&mut self) {
        self.status = SessionStatus::Terminated;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_active_and_named() {
        let id = SessionId::new();
        let session = Session::new(id, "alice");
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.name.starts_with("alice-"));
        assert_eq!(session.name.len(), "alice-".len() + 8);
        assert!(session.was_successful);
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn terminate_records_end() {
        let mut session = Session::new(SessionId::new(), "bob");
        session.terminate();
        assert!(session.is_terminated());
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn fail_keeps_reason() {
        let mut session = Session::new(SessionId::new(), "carol");
        session.fail("scope creation failed");
        assert!(!session.was_successful);
        assert_eq!(session.notes, vec!["scope creation failed".to_string()]);
    }
}
