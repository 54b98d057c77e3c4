//! Session table and per-session serialization.

use super::{Session, SessionError};
use crate::coordinator::{CoordinatorError, RuntimeCoordinator};
use crate::environment::{Environment, EnvironmentError, EnvironmentRegistry};
use crate::installation::RuntimeInstallation;
use chrono::Utc;
use ember_types::{EngineMode, EnvironmentId, ScopeId, SessionId, SessionStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts to bind a session before giving up on an environment that
/// keeps disappearing under eviction.
const BIND_ATTEMPTS: usize = 5;

/// Captured output kept per session; older output is dropped first.
pub const MAX_SESSION_OUTPUT: usize = 4 << 20;

#[derive(Debug)]
struct SessionEntry {
    record: RwLock<Session>,
    output: Mutex<String>,
    /// FIFO: tokio's mutex queues waiters in arrival order.
    exec_lock: tokio::sync::Mutex<()>,
    /// Marked by an idle sweep between picking the session and locking it.
    closing: AtomicBool,
    /// Marked by `terminate_session`; never cleared.
    terminating: AtomicBool,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            record: RwLock::new(session),
            output: Mutex::new(String::new()),
            exec_lock: tokio::sync::Mutex::new(()),
            closing: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
        }
    }

    fn id(&self) -> SessionId {
        self.record.read().id
    }

    fn snapshot(&self) -> Session {
        self.record.read().clone()
    }

    fn usable(&self) -> Result<(), SessionError> {
        let record = self.record.read();
        if record.is_terminated() {
            return Err(SessionError::invalid_state(record.id, "session is terminated"));
        }
        if self.closing.load(Ordering::SeqCst) || self.terminating.load(Ordering::SeqCst) {
            return Err(SessionError::invalid_state(record.id, "session is closing"));
        }
        Ok(())
    }
}

/// Outcome of one [`SessionManager::perform_session_cleanup`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Sessions terminated in this sweep.
    pub terminated: Vec<SessionId>,
    /// Terminated records dropped from the table.
    pub purged: Vec<SessionId>,
    /// Idle sessions left alone because an operation held their lock.
    pub busy: Vec<SessionId>,
}

impl CleanupReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.purged.is_empty() && self.busy.is_empty()
    }
}

/// Creates, tracks and tears down sessions.
///
/// The session table is a `parking_lot::RwLock` that is never held across
/// an `.await`. Each session additionally owns a FIFO async lock that
/// serializes its operations; different sessions only contend on the
/// runtime gate.
#[derive(Debug)]
pub struct SessionManager {
    coordinator: Arc<RuntimeCoordinator>,
    registry: Arc<EnvironmentRegistry>,
    installation: RuntimeInstallation,
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        coordinator: Arc<RuntimeCoordinator>,
        registry: Arc<EnvironmentRegistry>,
        installation: RuntimeInstallation,
    ) -> Self {
        Self {
            coordinator,
            registry,
            installation,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<RuntimeCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// Installation new environments are derived from.
    pub fn installation(&self) -> &RuntimeInstallation {
        &self.installation
    }

    // === Creation ===

    /// Creates a session for `username`.
    ///
    /// Without `environment_id` the environment is chosen automatically:
    /// the active one in SingleUser mode; in MultiUser mode the least
    /// recently used unbound environment, else a new per-user one.
    ///
    /// A failure to create the scope does not fail the call. The session
    /// is returned with `was_successful = false` and the reason in `notes`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::EnvironmentNotFound`] if `environment_id` is not tracked
    /// - [`SessionError::Environment`] if no environment could be bound or created
    /// - [`SessionError::Runtime`] if the runtime is not initialized
    pub async fn create_session(
        &self,
        username: &str,
        environment_id: Option<EnvironmentId>,
    ) -> Result<Session, SessionError> {
        let id = SessionId::new();
        let mut session = Session::new(id, username);

        let env = self.bind_environment(id, username, environment_id).await?;
        session.environment_id = Some(env.id);

        // Tracked before the scope await; the idle sweep skips it while the
        // lock is held and can unbind it if this call is abandoned.
        let entry = Arc::new(SessionEntry::new(session));
        let creating = entry.exec_lock.try_lock().ok();
        self.sessions.write().insert(id, Arc::clone(&entry));

        match self.coordinator.create_scope(id, &env).await {
            Ok(scope) => debug!(session = %id, scope = %scope, "Session scope ready"),
            Err(e) => {
                warn!(session = %id, environment = %env.id, error = %e, "Scope creation failed");
                entry.record.write().fail(format!("scope creation failed: {e}"));
            }
        }
        drop(creating);

        info!(session = %id, username, environment = %env.id, "Session created");
        Ok(entry.snapshot())
    }

    async fn bind_environment(
        &self,
        session: SessionId,
        username: &str,
        requested: Option<EnvironmentId>,
    ) -> Result<Environment, SessionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let env = match requested {
                Some(id) => self
                    .registry
                    .get_by_id(&id)
                    .ok_or(SessionError::EnvironmentNotFound(id))?,
                None => self.select_environment(username).await?,
            };

            match self.registry.bind_session(&env.id, session) {
                Ok(()) => return Ok(env),
                // Evicted between selection and binding
                Err(EnvironmentError::NotFound(id)) if requested.is_none() && attempt < BIND_ATTEMPTS => {
                    debug!(session = %session, environment = %id, attempt, "Environment vanished before bind, retrying");
                }
                Err(EnvironmentError::NotFound(id)) => return Err(SessionError::EnvironmentNotFound(id)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn select_environment(&self, username: &str) -> Result<Environment, SessionError> {
        match self.coordinator.mode() {
            Some(EngineMode::SingleUser) => {
                let active = self
                    .coordinator
                    .active_environment()
                    .ok_or(CoordinatorError::NotInitialized)?;
                self.registry
                    .get_by_id(&active)
                    .ok_or(SessionError::EnvironmentNotFound(active))
            }
            Some(EngineMode::MultiUser) => {
                if let Some(env) = self.registry.least_recently_used() {
                    return Ok(env);
                }
                let name = user_environment_name(username);
                Ok(self.registry.ensure(&self.installation, &name).await?)
            }
            None => Err(CoordinatorError::NotInitialized.into()),
        }
    }

    // === Table ===

    #[must_use]
    pub fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    #[must_use]
    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().get(id).map(|e| e.snapshot())
    }

    /// All tracked sessions, oldest first.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.sessions.read().values().map(|e| e.snapshot()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Tracks a session created elsewhere.
    ///
    /// A live session is bound to its environment and starts `Inactive`;
    /// its scope is created on first use by [`ensure_scope`](Self::ensure_scope).
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyExists`] if the id is tracked
    /// - [`SessionError::EnvironmentNotFound`] if its environment is not tracked
    pub fn register_session(&self, mut session: Session) -> Result<(), SessionError> {
        let id = session.id;
        if session.status == SessionStatus::Active {
            session.status = SessionStatus::Inactive;
        }
        let bind_to = session
            .environment_id
            .filter(|_| !session.is_terminated());

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists(id));
            }
            sessions.insert(id, Arc::new(SessionEntry::new(session)));
        }

        if let Some(env) = bind_to {
            if let Err(e) = self.registry.bind_session(&env, id) {
                self.sessions.write().remove(&id);
                return Err(match e {
                    EnvironmentError::NotFound(env) => SessionError::EnvironmentNotFound(env),
                    other => other.into(),
                });
            }
        }
        debug!(session = %id, "Session registered");
        Ok(())
    }

    /// Stops tracking a session, releasing its scope and environment binding.
    pub async fn unregister_session(&self, id: &SessionId) -> Option<Session> {
        let entry = self.sessions.write().remove(id)?;
        self.coordinator.shutdown_session(id).await;
        let session = entry.snapshot();
        if let Some(env) = session.environment_id {
            self.registry.unbind_session(&env, id);
        }
        debug!(session = %id, "Session unregistered");
        Some(session)
    }

    fn entry(&self, id: &SessionId) -> Result<Arc<SessionEntry>, SessionError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound(*id))
    }

    // === Binding ===

    /// Moves the session to another environment and gives it a new scope.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] / [`SessionError::InvalidState`] for
    ///   unknown, terminated or closing sessions
    /// - [`SessionError::EnvironmentNotFound`] if the target is not tracked
    /// - [`SessionError::Runtime`] if the new scope cannot be created (the
    ///   session stays bound to the target and is marked unsuccessful)
    pub async fn associate_with_environment(
        &self,
        id: &SessionId,
        environment_id: &EnvironmentId,
    ) -> Result<ScopeId, SessionError> {
        let entry = self.entry(id)?;
        entry.usable()?;
        let env = self
            .registry
            .get_by_id(environment_id)
            .ok_or(SessionError::EnvironmentNotFound(*environment_id))?;

        let _guard = entry.exec_lock.lock().await;
        entry.usable()?;

        let previous = entry.record.read().environment_id;
        if previous != Some(env.id) {
            self.coordinator.shutdown_session(id).await;
            if let Some(old) = previous {
                self.registry.unbind_session(&old, id);
            }
            if let Err(e) = self.registry.bind_session(&env.id, *id) {
                let mut record = entry.record.write();
                record.environment_id = None;
                record.status = SessionStatus::Inactive;
                return Err(match e {
                    EnvironmentError::NotFound(env) => SessionError::EnvironmentNotFound(env),
                    other => other.into(),
                });
            }
            entry.record.write().environment_id = Some(env.id);
            info!(session = %id, environment = %env.id, "Session rebound");
        }

        match self.coordinator.create_scope(*id, &env).await {
            Ok(scope) => {
                entry.record.write().status = SessionStatus::Active;
                Ok(scope)
            }
            Err(e) => {
                let mut record = entry.record.write();
                record.status = SessionStatus::Inactive;
                record.fail(format!("scope creation failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Returns the session's scope, recreating it for an inactive session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] for terminated or unbound sessions
    /// - [`SessionError::Runtime`] with [`CoordinatorError::ScopeInvalidated`]
    ///   when a restart invalidated the scope; release it with
    ///   [`cleanup_session`](Self::cleanup_session) first
    pub async fn ensure_scope(&self, id: &SessionId) -> Result<ScopeId, SessionError> {
        let entry = self.entry(id)?;
        let env_id = {
            let record = entry.record.read();
            if record.is_terminated() {
                return Err(SessionError::invalid_state(*id, "session is terminated"));
            }
            record.environment_id
        };
        if let Some(scope) = self.coordinator.get_scope(id) {
            return Ok(scope);
        }

        let env_id =
            env_id.ok_or_else(|| SessionError::invalid_state(*id, "session has no environment"))?;
        let env = self
            .registry
            .get_by_id(&env_id)
            .ok_or(SessionError::EnvironmentNotFound(env_id))?;
        let scope = self.coordinator.create_scope(*id, &env).await?;
        entry.record.write().status = SessionStatus::Active;
        debug!(session = %id, scope = %scope, "Scope recreated");
        Ok(scope)
    }

    // === Teardown ===

    /// Releases the session's scope and output; the session becomes `Inactive`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`], or [`SessionError::InvalidState`] for a
    /// terminated session.
    pub async fn cleanup_session(&self, id: &SessionId) -> Result<(), SessionError> {
        let entry = self.entry(id)?;
        if entry.record.read().is_terminated() {
            return Err(SessionError::invalid_state(*id, "session is terminated"));
        }

        let _guard = entry.exec_lock.lock().await;
        self.coordinator.shutdown_session(id).await;
        entry.output.lock().clear();
        let mut record = entry.record.write();
        if !record.is_terminated() {
            record.status = SessionStatus::Inactive;
        }
        debug!(session = %id, "Session cleaned up");
        Ok(())
    }

    /// Terminates the session. Idempotent.
    ///
    /// Pending operations already queued on the session finish first;
    /// new ones are refused.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if the session is not tracked.
    pub async fn terminate_session(&self, id: &SessionId) -> Result<(), SessionError> {
        let entry = self.entry(id)?;
        if entry.record.read().is_terminated() {
            return Ok(());
        }
        entry.terminating.store(true, Ordering::SeqCst);
        let _guard = entry.exec_lock.lock().await;
        self.teardown(&entry).await;
        Ok(())
    }

    /// Must be called with the entry's exec lock held.
    async fn teardown(&self, entry: &SessionEntry) {
        let (id, env) = {
            let record = entry.record.read();
            if record.is_terminated() {
                return;
            }
            (record.id, record.environment_id)
        };

        self.coordinator.shutdown_session(&id).await;
        if let Some(env) = env {
            self.registry.unbind_session(&env, &id);
        }
        entry.output.lock().clear();
        entry.record.write().terminate();
        info!(session = %id, "Session terminated");
    }

    /// Terminates every session idle for at least `max_age`.
    ///
    /// Candidates are marked `closing` without taking their locks; each is
    /// then torn down under its own lock. A session whose lock is held is
    /// unmarked and skipped; a termination requested meanwhile still holds. Records terminated at least `max_age` ago are
    /// dropped from the table first.
    pub async fn perform_session_cleanup(&self, max_age: Duration) -> CleanupReport {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        self.sessions.write().retain(|id, entry| {
            let record = entry.record.read();
            let expired = record.is_terminated()
                && record
                    .ended_at
                    .map_or(true, |t| (now - t).to_std().unwrap_or_default() >= max_age);
            if expired {
                report.purged.push(*id);
            }
            !expired
        });

        let candidates: Vec<Arc<SessionEntry>> = self
            .sessions
            .read()
            .values()
            .filter(|e| {
                let record = e.record.read();
                !record.is_terminated() && record.idle_for(now) >= max_age
            })
            .filter(|e| {
                e.closing
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
            .cloned()
            .collect();

        for entry in candidates {
            let id = entry.id();
            let Ok(_guard) = entry.exec_lock.try_lock() else {
                entry.closing.store(false, Ordering::SeqCst);
                debug!(session = %id, "Idle session busy, skipping");
                report.busy.push(id);
                continue;
            };
            self.teardown(&entry).await;
            report.terminated.push(id);
        }

        if !report.is_empty() {
            info!(
                terminated = report.terminated.len(),
                purged = report.purged.len(),
                busy = report.busy.len(),
                "Session cleanup finished"
            );
        }
        report
    }

    // === Execution ===

    /// Runs `action` while holding the session's lock.
    ///
    /// Operations on one session run one at a time in submission order.
    /// The outer `Result` reports concurrency-control failures, the inner
    /// one is the action's own. Last activity is updated only when the
    /// action succeeds.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if the session is not tracked
    /// - [`SessionError::InvalidState`] if it is terminated or closing,
    ///   checked both before and after waiting for the lock
    pub async fn execute_with_concurrency_control<T, E, F, Fut>(
        &self,
        id: &SessionId,
        action: F,
    ) -> Result<Result<T, E>, SessionError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let entry = self.entry(id)?;
        entry.usable()?;
        let _guard = entry.exec_lock.lock().await;
        entry.usable()?;

        let result = action(entry.snapshot()).await;
        if result.is_ok() {
            let env = {
                let mut record = entry.record.write();
                record.last_activity = Utc::now();
                record.environment_id
            };
            if let Some(env) = env {
                let _ = self.registry.mark_used(&env);
            }
        }
        Ok(result)
    }

    // === Output ===

    /// Appends captured output, dropping the oldest text past the cap.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if the session is not tracked.
    pub fn append_output(&self, id: &SessionId, text: &str) -> Result<(), SessionError> {
        if text.is_empty() {
            return Ok(());
        }
        let entry = self.entry(id)?;
        let mut buf = entry.output.lock();
        buf.push_str(text);
        trim_front(&mut buf, MAX_SESSION_OUTPUT);
        Ok(())
    }

    #[must_use]
    pub fn output(&self, id: &SessionId) -> Option<String> {
        let entry = self.sessions.read().get(id).cloned()?;
        let buf = entry.output.lock().clone();
        Some(buf)
    }

    /// Empties the buffer, returning what it held.
    pub fn clear_output(&self, id: &SessionId) -> Option<String> {
        let entry = self.sessions.read().get(id).cloned()?;
        let drained = std::mem::take(&mut *entry.output.lock());
        Some(drained)
    }
}

/// Name of the environment created for `username` when none is free.
fn user_environment_name(username: &str) -> String {
    let cleaned: String = username
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('_');
    if cleaned.is_empty() {
        "user-anonymous".into()
    } else {
        format!("user-{cleaned}")
    }
}

fn trim_front(buf: &mut String, max: usize) {
    if buf.len() <= max {
        return;
    }
    let mut cut = buf.len() - max;
    while !buf.is_char_boundary(cut) {
        cut += 1;
    }
    buf.drain(..cut);
}
