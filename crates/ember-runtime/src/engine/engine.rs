//! [`ExecutionEngine`]: the caller-facing execution surface.

use super::native::{self, NativeRun};
use super::result::{ExecutionError, ExecutionFailure, ExecutionResult, Profile};
use crate::coordinator::{CoordinatorError, RuntimeCoordinator, ScopeContext, CANCELLED_MESSAGE};
use crate::session::{SessionError, SessionManager};
use ember_types::{EngineMode, SessionId};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs code on behalf of sessions.
///
/// Every call takes the session's lock, makes sure the session has a
/// scope, then runs through the coordinator's gate. Results are always
/// returned as [`ExecutionResult`]; nothing here returns `Err` for a
/// failed execution.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    sessions: Arc<SessionManager>,
    coordinator: Arc<RuntimeCoordinator>,
    default_timeout: Duration,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>, default_timeout: Duration) -> Self {
        let coordinator = Arc::clone(sessions.coordinator());
        Self {
            sessions,
            coordinator,
            default_timeout,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // === Single calls ===

    /// Runs `code` as a chunk in the session's scope.
    ///
    /// The chunk's first return value becomes [`ExecutionResult::value`].
    /// `timeout` defaults to the engine's configured timeout.
    pub async fn execute_code(
        &self,
        code: &str,
        session: &SessionId,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let code = code.to_owned();
        self.run(session, self.timeout(timeout), false, move |ctx| {
            native::run_chunk(ctx, &code, "=code")
        })
        .await
    }

    /// Like [`execute_code`](Self::execute_code), with a [`Profile`] attached.
    pub async fn execute_code_with_profiling(
        &self,
        code: &str,
        session: &SessionId,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let code = code.to_owned();
        self.run(session, self.timeout(timeout), true, move |ctx| {
            native::run_chunk(ctx, &code, "=code")
        })
        .await
    }

    /// Runs one line with REPL semantics: as an expression if it parses as
    /// one, as a statement otherwise.
    pub async fn execute_command(&self, command: &str, session: &SessionId) -> ExecutionResult {
        let command = command.to_owned();
        self.run(session, self.default_timeout, false, move |ctx| {
            native::run_command(ctx, &command)
        })
        .await
    }

    /// Runs `code` with `variables` bound for this call only.
    ///
    /// The bindings are visible to the code but neither persist in the
    /// session's scope nor reach any other scope.
    pub async fn execute_with_variables(
        &self,
        code: &str,
        session: &SessionId,
        variables: serde_json::Map<String, serde_json::Value>,
    ) -> ExecutionResult {
        let code = code.to_owned();
        self.run(session, self.default_timeout, false, move |ctx| {
            native::run_with_variables(ctx, &code, &variables)
        })
        .await
    }

    /// Reads and runs a Lua file.
    ///
    /// A missing file is reported as [`ExecutionFailure::NotFound`].
    pub async fn execute_script_file(
        &self,
        path: &Path,
        session: &SessionId,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let code = match tokio::fs::read_to_string(path).await {
            Ok(code) => code,
            Err(e) => {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    ExecutionFailure::NotFound
                } else {
                    ExecutionFailure::Internal
                };
                return ExecutionResult::failed(
                    ExecutionError::new(kind, format!("cannot read {}: {e}", path.display())),
                    String::new(),
                    started.elapsed(),
                );
            }
        };
        let name = format!("@{}", path.display());
        self.run(session, self.timeout(timeout), false, move |ctx| {
            native::run_chunk(ctx, &code, &name)
        })
        .await
    }

    /// Runs `code`, then streams the values yielded by the coroutine
    /// `function_name` to `on_item`, in yield order.
    ///
    /// At most one item is in flight: the coroutine resumes only after
    /// the previous item was handed over. The function's final return
    /// value becomes [`ExecutionResult::value`].
    pub async fn execute_generator<F>(
        &self,
        code: &str,
        function_name: &str,
        session: &SessionId,
        mut on_item: F,
    ) -> ExecutionResult
    where
        F: FnMut(serde_json::Value),
    {
        let (tx, mut rx) = mpsc::channel(1);
        let code = code.to_owned();
        let name = function_name.to_owned();
        let producer = self.run(session, self.default_timeout, false, move |ctx| {
            native::run_generator(ctx, &code, &name, tx)
        });
        let mut producer = std::pin::pin!(producer);

        let mut delivered = 0usize;
        let result = loop {
            tokio::select! {
                result = &mut producer => break result,
                Some(item) = rx.recv() => {
                    on_item(item);
                    delivered += 1;
                }
            }
        };
        // Items sent just before the producer finished
        while let Ok(item) = rx.try_recv() {
            on_item(item);
            delivered += 1;
        }
        debug!(session = %session, delivered, success = result.success, "Generator finished");
        result
    }

    // === Sequences ===

    /// Runs commands in order with REPL semantics.
    ///
    /// A command whose Lua code fails does not stop the batch; an engine
    /// failure (timeout, cancellation, invalid session) does, and is the
    /// last result returned.
    pub async fn execute_batch<I>(&self, commands: I, session: &SessionId) -> Vec<ExecutionResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut results = Vec::new();
        for command in commands {
            let result = self.execute_command(command.as_ref(), session).await;
            let stop = result.failure().is_some_and(ExecutionFailure::is_engine_failure);
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }

    /// Runs code segments in order, sharing the session's scope.
    ///
    /// With `stop_on_error` the first failing segment ends the sequence;
    /// engine failures always do.
    pub async fn execute_interactive<I>(
        &self,
        segments: I,
        session: &SessionId,
        stop_on_error: bool,
    ) -> Vec<ExecutionResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut results = Vec::new();
        for segment in segments {
            let result = self.execute_code(segment.as_ref(), session, None).await;
            let stop = match result.failure() {
                None => false,
                Some(kind) => stop_on_error || kind.is_engine_failure(),
            };
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }

    // === Environment switching ===

    /// Runs `code` for the session inside the environment named
    /// `environment_name`, creating the environment if needed.
    ///
    /// In SingleUser mode switching to another environment restarts the
    /// runtime, which invalidates every other session's scope.
    pub async fn run_for_user(
        &self,
        session: &SessionId,
        environment_name: &str,
        code: &str,
    ) -> ExecutionResult {
        let started = Instant::now();
        if let Err(e) = self.switch_environment(session, environment_name).await {
            return ExecutionResult::failed(e, String::new(), started.elapsed());
        }
        self.execute_code(code, session, None).await
    }

    async fn switch_environment(
        &self,
        session: &SessionId,
        environment_name: &str,
    ) -> Result<(), ExecutionError> {
        let record = self
            .sessions
            .get_session(session)
            .ok_or(SessionError::NotFound(*session))?;
        let env = self
            .sessions
            .registry()
            .ensure(self.sessions.installation(), environment_name)
            .await
            .map_err(|e| ExecutionError::new(ExecutionFailure::InvalidState, e.to_string()))?;

        if self.coordinator.mode() == Some(EngineMode::SingleUser)
            && self.coordinator.active_environment() != Some(env.id)
        {
            info!(session = %session, environment = %env.id, "Switching runtime environment");
            self.coordinator.restart_with_environment(&env).await?;
        }

        if record.environment_id != Some(env.id) {
            self.sessions
                .associate_with_environment(session, &env.id)
                .await?;
            return Ok(());
        }

        match self.sessions.ensure_scope(session).await {
            Err(SessionError::Runtime(CoordinatorError::ScopeInvalidated { .. })) => {
                self.sessions.cleanup_session(session).await?;
                self.sessions.ensure_scope(session).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(_) => Ok(()),
        }
    }

    // === Control ===

    /// Releases the session's scope and output; the next call recreates them.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::cleanup_session`].
    pub async fn cleanup_session(&self, session: &SessionId) -> Result<(), SessionError> {
        self.sessions.cleanup_session(session).await
    }

    /// Asks the running call, whichever session it belongs to, to stop.
    /// Returns `false` when nothing is running.
    pub fn stop_execution(&self) -> bool {
        self.coordinator.stop_execution()
    }

    // === Plumbing ===

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    async fn run<F>(
        &self,
        session: &SessionId,
        timeout: Duration,
        profile: bool,
        f: F,
    ) -> ExecutionResult
    where
        F: FnOnce(&ScopeContext<'_>) -> mlua::Result<Option<serde_json::Value>> + Send + 'static,
    {
        let started = Instant::now();
        let sessions = &self.sessions;
        let coordinator = &self.coordinator;

        let outcome = sessions
            .execute_with_concurrency_control(session, |_| async move {
                // Scope recreation waits on the gate and counts against `timeout`
                let waiting = Instant::now();
                match tokio::time::timeout(timeout, sessions.ensure_scope(session)).await {
                    Ok(scope) => {
                        scope?;
                    }
                    Err(_) => {
                        warn!(session = %session, ?timeout, "Timed out waiting to recreate scope");
                        return Err(ExecutionError::from(CoordinatorError::Timeout(timeout)));
                    }
                }
                let remaining = timeout.saturating_sub(waiting.elapsed());
                let run = coordinator
                    .with_scope(session, remaining, move |ctx| native::measured(ctx, f))
                    .await
                    .map_err(|e| match e {
                        CoordinatorError::Timeout(_) => CoordinatorError::Timeout(timeout),
                        other => other,
                    })?;
                Ok::<NativeRun, ExecutionError>(run)
            })
            .await;
        let elapsed = started.elapsed();

        let run = match outcome {
            Ok(Ok(run)) => run,
            Ok(Err(e)) => return self.finish(session, ExecutionResult::failed(e, String::new(), elapsed)),
            Err(e) => {
                return self.finish(session, ExecutionResult::failed(e.into(), String::new(), elapsed))
            }
        };

        if let Err(e) = self.sessions.append_output(session, &run.output) {
            debug!(session = %session, error = %e, "Output dropped");
        }

        let mut result = match run.result {
            Ok(value) => ExecutionResult::ok(value, run.output, elapsed),
            Err(_) if run.cancelled => ExecutionResult::failed(
                ExecutionError::new(ExecutionFailure::Cancelled, CANCELLED_MESSAGE),
                run.output,
                elapsed,
            ),
            Err(e) => ExecutionResult::failed(
                ExecutionError::new(ExecutionFailure::Native, native::format_lua_error(&e)),
                run.output,
                elapsed,
            ),
        };
        if profile {
            result.profile = Some(Profile {
                queued: elapsed.saturating_sub(run.run),
                run: run.run,
                memory_before: run.memory_before,
                memory_after: run.memory_after,
            });
        }
        self.finish(session, result)
    }

    fn finish(&self, session: &SessionId, result: ExecutionResult) -> ExecutionResult {
        match &result.error {
            None => debug!(session = %session, elapsed = ?result.elapsed, "Execution succeeded"),
            Some(e) => debug!(session = %session, kind = %e.kind, elapsed = ?result.elapsed, "Execution failed"),
        }
        result
    }
}
