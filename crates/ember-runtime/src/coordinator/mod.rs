//! Runtime coordinator.
//!
//! Owns the single embedded Lua state and multiplexes sessions onto it.
//!
//! # The Gate
//!
//! All access to the Lua state goes through one FIFO async mutex
//! (`tokio::sync::Mutex`). A native call acquires it, moves the owned
//! guard onto a blocking worker thread and runs there. The guard is
//! released when the closure returns, so a call whose caller timed out
//! keeps the gate until the Lua code finishes or notices cancellation.
//!
//! ```text
//! with_scope(session, timeout, f)
//!   │  ticket = next
//!   ├─ timeout ─┬─ gate.lock_owned().await
//!   │           └─ spawn_blocking { verify generation; f(ctx) }
//!   └─ elapsed → cancel(ticket), Err(Timeout)
//! ```
//!
//! # State Machine
//!
//! ```text
//! Uninitialized → Initializing → Ready ⇄ Restarting
//!                                  ↓
//!                            ShuttingDown → Stopped → (initialize again)
//! ```
//!
//! `Restarting` and `ShuttingDown` are entered only while holding the gate.
//!
//! # Scopes
//!
//! Scopes always exist. In [`EngineMode::MultiUser`] each session gets its
//! own; in [`EngineMode::SingleUser`] every session maps to the one shared
//! scope of the active environment. A restart advances the generation and
//! every [`ScopeId`] from an older generation stops resolving.

mod cancel;
mod error;
mod vm;

pub use error::CoordinatorError;
pub use vm::VmOptions;

use crate::config::EngineConfig;
use crate::environment::Environment;
use crate::installation::RuntimeInstallation;
use cancel::CancelState;
use ember_types::{EngineMode, EnvironmentId, ScopeId, SessionId};
use mlua::{Lua, Table};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use vm::{LuaVm, ScopeTarget};

pub(crate) use vm::CANCELLED_MESSAGE;

/// Lifecycle of the embedded runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Restarting,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What the gate protects.
#[derive(Debug, Default)]
struct RuntimeSlot {
    vm: Option<LuaVm>,
}

#[derive(Debug, Default)]
struct Meta {
    state: RuntimeState,
    mode: Option<EngineMode>,
    active_environment: Option<EnvironmentId>,
    installation: Option<RuntimeInstallation>,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    scope: ScopeId,
    environment: EnvironmentId,
}

/// View of one scope handed to a native call.
///
/// Valid only inside the closure passed to
/// [`RuntimeCoordinator::with_scope`]; Lua values never leave it.
pub struct ScopeContext<'a> {
    lua: &'a Lua,
    env: Table,
    output: Arc<SyncMutex<String>>,
    scope: ScopeId,
    environment: EnvironmentId,
    cancel: &'a CancelState,
    ticket: u64,
}

impl ScopeContext<'_> {
    pub fn lua(&self) -> &Lua {
        self.lua
    }

    /// The scope's `_ENV` table. Load chunks with it as their environment.
    pub fn env(&self) -> &Table {
        &self.env
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn environment(&self) -> EnvironmentId {
        self.environment
    }

    /// Drains what `print` captured in this scope.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }

    /// Returns `true` once this call was cancelled (timeout or
    /// [`RuntimeCoordinator::stop_execution`]).
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled(self.ticket)
    }
}

/// Owner of the embedded runtime. Create one per host and share it by `Arc`.
pub struct RuntimeCoordinator {
    options: VmOptions,
    gate: Arc<Mutex<RuntimeSlot>>,
    meta: RwLock<Meta>,
    bindings: RwLock<HashMap<SessionId, Binding>>,
    generation: AtomicU64,
    cancel: CancelState,
}

impl std::fmt::Debug for RuntimeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.read();
        f.debug_struct("RuntimeCoordinator")
            .field("state", &meta.state)
            .field("mode", &meta.mode)
            .field("generation", &self.generation())
            .field("scopes", &self.bindings.read().len())
            .finish_non_exhaustive()
    }
}

impl RuntimeCoordinator {
    #[must_use]
    pub fn new(options: VmOptions) -> Self {
        Self {
            options,
            gate: Arc::new(Mutex::new(RuntimeSlot::default())),
            meta: RwLock::new(Meta::default()),
            bindings: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            cancel: CancelState::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(VmOptions {
            sandboxed: config.sandboxed,
            cancel_check_instructions: config.cancel_check_instructions,
        })
    }

    // === Lifecycle ===

    /// Builds the Lua state for `environment` in `mode`.
    ///
    /// Allowed from `Uninitialized` and from `Stopped`.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::AlreadyInitialized`] in any other state
    /// - [`CoordinatorError::Installation`] if `installation` is unavailable
    /// - [`CoordinatorError::Native`] if the shared scope cannot be built
    pub async fn initialize(
        &self,
        installation: &RuntimeInstallation,
        environment: &Environment,
        mode: EngineMode,
    ) -> Result<(), CoordinatorError> {
        {
            let mut meta = self.meta.write();
            match meta.state {
                RuntimeState::Uninitialized | RuntimeState::Stopped => {
                    meta.state = RuntimeState::Initializing;
                }
                other => return Err(CoordinatorError::AlreadyInitialized(other)),
            }
        }

        if let Err(e) = installation.ensure_available() {
            self.meta.write().state = RuntimeState::Uninitialized;
            return Err(e.into());
        }

        let mut slot = self.gate.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match self.build_vm(generation, mode, environment) {
            Ok(vm) => {
                slot.vm = Some(vm);
                let mut meta = self.meta.write();
                meta.state = RuntimeState::Ready;
                meta.mode = Some(mode);
                meta.active_environment = Some(environment.id);
                meta.installation = Some(installation.clone());
                info!(
                    mode = %mode,
                    environment = %environment.id,
                    installation = %installation.name(),
                    generation,
                    "Runtime initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.meta.write().state = RuntimeState::Uninitialized;
                error!(environment = %environment.id, error = %e, "Runtime initialization failed");
                Err(e.into())
            }
        }
    }

    /// Replaces the Lua state with one built for `environment`.
    ///
    /// Waits for the gate, so no native call is in flight while the old
    /// state is dropped. Every existing scope handle becomes stale.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::InvalidState`] outside SingleUser mode or when not `Ready`
    /// - [`CoordinatorError::RestartFailed`] if `environment` does not validate
    ///   or the new state cannot be built (the runtime is then `Stopped`)
    pub async fn restart_with_environment(
        &self,
        environment: &Environment,
    ) -> Result<(), CoordinatorError> {
        match self.mode() {
            Some(EngineMode::SingleUser) => {}
            Some(EngineMode::MultiUser) => {
                return Err(CoordinatorError::InvalidState(
                    "restart_with_environment requires single-user mode".into(),
                ))
            }
            None => return Err(CoordinatorError::NotInitialized),
        }
        if !environment.is_valid() {
            return Err(CoordinatorError::RestartFailed(format!(
                "environment '{}' at {} is not valid",
                environment.name,
                environment.path.display()
            )));
        }

        let mut slot = self.gate.lock().await;
        {
            let mut meta = self.meta.write();
            if meta.state != RuntimeState::Ready {
                return Err(CoordinatorError::InvalidState(format!(
                    "cannot restart while {}",
                    meta.state
                )));
            }
            meta.state = RuntimeState::Restarting;
        }
        info!(environment = %environment.id, name = %environment.name, "Restarting runtime");

        slot.vm = None;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match self.build_vm(generation, EngineMode::SingleUser, environment) {
            Ok(vm) => {
                slot.vm = Some(vm);
                let mut meta = self.meta.write();
                meta.state = RuntimeState::Ready;
                meta.active_environment = Some(environment.id);
                info!(environment = %environment.id, generation, "Runtime restarted");
                Ok(())
            }
            Err(e) => {
                let mut meta = self.meta.write();
                meta.state = RuntimeState::Stopped;
                meta.active_environment = None;
                error!(environment = %environment.id, error = %e, "Runtime restart failed");
                Err(CoordinatorError::RestartFailed(e.to_string()))
            }
        }
    }

    /// Drops the Lua state and every scope. Idempotent.
    ///
    /// A running call is asked to cancel first; shutdown still waits for
    /// it to release the gate.
    pub async fn shutdown(&self) {
        if matches!(
            self.state(),
            RuntimeState::Uninitialized | RuntimeState::Stopped
        ) {
            return;
        }
        self.cancel.cancel_current();

        let mut slot = self.gate.lock().await;
        {
            let mut meta = self.meta.write();
            if matches!(meta.state, RuntimeState::Uninitialized | RuntimeState::Stopped) {
                return;
            }
            meta.state = RuntimeState::ShuttingDown;
        }

        slot.vm = None;
        let released = {
            let mut bindings = self.bindings.write();
            let n = bindings.len();
            bindings.clear();
            n
        };

        let mut meta = self.meta.write();
        meta.state = RuntimeState::Stopped;
        meta.active_environment = None;
        info!(released, "Runtime stopped");
    }

    fn build_vm(
        &self,
        generation: u64,
        mode: EngineMode,
        environment: &Environment,
    ) -> mlua::Result<LuaVm> {
        match mode {
            EngineMode::SingleUser => LuaVm::with_shared_scope(
                generation,
                self.options,
                self.cancel.clone(),
                &ScopeTarget::from(environment),
            ),
            EngineMode::MultiUser => LuaVm::new(generation, self.options, self.cancel.clone()),
        }
    }

    // === Scopes ===

    /// Returns the session's scope, creating it on first use.
    ///
    /// Idempotent: a session already bound to `environment` gets the same
    /// handle back.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::NotInitialized`] / [`CoordinatorError::InvalidState`]
    ///   unless the runtime is `Ready`
    /// - [`CoordinatorError::EnvironmentMismatch`] in SingleUser mode when
    ///   `environment` is not the active one
    /// - [`CoordinatorError::ScopeInvalidated`] when the session's scope
    ///   predates a restart (release it with [`shutdown_session`](Self::shutdown_session) first)
    /// - [`CoordinatorError::InvalidState`] when the session is bound to another environment
    pub async fn create_scope(
        &self,
        session: SessionId,
        environment: &Environment,
    ) -> Result<ScopeId, CoordinatorError> {
        if let Some(scope) = self.existing_scope(&session, environment.id)? {
            return Ok(scope);
        }

        let mut slot = self.gate.lock().await;
        let mode = self.ready_mode()?;
        if let Some(scope) = self.existing_scope(&session, environment.id)? {
            return Ok(scope);
        }

        let vm = slot.vm.as_mut().ok_or(CoordinatorError::NotInitialized)?;
        let scope = match mode {
            EngineMode::SingleUser => {
                let active = self
                    .active_environment()
                    .ok_or(CoordinatorError::NotInitialized)?;
                if active != environment.id {
                    return Err(CoordinatorError::EnvironmentMismatch {
                        requested: environment.id,
                        active,
                    });
                }
                vm.shared_scope().ok_or_else(|| {
                    CoordinatorError::Internal("single-user runtime has no shared scope".into())
                })?
            }
            EngineMode::MultiUser => vm.create_scope(&ScopeTarget::from(environment))?,
        };

        self.bindings.write().insert(
            session,
            Binding {
                scope,
                environment: environment.id,
            },
        );
        debug!(session = %session, environment = %environment.id, scope = %scope, "Scope created");
        Ok(scope)
    }

    fn existing_scope(
        &self,
        session: &SessionId,
        environment: EnvironmentId,
    ) -> Result<Option<ScopeId>, CoordinatorError> {
        let Some(binding) = self.bindings.read().get(session).copied() else {
            return Ok(None);
        };
        if binding.scope.generation() != self.generation() {
            return Err(CoordinatorError::ScopeInvalidated {
                session: *session,
                scope: binding.scope,
            });
        }
        if binding.environment != environment {
            return Err(CoordinatorError::InvalidState(format!(
                "session {session} is bound to environment {}",
                binding.environment
            )));
        }
        Ok(Some(binding.scope))
    }

    fn ready_mode(&self) -> Result<EngineMode, CoordinatorError> {
        let meta = self.meta.read();
        match (meta.state, meta.mode) {
            (RuntimeState::Ready, Some(mode)) => Ok(mode),
            (RuntimeState::Uninitialized, _) => Err(CoordinatorError::NotInitialized),
            (state, _) => Err(CoordinatorError::InvalidState(format!("runtime is {state}"))),
        }
    }

    /// Returns `true` if the session has a scope of the current generation.
    #[must_use]
    pub fn has_scope(&self, session: &SessionId) -> bool {
        self.get_scope(session).is_some()
    }

    /// The session's scope, `None` if absent or invalidated by a restart.
    #[must_use]
    pub fn get_scope(&self, session: &SessionId) -> Option<ScopeId> {
        let scope = self.bindings.read().get(session)?.scope;
        (scope.generation() == self.generation()).then_some(scope)
    }

    /// Releases the session's scope. Idempotent; returns whether a binding existed.
    ///
    /// In SingleUser mode only the mapping goes; the shared scope stays.
    pub async fn shutdown_session(&self, session: &SessionId) -> bool {
        let Some(binding) = self.bindings.write().remove(session) else {
            return false;
        };
        debug!(session = %session, scope = %binding.scope, "Scope released");

        if binding.scope.generation() != self.generation()
            || self.mode() != Some(EngineMode::MultiUser)
        {
            return true;
        }

        let mut slot = self.gate.lock().await;
        if let Some(vm) = slot.vm.as_mut() {
            vm.destroy_scope(binding.scope);
        }
        true
    }

    // === Native calls ===

    /// Runs `f` against the session's scope while holding the gate.
    ///
    /// `f` runs on a blocking worker thread. If `timeout` elapses first the
    /// call is flagged for cancellation and [`CoordinatorError::Timeout`]
    /// returns immediately; the worker keeps the gate until `f` returns.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::ScopeNotFound`] if the session has no scope
    /// - [`CoordinatorError::ScopeInvalidated`] if the scope predates a restart
    /// - [`CoordinatorError::NotInitialized`] if the runtime was shut down
    /// - [`CoordinatorError::Timeout`] when `timeout` elapses
    /// - [`CoordinatorError::Internal`] if `f` panics
    pub async fn with_scope<F, R>(
        &self,
        session: &SessionId,
        timeout: Duration,
        f: F,
    ) -> Result<R, CoordinatorError>
    where
        F: FnOnce(&ScopeContext<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let binding = self
            .bindings
            .read()
            .get(session)
            .copied()
            .ok_or(CoordinatorError::ScopeNotFound(*session))?;
        let session = *session;
        let ticket = self.cancel.next_ticket();
        let gate = Arc::clone(&self.gate);
        let cancel = self.cancel.clone();

        let run = async move {
            let slot = gate.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let vm = slot.vm.as_ref().ok_or(CoordinatorError::NotInitialized)?;
                if vm.generation() != binding.scope.generation() {
                    return Err(CoordinatorError::ScopeInvalidated {
                        session,
                        scope: binding.scope,
                    });
                }
                let parts = vm
                    .parts(binding.scope)?
                    .ok_or(CoordinatorError::ScopeNotFound(session))?;

                let _running = cancel.begin(ticket);
                let ctx = ScopeContext {
                    lua: vm.lua(),
                    env: parts.env,
                    output: parts.output,
                    scope: binding.scope,
                    environment: parts.environment,
                    cancel: &cancel,
                    ticket,
                };
                Ok(f(&ctx))
            })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("native call failed: {e}")))?
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel.cancel(ticket);
                warn!(session = %session, ?timeout, "Native call timed out, cancellation requested");
                Err(CoordinatorError::Timeout(timeout))
            }
        }
    }

    /// Asks the running native call to stop. Returns `false` when idle.
    ///
    /// Cooperative: Lua code is interrupted at the next hook check; a
    /// blocking native function (such as `sleep`) finishes first.
    pub fn stop_execution(&self) -> bool {
        let stopped = self.cancel.cancel_current();
        if stopped {
            info!("Execution stop requested");
        }
        stopped
    }

    // === Introspection ===

    #[must_use]
    pub fn state(&self) -> RuntimeState {
        self.meta.read().state
    }

    /// Mode chosen at initialization, `None` before.
    #[must_use]
    pub fn mode(&self) -> Option<EngineMode> {
        self.meta.read().mode
    }

    #[must_use]
    pub fn active_environment(&self) -> Option<EnvironmentId> {
        self.meta.read().active_environment
    }

    #[must_use]
    pub fn installation(&self) -> Option<RuntimeInstallation> {
        self.meta.read().installation.clone()
    }

    /// Sessions holding a scope of the current generation.
    #[must_use]
    pub fn scope_count(&self) -> usize {
        let generation = self.generation();
        self.bindings
            .read()
            .values()
            .filter(|b| b.scope.generation() == generation)
            .count()
    }

    /// Current runtime generation, advanced by every initialize and restart.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> VmOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentRegistry;
    use crate::testing::RecordingPackages;
    use mlua::Value;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        registry: EnvironmentRegistry,
        installation: RuntimeInstallation,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let registry =
                EnvironmentRegistry::new(temp.path(), Arc::new(RecordingPackages::new()));
            Self {
                _temp: temp,
                registry,
                installation: RuntimeInstallation::embedded(),
            }
        }

        async fn env(&self, name: &str) -> Environment {
            self.registry.ensure(&self.installation, name).await.unwrap()
        }
    }

    async fn eval(
        coordinator: &RuntimeCoordinator,
        session: &SessionId,
        code: &'static str,
    ) -> Result<mlua::Result<serde_json::Value>, CoordinatorError> {
        coordinator
            .with_scope(session, Duration::from_secs(5), move |ctx| {
                ctx.lua()
                    .load(code)
                    .set_environment(ctx.env().clone())
                    .eval::<Value>()
                    .and_then(|v| crate::convert::lua_to_json(&v))
            })
            .await
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());

        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();
        let err = coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyInitialized(RuntimeState::Ready)));

        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert_eq!(coordinator.state(), RuntimeState::Stopped);
        coordinator
            .initialize(&fx.installation, &env, EngineMode::SingleUser)
            .await
            .unwrap();
        assert_eq!(coordinator.mode(), Some(EngineMode::SingleUser));
    }

    #[tokio::test]
    async fn unavailable_installation_is_rejected() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let mut broken = RuntimeInstallation::embedded();
        broken.available = false;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());

        let err = coordinator
            .initialize(&broken, &env, EngineMode::MultiUser)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Installation(_)));
        assert_eq!(coordinator.state(), RuntimeState::Uninitialized);
    }

    #[tokio::test]
    async fn create_scope_requires_initialization() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        let err = coordinator
            .create_scope(SessionId::new(), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotInitialized));
    }

    #[tokio::test]
    async fn create_scope_is_idempotent() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();

        let session = SessionId::new();
        let first = coordinator.create_scope(session, &env).await.unwrap();
        let second = coordinator.create_scope(session, &env).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(coordinator.scope_count(), 1);
        assert_eq!(coordinator.get_scope(&session), Some(first));
    }

    #[tokio::test]
    async fn multi_user_scopes_are_isolated() {
        let fx = Fixture::new();
        let env_a = fx.env("a").await;
        let env_b = fx.env("b").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env_a, EngineMode::MultiUser)
            .await
            .unwrap();

        let alice = SessionId::new();
        let bob = SessionId::new();
        coordinator.create_scope(alice, &env_a).await.unwrap();
        coordinator.create_scope(bob, &env_b).await.unwrap();

        eval(&coordinator, &alice, "secret = 'alice'; return secret")
            .await
            .unwrap()
            .unwrap();
        let seen = eval(&coordinator, &bob, "return secret").await.unwrap().unwrap();
        assert_eq!(seen, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn single_user_sessions_share_one_scope() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let other = fx.env("other").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::SingleUser)
            .await
            .unwrap();

        let a = SessionId::new();
        let b = SessionId::new();
        let scope_a = coordinator.create_scope(a, &env).await.unwrap();
        let scope_b = coordinator.create_scope(b, &env).await.unwrap();
        assert_eq!(scope_a, scope_b);

        eval(&coordinator, &a, "shared = 7").await.unwrap().ok();
        let seen = eval(&coordinator, &b, "return shared").await.unwrap().unwrap();
        assert_eq!(seen, serde_json::json!(7));

        let err = coordinator
            .create_scope(SessionId::new(), &other)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::EnvironmentMismatch { .. }));

        // Releasing one session keeps the shared scope alive for the other
        assert!(coordinator.shutdown_session(&a).await);
        assert!(!coordinator.shutdown_session(&a).await);
        let still = eval(&coordinator, &b, "return shared").await.unwrap().unwrap();
        assert_eq!(still, serde_json::json!(7));
    }

    #[tokio::test]
    async fn restart_invalidates_prior_scopes() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let next = fx.env("next").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::SingleUser)
            .await
            .unwrap();

        let session = SessionId::new();
        let before = coordinator.create_scope(session, &env).await.unwrap();
        coordinator.restart_with_environment(&next).await.unwrap();

        assert_eq!(coordinator.state(), RuntimeState::Ready);
        assert_eq!(coordinator.active_environment(), Some(next.id));
        assert!(!coordinator.has_scope(&session));
        assert_eq!(coordinator.scope_count(), 0);

        let err = eval(&coordinator, &session, "return 1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ScopeInvalidated { .. }));
        let err = coordinator.create_scope(session, &next).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ScopeInvalidated { .. }));

        coordinator.shutdown_session(&session).await;
        let after = coordinator.create_scope(session, &next).await.unwrap();
        assert!(after.generation() > before.generation());
    }

    #[tokio::test]
    async fn restart_requires_single_user_and_valid_environment() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();
        let err = coordinator.restart_with_environment(&env).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidState(_)));

        let single = RuntimeCoordinator::new(VmOptions::default());
        single
            .initialize(&fx.installation, &env, EngineMode::SingleUser)
            .await
            .unwrap();
        let mut broken = env.clone();
        broken.path = broken.path.join("missing");
        let err = single.restart_with_environment(&broken).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::RestartFailed(_)));
        assert_eq!(single.state(), RuntimeState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_returns_promptly_and_cancels() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();
        let session = SessionId::new();
        coordinator.create_scope(session, &env).await.unwrap();

        let started = Instant::now();
        let err = coordinator
            .with_scope(&session, Duration::from_millis(100), |ctx| {
                ctx.lua()
                    .load("while true do end")
                    .set_environment(ctx.env().clone())
                    .exec()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The loop observes cancellation and releases the gate
        let value = eval(&coordinator, &session, "return 1 + 1").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_execution_interrupts_running_code() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = Arc::new(RuntimeCoordinator::new(VmOptions::default()));
        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();
        let session = SessionId::new();
        coordinator.create_scope(session, &env).await.unwrap();

        let runner = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move {
            runner
                .with_scope(&session, Duration::from_secs(30), |ctx| {
                    let result = ctx
                        .lua()
                        .load("while true do end")
                        .set_environment(ctx.env().clone())
                        .exec();
                    (result, ctx.cancel_requested())
                })
                .await
        });

        let mut stopped = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if coordinator.stop_execution() {
                stopped = true;
                break;
            }
        }
        assert!(stopped);

        let (result, cancelled) = handle.await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(cancelled);
        assert!(!coordinator.stop_execution());
    }

    #[tokio::test]
    async fn print_output_is_captured_per_scope() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();
        let session = SessionId::new();
        coordinator.create_scope(session, &env).await.unwrap();

        let output = coordinator
            .with_scope(&session, Duration::from_secs(5), |ctx| {
                ctx.lua()
                    .load("print('hello', 42)")
                    .set_environment(ctx.env().clone())
                    .exec()
                    .unwrap();
                ctx.take_output()
            })
            .await
            .unwrap();
        assert_eq!(output, "hello\t42\n");
    }

    #[tokio::test]
    async fn with_scope_without_scope_is_not_found() {
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        let err = coordinator
            .with_scope(&SessionId::new(), Duration::from_secs(1), |_| ())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ScopeNotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_releases_every_scope() {
        let fx = Fixture::new();
        let env = fx.env("default").await;
        let coordinator = RuntimeCoordinator::new(VmOptions::default());
        coordinator
            .initialize(&fx.installation, &env, EngineMode::MultiUser)
            .await
            .unwrap();
        let session = SessionId::new();
        coordinator.create_scope(session, &env).await.unwrap();

        coordinator.shutdown().await;
        assert_eq!(coordinator.scope_count(), 0);
        assert!(!coordinator.has_scope(&session));
        assert!(coordinator.active_environment().is_none());
    }
}
