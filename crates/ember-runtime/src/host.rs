//! The owned object graph behind one embedded runtime.
//!
//! A [`Host`] is built once from an [`EmberConfig`] and owns everything a
//! caller needs: the environment registry, the runtime coordinator, the
//! session manager, the execution engine and the maintenance task. Nothing
//! is global; components receive their collaborators through `Arc`s.
//!
//! # Example
//!
//! ```no_run
//! use ember_runtime::{EmberConfig, Host};
//!
//! # async fn demo() -> Result<(), ember_runtime::HostError> {
//! let host = Host::builder(EmberConfig::default()).build();
//! host.start().await?;
//!
//! let session = host.sessions().create_session("alice", None).await?;
//! let result = host.engine().execute_code("return 1 + 1", &session.id, None).await;
//! assert!(result.success);
//!
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::EmberConfig;
use crate::coordinator::{CoordinatorError, RuntimeCoordinator};
use crate::engine::ExecutionEngine;
use crate::environment::{EnvironmentError, EnvironmentRegistry};
use crate::installation::{CommandLauncher, RuntimeInstallation};
use crate::maintenance::{Maintenance, SweepSettings};
use crate::package::{LuaRocksPackages, PackageOperations};
use crate::session::{SessionError, SessionManager};
use ember_types::ErrorCode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Host lifecycle errors.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("host already started")]
    AlreadyStarted,

    #[error("host not started")]
    NotStarted,

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] CoordinatorError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl ErrorCode for HostError {
    fn code(&self) -> &'static str {
        match self {
            Self::AlreadyStarted => "HOST_ALREADY_STARTED",
            Self::NotStarted => "HOST_NOT_STARTED",
            Self::Environment(_) => "HOST_ENVIRONMENT",
            Self::Runtime(_) => "HOST_RUNTIME",
            Self::Session(_) => "HOST_SESSION",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Environment(e) => e.is_recoverable(),
            Self::Runtime(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::AlreadyStarted | Self::NotStarted => false,
        }
    }
}

/// Builder for [`Host`].
#[derive(Debug)]
pub struct HostBuilder {
    config: EmberConfig,
    installation: Option<RuntimeInstallation>,
    packages: Option<Arc<dyn PackageOperations>>,
}

impl HostBuilder {
    /// Runtime installation environments derive from. Defaults to the
    /// embedded runtime.
    #[must_use]
    pub fn installation(mut self, installation: RuntimeInstallation) -> Self {
        self.installation = Some(installation);
        self
    }

    /// Package backend for the registry. Defaults to `luarocks`.
    #[must_use]
    pub fn packages(mut self, packages: Arc<dyn PackageOperations>) -> Self {
        self.packages = Some(packages);
        self
    }

    #[must_use]
    pub fn build(self) -> Host {
        let installation = self
            .installation
            .unwrap_or_else(RuntimeInstallation::embedded);
        let packages = self.packages.unwrap_or_else(|| {
            Arc::new(LuaRocksPackages::new(
                Arc::new(CommandLauncher),
                installation.language_version(),
            ))
        });

        let registry = Arc::new(
            EnvironmentRegistry::new(self.config.environments.resolved_root(), packages)
                .with_removal_policy(self.config.environments.removal),
        );
        let coordinator = Arc::new(RuntimeCoordinator::from_config(&self.config.engine));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            installation.clone(),
        ));
        let engine = ExecutionEngine::new(
            Arc::clone(&sessions),
            self.config.engine.default_timeout(),
        );

        Host {
            config: self.config,
            installation,
            coordinator,
            registry,
            sessions,
            engine,
            maintenance: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

/// One embedded runtime with its sessions and environments.
#[derive(Debug)]
pub struct Host {
    config: EmberConfig,
    installation: RuntimeInstallation,
    coordinator: Arc<RuntimeCoordinator>,
    registry: Arc<EnvironmentRegistry>,
    sessions: Arc<SessionManager>,
    engine: ExecutionEngine,
    maintenance: Mutex<Option<Maintenance>>,
    started: AtomicBool,
}

impl Host {
    #[must_use]
    pub fn builder(config: EmberConfig) -> HostBuilder {
        HostBuilder {
            config,
            installation: None,
            packages: None,
        }
    }

    /// Ensures the default environment, initializes the runtime against it
    /// in the configured mode and starts the maintenance sweep.
    ///
    /// Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`HostError::AlreadyStarted`] on a second call
    /// - [`HostError::Environment`] if the default environment cannot be created
    /// - [`HostError::Runtime`] if the runtime fails to initialize
    pub async fn start(&self) -> Result<(), HostError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HostError::AlreadyStarted);
        }

        if let Err(e) = self.bring_up().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let maintenance = Maintenance::spawn(
            Arc::clone(&self.sessions),
            SweepSettings::from_config(&self.config),
        );
        *self.maintenance.lock() = Some(maintenance);
        info!(mode = %self.config.engine.mode, "Host started");
        Ok(())
    }

    async fn bring_up(&self) -> Result<(), HostError> {
        let env = self
            .registry
            .ensure(&self.installation, &self.config.environments.default_name)
            .await?;
        self.coordinator
            .initialize(&self.installation, &env, self.config.engine.mode)
            .await?;
        Ok(())
    }

    /// Stops maintenance, terminates every live session and stops the
    /// runtime. Safe to call more than once.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.stop().await;
        }

        self.coordinator.stop_execution();
        let live: Vec<_> = self
            .sessions
            .list_sessions()
            .into_iter()
            .filter(|s| !s.is_terminated())
            .collect();
        for session in &live {
            if let Err(e) = self.sessions.terminate_session(&session.id).await {
                warn!(session = %session.id, error = %e, "Failed to terminate session during shutdown");
            }
        }

        self.coordinator.shutdown().await;
        info!(sessions = live.len(), "Host stopped");
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EmberConfig {
        &self.config
    }

    pub fn installation(&self) -> &RuntimeInstallation {
        &self.installation
    }

    pub fn coordinator(&self) -> &Arc<RuntimeCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Returns an error unless [`start`](Self::start) succeeded.
    ///
    /// # Errors
    ///
    /// [`HostError::NotStarted`] before `start` or after `shutdown`.
    pub fn ensure_started(&self) -> Result<(), HostError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(HostError::NotStarted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RuntimeState;
    use crate::testing::RecordingPackages;
    use ember_types::{assert_error_codes, EngineMode, SessionId};
    use tempfile::TempDir;

    fn config(temp: &TempDir, mode: EngineMode) -> EmberConfig {
        let mut config = EmberConfig::default();
        config.engine.mode = mode;
        config.environments.root = Some(temp.path().to_path_buf());
        config
    }

    fn host(temp: &TempDir, mode: EngineMode) -> Host {
        Host::builder(config(temp, mode))
            .packages(Arc::new(RecordingPackages::new()))
            .build()
    }

    #[test]
    fn all_error_codes_follow_convention() {
        assert_error_codes(
            &[
                HostError::AlreadyStarted,
                HostError::NotStarted,
                HostError::Environment(EnvironmentError::ResourceBusy("x".into())),
                HostError::Runtime(CoordinatorError::NotInitialized),
                HostError::Session(SessionError::NotFound(SessionId::new())),
            ],
            "HOST_",
        );
    }

    #[tokio::test]
    async fn start_creates_default_environment_and_runtime() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp, EngineMode::MultiUser);
        assert!(matches!(host.ensure_started(), Err(HostError::NotStarted)));

        host.start().await.unwrap();
        assert!(host.is_started());
        assert_eq!(host.coordinator().state(), RuntimeState::Ready);
        let default = host.registry().get_by_name("default").unwrap();
        assert_eq!(host.coordinator().active_environment(), Some(default.id));

        host.shutdown().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp, EngineMode::SingleUser);
        host.start().await.unwrap();
        assert!(matches!(host.start().await, Err(HostError::AlreadyStarted)));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_terminates_sessions_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp, EngineMode::MultiUser);
        host.start().await.unwrap();
        let session = host.sessions().create_session("alice", None).await.unwrap();

        host.shutdown().await;
        host.shutdown().await;

        assert!(!host.is_started());
        assert!(host.sessions().get_session(&session.id).unwrap().is_terminated());
        assert_eq!(host.coordinator().state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn host_can_restart_after_shutdown() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp, EngineMode::MultiUser);
        host.start().await.unwrap();
        host.shutdown().await;

        host.start().await.unwrap();
        let session = host.sessions().create_session("bob", None).await.unwrap();
        let result = host
            .engine()
            .execute_code("return 40 + 2", &session.id, None)
            .await;
        assert_eq!(result.value, Some(serde_json::json!(42)));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn unavailable_installation_fails_start() {
        let temp = TempDir::new().unwrap();
        let mut broken = RuntimeInstallation::embedded();
        broken.available = false;
        broken.status = "missing".into();
        let host = Host::builder(config(&temp, EngineMode::MultiUser))
            .installation(broken)
            .packages(Arc::new(RecordingPackages::new()))
            .build();

        let err = host.start().await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Environment(EnvironmentError::Installation(_))
        ));
        assert!(!host.is_started());
    }
}
