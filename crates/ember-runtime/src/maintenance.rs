//! Background reclamation of idle sessions and environments.
//!
//! Each tick runs [`SessionManager::perform_session_cleanup`] and then
//! [`EnvironmentRegistry::evict_idle`](crate::environment::EnvironmentRegistry::evict_idle),
//! so environments emptied by the session sweep become eligible in the
//! same pass once they have been idle long enough.

use crate::config::EmberConfig;
use crate::environment::EvictionReport;
use crate::session::{CleanupReport, SessionManager};
use ember_types::EngineMode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Thresholds and cadence of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub session_max_idle: Duration,
    pub environment_max_idle: Duration,
}

impl SweepSettings {
    #[must_use]
    pub fn from_config(config: &EmberConfig) -> Self {
        Self {
            interval: config.sessions.sweep_interval(),
            session_max_idle: config.sessions.max_idle(),
            environment_max_idle: config.environments.max_idle(),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: CleanupReport,
    pub environments: EvictionReport,
}

/// Runs one sweep now.
pub async fn sweep(sessions: &SessionManager, settings: &SweepSettings) -> SweepReport {
    let cleanup = sessions
        .perform_session_cleanup(settings.session_max_idle)
        .await;
    let coordinator = sessions.coordinator();
    if coordinator.mode() == Some(EngineMode::SingleUser) {
        // The loaded environment stays resident while the runtime uses it
        if let Some(active) = coordinator.active_environment() {
            let _ = sessions.registry().mark_used(&active);
        }
    }
    let eviction = sessions
        .registry()
        .evict_idle(settings.environment_max_idle);
    SweepReport {
        sessions: cleanup,
        environments: eviction,
    }
}

/// Handle to the running sweep task.
#[derive(Debug)]
pub struct Maintenance {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Maintenance {
    /// Spawns the periodic sweep on the current runtime.
    ///
    /// The first sweep happens one interval after spawning.
    #[must_use]
    pub fn spawn(sessions: Arc<SessionManager>, settings: SweepSettings) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = sweep(&sessions, &settings).await;
                        if !report.sessions.is_empty() || !report.environments.is_empty() {
                            debug!(
                                terminated = report.sessions.terminated.len(),
                                purged = report.sessions.purged.len(),
                                evicted = report.environments.evicted.len(),
                                failures = report.environments.failures.len(),
                                "Maintenance sweep"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Maintenance stopped");
        });
        info!(interval = ?settings.interval, "Maintenance started");
        Self { shutdown, handle }
    }

    /// Signals the task and waits for the sweep in progress, if any, to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
    }
}
