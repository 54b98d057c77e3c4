//! Package operations inside an environment.
//!
//! The registry never resolves dependencies itself; it forwards every
//! install, upgrade and removal to a [`PackageOperations`] implementation
//! and records the outcome. The default, [`LuaRocksPackages`], drives
//! `luarocks --tree <env>` through a [`ProcessLauncher`].

use crate::installation::{ProcessLauncher, ProcessOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Result of one package operation.
///
/// Failures are values, not errors: the registry logs them and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOutcome {
    pub success: bool,
    /// Tool output on success, the failure reason otherwise.
    pub message: String,
}

impl PackageOutcome {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Installs, upgrades and removes packages in an environment directory.
#[async_trait]
pub trait PackageOperations: Send + Sync + std::fmt::Debug {
    /// Installs `package` into the environment at `env_path`.
    async fn install(&self, env_path: &Path, package: &str) -> PackageOutcome;

    /// Upgrades `package` to its latest version.
    async fn upgrade(&self, env_path: &Path, package: &str) -> PackageOutcome;

    /// Removes `package` from the environment.
    async fn remove(&self, env_path: &Path, package: &str) -> PackageOutcome;
}

/// [`PackageOperations`] backed by the `luarocks` command-line tool.
#[derive(Debug, Clone)]
pub struct LuaRocksPackages {
    launcher: Arc<dyn ProcessLauncher>,
    luarocks: PathBuf,
    lua_version: String,
}

impl LuaRocksPackages {
    /// Uses `luarocks` from `PATH`, targeting Lua `lua_version` (e.g. `"5.4"`).
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, lua_version: impl Into<String>) -> Self {
        Self {
            launcher,
            luarocks: PathBuf::from("luarocks"),
            lua_version: lua_version.into(),
        }
    }

    /// Overrides the `luarocks` binary.
    #[must_use]
    pub fn with_binary(mut self, luarocks: impl Into<PathBuf>) -> Self {
        self.luarocks = luarocks.into();
        self
    }

    fn args(&self, env_path: &Path, verb: &str, package: &str) -> Vec<String> {
        vec![
            "--tree".into(),
            env_path.display().to_string(),
            "--lua-version".into(),
            self.lua_version.clone(),
            verb.into(),
            package.into(),
        ]
    }

    async fn run(&self, env_path: &Path, verb: &str, package: &str) -> PackageOutcome {
        let args = self.args(env_path, verb, package);
        debug!(env = %env_path.display(), verb, package, "Running luarocks");

        match self.launcher.run(&self.luarocks, &args, Some(env_path)).await {
            Ok(ProcessOutput {
                success: true,
                stdout,
                ..
            }) => PackageOutcome::ok(stdout.trim()),
            Ok(output) => {
                let reason = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                PackageOutcome::failed(format!("luarocks {verb} {package} failed: {reason}"))
            }
            Err(e) => PackageOutcome::failed(format!("failed to launch luarocks: {e}")),
        }
    }
}

#[async_trait]
impl PackageOperations for LuaRocksPackages {
    async fn install(&self, env_path: &Path, package: &str) -> PackageOutcome {
        self.run(env_path, "install", package).await
    }

    // luarocks has no upgrade verb; install resolves to the newest version.
    async fn upgrade(&self, env_path: &Path, package: &str) -> PackageOutcome {
        self.run(env_path, "install", package).await
    }

    async fn remove(&self, env_path: &Path, package: &str) -> PackageOutcome {
        self.run(env_path, "remove", package).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticLauncher;

    #[tokio::test]
    async fn install_passes_tree_and_version() {
        let launcher = Arc::new(
            StaticLauncher::new().respond("luarocks", ProcessOutput::ok("penlight 1.14 installed\n")),
        );
        let rocks = LuaRocksPackages::new(launcher.clone(), "5.4");

        let outcome = rocks.install(Path::new("/envs/a"), "penlight").await;
        assert!(outcome.success);
        assert_eq!(outcome.message, "penlight 1.14 installed");

        let calls = launcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].1,
            vec!["--tree", "/envs/a", "--lua-version", "5.4", "install", "penlight"]
        );
    }

    #[tokio::test]
    async fn failure_surfaces_stderr() {
        let launcher = Arc::new(
            StaticLauncher::new().respond("luarocks", ProcessOutput::failed("No results matching query")),
        );
        let rocks = LuaRocksPackages::new(launcher, "5.4");

        let outcome = rocks.remove(Path::new("/envs/a"), "nothing").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("No results matching query"));
        assert!(outcome.message.contains("remove nothing"));
    }

    #[tokio::test]
    async fn launch_error_is_a_failed_outcome() {
        // StaticLauncher reports NotFound for unknown binaries.
        let rocks = LuaRocksPackages::new(Arc::new(StaticLauncher::new()), "5.4")
            .with_binary("/missing/luarocks");

        let outcome = rocks.upgrade(Path::new("/envs/a"), "lpeg").await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("failed to launch luarocks"));
    }
}
