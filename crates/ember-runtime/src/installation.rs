//! Runtime installations: discovery, probing and status refresh.
//!
//! A [`RuntimeInstallation`] describes one Lua distribution on disk, or
//! the vendored runtime linked into this process. Environments are
//! derived from an installation; the coordinator always executes code in
//! the embedded runtime, while external installations provide the binary
//! linked into an environment and the interpreter package tooling builds
//! against.
//!
//! Probing goes through the [`ProcessLauncher`] seam so tests can answer
//! with canned output instead of spawning processes.

use async_trait::async_trait;
use ember_types::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Binary names probed in each search directory, in preference order.
pub const BINARY_NAMES: &[&str] = &["lua5.4", "lua54", "lua", "luajit"];

/// Chunk passed to `-e` when probing a binary.
///
/// Prints the `_VERSION` string, then the pointer width in bits
/// (`0` on runtimes without `string.packsize`).
pub const PROBE_SCRIPT: &str =
    "print(_VERSION); print(string.packsize and string.packsize('T')*8 or 0)";

/// Captured result of running an external process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    /// Exit status was success.
    pub success: bool,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Successful exit with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Exit code 1 with the given stderr.
    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs on behalf of ember.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + std::fmt::Debug {
    /// Runs `program` with `args`, optionally inside `cwd`, to completion.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the process cannot be spawned.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<ProcessOutput>;
}

/// [`ProcessLauncher`] backed by `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<ProcessOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(program = %program.display(), ?args, "Launching process");
        let output = cmd.output().await?;

        Ok(ProcessOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Installation errors.
#[derive(Debug, Clone, Error)]
pub enum InstallationError {
    /// No binary exists at the given path.
    #[error("installation binary not found: {0}")]
    NotFound(PathBuf),

    /// The installation was probed and is not usable.
    #[error("installation '{name}' is unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

impl ErrorCode for InstallationError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "INSTALL_NOT_FOUND",
            Self::Unavailable { .. } => "INSTALL_UNAVAILABLE",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// One runtime distribution.
///
/// Only `available` and `status` change after the record is created
/// (see [`InstallationCatalog::refresh`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInstallation {
    /// Installation prefix (the directory above `bin/`).
    pub install_path: PathBuf,
    /// Interpreter binary; `None` for the embedded runtime.
    pub binary_path: Option<PathBuf>,
    /// `_VERSION` as reported by the runtime, e.g. `"Lua 5.4"`.
    pub version: String,
    /// Pointer width in bits, `0` when unknown.
    pub bitness: u32,
    /// Where the installation keeps its pure-Lua modules.
    pub packages_path: PathBuf,
    pub available: bool,
    /// Human-readable status, the probe error when unavailable.
    pub status: String,
}

impl RuntimeInstallation {
    /// The runtime vendored into this process. Always available.
    #[must_use]
    pub fn embedded() -> Self {
        Self {
            install_path: PathBuf::new(),
            binary_path: None,
            version: "Lua 5.4".into(),
            bitness: usize::BITS,
            packages_path: PathBuf::new(),
            available: true,
            status: "embedded".into(),
        }
    }

    /// Returns `true` for the in-process runtime.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        self.binary_path.is_none()
    }

    /// Language version without the `Lua ` prefix, e.g. `"5.4"`.
    #[must_use]
    pub fn language_version(&self) -> &str {
        self.version
            .split_whitespace()
            .last()
            .unwrap_or(self.version.as_str())
    }

    /// Short display name: the binary path, or `embedded`.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.binary_path {
            Some(path) => path.display().to_string(),
            None => "embedded".into(),
        }
    }

    /// Fails unless the installation was last probed as usable.
    ///
    /// # Errors
    ///
    /// Returns [`InstallationError::Unavailable`] with the recorded status.
    pub fn ensure_available(&self) -> Result<(), InstallationError> {
        if self.available {
            Ok(())
        } else {
            Err(InstallationError::Unavailable {
                name: self.name(),
                reason: self.status.clone(),
            })
        }
    }

    fn from_binary(binary: &Path) -> Self {
        let parent = binary.parent().unwrap_or_else(|| Path::new(""));
        let install_path = if parent.file_name().is_some_and(|n| n == "bin") {
            parent.parent().unwrap_or(parent).to_path_buf()
        } else {
            parent.to_path_buf()
        };
        Self {
            packages_path: install_path.join("share").join("lua"),
            install_path,
            binary_path: Some(binary.to_path_buf()),
            version: String::new(),
            bitness: 0,
            available: false,
            status: "not probed".into(),
        }
    }
}

/// Discovers and probes installations through a [`ProcessLauncher`].
#[derive(Debug, Clone)]
pub struct InstallationCatalog {
    launcher: Arc<dyn ProcessLauncher>,
}

impl InstallationCatalog {
    /// Creates a catalog that probes with `launcher`.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }

    /// Scans each directory (and its `bin/`) for known binary names.
    ///
    /// Every candidate is probed; failures are recorded as unavailable
    /// installations rather than dropped. A binary reachable through
    /// several paths is recorded once.
    pub async fn discover(&self, search_dirs: &[PathBuf]) -> Vec<RuntimeInstallation> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for dir in search_dirs {
            for candidate_dir in [dir.clone(), dir.join("bin")] {
                for name in BINARY_NAMES {
                    let binary = candidate_dir.join(name);
                    if !binary.is_file() {
                        continue;
                    }
                    let canonical = std::fs::canonicalize(&binary).unwrap_or_else(|_| binary.clone());
                    if !seen.insert(canonical) {
                        debug!(binary = %binary.display(), "Skipping duplicate installation");
                        continue;
                    }
                    found.push(self.probe(&binary).await);
                }
            }
        }

        info!(count = found.len(), "Installation discovery finished");
        found
    }

    /// Probes one binary. Never fails; see `available` and `status`.
    pub async fn probe(&self, binary: &Path) -> RuntimeInstallation {
        let mut installation = RuntimeInstallation::from_binary(binary);
        self.refresh(&mut installation).await;
        installation
    }

    /// Probes one binary, failing when it is missing or unusable.
    ///
    /// # Errors
    ///
    /// [`InstallationError::NotFound`] when no file exists at `binary`,
    /// [`InstallationError::Unavailable`] when the probe fails.
    pub async fn inspect(&self, binary: &Path) -> Result<RuntimeInstallation, InstallationError> {
        if !binary.is_file() {
            return Err(InstallationError::NotFound(binary.to_path_buf()));
        }
        let installation = self.probe(binary).await;
        installation.ensure_available()?;
        Ok(installation)
    }

    /// Re-probes `installation`, updating version, bitness and status.
    ///
    /// The embedded installation is left untouched.
    pub async fn refresh(&self, installation: &mut RuntimeInstallation) {
        let Some(binary) = installation.binary_path.clone() else {
            return;
        };

        let args = vec!["-e".to_string(), PROBE_SCRIPT.to_string()];
        match self.launcher.run(&binary, &args, None).await {
            Ok(output) if output.success => match parse_probe(&output.stdout) {
                Some((version, bitness)) => {
                    installation.version = version;
                    installation.bitness = bitness;
                    installation.available = true;
                    installation.status = "ok".into();
                }
                None => {
                    installation.available = false;
                    installation.status =
                        format!("unrecognized probe output: {}", output.stdout.trim());
                }
            },
            Ok(output) => {
                installation.available = false;
                installation.status = if output.stderr.trim().is_empty() {
                    format!("probe exited with {:?}", output.code)
                } else {
                    output.stderr.trim().to_string()
                };
            }
            Err(e) => {
                installation.available = false;
                installation.status = e.to_string();
            }
        }

        debug!(
            binary = %binary.display(),
            available = installation.available,
            status = %installation.status,
            "Probed installation"
        );
    }
}

fn parse_probe(stdout: &str) -> Option<(String, u32)> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let version = lines.next()?;
    if !version.starts_with("Lua") {
        return None;
    }
    let bitness = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
    Some((version.to_string(), bitness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticLauncher;
    use ember_types::assert_error_codes;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn embedded_is_available() {
        let embedded = RuntimeInstallation::embedded();
        assert!(embedded.is_embedded());
        assert!(embedded.ensure_available().is_ok());
        assert_eq!(embedded.language_version(), "5.4");
    }

    #[test]
    fn parse_probe_output() {
        assert_eq!(
            parse_probe("Lua 5.4\n64\n"),
            Some(("Lua 5.4".to_string(), 64))
        );
        assert_eq!(parse_probe("Lua 5.1\n0\n"), Some(("Lua 5.1".to_string(), 0)));
        assert_eq!(parse_probe("Lua 5.3"), Some(("Lua 5.3".to_string(), 0)));
        assert_eq!(parse_probe("Python 3.12\n"), None);
        assert_eq!(parse_probe(""), None);
    }

    #[test]
    fn install_path_strips_bin() {
        let inst = RuntimeInstallation::from_binary(Path::new("/opt/lua/bin/lua5.4"));
        assert_eq!(inst.install_path, PathBuf::from("/opt/lua"));
        assert_eq!(inst.packages_path, PathBuf::from("/opt/lua/share/lua"));
    }

    #[tokio::test]
    async fn discover_probes_candidates() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("bin").join("lua5.4"));
        touch(&temp.path().join("luajit"));

        let launcher = StaticLauncher::new()
            .respond("lua5.4", ProcessOutput::ok("Lua 5.4\n64\n"))
            .respond("luajit", ProcessOutput::failed("luajit: bad option"));
        let catalog = InstallationCatalog::new(Arc::new(launcher));

        let found = catalog.discover(&[temp.path().to_path_buf()]).await;
        assert_eq!(found.len(), 2);

        let lua = found.iter().find(|i| i.available).unwrap();
        assert_eq!(lua.version, "Lua 5.4");
        assert_eq!(lua.bitness, 64);
        assert_eq!(lua.install_path, temp.path());

        let jit = found.iter().find(|i| !i.available).unwrap();
        assert_eq!(jit.status, "luajit: bad option");
    }

    #[tokio::test]
    async fn discover_records_duplicate_dirs_once() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("lua"));

        let launcher = StaticLauncher::new().respond("lua", ProcessOutput::ok("Lua 5.4\n64\n"));
        let catalog = InstallationCatalog::new(Arc::new(launcher));

        let dir = temp.path().to_path_buf();
        let found = catalog.discover(&[dir.clone(), dir]).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn refresh_updates_status_only() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("lua");
        touch(&binary);

        let launcher = Arc::new(StaticLauncher::new().respond("lua", ProcessOutput::ok("Lua 5.4\n64")));
        let catalog = InstallationCatalog::new(launcher.clone());
        let mut inst = catalog.probe(&binary).await;
        assert!(inst.available);

        launcher.set_response("lua", ProcessOutput::failed("segfault"));
        catalog.refresh(&mut inst).await;
        assert!(!inst.available);
        assert_eq!(inst.status, "segfault");
        assert_eq!(inst.binary_path.as_deref(), Some(binary.as_path()));
    }

    #[tokio::test]
    async fn inspect_missing_binary() {
        let catalog = InstallationCatalog::new(Arc::new(StaticLauncher::new()));
        let err = catalog
            .inspect(Path::new("/nonexistent/bin/lua"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallationError::NotFound(_)));
    }

    #[test]
    fn all_error_codes_follow_convention() {
        assert_error_codes(
            &[
                InstallationError::NotFound(PathBuf::from("/x")),
                InstallationError::Unavailable {
                    name: "x".into(),
                    reason: "y".into(),
                },
            ],
            "INSTALL_",
        );
    }
}
