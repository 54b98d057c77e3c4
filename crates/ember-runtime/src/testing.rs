//! Deterministic collaborators for tests.
//!
//! - [`StaticLauncher`] answers process launches with canned output
//! - [`RecordingPackages`] records package operations in memory
//!
//! # Example
//!
//! ```
//! use ember_runtime::installation::ProcessOutput;
//! use ember_runtime::testing::StaticLauncher;
//!
//! let launcher = StaticLauncher::new().respond("lua5.4", ProcessOutput::ok("Lua 5.4\n64\n"));
//! assert!(launcher.calls().is_empty());
//! ```

use crate::installation::{ProcessLauncher, ProcessOutput};
use crate::package::{PackageOperations, PackageOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A recorded launch: program and arguments.
pub type LaunchRecord = (PathBuf, Vec<String>);

/// [`ProcessLauncher`] that never spawns anything.
///
/// Responses are keyed by the program's file name. Launching an unknown
/// program fails with `NotFound`, like a missing binary would.
#[derive(Debug, Default)]
pub struct StaticLauncher {
    responses: Mutex<HashMap<String, ProcessOutput>>,
    calls: Mutex<Vec<LaunchRecord>>,
}

impl StaticLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the output returned for `program`.
    #[must_use]
    pub fn respond(self, program: &str, output: ProcessOutput) -> Self {
        self.set_response(program, output);
        self
    }

    /// Replaces the output returned for `program`.
    pub fn set_response(&self, program: &str, output: ProcessOutput) {
        self.responses.lock().insert(program.to_string(), output);
    }

    /// Every launch so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<LaunchRecord> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProcessLauncher for StaticLauncher {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _cwd: Option<&Path>,
    ) -> std::io::Result<ProcessOutput> {
        self.calls.lock().push((program.to_path_buf(), args.to_vec()));

        let key = program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.responses.lock().get(&key).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such program: {}", program.display()),
            )
        })
    }
}

/// Kind of a recorded package operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOp {
    Install,
    Upgrade,
    Remove,
}

/// In-memory [`PackageOperations`].
///
/// Succeeds for every package except those registered with
/// [`RecordingPackages::fail_on`].
#[derive(Debug, Default)]
pub struct RecordingPackages {
    failing: Mutex<HashSet<String>>,
    log: Mutex<Vec<(PackageOp, PathBuf, String)>>,
}

impl RecordingPackages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation on `package` fail.
    #[must_use]
    pub fn fail_on(self, package: &str) -> Self {
        self.failing.lock().insert(package.to_string());
        self
    }

    /// Recorded operations, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<(PackageOp, PathBuf, String)> {
        self.log.lock().clone()
    }

    fn record(&self, op: PackageOp, env_path: &Path, package: &str) -> PackageOutcome {
        self.log
            .lock()
            .push((op, env_path.to_path_buf(), package.to_string()));
        if self.failing.lock().contains(package) {
            PackageOutcome::failed(format!("{package}: simulated failure"))
        } else {
            PackageOutcome::ok(format!("{op:?} {package}"))
        }
    }
}

#[async_trait]
impl PackageOperations for RecordingPackages {
    async fn install(&self, env_path: &Path, package: &str) -> PackageOutcome {
        self.record(PackageOp::Install, env_path, package)
    }

    async fn upgrade(&self, env_path: &Path, package: &str) -> PackageOutcome {
        self.record(PackageOp::Upgrade, env_path, package)
    }

    async fn remove(&self, env_path: &Path, package: &str) -> PackageOutcome {
        self.record(PackageOp::Remove, env_path, package)
    }
}
