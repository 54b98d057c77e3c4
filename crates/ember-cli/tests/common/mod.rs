//! Shared E2E test helpers for `ember` binary tests.

use assert_cmd::cargo::cargo_bin_cmd;
use std::time::Duration;

/// Default timeout for CLI tests.
pub const TIMEOUT_BASIC: Duration = Duration::from_secs(20);

/// Build a Command for the `ember` binary isolated in a tempdir.
///
/// Config and environments live in the tempdir; no user config is read.
/// Returns (command, _guard) — keep the guard alive for the test's duration.
pub fn ember_cmd() -> (assert_cmd::Command, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create temp dir for ember state");
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("ember");
    cmd.timeout(TIMEOUT_BASIC);
    for var in [
        "EMBER_DEBUG",
        "EMBER_MODE",
        "EMBER_TIMEOUT_MS",
        "EMBER_SANDBOXED",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("EMBER_ENV_ROOT", tmp.path().join("environments"));
    cmd.current_dir(tmp.path());
    cmd.args([
        "--config",
        tmp.path()
            .join("config.toml")
            .to_str()
            .expect("valid utf8"),
    ]);
    (cmd, tmp)
}
