//! Configuration types.
//!
//! All types implement [`Default`] for compile-time fallback values.

use crate::installation::RuntimeInstallation;
use ember_types::EngineMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
///
/// This is the unified configuration after merging all layers.
///
/// # Example
///
/// ```
/// use ember_runtime::config::EmberConfig;
/// use ember_types::EngineMode;
///
/// let config = EmberConfig::default();
/// assert!(!config.debug);
/// assert_eq!(config.engine.mode, EngineMode::MultiUser);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmberConfig {
    /// Enable debug mode (verbose logging).
    pub debug: bool,

    /// Engine behavior.
    pub engine: EngineConfig,

    /// Environment registry settings.
    pub environments: EnvironmentsConfig,

    /// Session manager settings.
    pub sessions: SessionsConfig,

    /// Known and discoverable runtime installations.
    pub installations: InstallationsConfig,
}

impl EmberConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Merges another config into this one.
    ///
    /// Values from `other` override values in `self` only if they
    /// differ from the default.
    pub fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.debug != default.debug {
            self.debug = other.debug;
        }

        self.engine.merge(&other.engine);
        self.environments.merge(&other.environments);
        self.sessions.merge(&other.sessions);
        self.installations.merge(&other.installations);
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Session sharing mode, fixed for the lifetime of the runtime.
    pub mode: EngineMode,

    /// Timeout applied when a caller does not pass one.
    pub default_timeout_ms: u64,

    /// Instructions between cancellation checks.
    pub cancel_check_instructions: u32,

    /// Restrict scopes to the safe standard library.
    ///
    /// When `false`, scopes fall through to the full global table
    /// (`io`, `os.execute`, `load` ...).
    pub sandboxed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::MultiUser,
            default_timeout_ms: 30_000,
            cancel_check_instructions: 1_000,
            sandboxed: true,
        }
    }
}

impl EngineConfig {
    /// Default timeout as a [`Duration`].
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.mode != default.mode {
            self.mode = other.mode;
        }
        if other.default_timeout_ms != default.default_timeout_ms {
            self.default_timeout_ms = other.default_timeout_ms;
        }
        if other.cancel_check_instructions != default.cancel_check_instructions {
            self.cancel_check_instructions = other.cancel_check_instructions;
        }
        if other.sandboxed != default.sandboxed {
            self.sandboxed = other.sandboxed;
        }
    }
}

/// What eviction does with an environment's directory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Forget the environment; leave files on disk.
    #[default]
    Keep,
    /// Delete the directory, but only when it lies under the environment root.
    DeleteManaged,
}

/// Environment registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentsConfig {
    /// Directory new environments are created under.
    ///
    /// When `None`, defaults to `~/.ember/environments`.
    pub root: Option<PathBuf>,

    /// Name used when a session does not request an environment.
    pub default_name: String,

    /// Idle time after which an unbound environment is evicted.
    pub max_idle_secs: u64,

    /// On-disk handling of evicted environments.
    pub removal: RemovalPolicy,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            root: None,
            default_name: "default".into(),
            max_idle_secs: 3_600,
            removal: RemovalPolicy::Keep,
        }
    }
}

impl EnvironmentsConfig {
    /// Returns the environment root with `~` expanded.
    #[must_use]
    pub fn resolved_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => expand_tilde(root),
            None => super::default_config_dir().join("environments"),
        }
    }

    /// Idle threshold as a [`Duration`].
    #[must_use]
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.root.is_some() {
            self.root = other.root.clone();
        }
        if other.default_name != default.default_name {
            self.default_name = other.default_name.clone();
        }
        if other.max_idle_secs != default.max_idle_secs {
            self.max_idle_secs = other.max_idle_secs;
        }
        if other.removal != default.removal {
            self.removal = other.removal;
        }
    }
}

/// Session manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Idle time after which a session is reclaimed by the sweep.
    pub max_idle_secs: u64,

    /// Seconds between background maintenance sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 1_800,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    /// Idle threshold as a [`Duration`].
    #[must_use]
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    /// Sweep interval as a [`Duration`]; never zero.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.max_idle_secs != default.max_idle_secs {
            self.max_idle_secs = other.max_idle_secs;
        }
        if other.sweep_interval_secs != default.sweep_interval_secs {
            self.sweep_interval_secs = other.sweep_interval_secs;
        }
    }
}

/// Runtime installation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstallationsConfig {
    /// Directories scanned by discovery.
    ///
    /// Supports `~` for the home directory.
    pub search_dirs: Vec<PathBuf>,

    /// Installations recorded by a previous discovery.
    pub known: Vec<RuntimeInstallation>,
}

impl InstallationsConfig {
    /// Returns search dirs with `~` expanded.
    #[must_use]
    pub fn resolved_search_dirs(&self) -> Vec<PathBuf> {
        self.search_dirs.iter().map(|d| expand_tilde(d)).collect()
    }

    /// Records `installation`, replacing any entry with the same binary.
    pub fn remember(&mut self, installation: RuntimeInstallation) {
        match self
            .known
            .iter_mut()
            .find(|k| k.binary_path == installation.binary_path)
        {
            Some(existing) => *existing = installation,
            None => self.known.push(installation),
        }
    }

    /// Accumulates dirs and installations (no duplicates).
    fn merge(&mut self, other: &Self) {
        for dir in &other.search_dirs {
            if !self.search_dirs.contains(dir) {
                self.search_dirs.push(dir.clone());
            }
        }
        for installation in &other.known {
            self.remember(installation.clone());
        }
    }
}

/// Expands `~` at the start of a path to the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EmberConfig::default();
        assert!(!config.debug);
        assert!(config.engine.sandboxed);
        assert_eq!(config.engine.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.environments.default_name, "default");
        assert_eq!(config.environments.removal, RemovalPolicy::Keep);
        assert!(config.installations.known.is_empty());
    }

    #[test]
    fn toml_roundtrip_with_installation() {
        let mut config = EmberConfig::default();
        config
            .installations
            .remember(RuntimeInstallation::embedded());
        let toml = config.to_toml().expect("should serialize config to TOML");
        let restored = EmberConfig::from_toml(&toml).expect("should deserialize roundtripped TOML");
        assert_eq!(config, restored);
    }

    #[test]
    fn toml_partial_parse() {
        let toml = r#"
debug = true

[engine]
mode = "single_user"

[environments]
removal = "delete_managed"
"#;
        let config = EmberConfig::from_toml(toml).expect("should parse partial TOML with defaults");
        assert!(config.debug);
        assert_eq!(config.engine.mode, EngineMode::SingleUser);
        assert_eq!(config.environments.removal, RemovalPolicy::DeleteManaged);
        // Unspecified fields keep defaults
        assert_eq!(config.engine.default_timeout_ms, 30_000);
        assert_eq!(config.sessions.sweep_interval_secs, 60);
    }

    #[test]
    fn merge_overrides_non_default() {
        let mut base = EmberConfig::default();
        let overlay = EmberConfig {
            engine: EngineConfig {
                mode: EngineMode::SingleUser,
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(&overlay);

        assert_eq!(base.engine.mode, EngineMode::SingleUser);
        assert!(base.engine.sandboxed);
    }

    #[test]
    fn merge_keeps_base_when_overlay_is_default() {
        let mut base = EmberConfig {
            debug: true,
            sessions: SessionsConfig {
                max_idle_secs: 5,
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(&EmberConfig::default());

        assert!(base.debug);
        assert_eq!(base.sessions.max_idle_secs, 5);
    }

    #[test]
    fn installations_merge_accumulates_without_duplicates() {
        let mut base = InstallationsConfig {
            search_dirs: vec![PathBuf::from("/usr/bin")],
            known: vec![RuntimeInstallation::embedded()],
        };
        let overlay = InstallationsConfig {
            search_dirs: vec![PathBuf::from("/usr/bin"), PathBuf::from("/opt/lua/bin")],
            known: vec![RuntimeInstallation::embedded()],
        };

        base.merge(&overlay);

        assert_eq!(base.search_dirs.len(), 2);
        assert_eq!(base.known.len(), 1);
    }

    #[test]
    fn sweep_interval_never_zero() {
        let sessions = SessionsConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(sessions.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn resolved_root_defaults_under_config_dir() {
        let root = EnvironmentsConfig::default().resolved_root();
        assert!(root.ends_with(".ember/environments"));
    }

    #[test]
    fn expand_tilde_with_home() {
        let expanded = expand_tilde(Path::new("~/.ember/environments"));
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with(".ember/environments"));
    }

    #[test]
    fn expand_tilde_absolute_unchanged() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_tilde(&path), path);
    }
}
