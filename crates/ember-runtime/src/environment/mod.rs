//! Isolated dependency environments.
//!
//! An environment is a directory derived from a [`RuntimeInstallation`]
//! holding its own module tree. Sessions bind to exactly one environment;
//! the registry reclaims environments nobody is bound to.
//!
//! # On-disk Layout
//!
//! ```text
//! <env>/
//! ├── ember-env.toml      # manifest: id, name, created_at, created_by, base binary
//! ├── bin/<binary>        # link to the base installation binary (if any)
//! ├── share/lua/<ver>/    # pure-Lua modules, searched by scope `require`
//! └── lib/lua/<ver>/      # native modules (installed by package tooling only)
//! ```
//!
//! [`RuntimeInstallation`]: crate::installation::RuntimeInstallation

mod error;
mod registry;

pub use error::EnvironmentError;
pub use registry::{EnvironmentRegistry, EvictionReport};

use chrono::{DateTime, Utc};
use ember_types::{EnvironmentId, SessionId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manifest file name at the environment root.
pub const MANIFEST_FILE: &str = "ember-env.toml";

/// A tracked environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Identity that created the environment.
    pub created_by: String,
    /// Binary of the base installation, `None` for the embedded runtime.
    pub base_binary: Option<PathBuf>,
    /// Lua language version, e.g. `"5.4"`.
    pub language_version: String,
    /// Packages successfully installed through the registry.
    pub packages: Vec<String>,
    /// Sessions currently bound. Every entry's session references this
    /// environment.
    pub sessions: Vec<SessionId>,
    pub last_used: DateTime<Utc>,
    /// Non-fatal problems recorded during creation (failed package installs).
    pub notes: Vec<String>,
}

impl Environment {
    /// Directory searched by scope `require`.
    #[must_use]
    pub fn module_dir(&self) -> PathBuf {
        module_dir(&self.path, &self.language_version)
    }

    /// Directory holding native modules.
    #[must_use]
    pub fn native_module_dir(&self) -> PathBuf {
        self.path.join("lib").join("lua").join(&self.language_version)
    }

    /// Path of the linked base binary inside `bin/`.
    #[must_use]
    pub fn linked_binary(&self) -> Option<PathBuf> {
        linked_binary(&self.path, self.base_binary.as_deref())
    }

    /// Path exists, manifest exists, and the expected binary exists.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.path.is_dir()
            && self.path.join(MANIFEST_FILE).is_file()
            && self.linked_binary().map_or(true, |b| b.exists())
    }

    /// Time since last use, zero if the clock went backwards.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_used).to_std().unwrap_or_default()
    }

    pub(crate) fn from_manifest(manifest: Manifest, path: PathBuf) -> Self {
        Self {
            id: manifest.id,
            name: manifest.name,
            path,
            created_at: manifest.created_at,
            created_by: manifest.created_by,
            base_binary: manifest.base_binary,
            language_version: manifest.language_version,
            packages: manifest.packages,
            sessions: Vec::new(),
            last_used: Utc::now(),
            notes: Vec::new(),
        }
    }
}

/// Where a new environment comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentSource {
    /// Build (or adopt) an environment from a definition.
    Definition(EnvironmentDefinition),
    /// Track an environment that already exists at this path.
    Path(PathBuf),
}

impl EnvironmentSource {
    /// Shorthand for a definition with just a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Definition(EnvironmentDefinition::new(name))
    }
}

/// Declarative description of an environment to create.
///
/// # Example
///
/// ```
/// use ember_runtime::environment::EnvironmentDefinition;
///
/// let def = EnvironmentDefinition::new("analysis")
///     .with_packages(["penlight", "lpeg"])
///     .created_by("alice");
/// assert_eq!(def.packages.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDefinition {
    pub name: String,
    pub packages: Vec<String>,
    /// Explicit location; defaults to `<root>/<name>`.
    pub path: Option<PathBuf>,
    pub created_by: String,
}

impl EnvironmentDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packages: Vec::new(),
            path: None,
            created_by: current_user(),
        }
    }

    #[must_use]
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }
}

/// Persisted part of an [`Environment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub id: EnvironmentId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub language_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_binary: Option<PathBuf>,
    #[serde(default)]
    pub packages: Vec<String>,
}

impl Manifest {
    pub fn of(env: &Environment) -> Self {
        Self {
            id: env.id,
            name: env.name.clone(),
            created_at: env.created_at,
            created_by: env.created_by.clone(),
            language_version: env.language_version.clone(),
            base_binary: env.base_binary.clone(),
            packages: env.packages.clone(),
        }
    }

    /// Reads `<dir>/ember-env.toml`; `Ok(None)` when absent.
    pub fn read(dir: &Path) -> Result<Option<Self>, EnvironmentError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| EnvironmentError::io(&path, &e))?;
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| EnvironmentError::PathInvalid {
                path,
                reason: format!("malformed manifest: {e}"),
            })
    }

    pub fn write(&self, dir: &Path) -> Result<(), EnvironmentError> {
        let path = dir.join(MANIFEST_FILE);
        let content = toml::to_string_pretty(self).map_err(|e| EnvironmentError::Io {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, content).map_err(|e| EnvironmentError::io(&path, &e))
    }
}

pub(crate) fn module_dir(env_path: &Path, language_version: &str) -> PathBuf {
    env_path.join("share").join("lua").join(language_version)
}

pub(crate) fn linked_binary(env_path: &Path, base_binary: Option<&Path>) -> Option<PathBuf> {
    let name = base_binary?.file_name()?;
    Some(env_path.join("bin").join(name))
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(path: PathBuf) -> Environment {
        Environment {
            id: EnvironmentId::new(),
            name: "sample".into(),
            path,
            created_at: Utc::now(),
            created_by: "tester".into(),
            base_binary: Some(PathBuf::from("/usr/bin/lua5.4")),
            language_version: "5.4".into(),
            packages: vec!["penlight".into()],
            sessions: Vec::new(),
            last_used: Utc::now(),
            notes: Vec::new(),
        }
    }

    #[test]
    fn layout_paths() {
        let env = sample(PathBuf::from("/envs/sample"));
        assert_eq!(env.module_dir(), PathBuf::from("/envs/sample/share/lua/5.4"));
        assert_eq!(env.native_module_dir(), PathBuf::from("/envs/sample/lib/lua/5.4"));
        assert_eq!(env.linked_binary(), Some(PathBuf::from("/envs/sample/bin/lua5.4")));
    }

    #[test]
    fn manifest_roundtrip_on_disk() {
        let temp = TempDir::new().unwrap();
        let env = sample(temp.path().to_path_buf());

        Manifest::of(&env).write(temp.path()).unwrap();
        let read = Manifest::read(temp.path()).unwrap().unwrap();

        assert_eq!(read, Manifest::of(&env));
        let restored = Environment::from_manifest(read, temp.path().to_path_buf());
        assert_eq!(restored.id, env.id);
        assert_eq!(restored.packages, env.packages);
    }

    #[test]
    fn manifest_absent_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(Manifest::read(temp.path()).unwrap().is_none());
    }

    #[test]
    fn malformed_manifest_is_path_invalid() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(MANIFEST_FILE), "id = [").unwrap();
        let err = Manifest::read(temp.path()).unwrap_err();
        assert!(matches!(err, EnvironmentError::PathInvalid { .. }));
    }

    #[test]
    fn validity_requires_linked_binary() {
        let temp = TempDir::new().unwrap();
        let env = sample(temp.path().to_path_buf());
        Manifest::of(&env).write(temp.path()).unwrap();
        assert!(!env.is_valid());

        std::fs::create_dir_all(temp.path().join("bin")).unwrap();
        std::fs::write(temp.path().join("bin").join("lua5.4"), b"").unwrap();
        assert!(env.is_valid());
    }

    #[test]
    fn idle_for_never_negative() {
        let mut env = sample(PathBuf::from("/x"));
        env.last_used = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(env.idle_for(Utc::now()), Duration::ZERO);
    }
}
