//! The environment table.
//!
//! All bookkeeping happens under one `parking_lot::RwLock`, which is never
//! held across an `.await` or a filesystem walk. Binding and eviction take
//! the same write lock, so an environment observed empty by eviction
//! cannot gain a session before it is removed.

use super::{
    linked_binary, module_dir, Environment, EnvironmentDefinition, EnvironmentError,
    EnvironmentSource, Manifest,
};
use crate::config::RemovalPolicy;
use crate::installation::RuntimeInstallation;
use crate::package::{PackageOperations, PackageOutcome};
use chrono::{DateTime, Utc};
use ember_types::{EnvironmentId, SessionId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts made by [`EnvironmentRegistry::ensure`] while a concurrent
/// creation of the same name is in flight.
const ENSURE_ATTEMPTS: usize = 50;
const ENSURE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Outcome of [`EnvironmentRegistry::evict_idle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Environments removed from the table.
    pub evicted: Vec<EnvironmentId>,
    /// On-disk removals that failed, with the reason. The environment is
    /// still evicted from the table.
    pub failures: Vec<(EnvironmentId, String)>,
}

impl EvictionReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    environments: HashMap<EnvironmentId, Environment>,
    /// Paths with a creation in flight.
    creating: HashSet<PathBuf>,
}

/// Owns every tracked [`Environment`].
///
/// # Example
///
/// ```no_run
/// use ember_runtime::environment::{EnvironmentRegistry, EnvironmentSource};
/// use ember_runtime::installation::RuntimeInstallation;
/// use ember_runtime::testing::RecordingPackages;
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), ember_runtime::environment::EnvironmentError> {
/// let registry = EnvironmentRegistry::new("/tmp/envs", Arc::new(RecordingPackages::new()));
/// let env = registry
///     .create(&RuntimeInstallation::embedded(), EnvironmentSource::named("default"))
///     .await?;
/// assert!(registry.get_by_name("default").is_some());
/// # let _ = env;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EnvironmentRegistry {
    root: PathBuf,
    removal: RemovalPolicy,
    packages: Arc<dyn PackageOperations>,
    inner: RwLock<Inner>,
}

/// Clears a path from `creating` when creation finishes or is abandoned.
struct CreationGuard<'a> {
    inner: &'a RwLock<Inner>,
    path: PathBuf,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.inner.write().creating.remove(&self.path);
    }
}

impl EnvironmentRegistry {
    /// Creates an empty registry placing new environments under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, packages: Arc<dyn PackageOperations>) -> Self {
        Self {
            root: root.into(),
            removal: RemovalPolicy::default(),
            packages,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Sets what eviction does on disk.
    #[must_use]
    pub fn with_removal_policy(mut self, removal: RemovalPolicy) -> Self {
        self.removal = removal;
        self
    }

    /// Directory new environments are created under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // === Creation ===

    /// Creates or adopts an environment.
    ///
    /// A [`EnvironmentSource::Definition`] targets `<root>/<name>` unless it
    /// names a path. An empty or missing directory is laid out fresh; a
    /// directory that already carries a manifest is adopted. Definition
    /// packages are then installed; failures are recorded in
    /// [`Environment::notes`] and do not fail creation.
    ///
    /// # Errors
    ///
    /// - [`EnvironmentError::PathInvalid`] if the path cannot hold an environment
    /// - [`EnvironmentError::BinaryMissing`] if an adopted environment lost its binary
    /// - [`EnvironmentError::AlreadyExists`] if the name or path is tracked
    /// - [`EnvironmentError::ResourceBusy`] if the path is being created concurrently
    /// - [`EnvironmentError::Installation`] if `installation` is unavailable
    pub async fn create(
        &self,
        installation: &RuntimeInstallation,
        source: EnvironmentSource,
    ) -> Result<Environment, EnvironmentError> {
        match source {
            EnvironmentSource::Definition(def) => self.create_from_definition(installation, def).await,
            EnvironmentSource::Path(path) => self.adopt(&path),
        }
    }

    /// Returns the environment named `name`, creating it if needed.
    ///
    /// A tracked environment that no longer validates and has no sessions
    /// is forgotten and rebuilt.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create); `PathInvalid` when the tracked
    /// environment is broken but still has sessions bound.
    pub async fn ensure(
        &self,
        installation: &RuntimeInstallation,
        name: &str,
    ) -> Result<Environment, EnvironmentError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if let Some(env) = self.get_by_name(name) {
                if env.is_valid() {
                    return Ok(env);
                }
                if !env.sessions.is_empty() {
                    return Err(EnvironmentError::PathInvalid {
                        path: env.path,
                        reason: "environment failed validation while sessions are bound".into(),
                    });
                }
                warn!(environment = %env.id, name, "Tracked environment failed validation, rebuilding");
                self.inner.write().environments.remove(&env.id);
            }

            match self
                .create(installation, EnvironmentSource::named(name))
                .await
            {
                Ok(env) => return Ok(env),
                Err(EnvironmentError::AlreadyExists(_) | EnvironmentError::ResourceBusy(_))
                    if attempt < ENSURE_ATTEMPTS =>
                {
                    debug!(name, attempt, "Environment creation in flight, retrying");
                    tokio::time::sleep(ENSURE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_from_definition(
        &self,
        installation: &RuntimeInstallation,
        def: EnvironmentDefinition,
    ) -> Result<Environment, EnvironmentError> {
        installation.ensure_available()?;

        let path = match &def.path {
            Some(path) => path.clone(),
            None => {
                if def.name.is_empty() || def.name.contains(['/', '\\']) || def.name.starts_with('.') {
                    return Err(EnvironmentError::PathInvalid {
                        path: self.root.join(&def.name),
                        reason: format!("'{}' is not a valid environment name", def.name),
                    });
                }
                self.root.join(&def.name)
            }
        };

        let _guard = {
            let mut inner = self.inner.write();
            if inner
                .environments
                .values()
                .any(|e| e.name == def.name || e.path == path)
            {
                return Err(EnvironmentError::AlreadyExists(def.name));
            }
            if !inner.creating.insert(path.clone()) {
                return Err(EnvironmentError::ResourceBusy(format!(
                    "{} is being created",
                    def.name
                )));
            }
            CreationGuard {
                inner: &self.inner,
                path: path.clone(),
            }
        };

        let mut env = materialize(installation, &def, &path)?;

        for package in &def.packages {
            if env.packages.contains(package) {
                continue;
            }
            let outcome = self.packages.install(&path, package).await;
            if outcome.success {
                env.packages.push(package.clone());
            } else {
                warn!(environment = %env.id, package = %package, reason = %outcome.message, "Package install failed");
                env.notes.push(format!("install {package}: {}", outcome.message));
            }
        }
        Manifest::of(&env).write(&path)?;

        {
            let mut inner = self.inner.write();
            if inner.environments.values().any(|e| e.name == env.name) {
                return Err(EnvironmentError::AlreadyExists(env.name));
            }
            inner.environments.insert(env.id, env.clone());
        }

        info!(environment = %env.id, name = %env.name, path = %path.display(), "Environment created");
        Ok(env)
    }

    fn adopt(&self, path: &Path) -> Result<Environment, EnvironmentError> {
        let manifest = Manifest::read(path)?.ok_or_else(|| EnvironmentError::PathInvalid {
            path: path.to_path_buf(),
            reason: format!("missing {}", super::MANIFEST_FILE),
        })?;
        if let Some(binary) = linked_binary(path, manifest.base_binary.as_deref()) {
            if !binary.exists() {
                return Err(EnvironmentError::BinaryMissing(binary));
            }
        }

        let env = Environment::from_manifest(manifest, path.to_path_buf());
        let mut inner = self.inner.write();
        if inner.creating.contains(path) {
            return Err(EnvironmentError::ResourceBusy(env.name));
        }
        if inner.environments.contains_key(&env.id)
            || inner
                .environments
                .values()
                .any(|e| e.path == env.path || e.name == env.name)
        {
            return Err(EnvironmentError::AlreadyExists(env.name));
        }
        inner.environments.insert(env.id, env.clone());

        info!(environment = %env.id, name = %env.name, path = %path.display(), "Environment adopted");
        Ok(env)
    }

    // === Lookup ===

    #[must_use]
    pub fn get_by_id(&self, id: &EnvironmentId) -> Option<Environment> {
        self.inner.read().environments.get(id).cloned()
    }

    #[must_use]
    pub fn get_by_path(&self, path: &Path) -> Option<Environment> {
        self.inner
            .read()
            .environments
            .values()
            .find(|e| e.path == path)
            .cloned()
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Environment> {
        self.inner
            .read()
            .environments
            .values()
            .find(|e| e.name == name)
            .cloned()
    }

    /// All environments, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Environment> {
        let mut all: Vec<Environment> = self.inner.read().environments.values().cloned().collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().environments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Usage ===

    /// Records a use of the environment now.
    ///
    /// # Errors
    ///
    /// [`EnvironmentError::NotFound`] if the environment is not tracked.
    pub fn mark_used(&self, id: &EnvironmentId) -> Result<(), EnvironmentError> {
        let mut inner = self.inner.write();
        let env = inner
            .environments
            .get_mut(id)
            .ok_or(EnvironmentError::NotFound(*id))?;
        env.last_used = Utc::now();
        Ok(())
    }

    /// The unbound environment unused for the longest time.
    #[must_use]
    pub fn least_recently_used(&self) -> Option<Environment> {
        select_lru(self.inner.read().environments.values()).cloned()
    }

    /// Binds `session` to the environment and marks it used.
    ///
    /// # Errors
    ///
    /// [`EnvironmentError::NotFound`] if the environment is not tracked,
    /// for example because eviction removed it first.
    pub fn bind_session(
        &self,
        id: &EnvironmentId,
        session: SessionId,
    ) -> Result<(), EnvironmentError> {
        let mut inner = self.inner.write();
        let env = inner
            .environments
            .get_mut(id)
            .ok_or(EnvironmentError::NotFound(*id))?;
        if !env.sessions.contains(&session) {
            env.sessions.push(session);
        }
        env.last_used = Utc::now();
        debug!(environment = %id, session = %session, bound = env.sessions.len(), "Session bound");
        Ok(())
    }

    /// Removes `session` from the environment. Returns whether it was bound.
    pub fn unbind_session(&self, id: &EnvironmentId, session: &SessionId) -> bool {
        let mut inner = self.inner.write();
        let Some(env) = inner.environments.get_mut(id) else {
            return false;
        };
        let before = env.sessions.len();
        env.sessions.retain(|s| s != session);
        let removed = env.sessions.len() != before;
        if removed {
            env.last_used = Utc::now();
            debug!(environment = %id, session = %session, "Session unbound");
        }
        removed
    }

    // === Reclamation ===

    /// Evicts every environment idle for at least `max_idle` with no
    /// sessions bound.
    ///
    /// Selection and removal happen under one write lock. Directory
    /// removal (per [`RemovalPolicy`]) happens afterwards; a failure is
    /// logged, recorded in the report, and the sweep continues.
    pub fn evict_idle(&self, max_idle: Duration) -> EvictionReport {
        let now = Utc::now();
        let evicted: Vec<Environment> = {
            let mut inner = self.inner.write();
            let ids = idle_candidates(
                inner
                    .environments
                    .values()
                    .filter(|e| !inner.creating.contains(&e.path)),
                now,
                max_idle,
            );
            ids.iter()
                .filter_map(|id| inner.environments.remove(id))
                .collect()
        };

        let mut report = EvictionReport::default();
        for env in evicted {
            info!(environment = %env.id, name = %env.name, "Environment evicted");
            report.evicted.push(env.id);
            if self.removal == RemovalPolicy::DeleteManaged {
                if let Err(e) = self.remove_managed_dir(&env) {
                    warn!(environment = %env.id, error = %e, "Failed to remove evicted environment");
                    report.failures.push((env.id, e.to_string()));
                }
            }
        }
        report
    }

    /// Forgets an environment and deletes its directory if it lies under
    /// the registry root.
    ///
    /// # Errors
    ///
    /// - [`EnvironmentError::NotFound`] if not tracked
    /// - [`EnvironmentError::ResourceBusy`] while sessions are bound
    /// - [`EnvironmentError::Io`] if the directory cannot be removed
    ///   (the environment is already forgotten)
    pub fn destroy(&self, id: &EnvironmentId) -> Result<Environment, EnvironmentError> {
        let env = {
            let mut inner = self.inner.write();
            let env = inner
                .environments
                .get(id)
                .ok_or(EnvironmentError::NotFound(*id))?;
            if !env.sessions.is_empty() {
                return Err(EnvironmentError::ResourceBusy(format!(
                    "{} has {} bound session(s)",
                    env.name,
                    env.sessions.len()
                )));
            }
            inner
                .environments
                .remove(id)
                .ok_or(EnvironmentError::NotFound(*id))?
        };

        self.remove_managed_dir(&env)?;
        info!(environment = %env.id, name = %env.name, "Environment destroyed");
        Ok(env)
    }

    fn remove_managed_dir(&self, env: &Environment) -> Result<(), EnvironmentError> {
        if !env.path.starts_with(&self.root) || env.path == self.root {
            debug!(environment = %env.id, path = %env.path.display(), "Leaving unmanaged directory in place");
            return Ok(());
        }
        if !env.path.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&env.path).map_err(|e| EnvironmentError::io(&env.path, &e))
    }

    // === Packages ===

    /// Installs `package` and records it on success.
    ///
    /// # Errors
    ///
    /// [`EnvironmentError::NotFound`] if the environment is not tracked.
    pub async fn install_package(
        &self,
        id: &EnvironmentId,
        package: &str,
    ) -> Result<PackageOutcome, EnvironmentError> {
        let path = self.path_of(id)?;
        let outcome = self.packages.install(&path, package).await;
        if outcome.success {
            self.update_packages(id, |packages| {
                if !packages.iter().any(|p| p == package) {
                    packages.push(package.to_string());
                }
            })?;
        }
        Ok(outcome)
    }

    /// Upgrades `package`; the package list is unchanged.
    ///
    /// # Errors
    ///
    /// [`EnvironmentError::NotFound`] if the environment is not tracked.
    pub async fn upgrade_package(
        &self,
        id: &EnvironmentId,
        package: &str,
    ) -> Result<PackageOutcome, EnvironmentError> {
        let path = self.path_of(id)?;
        let outcome = self.packages.upgrade(&path, package).await;
        if outcome.success {
            self.update_packages(id, |packages| {
                if !packages.iter().any(|p| p == package) {
                    packages.push(package.to_string());
                }
            })?;
        }
        Ok(outcome)
    }

    /// Removes `package` and drops it from the list on success.
    ///
    /// # Errors
    ///
    /// [`EnvironmentError::NotFound`] if the environment is not tracked.
    pub async fn remove_package(
        &self,
        id: &EnvironmentId,
        package: &str,
    ) -> Result<PackageOutcome, EnvironmentError> {
        let path = self.path_of(id)?;
        let outcome = self.packages.remove(&path, package).await;
        if outcome.success {
            self.update_packages(id, |packages| packages.retain(|p| p != package))?;
        }
        Ok(outcome)
    }

    fn path_of(&self, id: &EnvironmentId) -> Result<PathBuf, EnvironmentError> {
        self.inner
            .read()
            .environments
            .get(id)
            .map(|e| e.path.clone())
            .ok_or(EnvironmentError::NotFound(*id))
    }

    fn update_packages(
        &self,
        id: &EnvironmentId,
        update: impl FnOnce(&mut Vec<String>),
    ) -> Result<(), EnvironmentError> {
        let (manifest, path) = {
            let mut inner = self.inner.write();
            let env = inner
                .environments
                .get_mut(id)
                .ok_or(EnvironmentError::NotFound(*id))?;
            update(&mut env.packages);
            (Manifest::of(env), env.path.clone())
        };
        manifest.write(&path)
    }
}

/// Lays out (or adopts) the directory at `path`.
fn materialize(
    installation: &RuntimeInstallation,
    def: &EnvironmentDefinition,
    path: &Path,
) -> Result<Environment, EnvironmentError> {
    if path.exists() && !path.is_dir() {
        return Err(EnvironmentError::PathInvalid {
            path: path.to_path_buf(),
            reason: "not a directory".into(),
        });
    }

    if let Some(manifest) = Manifest::read(path)? {
        if let Some(binary) = linked_binary(path, manifest.base_binary.as_deref()) {
            if !binary.exists() {
                return Err(EnvironmentError::BinaryMissing(binary));
            }
        }
        debug!(path = %path.display(), "Adopting environment directory with existing manifest");
        let mut env = Environment::from_manifest(manifest, path.to_path_buf());
        env.name = def.name.clone();
        return Ok(env);
    }

    if path.is_dir() {
        let non_empty = std::fs::read_dir(path)
            .map_err(|e| EnvironmentError::io(path, &e))?
            .next()
            .is_some();
        if non_empty {
            return Err(EnvironmentError::PathInvalid {
                path: path.to_path_buf(),
                reason: format!("directory is not empty and has no {}", super::MANIFEST_FILE),
            });
        }
    }

    let version = installation.language_version().to_string();
    for dir in [
        module_dir(path, &version),
        path.join("lib").join("lua").join(&version),
        path.join("bin"),
    ] {
        std::fs::create_dir_all(&dir).map_err(|e| EnvironmentError::PathInvalid {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
    }

    if let Some(base) = installation.binary_path.as_deref() {
        if let Some(dest) = linked_binary(path, Some(base)) {
            link_binary(base, &dest).map_err(|e| EnvironmentError::io(&dest, &e))?;
        }
    }

    let now = Utc::now();
    Ok(Environment {
        id: EnvironmentId::new(),
        name: def.name.clone(),
        path: path.to_path_buf(),
        created_at: now,
        created_by: def.created_by.clone(),
        base_binary: installation.binary_path.clone(),
        language_version: version,
        packages: Vec::new(),
        sessions: Vec::new(),
        last_used: now,
        notes: Vec::new(),
    })
}

#[cfg(unix)]
fn link_binary(base: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.symlink_metadata().is_ok() {
        return Ok(());
    }
    std::os::unix::fs::symlink(base, dest)
}

#[cfg(not(unix))]
fn link_binary(base: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        return Ok(());
    }
    std::fs::copy(base, dest).map(|_| ())
}

/// Oldest `last_used` among environments with no sessions.
fn select_lru<'a>(envs: impl Iterator<Item = &'a Environment>) -> Option<&'a Environment> {
    envs.filter(|e| e.sessions.is_empty())
        .min_by_key(|e| e.last_used)
}

/// Ids of unbound environments idle for at least `max_idle` at `now`.
fn idle_candidates<'a>(
    envs: impl Iterator<Item = &'a Environment>,
    now: DateTime<Utc>,
    max_idle: Duration,
) -> Vec<EnvironmentId> {
    envs.filter(|e| e.sessions.is_empty() && e.idle_for(now) >= max_idle)
        .map(|e| e.id)
        .collect()
}
