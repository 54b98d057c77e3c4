//! Ember Runtime - session and environment orchestration for embedded Lua.
//!
//! One process hosts one Lua runtime. Many callers share it, each through
//! a session that looks like a private, stateful interpreter. This crate
//! is the layer that multiplexes those sessions onto the single runtime.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Frontend Layer                           │
//! │  (ember-cli: exec, run, repl, discover, save-config)         │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  host/        : Host, HostBuilder (owned object graph)       │
//! │  maintenance  : periodic session + environment reclamation   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  engine/      : ExecutionEngine, ExecutionResult             │
//! │  session/     : SessionManager, Session                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  coordinator/ : RuntimeCoordinator (gate, scopes, restart)   │
//! │  environment/ : EnvironmentRegistry, Environment             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  installation : InstallationCatalog, RuntimeInstallation     │
//! │  package      : PackageOperations, LuaRocksPackages          │
//! │  config/      : EmberConfig, ConfigLoader                    │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ember-types  : SessionId, EnvironmentId, ScopeId,           │
//! │                 EngineMode, ErrorCode                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! ## [`coordinator`] - The Runtime
//!
//! - [`RuntimeCoordinator`]: owns the Lua state behind one async gate;
//!   every native call goes through [`RuntimeCoordinator::with_scope`]
//! - Scopes: one per session in MultiUser mode, one shared in SingleUser
//!
//! ## [`environment`] - Dependency Environments
//!
//! - [`EnvironmentRegistry`]: creation, lookup, LRU selection, idle eviction
//! - [`Environment`]: an isolated module tree derived from an installation
//!
//! ## [`session`] - Caller Sessions
//!
//! - [`SessionManager`]: session table, environment binding, per-session
//!   serialization, output buffers, idle cleanup
//!
//! ## [`engine`] - Execution
//!
//! - [`ExecutionEngine`]: code, files, commands, batches, variables,
//!   generators; timeouts, cancellation and profiling
//!
//! ## [`host`] - Wiring
//!
//! - [`Host`]: builds the graph from [`EmberConfig`], starts and stops it
//!
//! # Locking
//!
//! The gate (`tokio::sync::Mutex`) and the per-session lock are the only
//! locks held across `.await`. Tables use `parking_lot` locks that are
//! released before any native call.

pub mod config;
mod convert;
pub mod coordinator;
pub mod engine;
pub mod environment;
pub mod host;
pub mod installation;
pub mod maintenance;
pub mod package;
pub mod session;
pub mod testing;

pub use config::{
    default_config_dir, default_config_path, save_config, save_global_config, ConfigError,
    ConfigLoader, EmberConfig, EngineConfig, EnvironmentsConfig, InstallationsConfig,
    RemovalPolicy, SessionsConfig,
};
pub use coordinator::{
    CoordinatorError, RuntimeCoordinator, RuntimeState, ScopeContext, VmOptions,
};
pub use engine::{ExecutionEngine, ExecutionError, ExecutionFailure, ExecutionResult, Profile};
pub use environment::{
    Environment, EnvironmentDefinition, EnvironmentError, EnvironmentRegistry, EnvironmentSource,
    EvictionReport,
};
pub use host::{Host, HostBuilder, HostError};
pub use installation::{
    CommandLauncher, InstallationCatalog, InstallationError, ProcessLauncher, ProcessOutput,
    RuntimeInstallation,
};
pub use maintenance::{Maintenance, SweepReport, SweepSettings};
pub use package::{LuaRocksPackages, PackageOperations, PackageOutcome};
pub use session::{CleanupReport, Session, SessionError, SessionManager};

pub use ember_types::{EngineMode, EnvironmentId, ErrorCode, ScopeId, SessionId, SessionStatus};
