//! Configuration management with hierarchical layering.
//!
//! # Architecture
//!
//! Configuration is loaded from multiple sources with priority-based merging:
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌──────────────────────────────────────────┐
//! │  1. Environment Variables (EMBER_*)      │  Runtime override
//! ├──────────────────────────────────────────┤
//! │  2. Project Config (.ember/config.toml)  │  Project-specific
//! ├──────────────────────────────────────────┤
//! │  3. Global Config (~/.ember/config.toml) │  User defaults
//! ├──────────────────────────────────────────┤
//! │  4. Default Values (compile-time)        │  Fallback
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Directory Structure
//!
//! ```text
//! ~/.ember/                    # Global ember directory
//! ├── config.toml              # Global configuration
//! └── environments/            # Default environment root
//!     └── {name}/
//!         ├── ember-env.toml
//!         ├── bin/
//!         └── share/lua/5.4/
//!
//! <project>/.ember/
//! └── config.toml              # Project configuration (overrides global)
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Config Field | Type |
//! |----------|--------------|------|
//! | `EMBER_DEBUG` | `debug` | bool |
//! | `EMBER_MODE` | `engine.mode` | `single_user` / `multi_user` |
//! | `EMBER_TIMEOUT_MS` | `engine.default_timeout_ms` | u64 |
//! | `EMBER_SANDBOXED` | `engine.sandboxed` | bool |
//! | `EMBER_ENV_ROOT` | `environments.root` | PathBuf |
//!
//! # Example Configuration
//!
//! ```toml
//! # ~/.ember/config.toml
//! debug = false
//!
//! [engine]
//! mode = "multi_user"
//! default_timeout_ms = 30000
//! sandboxed = true
//!
//! [environments]
//! root = "~/.ember/environments"
//! default_name = "default"
//! max_idle_secs = 3600
//! removal = "keep"
//!
//! [sessions]
//! max_idle_secs = 1800
//! sweep_interval_secs = 60
//!
//! [installations]
//! search_dirs = ["/usr/bin", "/usr/local/bin"]
//! ```

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::{save_config, save_global_config, ConfigLoader};
pub use types::{
    EmberConfig, EngineConfig, EnvironmentsConfig, InstallationsConfig, RemovalPolicy,
    SessionsConfig,
};

/// Default global config directory.
pub fn default_config_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".ember")
}

/// Default global config file path.
pub fn default_config_path() -> std::path::PathBuf {
    default_config_dir().join("config.toml")
}

/// Project config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".ember";

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = "config.toml";
