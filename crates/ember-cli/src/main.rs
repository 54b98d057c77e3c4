//! Ember CLI - run Lua through the ember session host.
//!
//! # Configuration
//!
//! Configuration is loaded from multiple sources with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`EMBER_*`)
//! 3. Project config (`.ember/config.toml` in the project directory)
//! 4. Global config (`~/.ember/config.toml`, or `--config`)
//! 5. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `EMBER_DEBUG`: Enable debug mode (`true`/`false`)
//! - `EMBER_MODE`: `single_user` or `multi_user`
//! - `EMBER_TIMEOUT_MS`: Default execution timeout
//! - `EMBER_SANDBOXED`: Restrict the Lua standard library
//! - `EMBER_ENV_ROOT`: Where environments are created

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ember_runtime::{
    default_config_path, save_config, CommandLauncher, ConfigError, ConfigLoader, EmberConfig,
    EngineMode, ExecutionResult, Host, InstallationCatalog, SessionId,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ember CLI - sessions over an embedded Lua runtime
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Global config file (defaults to ~/.ember/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Project root directory (defaults to current directory)
    #[arg(short = 'C', long, global = true)]
    project: Option<PathBuf>,

    /// Engine mode: single-user or multi-user
    #[arg(long, global = true)]
    mode: Option<EngineMode>,

    /// Default execution timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Session owner
    #[arg(long, global = true, default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Run a Lua fragment in a fresh session
    Exec {
        /// Lua source
        code: String,
    },
    /// Run a Lua file in a fresh session
    Run {
        /// Script path
        file: PathBuf,
    },
    /// Read Lua lines from stdin, one command at a time
    Repl,
    /// Find Lua installations on disk
    Discover {
        /// Directories to scan (defaults to the configured search dirs)
        dirs: Vec<PathBuf>,

        /// Remember the installations found in the global config
        #[arg(long)]
        save: bool,
    },
    /// Write the effective configuration
    SaveConfig {
        /// Target file (defaults to the global config path)
        path: Option<PathBuf>,
    },
}

/// Merges file/env config via [`ConfigLoader`] and applies CLI argument
/// overrides as the highest-priority layer.
#[derive(Debug)]
struct CliConfigResolver {
    project_root: PathBuf,
    global_config: Option<PathBuf>,
    debug: bool,
    mode: Option<EngineMode>,
    timeout_ms: Option<u64>,
}

impl CliConfigResolver {
    fn from_args(args: &Args) -> Self {
        let project_root = args.project.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to get current directory, using '.'");
                PathBuf::from(".")
            })
        });
        Self {
            project_root,
            global_config: args.config.clone(),
            debug: args.debug,
            mode: args.mode,
            timeout_ms: args.timeout_ms,
        }
    }

    fn resolve(&self) -> Result<EmberConfig, ConfigError> {
        let mut loader = ConfigLoader::new().with_project_root(&self.project_root);
        if let Some(ref path) = self.global_config {
            loader = loader.with_global_config(path);
        }
        let mut config = loader.load()?;

        if self.debug {
            config.debug = true;
        }
        if let Some(mode) = self.mode {
            config.engine.mode = mode;
        }
        if let Some(ms) = self.timeout_ms {
            config.engine.default_timeout_ms = ms;
        }
        Ok(config)
    }

    /// Where `save-config` and `discover --save` write by default.
    fn config_path(&self) -> PathBuf {
        self.global_config
            .clone()
            .unwrap_or_else(default_config_path)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Terminal filter: --debug > --verbose > RUST_LOG env > default "warn"
    let filter = if args.debug {
        EnvFilter::new("debug,tokio=warn")
    } else if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let resolver = CliConfigResolver::from_args(&args);
    let config = resolver
        .resolve()
        .map_err(|e| anyhow::anyhow!("Config error: {e}"))?;
    info!(
        project = %resolver.project_root.display(),
        mode = %config.engine.mode,
        "Configuration resolved"
    );

    let exit_code = match args.command {
        Command::Exec { code } => with_host(config, &args.user, |host, session| async move {
            let result = host.engine().execute_code(&code, &session, None).await;
            report(&result)
        })
        .await?,
        Command::Run { file } => with_host(config, &args.user, |host, session| async move {
            let result = host
                .engine()
                .execute_script_file(&file, &session, None)
                .await;
            report(&result)
        })
        .await?,
        Command::Repl => repl(config, &args.user).await?,
        Command::Discover { dirs, save } => {
            discover(config, dirs, save.then(|| resolver.config_path())).await?
        }
        Command::SaveConfig { path } => {
            let path = path.unwrap_or_else(|| resolver.config_path());
            save_config(&config, &path)
                .with_context(|| format!("failed to save config to {}", path.display()))?;
            println!("Saved configuration to {}", path.display());
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Starts a host, runs `f` with a fresh session, then shuts the host down.
async fn with_host<F, Fut>(config: EmberConfig, user: &str, f: F) -> Result<i32>
where
    F: FnOnce(Arc<Host>, SessionId) -> Fut,
    Fut: std::future::Future<Output = i32>,
{
    let host = Arc::new(Host::builder(config).build());
    host.start().await.context("failed to start host")?;

    let outcome = match host.sessions().create_session(user, None).await {
        Ok(session) => Ok(f(Arc::clone(&host), session.id).await),
        Err(e) => Err(anyhow::Error::new(e).context("failed to create session")),
    };

    host.shutdown().await;
    outcome
}

/// Prints captured output and the value; returns the exit code.
fn report(result: &ExecutionResult) -> i32 {
    if !result.output.is_empty() {
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
    }
    if let Some(ref value) = result.value {
        println!("{value}");
    }
    let _ = std::io::stdout().flush();

    match result.error_message() {
        Some(message) => {
            eprintln!("Error: {message}");
            1
        }
        None => 0,
    }
}

/// Line loop on stdin. `:quit` exits, `:reset` starts a new session.
async fn repl(config: EmberConfig, user: &str) -> Result<i32> {
    let host = Arc::new(Host::builder(config).build());
    host.start().await.context("failed to start host")?;
    let mut session = host
        .sessions()
        .create_session(user, None)
        .await
        .context("failed to create session")?;
    println!("Session ID: {}", session.id);

    // Ctrl-C interrupts the running call instead of killing the process
    let engine = host.engine().clone();
    let interrupts = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if engine.stop_execution() {
                eprintln!("Interrupted");
            }
        }
    });

    let mut failures = 0;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => break,
            ":reset" => {
                if let Err(e) = host.sessions().terminate_session(&session.id).await {
                    warn!(session = %session.id, error = %e, "Failed to terminate session");
                }
                session = host
                    .sessions()
                    .create_session(user, None)
                    .await
                    .context("failed to create session")?;
                println!("Session ID: {}", session.id);
            }
            command => {
                let result = host.engine().execute_command(command, &session.id).await;
                if report(&result) != 0 {
                    failures += 1;
                }
            }
        }
    }

    interrupts.abort();
    host.shutdown().await;
    info!(failures, "REPL finished");
    Ok(0)
}

async fn discover(
    mut config: EmberConfig,
    dirs: Vec<PathBuf>,
    save_to: Option<PathBuf>,
) -> Result<i32> {
    let dirs = if dirs.is_empty() {
        config.installations.resolved_search_dirs()
    } else {
        dirs
    };

    let catalog = InstallationCatalog::new(Arc::new(CommandLauncher));
    let found = catalog.discover(&dirs).await;
    if found.is_empty() {
        println!("No installations found");
    }
    for installation in &found {
        let state = if installation.available {
            "ok"
        } else {
            "unavailable"
        };
        println!(
            "{}\t{}\t{}-bit\t{}\t{}",
            installation.name(),
            installation.version,
            installation.bitness,
            state,
            installation.status
        );
    }

    if let Some(path) = save_to {
        for installation in found {
            config.installations.remember(installation);
        }
        save(&config, &path)?;
    }
    Ok(0)
}

fn save(config: &EmberConfig, path: &Path) -> Result<()> {
    save_config(config, path)
        .with_context(|| format!("failed to save config to {}", path.display()))?;
    println!("Saved configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver_in(temp: &TempDir) -> CliConfigResolver {
        CliConfigResolver {
            project_root: temp.path().to_path_buf(),
            global_config: Some(temp.path().join("missing.toml")),
            debug: false,
            mode: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn resolve_defaults_no_overrides() {
        let temp = TempDir::new().unwrap();
        let config = resolver_in(&temp).resolve().expect("resolve should succeed");
        let baseline = EmberConfig::default();
        assert_eq!(config.debug, baseline.debug);
        assert_eq!(config.engine.default_timeout_ms, baseline.engine.default_timeout_ms);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".ember")).unwrap();
        std::fs::write(
            temp.path().join(".ember/config.toml"),
            "[engine]\nmode = \"multi_user\"\ndefault_timeout_ms = 10\n",
        )
        .unwrap();

        let mut resolver = resolver_in(&temp);
        resolver.debug = true;
        resolver.mode = Some(EngineMode::SingleUser);
        resolver.timeout_ms = Some(250);
        let config = resolver.resolve().expect("resolve should succeed");

        assert!(config.debug);
        assert_eq!(config.engine.mode, EngineMode::SingleUser);
        assert_eq!(config.engine.default_timeout_ms, 250);
    }

    #[test]
    fn project_config_applies_without_overrides() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".ember")).unwrap();
        std::fs::write(
            temp.path().join(".ember/config.toml"),
            "[engine]\ndefault_timeout_ms = 1234\n",
        )
        .unwrap();

        let config = resolver_in(&temp).resolve().expect("resolve should succeed");
        assert_eq!(config.engine.default_timeout_ms, 1234);
    }

    #[test]
    fn config_path_prefers_explicit_file() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver_in(&temp);
        assert_eq!(resolver.config_path(), temp.path().join("missing.toml"));
    }

    #[test]
    fn parses_subcommands_and_global_flags() {
        let args = Args::try_parse_from([
            "ember",
            "exec",
            "return 1",
            "--mode",
            "single-user",
            "--timeout-ms",
            "500",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Exec {
                code: "return 1".into()
            }
        );
        assert_eq!(args.mode, Some(EngineMode::SingleUser));
        assert_eq!(args.timeout_ms, Some(500));
        assert_eq!(args.user, "cli");
    }

    #[test]
    fn discover_save_flag_parses() {
        let args = Args::try_parse_from(["ember", "discover", "/opt/lua", "--save"]).unwrap();
        assert_eq!(
            args.command,
            Command::Discover {
                dirs: vec![PathBuf::from("/opt/lua")],
                save: true
            }
        );
    }
}
