//! Execution engine.
//!
//! The caller-facing surface for running Lua on behalf of sessions: code
//! fragments, files, REPL commands, batches, interactive sequences,
//! variable injection and generator streaming.
//!
//! # Call Path
//!
//! ```text
//! ExecutionEngine::execute_*
//!   └─ SessionManager::execute_with_concurrency_control   (per-session FIFO)
//!        ├─ SessionManager::ensure_scope
//!        └─ RuntimeCoordinator::with_scope                (global gate, timeout)
//!             └─ spawn_blocking → Lua
//! ```
//!
//! # Failures
//!
//! Nothing here returns `Err` for a failed execution. Each call yields an
//! [`ExecutionResult`]; on failure its [`ExecutionError`] carries an
//! [`ExecutionFailure`] kind and the message verbatim.
//!
//! | Kind | Cause |
//! |------|-------|
//! | `Timeout` | caller stopped waiting; the native call may still finish |
//! | `Native` | Lua raised an error |
//! | `Cancelled` | [`ExecutionEngine::stop_execution`] interrupted the call |
//! | `InvalidState` | session terminated or closing, scope invalidated, runtime stopped |
//! | `NotFound` | unknown session, environment or script file |
//! | `Internal` | worker thread panicked, unreadable file |

#[allow(clippy::module_inception)]
mod engine;
mod native;
mod result;

pub use engine::ExecutionEngine;
pub use result::{ExecutionError, ExecutionFailure, ExecutionResult, Profile};
