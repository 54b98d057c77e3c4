//! Caller sessions.
//!
//! A session is a caller's logical execution context: bound to one
//! environment and, through the coordinator, to one scope.
//!
//! # Lifecycle
//!
//! ```text
//! create_session ──► Active ──cleanup_session──► Inactive
//!                      ▲                            │
//!                      └──────── ensure_scope ──────┘
//!                      │                            │
//!                      └──── terminate_session ─────┴──► Terminated
//! ```
//!
//! Terminated sessions stay in the table (immutable) until a cleanup
//! sweep purges them.
//!
//! # Example
//!
//! ```no_run
//! use ember_runtime::session::SessionManager;
//!
//! # async fn example(manager: &SessionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let session = manager.create_session("alice", None).await?;
//! let answer = manager
//!     .execute_with_concurrency_control(&session.id, |_session| async { Ok::<_, ()>(42) })
//!     .await?;
//! assert_eq!(answer, Ok(42));
//! manager.terminate_session(&session.id).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod manager;
mod model;

pub use error::SessionError;
pub use manager::{CleanupReport, SessionManager, MAX_SESSION_OUTPUT};
pub use model::Session;
