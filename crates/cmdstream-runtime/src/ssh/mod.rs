//! SSH session pooling and multiplexed command execution
//!
//! This module keeps long-lived interactive shells on remote hosts and runs
//! many independent commands through them, one at a time per session.
//!
//! Features:
//! - Keyed session pool with idle eviction and periodic health checks
//! - Begin/end marker protocol to find each command's output in the shell stream
//! - Pluggable error heuristic for shell output
//! - One-shot exec channels for commands that need no shared state

mod error;
mod marker;
mod pool;
mod session;
mod ssh_pool;
mod transport;

#[cfg(test)]
mod fake;

#[cfg(test)]
mod integration_tests;

pub use error::SshError;
pub use marker::{run_command, Completion, ErrorDetector, KeywordErrorDetector, MarkerParser, Markers};
pub use pool::{Pool, PooledSession, SessionState};
pub use session::{RusshConnector, RusshShell, Session};
pub use ssh_pool::SshPoolHandle;
pub use transport::{CommandOutput, Connector, ShellChannel, ShellEvent, Transport};
