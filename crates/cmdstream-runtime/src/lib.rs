//! Runtime library for cmdstream
//!
//! This crate runs shell commands locally or on remote hosts over SSH. Its
//! core is a pool of long-lived interactive shells: many independent command
//! invocations are multiplexed onto one remote shell per connection key, and
//! each command's output is recovered from the shell's byte stream by
//! bracketing it with begin/end markers.
//!
//! It includes:
//!
//! - An SSH transport built on `russh` (password login, exec and shell channels)
//! - The connection pool actor with idle eviction and health checks
//! - The marker protocol engine that detects command completion
//! - A local executor for commands that should not leave this machine
//!
//! # Example
//!
//! ```ignore
//! let pool = SshPoolHandle::new(PoolConfig::default());
//! let params = ConnectParams::new("db1.internal", 22, "postgres", "secret");
//!
//! pool.run_multiplexed("cd /var/lib/postgresql", &params, true, None).await;
//! let result = pool.run_multiplexed("pwd", &params, false, None).await;
//! assert!(result.success);
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for standalone logging to the terminal.
///
/// This sets up tracing to output directly to stderr with the log level
/// controlled by the `RUST_LOG` environment variable.
///
/// Applications that already install a `log` logger don't need this: the
/// `tracing` crate's `log` feature forwards every event from this crate to
/// the `log` facade when no subscriber is set.
///
/// # Examples
///
/// ```ignore
/// // Set RUST_LOG=cmdstream_runtime=trace to see every chunk the marker engine parses
/// cmdstream_runtime::init_tracing();
/// ```
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

pub mod config;
pub mod execution;
pub mod local;
pub mod ssh;

pub use config::{MarkerConfig, PoolConfig, PtyConfig};
pub use execution::{CommandExecutionResult, ConnectParams};
pub use ssh::{SshError, SshPoolHandle};
