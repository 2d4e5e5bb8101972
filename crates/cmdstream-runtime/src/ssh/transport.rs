// The seam between the pool and whatever actually speaks SSH. The pool only
// needs to connect, run a one-shot exec, and open an interactive shell.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;

use crate::config::PtyConfig;
use crate::execution::{CommandExecutionResult, ConnectParams};

/// Output of a one-shot exec channel
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl From<CommandOutput> for CommandExecutionResult {
    /// Stdout followed by stderr. Anything on stderr, or a non-zero exit
    /// status, counts as a failure.
    fn from(output: CommandOutput) -> Self {
        let success = output.stderr.is_empty() && output.exit_code.unwrap_or(0) == 0;
        let mut text = output.stdout;
        text.push_str(&output.stderr);

        CommandExecutionResult {
            output: text,
            success,
        }
    }
}

/// Something that arrived on an interactive shell channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// EOF or close from the remote side. No more events follow.
    Closed,
}

/// A persistent, duplex shell stream
#[async_trait]
pub trait ShellChannel: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the next event. Returns `ShellEvent::Closed` once the
    /// channel is gone, and keeps returning it afterwards.
    async fn recv(&mut self) -> ShellEvent;

    async fn close(&mut self) -> Result<()>;
}

/// An authenticated connection to one remote host
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    async fn open_shell(&self, pty: &PtyConfig) -> Result<Box<dyn ShellChannel>>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Opens and authenticates transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>>;
}
