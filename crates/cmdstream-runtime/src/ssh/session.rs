// Handle making SSH connections. Do not manage or pool them, just handle the actual plumbing.
// This is essentially a wrapper around the russh crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use russh::client::{Handle, Msg};
use russh::*;
use tokio::time::timeout;

use crate::config::PtyConfig;
use crate::execution::ConnectParams;
use crate::ssh::error::SshError;
use crate::ssh::transport::{CommandOutput, Connector, ShellChannel, ShellEvent, Transport};

const SSH_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH client implementation for russh
pub struct Client;

impl russh::client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host key verification is not performed; every server key is accepted
        Ok(true)
    }
}

/// An ssh session, wrapping the underlying russh with async-safe primitives
pub struct Session {
    session: Handle<Client>,
    address: String,
}

impl Session {
    /// Open a new SSH session to the given host, and connect
    pub async fn open(params: &ConnectParams, connect_timeout: Duration) -> Result<Self> {
        let config = russh::client::Config::default();
        let address = params.address();

        tracing::debug!("Connecting directly to: {address}");
        let session = timeout(
            connect_timeout,
            russh::client::connect(Arc::new(config), address.as_str(), Client),
        )
        .await
        .map_err(|_| SshError::Connect(format!("timed out connecting to {address}")))?
        .map_err(|e| SshError::Connect(e.to_string()))?;

        Ok(Session { session, address })
    }

    /// Password authentication
    pub async fn password_auth(&mut self, username: &str, password: &str) -> Result<()> {
        let auth_res = self
            .session
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::Connect(e.to_string()))?;

        if !matches!(auth_res, russh::client::AuthResult::Success) {
            tracing::warn!("Password authentication rejected for {username}@{}", self.address);
            return Err(SshError::Authentication {
                username: username.to_string(),
                host: self.address.clone(),
            }
            .into());
        }

        tracing::info!("Authenticated to {} as {username}", self.address);
        Ok(())
    }

    /// Execute a simple command and capture its output.
    /// This opens a new channel, runs the command, and returns stdout, stderr, and exit code
    pub async fn exec_and_capture(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code: Option<u32> = None;
        let mut got_eof = false;

        loop {
            let Some(msg) = channel.wait().await else {
                break;
            };

            match msg {
                ChannelMsg::Data { data } => {
                    stdout.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    stderr.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                    // If we already got EOF, we can break now
                    if got_eof {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    got_eof = true;
                    // If we already got exit status, we can break now
                    if exit_code.is_some() {
                        break;
                    }
                }
                ChannelMsg::Close => {
                    break;
                }
                _ => {}
            }
        }

        let _ = channel.close().await;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Open a session channel with a PTY and an interactive shell on it
    pub async fn open_shell(&self, pty: &PtyConfig) -> Result<RusshShell> {
        let channel = timeout(SSH_OPERATION_TIMEOUT, self.session.channel_open_session())
            .await
            .map_err(|_| SshError::Channel("timeout opening SSH channel for shell".into()))??;

        timeout(
            SSH_OPERATION_TIMEOUT,
            channel.request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &[]),
        )
        .await
        .map_err(|_| SshError::Channel("timeout requesting PTY".into()))??;

        timeout(SSH_OPERATION_TIMEOUT, channel.request_shell(true))
            .await
            .map_err(|_| SshError::Channel("timeout starting shell".into()))??;

        tracing::debug!("Opened interactive shell on {}", self.address);
        Ok(RusshShell {
            channel,
            closed: false,
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for Session {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_and_capture(command).await
    }

    async fn open_shell(&self, pty: &PtyConfig) -> Result<Box<dyn ShellChannel>> {
        let shell = Session::open_shell(self, pty).await?;
        Ok(Box::new(shell))
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }
}

/// The interactive shell half of a session
pub struct RusshShell {
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl ShellChannel for RusshShell {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let cursor = std::io::Cursor::new(data);
        self.channel
            .data(cursor)
            .await
            .map_err(|e| SshError::Channel(format!("failed to write to shell: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self) -> ShellEvent {
        if self.closed {
            return ShellEvent::Closed;
        }

        loop {
            let Some(msg) = self.channel.wait().await else {
                self.closed = true;
                return ShellEvent::Closed;
            };

            match msg {
                ChannelMsg::Data { data } => {
                    return ShellEvent::Stdout(Bytes::copy_from_slice(&data));
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return ShellEvent::Stderr(Bytes::copy_from_slice(&data));
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    tracing::debug!("SSH shell channel closed by remote");
                    self.closed = true;
                    return ShellEvent::Closed;
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        let _ = self.channel.eof().await;
        self.channel.close().await?;
        Ok(())
    }
}

/// Connects real SSH sessions using password authentication
#[derive(Debug, Clone)]
pub struct RusshConnector {
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>> {
        let mut session = Session::open(params, self.connect_timeout).await?;
        session
            .password_auth(&params.username, &params.password)
            .await?;
        Ok(Arc::new(session))
    }
}
