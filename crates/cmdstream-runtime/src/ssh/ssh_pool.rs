// An actor for managing pooled SSH shell sessions

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::execution::{resolve_key, CommandExecutionResult, ConnectParams};
use crate::local;
use crate::ssh::error::SshError;
use crate::ssh::marker::{run_command, Completion, ErrorDetector, KeywordErrorDetector, Markers};
use crate::ssh::pool::{LiveSession, Pool, PooledSession, SessionState};
use crate::ssh::session::RusshConnector;
use crate::ssh::transport::{Connector, ShellChannel};

pub enum SshPoolMessage {
    Acquire {
        key: String,
        reply_to: oneshot::Sender<Result<Arc<PooledSession>, SshError>>,
    },
    /// Hand a lease back and keep the session pooled
    Release {
        key: String,
        session_id: Uuid,
        reply_to: oneshot::Sender<()>,
    },
    /// Drop a session that has already been shut down by its caller
    Evict {
        key: String,
        session_id: Uuid,
        reply_to: oneshot::Sender<()>,
    },
    IdleExpired {
        key: String,
        token: u64,
    },
    Disconnect {
        key: String,
        reply_to: oneshot::Sender<bool>,
    },
    ListConnections {
        reply_to: oneshot::Sender<Vec<String>>,
    },
    Len {
        reply_to: oneshot::Sender<usize>,
    },
    HealthCheck {
        reply_to: oneshot::Sender<usize>,
    },
}

/// Cheap, cloneable entry point to the pool.
///
/// Every public `run_*` call resolves to a [`CommandExecutionResult`]; no
/// failure is returned as an error.
#[derive(Clone)]
pub struct SshPoolHandle {
    sender: mpsc::Sender<SshPoolMessage>,
    connector: Arc<dyn Connector>,
    detector: Arc<dyn ErrorDetector>,
    config: Arc<PoolConfig>,
}

impl SshPoolHandle {
    /// Start a pool that connects with russh. Must be called from within a
    /// tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let connector = Arc::new(RusshConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let mut actor = SshPool::new(sender.downgrade(), receiver, &config);

        tokio::spawn(async move { actor.run().await });

        Self {
            sender,
            connector,
            detector: Arc::new(KeywordErrorDetector::default()),
            config: Arc::new(config),
        }
    }

    /// Replace the heuristic that decides whether shell output means failure
    pub fn with_error_detector(mut self, detector: impl ErrorDetector + 'static) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    /// Run a command on the pooled shell for `session_key` (or the key
    /// derived from `params`), connecting first if needed.
    ///
    /// With `keep_alive` the session stays pooled and its idle timer is
    /// re-armed; without it the session is torn down before this returns.
    pub async fn run_multiplexed(
        &self,
        command: &str,
        params: &ConnectParams,
        keep_alive: bool,
        session_key: Option<&str>,
    ) -> CommandExecutionResult {
        let key = resolve_key(params, session_key);
        let markers = Markers::new(&self.config.marker);

        if markers.collides_with(command) {
            let err = SshError::ReservedMarker(markers.end().to_string());
            return CommandExecutionResult::failure(err.to_string());
        }

        match self
            .run_on_session(&key, command, params, keep_alive, markers)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Command on session {key} failed: {e}");
                CommandExecutionResult::failure(e.to_string())
            }
        }
    }

    /// Run one command without pooling: locally when no connection is
    /// given, otherwise over a fresh exec channel that is closed afterwards.
    pub async fn run_once(
        &self,
        command: &str,
        params: Option<&ConnectParams>,
    ) -> CommandExecutionResult {
        let Some(params) = params else {
            return local::execute(command).await;
        };

        let transport = match self.connector.connect(params).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("One-shot connection to {} failed: {e}", params.address());
                return CommandExecutionResult::failure(e.to_string());
            }
        };

        let result = match transport.exec(command).await {
            Ok(output) => output.into(),
            Err(e) => CommandExecutionResult::failure(e.to_string()),
        };

        if let Err(e) = transport.close().await {
            tracing::debug!("Error closing one-shot connection: {e}");
        }

        result
    }

    pub async fn list_connections(&self) -> Result<Vec<String>, SshError> {
        self.request(|reply_to| SshPoolMessage::ListConnections { reply_to })
            .await
    }

    pub async fn len(&self) -> Result<usize, SshError> {
        self.request(|reply_to| SshPoolMessage::Len { reply_to })
            .await
    }

    /// Force-evict a session. Returns whether the key was pooled.
    pub async fn disconnect(&self, key: &str) -> Result<bool, SshError> {
        self.request(|reply_to| SshPoolMessage::Disconnect {
            key: key.to_string(),
            reply_to,
        })
        .await
    }

    /// Evict idle sessions whose connection has gone away. Returns how many
    /// were removed. Also runs on a timer inside the pool.
    pub async fn health_check(&self) -> Result<usize, SshError> {
        self.request(|reply_to| SshPoolMessage::HealthCheck { reply_to })
            .await
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> SshPoolMessage,
    ) -> Result<T, SshError> {
        let (sender, receiver) = oneshot::channel();

        self.sender
            .send(message(sender))
            .await
            .map_err(|_| SshError::PoolShutdown)?;
        receiver.await.map_err(|_| SshError::PoolShutdown)
    }

    async fn run_on_session(
        &self,
        key: &str,
        command: &str,
        params: &ConnectParams,
        keep_alive: bool,
        markers: Markers,
    ) -> Result<CommandExecutionResult, SshError> {
        loop {
            let session = self
                .request(|reply_to| SshPoolMessage::Acquire {
                    key: key.to_string(),
                    reply_to,
                })
                .await??;
            let _lease = Lease::new(self.sender.clone(), key, session.id);

            let mut state = SessionGuard::new(
                session.lock_owned().await,
                self.sender.clone(),
                key,
                session.id,
            );

            match &*state {
                SessionState::Closed(None) => {
                    tracing::debug!("Session {key} closed while queued, retrying on a new one");
                    state.disarm();
                    continue;
                }
                SessionState::Closed(Some(reason)) => {
                    let reason = reason.clone();
                    state.disarm();
                    return Ok(CommandExecutionResult::failure(reason));
                }
                SessionState::Pending | SessionState::Live(_) => {}
            }

            let outcome = match self.prepare_shell(key, &mut state, params).await {
                Ok(shell) => self.execute(shell, command, markers.clone()).await,
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!("Could not open shell for {key}: {message}");
                    state.shutdown(Some(message.clone())).await;
                    self.evict(key, session.id).await?;
                    state.disarm();
                    return Ok(CommandExecutionResult::failure(message));
                }
            };

            let result = match outcome {
                Ok(Completion {
                    result,
                    channel_closed: false,
                }) => {
                    if !keep_alive {
                        tracing::debug!("Closing session {key} after command");
                        state.shutdown(None).await;
                        self.evict(key, session.id).await?;
                    }
                    result
                }
                Ok(Completion {
                    result,
                    channel_closed: true,
                }) => {
                    let reason = SshError::Closed("shell channel closed by remote host".into());
                    state.shutdown(Some(reason.to_string())).await;
                    self.evict(key, session.id).await?;
                    result
                }
                Err(e) => {
                    // The shell may be mid-command; it can't be reused
                    let message = e.to_string();
                    tracing::warn!("Evicting session {key}: {message}");
                    state.shutdown(Some(message.clone())).await;
                    self.evict(key, session.id).await?;
                    CommandExecutionResult::failure(message)
                }
            };

            state.disarm();
            return Ok(result);
        }
    }

    /// Bring a session to the point where it has a live interactive shell,
    /// reconnecting if the pooled transport has died.
    async fn prepare_shell<'a>(
        &self,
        key: &str,
        state: &'a mut SessionState,
        params: &ConnectParams,
    ) -> Result<&'a mut Box<dyn ShellChannel>> {
        if matches!(&*state, SessionState::Live(live) if live.transport.is_closed()) {
            tracing::info!("Pooled connection for {key} has gone away, reconnecting");
            state.shutdown(None).await;
            *state = SessionState::Pending;
        }

        if let SessionState::Pending = *state {
            tracing::debug!("Connecting session {key} to {}", params.address());
            let transport = self.connector.connect(params).await?;
            *state = SessionState::Live(LiveSession {
                transport,
                shell: None,
            });
        }

        match state {
            SessionState::Live(live) => {
                if live.shell.is_none() {
                    tracing::debug!("Opening interactive shell for {key}");
                    live.shell = Some(live.transport.open_shell(&self.config.pty).await?);
                }
                live.shell
                    .as_mut()
                    .ok_or_else(|| SshError::Channel("shell unavailable".into()).into())
            }
            SessionState::Pending | SessionState::Closed(_) => {
                Err(SshError::Closed("session is not connected".into()).into())
            }
        }
    }

    async fn execute(
        &self,
        shell: &mut Box<dyn ShellChannel>,
        command: &str,
        markers: Markers,
    ) -> Result<Completion> {
        let run = run_command(shell.as_mut(), command, markers, self.detector.clone());

        match self.config.command_timeout {
            Some(limit) => timeout(limit, run)
                .await
                .map_err(|_| SshError::Timeout(limit))?,
            None => run.await,
        }
    }

    async fn evict(&self, key: &str, session_id: Uuid) -> Result<(), SshError> {
        self.request(|reply_to| SshPoolMessage::Evict {
            key: key.to_string(),
            session_id,
            reply_to,
        })
        .await
    }
}

impl Default for SshPoolHandle {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

pub(crate) struct SshPool {
    sender: mpsc::WeakSender<SshPoolMessage>,
    receiver: mpsc::Receiver<SshPoolMessage>,

    pool: Pool,
    idle_timeout: Duration,
    health_check_interval: Duration,
}

impl SshPool {
    pub fn new(
        sender: mpsc::WeakSender<SshPoolMessage>,
        receiver: mpsc::Receiver<SshPoolMessage>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            sender,
            receiver,
            pool: Pool::new(config.max_sessions),
            idle_timeout: config.idle_timeout,
            health_check_interval: config.health_check_interval,
        }
    }

    async fn run(&mut self) {
        // Start the health check task
        let health_check_handle = self.start_health_check_task();

        while let Some(msg) = self.receiver.recv().await {
            self.handle_message(msg);

            log::trace!("SshPool message handled");
        }

        // Every handle is gone; clean up whatever is still pooled
        health_check_handle.abort();
        for session in self.pool.drain() {
            session.lock().await.shutdown(None).await;
        }
        log::debug!("SSH pool shut down");
    }

    /// Start the background health checking task
    fn start_health_check_task(&self) -> tokio::task::JoinHandle<()> {
        let sender = self.sender.clone();
        let period = self.health_check_interval;

        tokio::spawn(async move {
            let mut interval = interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(sender) = sender.upgrade() else {
                    log::debug!("SSH pool shut down, stopping health check task");
                    break;
                };

                let (reply_tx, recv) = oneshot::channel();
                let msg = SshPoolMessage::HealthCheck { reply_to: reply_tx };

                if sender.send(msg).await.is_err() {
                    log::debug!("SSH pool shut down, stopping health check task");
                    break;
                }
                drop(sender);

                match recv.await {
                    Ok(removed) => {
                        log::debug!("Scheduled SSH health check removed {removed} sessions");
                    }
                    Err(_) => {
                        log::error!("Scheduled SSH health check response failure");
                    }
                }
            }
        })
    }

    fn arm_idle_timer(&mut self, key: &str) {
        let token = self.pool.next_timer_token();
        let sender = self.sender.clone();
        let idle_timeout = self.idle_timeout;
        let timer_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;

            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(SshPoolMessage::IdleExpired {
                        key: timer_key,
                        token,
                    })
                    .await;
            }
        });

        log::trace!("Armed idle timer {token} for {key}");
        self.pool.attach_idle_timer(key, token, handle);
    }

    fn handle_message(&mut self, message: SshPoolMessage) {
        match message {
            SshPoolMessage::Acquire { key, reply_to } => {
                // A caller that gave up before the reply must not keep a lease
                if let Err(Ok(session)) = reply_to.send(self.pool.checkout(&key)) {
                    log::debug!("Caller for {key} went away before acquiring");
                    if let Some(0) = self.pool.checkin(&key, session.id) {
                        self.arm_idle_timer(&key);
                    }
                }
            }
            SshPoolMessage::Release {
                key,
                session_id,
                reply_to,
            } => {
                if let Some(0) = self.pool.checkin(&key, session_id) {
                    self.arm_idle_timer(&key);
                }
                let _ = reply_to.send(());
            }
            SshPoolMessage::Evict {
                key,
                session_id,
                reply_to,
            } => {
                if self.pool.remove(&key, session_id).is_some() {
                    log::debug!("Removed session {key} from pool");
                }
                let _ = reply_to.send(());
            }
            SshPoolMessage::IdleExpired { key, token } => {
                if let Some(session) = self.pool.expire(&key, token) {
                    log::debug!("Idle timeout reached for {key}, closing session");
                    spawn_shutdown(session, None);
                }
            }
            SshPoolMessage::Disconnect { key, reply_to } => {
                let removed = self.pool.remove_any(&key);
                if let Some(session) = &removed {
                    log::debug!("Disconnecting session {key}");
                    spawn_shutdown(session.clone(), None);
                }
                let _ = reply_to.send(removed.is_some());
            }
            SshPoolMessage::ListConnections { reply_to } => {
                let _ = reply_to.send(self.pool.keys());
            }
            SshPoolMessage::Len { reply_to } => {
                let _ = reply_to.send(self.pool.len());
            }
            SshPoolMessage::HealthCheck { reply_to } => {
                let idle = self.pool.idle_sessions();
                log::debug!("Running SSH health check on {} idle sessions", idle.len());

                let mut dead = Vec::new();
                for session in idle {
                    // Locked means someone is mid-command, so it's alive enough
                    let Some(state) = session.try_lock() else {
                        continue;
                    };
                    let alive = match &*state {
                        SessionState::Live(live) => !live.transport.is_closed(),
                        SessionState::Pending => true,
                        SessionState::Closed(_) => false,
                    };
                    drop(state);

                    if !alive {
                        dead.push(session);
                    }
                }

                for session in &dead {
                    log::debug!("Connection for {} is gone, removing it", session.key);
                    self.pool.remove(&session.key, session.id);
                    spawn_shutdown(session.clone(), Some("SSH connection lost".to_string()));
                }

                if !dead.is_empty() {
                    log::debug!(
                        "Health check removed {} dead sessions, {} remaining",
                        dead.len(),
                        self.pool.len()
                    );
                }

                let _ = reply_to.send(dead.len());
            }
        }
    }
}

fn spawn_shutdown(session: Arc<PooledSession>, reason: Option<String>) {
    tokio::spawn(async move {
        session.lock().await.shutdown(reason).await;
    });
}

/// Queue a message without waiting, for use from `Drop`
fn send_detached(sender: &mpsc::Sender<SshPoolMessage>, message: SshPoolMessage) {
    match sender.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                log::warn!("No runtime to deliver pool message");
                return;
            };
            let sender = sender.clone();
            runtime.spawn(async move {
                let _ = sender.send(message).await;
            });
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// One caller's claim on a pooled session, taken by `Acquire`. Handed back
/// when dropped, however the caller exits.
struct Lease {
    sender: mpsc::Sender<SshPoolMessage>,
    key: String,
    session_id: Uuid,
}

impl Lease {
    fn new(sender: mpsc::Sender<SshPoolMessage>, key: &str, session_id: Uuid) -> Self {
        Self {
            sender,
            key: key.to_string(),
            session_id,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let (reply_to, _) = oneshot::channel();
        send_detached(
            &self.sender,
            SshPoolMessage::Release {
                key: std::mem::take(&mut self.key),
                session_id: self.session_id,
                reply_to,
            },
        );
    }
}

/// Exclusive use of a session's shell.
///
/// Dropped while still armed means the caller was cancelled with a command
/// in flight. Its output would land in front of the next caller's markers,
/// so the session is closed before anyone queued behind gets the lock, and
/// evicted from the pool.
struct SessionGuard {
    state: OwnedMutexGuard<SessionState>,
    sender: mpsc::Sender<SshPoolMessage>,
    key: String,
    session_id: Uuid,
    armed: bool,
}

impl SessionGuard {
    fn new(
        state: OwnedMutexGuard<SessionState>,
        sender: mpsc::Sender<SshPoolMessage>,
        key: &str,
        session_id: Uuid,
    ) -> Self {
        Self {
            state,
            sender,
            key: key.to_string(),
            session_id,
            armed: true,
        }
    }

    /// The caller saw its command through; leave the session as it is
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Deref for SessionGuard {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!("Command on session {} was cancelled, closing it", self.key);
        let abandoned = std::mem::replace(
            &mut *self.state,
            SessionState::Closed(Some(CANCELLED.to_string())),
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(abandoned.close());
        }

        let (reply_to, _) = oneshot::channel();
        send_detached(
            &self.sender,
            SshPoolMessage::Evict {
                key: std::mem::take(&mut self.key),
                session_id: self.session_id,
                reply_to,
            },
        );
    }
}

const CANCELLED: &str = "Command cancelled before it completed";
