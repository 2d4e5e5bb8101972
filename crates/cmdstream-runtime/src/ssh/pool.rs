use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::SshError;
use super::transport::{ShellChannel, Transport};

// A registry of pooled shell sessions, keyed by connection key.
// Owned by the pool actor, so map mutation needs no locking of its own: the
// actor processes one message at a time, which makes create-if-absent atomic.

/// One live (or about to be live) remote session.
///
/// Callers using the same key share this value and serialize on its state
/// lock, which is what keeps two commands from writing to one shell at once.
pub struct PooledSession {
    pub id: Uuid,
    pub key: String,
    state: Arc<Mutex<SessionState>>,
}

pub enum SessionState {
    /// Created by the pool, not connected yet
    Pending,
    Live(LiveSession),
    /// Torn down. `Some` carries the failure that caused it; `None` means an
    /// orderly close, after which waiting callers retry on a fresh session.
    Closed(Option<String>),
}

pub struct LiveSession {
    pub transport: Arc<dyn Transport>,
    /// Opened lazily on first multiplexed use
    pub shell: Option<Box<dyn ShellChannel>>,
}

impl PooledSession {
    pub fn new(key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.to_string(),
            state: Arc::new(Mutex::new(SessionState::Pending)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Lock for a caller that may be cancelled while holding the guard
    pub async fn lock_owned(&self) -> OwnedMutexGuard<SessionState> {
        self.state.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, SessionState>> {
        self.state.try_lock().ok()
    }
}

impl SessionState {
    /// Close the shell (if any) and then the transport
    pub async fn shutdown(&mut self, reason: Option<String>) {
        std::mem::replace(self, SessionState::Closed(reason))
            .close()
            .await;
    }

    /// Release whatever a state value still holds open
    pub async fn close(self) {
        if let SessionState::Live(mut live) = self {
            if let Some(mut shell) = live.shell.take() {
                if let Err(e) = shell.close().await {
                    tracing::debug!("Error closing shell channel: {e}");
                }
            }
            if let Err(e) = live.transport.close().await {
                tracing::debug!("Error closing SSH transport: {e}");
            }
        }
    }
}

struct IdleTimer {
    token: u64,
    handle: JoinHandle<()>,
}

struct PoolEntry {
    session: Arc<PooledSession>,
    leases: usize,
    idle_timer: Option<IdleTimer>,
}

impl PoolEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.handle.abort();
        }
    }
}

pub struct Pool {
    connections: HashMap<String, PoolEntry>,
    max_sessions: Option<usize>,
    next_token: u64,
}

impl Pool {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Pool {
            connections: HashMap::new(),
            max_sessions,
            next_token: 0,
        }
    }

    /// Fetch the session for `key`, creating an unconnected one on a miss.
    /// Takes a lease and cancels any pending idle eviction.
    pub fn checkout(&mut self, key: &str) -> Result<Arc<PooledSession>, SshError> {
        if let Some(entry) = self.connections.get_mut(key) {
            tracing::debug!("found existing session in pool for {key}");
            entry.cancel_timer();
            entry.leases += 1;
            return Ok(entry.session.clone());
        }

        if let Some(max) = self.max_sessions {
            if self.connections.len() >= max {
                return Err(SshError::PoolExhausted(self.connections.len()));
            }
        }

        tracing::debug!("Creating new pooled session for {key}");
        let session = Arc::new(PooledSession::new(key));
        self.connections.insert(
            key.to_string(),
            PoolEntry {
                session: session.clone(),
                leases: 1,
                idle_timer: None,
            },
        );

        Ok(session)
    }

    /// Return a lease. Yields the number of leases still outstanding, or
    /// `None` if the entry is gone or belongs to a different session.
    pub fn checkin(&mut self, key: &str, session_id: Uuid) -> Option<usize> {
        let entry = self.connections.get_mut(key)?;
        if entry.session.id != session_id {
            return None;
        }

        entry.leases = entry.leases.saturating_sub(1);
        Some(entry.leases)
    }

    /// Reserve a token for a new idle timer on `key`. The timer task itself
    /// is attached with [`Pool::attach_idle_timer`].
    pub fn next_timer_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub fn attach_idle_timer(&mut self, key: &str, token: u64, handle: JoinHandle<()>) {
        match self.connections.get_mut(key) {
            Some(entry) => {
                entry.cancel_timer();
                entry.idle_timer = Some(IdleTimer { token, handle });
            }
            None => handle.abort(),
        }
    }

    /// Remove `key` if its idle timer `token` is still the armed one and
    /// nobody holds a lease.
    pub fn expire(&mut self, key: &str, token: u64) -> Option<Arc<PooledSession>> {
        let entry = self.connections.get(key)?;
        let armed = entry.idle_timer.as_ref().map(|t| t.token);
        if armed != Some(token) || entry.leases > 0 {
            return None;
        }

        self.connections.remove(key).map(|entry| entry.session)
    }

    /// Remove `key`, but only if it still refers to `session_id`
    pub fn remove(&mut self, key: &str, session_id: Uuid) -> Option<Arc<PooledSession>> {
        if self.connections.get(key)?.session.id != session_id {
            return None;
        }
        self.remove_any(key)
    }

    pub fn remove_any(&mut self, key: &str) -> Option<Arc<PooledSession>> {
        let mut entry = self.connections.remove(key)?;
        entry.cancel_timer();
        Some(entry.session)
    }

    /// Sessions nobody is currently using
    pub fn idle_sessions(&self) -> Vec<Arc<PooledSession>> {
        self.connections
            .values()
            .filter(|entry| entry.leases == 0)
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every entry, returning the sessions so they can be shut down
    pub fn drain(&mut self) -> Vec<Arc<PooledSession>> {
        self.connections
            .drain()
            .map(|(_, mut entry)| {
                entry.cancel_timer();
                entry.session
            })
            .collect()
    }
}
