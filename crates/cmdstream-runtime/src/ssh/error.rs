use std::time::Duration;

/// Failures on the SSH paths. Callers never see these directly; they are
/// rendered into a failed `CommandExecutionResult`.
#[derive(thiserror::Error, Debug)]
pub enum SshError {
    #[error("SSH connection failed: {0}")]
    Connect(String),
    #[error("SSH authentication failed for {username}@{host}")]
    Authentication { username: String, host: String },
    #[error("SSH channel error: {0}")]
    Channel(String),
    #[error("SSH session closed: {0}")]
    Closed(String),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection pool exhausted ({0} sessions open)")]
    PoolExhausted(usize),
    #[error("Command contains reserved marker text: {0}")]
    ReservedMarker(String),
    #[error("SSH pool is shut down")]
    PoolShutdown,
}
