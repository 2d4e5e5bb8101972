//! The plain data exchanged between the runtime and its callers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of one command invocation.
///
/// `success == false` means either the connection failed (the message is in
/// `output`) or the command itself reported an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecutionResult {
    pub output: String,
    pub success: bool,
}

impl CommandExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
        }
    }
}

/// Where and as whom to connect.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_port() -> u16 {
    22
}

impl ConnectParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// The pool key used when the caller doesn't supply one.
    pub fn connection_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Keep the password out of logs
impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolve the pool key for an invocation: an explicit session key wins over
/// the one derived from the connection parameters.
pub fn resolve_key(params: &ConnectParams, session_key: Option<&str>) -> String {
    match session_key {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => params.connection_key(),
    }
}
