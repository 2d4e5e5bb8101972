//! Configuration for the session pool and the marker protocol.
//!
//! Durations are expressed in whole seconds when (de)serialized so that the
//! config file stays readable, e.g.
//!
//! ```yaml
//! idle_timeout: 300
//! command_timeout: 60
//! max_sessions: 32
//! marker:
//!   randomize: true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Health check every 2 minutes to avoid excessive network traffic
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(120);

/// Settings for the pooled, multiplexed execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct PoolConfig {
    /// How long a released keep-alive session may sit unused before eviction
    #[builder(default = DEFAULT_IDLE_TIMEOUT)]
    #[serde(with = "secs")]
    pub idle_timeout: Duration,

    /// Upper bound on a single multiplexed command. `None` waits for the end
    /// marker (or channel close) indefinitely.
    #[builder(default, setter(strip_option))]
    #[serde(with = "opt_secs")]
    pub command_timeout: Option<Duration>,

    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    /// Maximum number of distinct live session keys. `None` is unbounded.
    #[builder(default, setter(strip_option))]
    pub max_sessions: Option<usize>,

    #[builder(default = DEFAULT_HEALTH_CHECK_INTERVAL)]
    #[serde(with = "secs")]
    pub health_check_interval: Duration,

    #[builder(default)]
    pub marker: MarkerConfig,

    #[builder(default)]
    pub pty: PtyConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Literal text used to bracket each command's output in the shared shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub begin: String,
    pub end: String,
    /// Append a fresh random suffix to both markers on every invocation
    pub randomize: bool,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            begin: "__CMDSTREAM_BEGIN__".to_string(),
            end: "__CMDSTREAM_END__".to_string(),
            randomize: true,
        }
    }
}

/// Terminal requested when an interactive shell channel is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyConfig {
    fn default() -> Self {
        // Wide enough that typical composite lines are not wrapped by the
        // remote terminal, which would split the echoed markers.
        Self {
            term: "xterm".to_string(),
            cols: 1000,
            rows: 24,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_secs))
    }
}
