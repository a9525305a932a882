//! Multiplexer session configuration

use std::time::Duration;

/// Default interval between keepalive pings
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time to wait for a ping or open acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of peer-opened streams waiting to be accepted
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Ping the peer on this interval and close the session on the first
    /// failure. `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    pub ping_timeout: Duration,
    pub open_timeout: Duration,
    pub accept_backlog: usize,
}

impl MuxConfig {
    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            ping_timeout: DEFAULT_ACK_TIMEOUT,
            open_timeout: DEFAULT_ACK_TIMEOUT,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

/// Serialize a `Duration` as whole seconds in config files
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
