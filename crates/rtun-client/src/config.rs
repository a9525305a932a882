//! Client configuration

use rtun_transport::config::duration_secs;
use rtun_transport::MuxConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker registration address (`host:port`)
    pub server_addr: String,
    /// Local service every stream is forwarded to (`host:port`)
    pub local_addr: String,
    /// Bound on dialing the broker and reading the port announcement
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Multiplexer keepalive interval, zero disables it
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub open_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            local_addr: local_addr.into(),
            ..Default::default()
        }
    }

    pub fn mux_config(&self) -> MuxConfig {
        let keepalive = (!self.keepalive_interval.is_zero()).then_some(self.keepalive_interval);
        MuxConfig::default()
            .with_keepalive(keepalive)
            .with_ping_timeout(self.ping_timeout)
            .with_open_timeout(self.open_timeout)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_string(),
            local_addr: "127.0.0.1:8080".to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
        }
    }
}
