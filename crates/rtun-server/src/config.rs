//! Broker configuration

use rtun_transport::config::duration_secs;
use rtun_transport::MuxConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::warn;

/// Inclusive range of public ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address clients register on
    pub listen_addr: SocketAddr,
    /// Explicit public ports to lease
    pub ports: Vec<u16>,
    /// Range of public ports to lease, added to `ports`
    pub port_range: Option<PortRange>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000),
            ports: Vec::new(),
            port_range: None,
            session: SessionConfig::default(),
        }
    }
}

/// Per-session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interface leased public listeners bind on
    pub public_bind: IpAddr,
    /// Interval between liveness pings sent to the client
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,
    /// Multiplexer keepalive interval, zero disables it
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub open_timeout: Duration,
    /// Consecutive accept errors on a public listener tolerated before the
    /// session is declared dead
    pub accept_retry_limit: u32,
}

impl SessionConfig {
    pub fn mux_config(&self) -> MuxConfig {
        let keepalive = (!self.keepalive_interval.is_zero()).then_some(self.keepalive_interval);
        MuxConfig::default()
            .with_keepalive(keepalive)
            .with_ping_timeout(self.ping_timeout)
            .with_open_timeout(self.open_timeout)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            public_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ping_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
            accept_retry_limit: 0,
        }
    }
}

/// Parse port numbers given as text, skipping entries that are not valid ports
pub fn parse_port_list<S: AsRef<str>>(items: &[S]) -> Vec<u16> {
    items
        .iter()
        .filter_map(|item| {
            let item = item.as_ref().trim();
            match item.parse::<u16>() {
                Ok(port) if port != 0 => Some(port),
                _ => {
                    warn!("Invalid port: {}", item);
                    None
                }
            }
        })
        .collect()
}
