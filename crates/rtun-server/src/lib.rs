//! Reverse-tunnel broker
//!
//! Accepts client registrations, leases each client a public port from a
//! [`PortPool`], and bridges every end-user connection on that port to a
//! logical stream on the client's multiplexed connection.

pub mod config;
pub mod port_pool;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{parse_port_list, PortRange, ServerConfig, SessionConfig};
pub use port_pool::{Lease, PortLease, PortPool};
pub use registry::{SessionInfo, SessionRegistry};
pub use server::{ServerError, TunnelServer};
pub use session::{DeathReason, SessionError, TunnelSession};
