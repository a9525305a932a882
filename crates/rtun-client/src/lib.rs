//! Reverse-tunnel client
//!
//! Registers with a broker, learns the public port it was given, and
//! forwards every stream the broker opens to a local service.

pub mod config;
pub mod forwarder;

pub use config::ClientConfig;
pub use forwarder::{ClientError, Forwarder};
