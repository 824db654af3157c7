//! Per-client tunnel socket management
//!
//! A [`TunnelAgent`] owns a TCP listener on an ephemeral port and a bounded
//! pool of tunnel sockets dialed by the remote client. It acts as an HTTP
//! connection source: [`TunnelAgent::create_connection`] yields an
//! already-established [`TunnelSocket`] that an HTTP client can drive
//! directly, so no outbound dial ever happens on the proxy path.

mod agent;
mod public_ip;
mod socket;

pub use agent::{AgentConfig, AgentError, AgentEvent, AgentStats, ListenInfo, TunnelAgent};
pub use public_ip::public_ip;
pub use socket::{canonical_ip, TunnelSocket};
