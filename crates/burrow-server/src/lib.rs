//! Public HTTP surface
//!
//! One TCP listener serves everything: requests whose Host carries a live
//! client identifier as its leftmost label are proxied through that client's
//! tunnel, everything else lands on the management router (tunnel creation,
//! status, landing redirect).

mod api;
mod server;

use burrow_control::ClientManager;
use std::sync::Arc;

pub use api::{NewTunnelResponse, StatusResponse, TunnelStatusResponse};
pub use server::{PublicServer, ServerError};

/// Public server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base domain tunnels are served under (e.g. `lt.example.com`)
    pub domain: String,
    /// Advertise `https://` tunnel URLs
    pub secure: bool,
    /// Where to send requests for the bare domain, if anywhere
    pub landing: Option<String>,
}

impl ServerConfig {
    /// Public URL for a tunnel identifier.
    pub fn public_url(&self, id: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{id}.{}", self.domain)
    }
}

/// Shared state behind every request handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) manager: ClientManager,
    pub(crate) config: Arc<ServerConfig>,
}
