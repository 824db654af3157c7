//! Tunnel clients and their registry
//!
//! A [`Client`] wraps one [`burrow_agent::TunnelAgent`] and bridges public
//! HTTP conversations onto tunnel sockets. The [`ClientManager`] maps client
//! identifiers (the leftmost DNS label of the public hostname) to live
//! clients and owns their lifecycle.

mod client;
mod manager;

pub use client::{Client, ProxyBody};
pub use manager::{
    id_valid, ClientManager, ManagerConfig, ManagerError, ManagerStats, NewClientInfo,
};
