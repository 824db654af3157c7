//! Process-wide registry of tunnel clients

use crate::client::Client;
use burrow_agent::{AgentConfig, AgentError, AgentEvent, TunnelAgent};
use rand::Rng;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

static ID_PATTERN: OnceLock<Regex> = OnceLock::new();

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Whether a client-requested identifier is acceptable: lowercase
/// alphanumeric with dashes, 4-63 chars, starting alphanumeric.
pub fn id_valid(id: &str) -> bool {
    ID_PATTERN
        .get_or_init(|| Regex::new("^[a-z0-9][a-z0-9-]{3,62}$").unwrap())
        .is_match(id)
}

/// Client manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-agent ceiling on simultaneous tunnel sockets
    pub max_sockets: usize,
    /// Idle timeout applied to pooled tunnel sockets
    pub socket_timeout: Duration,
    /// Cap on simultaneous live clients
    pub max_clients: Option<usize>,
    /// How long a client may stay offline (or take to come online after
    /// creation) before it is closed and its identifier freed
    pub grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sockets: 10,
            socket_timeout: Duration::from_secs(60),
            max_clients: None,
            grace_period: Duration::from_secs(1),
        }
    }
}

/// Manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid tunnel identifier: {0:?}")]
    InvalidId(String),

    #[error("tunnel limit reached")]
    AtCapacity,

    #[error("failed to start tunnel listener: {0}")]
    Listen(#[from] AgentError),
}

/// Result of a successful tunnel creation.
#[derive(Debug, Clone)]
pub struct NewClientInfo {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
}

/// Global statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ManagerStats {
    /// Number of live clients
    pub tunnels: usize,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<Client>>,
    /// Identifiers picked but whose listener is still being bound; keeps
    /// uniqueness across the await inside new_client.
    reserved: HashSet<String>,
}

impl Registry {
    fn occupied(&self, id: &str) -> bool {
        self.clients.contains_key(id) || self.reserved.contains(id)
    }
}

struct ManagerInner {
    config: ManagerConfig,
    registry: RwLock<Registry>,
}

/// Registry mapping client identifiers to live [`Client`]s.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

impl ClientManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    /// Create a new client and start its tunnel listener.
    ///
    /// A requested identifier must match the id pattern; if it is already
    /// live a fresh random identifier is assigned instead. Without a request
    /// a random 4-6 character identifier is generated.
    pub async fn new_client(&self, requested: Option<&str>) -> Result<NewClientInfo, ManagerError> {
        if let Some(requested) = requested {
            if !id_valid(requested) {
                return Err(ManagerError::InvalidId(requested.to_string()));
            }
        }

        let reservation = self.reserve(requested)?;
        let id = reservation.id().to_string();

        let (agent, events) = TunnelAgent::new(
            id.clone(),
            AgentConfig {
                max_sockets: self.inner.config.max_sockets,
                idle_timeout: self.inner.config.socket_timeout,
            },
        );

        // The reservation guard releases the identifier if this future is
        // dropped mid-await or the listener fails to come up.
        let listen = agent.listen().await?;

        info!(
            tunnel = %id,
            port = listen.port,
            public_ip = ?listen.public_ip,
            "tunnel created"
        );

        let client = Arc::new(Client::new(id.clone(), agent));
        {
            let mut registry = self.inner.registry.write().unwrap();
            registry.clients.insert(id.clone(), client.clone());
            reservation.complete(&mut registry);
        }

        tokio::spawn(watch_client(
            self.inner.clone(),
            id.clone(),
            client,
            events,
        ));

        Ok(NewClientInfo {
            id,
            port: listen.port,
            max_conn_count: self.inner.config.max_sockets,
        })
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.inner.registry.read().unwrap().clients.get(id).cloned()
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.inner.registry.read().unwrap().clients.contains_key(id)
    }

    /// Destroy a client's agent and drop its registry entry.
    pub fn remove_client(&self, id: &str) -> bool {
        let removed = self.inner.registry.write().unwrap().clients.remove(id);
        match removed {
            Some(client) => {
                info!(tunnel = %id, "removing tunnel");
                client.close();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            tunnels: self.inner.registry.read().unwrap().clients.len(),
        }
    }

    /// Pick an identifier and mark it in-flight, enforcing uniqueness and the
    /// global client cap.
    fn reserve(&self, requested: Option<&str>) -> Result<Reservation, ManagerError> {
        let mut registry = self.inner.registry.write().unwrap();

        if let Some(cap) = self.inner.config.max_clients {
            if registry.clients.len() + registry.reserved.len() >= cap {
                return Err(ManagerError::AtCapacity);
            }
        }

        let id = match requested {
            Some(requested) if !registry.occupied(requested) => requested.to_string(),
            _ => {
                let mut rng = rand::thread_rng();
                loop {
                    let candidate = random_id(&mut rng);
                    if !registry.occupied(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        registry.reserved.insert(id.clone());
        Ok(Reservation {
            inner: self.inner.clone(),
            id: Some(id),
        })
    }
}

/// An in-flight identifier reservation. Dropping it releases the identifier
/// again, so a creation that never finishes (listener failure, or the whole
/// future dropped because the requester went away) cannot leak it.
struct Reservation {
    inner: Arc<ManagerInner>,
    id: Option<String>,
}

impl Reservation {
    fn id(&self) -> &str {
        self.id.as_deref().expect("reservation already released")
    }

    /// Consume the reservation inside the registration lock, so the
    /// identifier moves from reserved to live in one step.
    fn complete(mut self, registry: &mut Registry) {
        if let Some(id) = self.id.take() {
            registry.reserved.remove(&id);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.registry.write().unwrap().reserved.remove(&id);
        }
    }
}

fn random_id(rng: &mut impl Rng) -> String {
    let len = rng.gen_range(4..=6);
    (0..len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Follow one client's lifecycle events until its agent ends, then drop the
/// registry entry.
///
/// A client gets a grace period to come online after creation, and the same
/// grace period to come back after going offline; crossing either deadline
/// closes it. The deadline keeps a transient zero-socket crossing between
/// back-to-back requests from tearing the client down.
async fn watch_client(
    inner: Arc<ManagerInner>,
    id: String,
    client: Arc<Client>,
    mut events: UnboundedReceiver<AgentEvent>,
) {
    let grace = inner.config.grace_period;
    let mut deadline = Some(Box::pin(tokio::time::sleep(grace)));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AgentEvent::Online) => {
                    debug!(tunnel = %id, "client online");
                    deadline = None;
                }
                Some(AgentEvent::Offline) => {
                    debug!(tunnel = %id, "client offline");
                    deadline = Some(Box::pin(tokio::time::sleep(grace)));
                }
                Some(AgentEvent::End) | None => break,
            },
            _ = async { deadline.as_mut().unwrap().await }, if deadline.is_some() => {
                info!(tunnel = %id, "client did not connect within grace period");
                deadline = None;
                client.close();
            }
        }
    }

    // Only drop the entry if it is still ours; the identifier may already
    // have been reused by a newer client.
    let mut registry = inner.registry.write().unwrap();
    if let Some(current) = registry.clients.get(&id) {
        if Arc::ptr_eq(current, &client) {
            registry.clients.remove(&id);
            info!(tunnel = %id, "tunnel removed");
        }
    }
}
