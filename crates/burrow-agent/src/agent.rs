//! Tunnel agent: listener, socket pool, and checkout queue
//!
//! The agent coordinates two producer/consumer streams: tunnel sockets
//! arriving from the remote client, and proxy requests demanding a socket.
//! Sockets and waiters are both FIFO, and an arriving socket always satisfies
//! the oldest waiter before it is allowed to go idle.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::public_ip::public_ip;
use crate::socket::{canonical_ip, TunnelSocket};

/// Default ceiling on simultaneous tunnel sockets per client.
pub const DEFAULT_MAX_SOCKETS: usize = 10;

/// Default idle timeout for pooled tunnel sockets.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunnel agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum simultaneous tunnel sockets
    pub max_sockets: usize,
    /// How long a pooled socket may sit idle before it is destroyed. Also
    /// bounds how long a checkout waits for a socket to arrive.
    pub idle_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Agent lifecycle events, delivered over the channel returned by
/// [`TunnelAgent::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// Connected socket count went 0 -> 1
    Online,
    /// Connected socket count returned to 0
    Offline,
    /// The agent was destroyed; no further sockets will be admitted
    End,
}

/// Tunnel agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent already started")]
    AlreadyStarted,

    #[error("agent is closed")]
    Closed,

    #[error("timed out waiting for a tunnel socket")]
    CheckoutTimeout,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result of [`TunnelAgent::listen`]
#[derive(Debug, Clone)]
pub struct ListenInfo {
    /// Port the remote client should dial its tunnel sockets to
    pub port: u16,
    /// Best-effort public address of this host, if discovery succeeded
    pub public_ip: Option<IpAddr>,
}

/// Snapshot of agent counters
#[derive(Debug, Clone)]
pub struct AgentStats {
    /// Sockets currently admitted (idle + checked out)
    pub connected_sockets: usize,
    /// Sockets currently idle in the pool
    pub idle_sockets: usize,
    /// Distinct normalized peer addresses seen over the agent's lifetime
    pub peer_ips: Vec<IpAddr>,
}

/// Reply channel a checkout hands to an idle socket's guard task.
type Claim = oneshot::Sender<TunnelSocket>;

/// Pool entry for an idle socket, owned by its guard task.
struct IdleHandle {
    socket_id: u64,
    claim: oneshot::Sender<Claim>,
}

#[derive(Default)]
struct AgentState {
    available: VecDeque<IdleHandle>,
    waiters: VecDeque<oneshot::Sender<TunnelSocket>>,
    connected: usize,
    next_socket_id: u64,
    started: bool,
    closed: bool,
    peer_ips: HashSet<IpAddr>,
    shutdown: Option<oneshot::Sender<()>>,
}

pub(crate) struct AgentInner {
    id: String,
    config: AgentConfig,
    state: Mutex<AgentState>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

/// Per-client pool of tunnel sockets behind a dedicated TCP listener.
#[derive(Clone)]
pub struct TunnelAgent {
    inner: Arc<AgentInner>,
}

impl TunnelAgent {
    /// Create an agent and the receiving end of its lifecycle events.
    pub fn new(id: impl Into<String>, config: AgentConfig) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let agent = Self {
            inner: Arc::new(AgentInner {
                id: id.into(),
                config,
                state: Mutex::new(AgentState::default()),
                events,
            }),
        };
        (agent, events_rx)
    }

    /// Identifier of the client this agent serves.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Bind the tunnel listener on an OS-chosen port and start admitting
    /// sockets. Fails with [`AgentError::AlreadyStarted`] on a second call.
    ///
    /// The public IP in the result is discovered opportunistically; lookup
    /// failure just leaves it unset.
    pub async fn listen(&self) -> Result<ListenInfo, AgentError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(AgentError::Closed);
            }
            if state.started {
                return Err(AgentError::AlreadyStarted);
            }
            state.started = true;
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(AgentError::Closed);
            }
            state.shutdown = Some(shutdown_tx);
        }

        info!(agent = %self.inner.id, port, "tunnel listener bound");
        tokio::spawn(accept_loop(self.inner.clone(), listener, shutdown_rx));

        let public_ip = public_ip().await;
        Ok(ListenInfo { port, public_ip })
    }

    /// Check out one tunnel socket.
    ///
    /// Completes immediately with the oldest idle socket when one exists,
    /// fails with [`AgentError::Closed`] if the agent is destroyed, and
    /// otherwise parks until the next admitted socket is handed over. Parked
    /// checkouts are served in FIFO order and give up after the agent's idle
    /// timeout.
    pub async fn create_connection(&self) -> Result<TunnelSocket, AgentError> {
        loop {
            let mut idle = None;
            let mut parked = None;
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(AgentError::Closed);
                }
                match state.available.pop_front() {
                    Some(handle) => idle = Some(handle),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        parked = Some(rx);
                    }
                }
            }

            if let Some(handle) = idle {
                let (reply_tx, reply_rx) = oneshot::channel();
                if handle.claim.send(reply_tx).is_ok() {
                    if let Ok(socket) = reply_rx.await {
                        return Ok(socket);
                    }
                }
                // The guard raced us into discarding this socket; take the
                // next one.
                continue;
            }

            let rx = parked.expect("checkout neither claimed nor parked");
            return match tokio::time::timeout(self.inner.config.idle_timeout, rx).await {
                Ok(Ok(socket)) => Ok(socket),
                Ok(Err(_)) => Err(AgentError::Closed),
                Err(_) => Err(AgentError::CheckoutTimeout),
            };
        }
    }

    /// Snapshot of the agent's counters.
    pub fn stats(&self) -> AgentStats {
        let state = self.inner.state.lock().unwrap();
        AgentStats {
            connected_sockets: state.connected,
            idle_sockets: state.available.len(),
            peer_ips: state.peer_ips.iter().copied().collect(),
        }
    }

    /// Tear the agent down: close the listener, fail all parked checkouts
    /// with [`AgentError::Closed`], and emit [`AgentEvent::End`]. Every
    /// subsequent `create_connection` fails immediately. Idempotent.
    pub fn destroy(&self) {
        self.inner.close();
    }
}

impl AgentInner {
    /// Admit a freshly accepted tunnel socket into the pool.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if state.connected >= self.config.max_sockets {
            debug!(agent = %self.id, peer = %peer, "tunnel socket limit reached, dropping");
            return;
        }

        let peer = SocketAddr::new(canonical_ip(peer.ip()), peer.port());
        state.peer_ips.insert(peer.ip());
        state.connected += 1;
        let came_online = state.connected == 1;

        let socket_id = state.next_socket_id;
        state.next_socket_id += 1;
        debug!(agent = %self.id, peer = %peer, socket_id, "tunnel socket admitted");

        let lease = SocketLease {
            inner: self.clone(),
            socket_id,
        };
        let mut socket = Some(TunnelSocket::new(stream, peer, lease));

        // Hand off to the oldest live waiter. The send only wakes the
        // waiting task, so its callback runs after this admission returns.
        let mut delivered = false;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(socket.take().expect("socket present while undelivered")) {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(back) => socket = Some(back),
            }
        }

        if !delivered {
            let socket = socket.expect("socket present while undelivered");
            let (claim_tx, claim_rx) = oneshot::channel();
            state.available.push_back(IdleHandle {
                socket_id,
                claim: claim_tx,
            });
            tokio::spawn(idle_guard(
                self.clone(),
                socket_id,
                socket,
                claim_rx,
                self.config.idle_timeout,
            ));
        }
        drop(state);

        if came_online {
            let _ = self.events.send(AgentEvent::Online);
        }
    }

    /// Drop a socket's pool entry, if it still has one.
    fn take_available(&self, socket_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.available.retain(|handle| handle.socket_id != socket_id);
    }

    /// Called from [`SocketLease::drop`]: the socket is gone, in whichever
    /// way it went.
    fn release(&self, socket_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.available.retain(|handle| handle.socket_id != socket_id);
        state.connected -= 1;
        let went_offline = state.connected == 0 && !state.closed;
        drop(state);

        if went_offline {
            let _ = self.events.send(AgentEvent::Offline);
        }
    }

    fn close(&self) {
        let shutdown = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the waiter senders completes every parked checkout
            // with Closed; dropping the idle handles makes each guard task
            // discard its socket.
            state.waiters.clear();
            state.available.clear();
            state.shutdown.take()
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }

        info!(agent = %self.id, "agent closed");
        let _ = self.events.send(AgentEvent::End);
    }
}

/// Slot reservation carried by every admitted socket. Dropping it is the
/// single place the connected counter is decremented.
pub(crate) struct SocketLease {
    inner: Arc<AgentInner>,
    socket_id: u64,
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.inner.release(self.socket_id);
    }
}

async fn accept_loop(
    inner: Arc<AgentInner>,
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => inner.admit(stream, peer),
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::TimedOut
                ) => {
                    debug!(agent = %inner.id, "transient accept error: {e}");
                }
                Err(e) => {
                    warn!(agent = %inner.id, "accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!(agent = %inner.id, "tunnel listener closed");
}

enum IdleOutcome {
    Claimed(Claim),
    Evicted,
    Expired,
    Dead,
}

/// Owns an idle socket until it is claimed by a checkout, times out, or the
/// peer hangs up underneath it.
async fn idle_guard(
    inner: Arc<AgentInner>,
    socket_id: u64,
    socket: TunnelSocket,
    mut claim_rx: oneshot::Receiver<Claim>,
    idle_timeout: Duration,
) {
    let outcome = tokio::select! {
        claim = &mut claim_rx => match claim {
            Ok(reply) => IdleOutcome::Claimed(reply),
            Err(_) => IdleOutcome::Evicted,
        },
        _ = tokio::time::sleep(idle_timeout) => IdleOutcome::Expired,
        _ = socket.unusable() => IdleOutcome::Dead,
    };

    match outcome {
        IdleOutcome::Claimed(reply) => {
            // Checked out; the lease travels with the socket.
            let _ = reply.send(socket);
        }
        IdleOutcome::Evicted => {
            // The agent already dropped our pool entry (close cascade).
        }
        IdleOutcome::Expired => {
            debug!(agent = %inner.id, socket_id, "idle tunnel socket timed out");
            inner.take_available(socket_id);
        }
        IdleOutcome::Dead => {
            debug!(agent = %inner.id, socket_id, "idle tunnel socket closed by peer");
            inner.take_available(socket_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_agent(id: &str) -> (TunnelAgent, mpsc::UnboundedReceiver<AgentEvent>) {
        // Keep listen() from reaching out to a real IP-echo service.
        std::env::set_var("BURROW_IP_ECHO_URL", "http://127.0.0.1:9");
        TunnelAgent::new(id, AgentConfig::default())
    }

    #[test]
    fn config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_sockets, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let (agent, _events) = offline_agent("twice");
        agent.listen().await.unwrap();
        assert!(matches!(
            agent.listen().await,
            Err(AgentError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn create_connection_after_destroy_fails_immediately() {
        let (agent, _events) = offline_agent("gone");
        agent.listen().await.unwrap();
        agent.destroy();
        assert!(matches!(
            agent.create_connection().await,
            Err(AgentError::Closed)
        ));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_emits_end_once() {
        let (agent, mut events) = offline_agent("end-once");
        agent.listen().await.unwrap();
        agent.destroy();
        agent.destroy();
        assert_eq!(events.recv().await, Some(AgentEvent::End));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn listen_after_destroy_fails() {
        let (agent, _events) = offline_agent("late");
        agent.destroy();
        assert!(matches!(agent.listen().await, Err(AgentError::Closed)));
    }
}
