//! One tunnel client: HTTP bridging over pooled tunnel sockets

use burrow_agent::{AgentStats, TunnelAgent};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_TYPE};
use hyper::upgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::copy_bidirectional;
use tracing::{debug, info};

/// Body type produced by the proxy path: either a streamed upstream body or
/// a small synthesized error page.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that only ever apply to a single hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// A live tunnel client: one agent plus the reverse-proxy glue.
pub struct Client {
    id: String,
    agent: TunnelAgent,
    disposed: AtomicBool,
}

impl Client {
    pub fn new(id: impl Into<String>, agent: TunnelAgent) -> Self {
        Self {
            id: id.into(),
            agent,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> AgentStats {
        self.agent.stats()
    }

    /// Bridge one public HTTP request onto a tunnel socket.
    ///
    /// The request is replayed over a fresh HTTP/1.1 client conversation that
    /// sources its connection from the agent pool, so framing, chunking and
    /// keep-alive are handled by hyper. The response body is streamed, not
    /// buffered. Any socket failure before response headers surfaces as 502.
    pub async fn handle_request(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        if self.disposed.load(Ordering::Relaxed) {
            return self.bad_gateway();
        }

        let socket = match self.agent.create_connection().await {
            Ok(socket) => socket,
            Err(e) => {
                debug!(client = %self.id, "no tunnel socket for request: {e}");
                return self.bad_gateway();
            }
        };

        strip_hop_by_hop(req.headers_mut());

        let (mut sender, conn) = match http1::handshake(TokioIo::new(socket)).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(client = %self.id, "tunnel handshake failed: {e}");
                return self.bad_gateway();
            }
        };
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(client = %id, "tunnel connection ended: {e}");
            }
        });

        match sender.send_request(req).await {
            Ok(mut resp) => {
                strip_hop_by_hop(resp.headers_mut());
                resp.map(|body| body.boxed())
            }
            Err(e) => {
                debug!(client = %self.id, "request over tunnel failed: {e}");
                self.bad_gateway()
            }
        }
    }

    /// Bridge a protocol upgrade (WebSocket).
    ///
    /// The request is forwarded over a tunnel socket with its upgrade headers
    /// intact; when the remote answers `101 Switching Protocols` both sides
    /// are upgraded and their byte streams spliced until either closes. The
    /// tunnel socket never returns to the pool.
    pub async fn handle_upgrade(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        if self.disposed.load(Ordering::Relaxed) {
            return self.bad_gateway();
        }

        let socket = match self.agent.create_connection().await {
            Ok(socket) => socket,
            Err(e) => {
                debug!(client = %self.id, "no tunnel socket for upgrade: {e}");
                return self.bad_gateway();
            }
        };

        let (mut sender, conn) = match http1::handshake(TokioIo::new(socket)).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(client = %self.id, "tunnel handshake failed: {e}");
                return self.bad_gateway();
            }
        };
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(client = %id, "tunnel connection ended: {e}");
            }
        });

        let public_upgrade = upgrade::on(&mut req);
        let mut resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(client = %self.id, "upgrade over tunnel failed: {e}");
                return self.bad_gateway();
            }
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let tunnel_upgrade = upgrade::on(&mut resp);
            let id = self.id.clone();
            tokio::spawn(async move {
                let public = match public_upgrade.await {
                    Ok(io) => io,
                    Err(e) => {
                        debug!(client = %id, "public upgrade failed: {e}");
                        return;
                    }
                };
                let tunnel = match tunnel_upgrade.await {
                    Ok(io) => io,
                    Err(e) => {
                        debug!(client = %id, "tunnel upgrade failed: {e}");
                        return;
                    }
                };
                let mut public = TokioIo::new(public);
                let mut tunnel = TokioIo::new(tunnel);
                match copy_bidirectional(&mut public, &mut tunnel).await {
                    Ok((sent, received)) => {
                        debug!(client = %id, sent, received, "upgraded connection closed");
                    }
                    Err(e) => debug!(client = %id, "upgraded connection aborted: {e}"),
                }
            });
        }

        resp.map(|body| body.boxed())
    }

    /// Destroy the agent. The manager removes this client when the agent's
    /// end-of-life event lands.
    pub fn close(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            info!(client = %self.id, "closing client");
            self.agent.destroy();
        }
    }

    fn bad_gateway(&self) -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(CONTENT_TYPE, "text/plain")
            .body(full(format!("client [{}] failed", self.id)))
            .unwrap()
    }
}

fn full(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Remove hop-by-hop headers, both the fixed RFC 7230 set and anything named
/// by the Connection header.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| token.trim().parse::<HeaderName>().ok())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in named {
        headers.remove(name);
    }
}
