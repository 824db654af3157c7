//! Accept loop and hostname routing

use crate::{api, AppState, ServerConfig};
use axum::body::Body;
use axum::Router;
use burrow_control::ClientManager;
use hyper::body::Incoming;
use hyper::header::{HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, info};

/// Public server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The public HTTP server: one listener for proxied traffic and the
/// management API alike.
pub struct PublicServer {
    state: AppState,
    api: Router,
}

impl PublicServer {
    pub fn new(manager: ClientManager, config: ServerConfig) -> Self {
        let state = AppState {
            manager,
            config: Arc::new(config),
        };
        let api = api::router(state.clone());
        Self { state, api }
    }

    /// Serve connections from `listener` until the process shuts down.
    ///
    /// Each connection runs in its own task; a failure there is logged and
    /// never propagates past that connection.
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("public server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("accept failed: {e}");
                    continue;
                }
            };

            let state = self.state.clone();
            let api = self.api.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let state = state.clone();
                    let api = api.clone();
                    async move { Ok::<_, Infallible>(dispatch(state, api, req).await) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!(peer = %peer, "connection error: {e}");
                }
            });
        }
    }
}

/// Route one request: tunnel traffic by Host label, everything else to the
/// management router.
async fn dispatch(state: AppState, api: Router, req: Request<Incoming>) -> Response<Body> {
    let Some(host) = request_host(&req) else {
        return text_response(StatusCode::BAD_REQUEST, "missing host header");
    };

    match client_id_from_host(&host, &state.config.domain) {
        Some(id) => match state.manager.get_client(&id) {
            Some(client) => {
                let resp = if is_upgrade_request(&req) {
                    client.handle_upgrade(req).await
                } else {
                    client.handle_request(req).await
                };
                resp.map(Body::new)
            }
            None => {
                debug!(tunnel = %id, "no tunnel for host");
                text_response(StatusCode::NOT_FOUND, "404")
            }
        },
        None => match api.oneshot(req).await {
            Ok(resp) => resp,
            Err(never) => match never {},
        },
    }
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .map(|host| host.to_ascii_lowercase())
}

/// Extract the client identifier from a Host header: the leftmost DNS label
/// of hosts under the configured base domain.
fn client_id_from_host(host: &str, domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let prefix = host.strip_suffix(domain)?.strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }
    prefix.split('.').next().map(str::to_string)
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    req.headers().contains_key(UPGRADE)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_leftmost_label_under_the_base_domain() {
        assert_eq!(
            client_id_from_host("abc123.lt.example.com", "lt.example.com"),
            Some("abc123".to_string())
        );
        assert_eq!(
            client_id_from_host("abc123.lt.example.com:8080", "lt.example.com"),
            Some("abc123".to_string())
        );
        assert_eq!(
            client_id_from_host("a.b.lt.example.com", "lt.example.com"),
            Some("a".to_string())
        );
    }

    #[test]
    fn bare_and_foreign_hosts_have_no_client_id() {
        assert_eq!(client_id_from_host("lt.example.com", "lt.example.com"), None);
        assert_eq!(
            client_id_from_host("lt.example.com:8080", "lt.example.com"),
            None
        );
        assert_eq!(client_id_from_host("other.com", "lt.example.com"), None);
        // No dot boundary: "xlt.example.com" is not a subdomain.
        assert_eq!(
            client_id_from_host("xlt.example.com", "lt.example.com"),
            None
        );
    }
}
