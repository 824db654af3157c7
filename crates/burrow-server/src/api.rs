//! Management endpoints served on the bare domain

use crate::AppState;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use burrow_control::ManagerError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Response to a tunnel creation request.
#[derive(Debug, Serialize, Deserialize)]
pub struct NewTunnelResponse {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
    pub url: String,
}

/// Response to `GET /api/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub tunnels: usize,
}

/// Response to `GET /api/tunnels/:id/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelStatusResponse {
    pub connected_sockets: usize,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/tunnels/:id/status", get(tunnel_status))
        .route("/", get(root))
        .route("/:id", get(named_tunnel))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnels: state.manager.stats().tunnels,
    })
}

async fn tunnel_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get_client(&id) {
        Some(client) => Json(TunnelStatusResponse {
            connected_sockets: client.stats().connected_sockets,
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "404").into_response(),
    }
}

/// `GET /?new` creates a tunnel with a random identifier; a bare `GET /` is
/// sent to the landing page when one is configured.
async fn root(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    if wants_new_tunnel(query.as_deref()) {
        return create_tunnel(&state, None).await;
    }
    match &state.config.landing {
        Some(landing) => {
            (StatusCode::FOUND, [(header::LOCATION, landing.clone())]).into_response()
        }
        None => (StatusCode::NOT_FOUND, "404").into_response(),
    }
}

/// `GET /<requestedId>` creates a tunnel under a chosen identifier.
async fn named_tunnel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    create_tunnel(&state, Some(&id)).await
}

async fn create_tunnel(state: &AppState, requested: Option<&str>) -> Response {
    match state.manager.new_client(requested).await {
        Ok(info) => {
            let url = state.config.public_url(&info.id);
            Json(NewTunnelResponse {
                id: info.id,
                port: info.port,
                max_conn_count: info.max_conn_count,
                url,
            })
            .into_response()
        }
        Err(ManagerError::InvalidId(_)) => (
            StatusCode::FORBIDDEN,
            "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.",
        )
            .into_response(),
        Err(ManagerError::AtCapacity) => {
            (StatusCode::SERVICE_UNAVAILABLE, "tunnel limit reached").into_response()
        }
        Err(e) => {
            error!("failed to create tunnel: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to create tunnel").into_response()
        }
    }
}

fn wants_new_tunnel(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .any(|pair| pair == "new" || pair.starts_with("new="))
    })
}
