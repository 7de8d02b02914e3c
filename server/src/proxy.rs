//! # Public HTTP Surface
//!
//! The axum router every public request enters: `/_health`, the `/_tunnel`
//! control-plane upgrade endpoint and a fallback handler that resolves the
//! target tunnel (host, then first path segment, then header) and bridges
//! the request onto a multiplexed stream.

use crate::config::{Limits, Timeouts};
use crate::control::ControlPlane;
use crate::http;
use crate::registry::Registry;
use crate::session::SessionState;
use crate::transport::WsByteStream;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use burrow_protocol::{StreamHeader, StreamKind};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ProxyState {
    pub control: Arc<ControlPlane>,
    pub registry: Arc<Registry>,
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub tls: bool,
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/_tunnel", get(tunnel_upgrade))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Small status document with live session and tunnel counts.
async fn health(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    let (sessions, tunnels) = state.registry.counts().await;
    Json(serde_json::json!({
        "status": "ok",
        "sessions": sessions,
        "tunnels": tunnels,
    }))
}

/// Control-plane connections arriving over an HTTP upgrade instead of the
/// raw TCP listener. The WebSocket is adapted to a byte stream and handed
/// to the same connection handler.
async fn tunnel_upgrade(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let io = WsByteStream::new(socket);
        let control = Arc::clone(&state.control);
        control.handle_connection(io, peer.to_string()).await;
    })
}

async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    // Resolution order: Host header, first path segment (with rewrite),
    // X-Tunnel-Subdomain.
    let mut entry = if host.is_empty() {
        None
    } else {
        state.registry.lookup_by_host(&host).await
    };
    if entry.is_none() {
        if let Some((candidate, rest)) = first_path_segment(req.uri().path()) {
            if let Some(found) = state.registry.lookup(candidate).await {
                let rewritten = rewrite_path(rest, req.uri().query());
                if let Ok(uri) = rewritten.parse::<Uri>() {
                    *req.uri_mut() = uri;
                    entry = Some(found);
                }
            }
        }
    }
    if entry.is_none() {
        if let Some(subdomain) = req
            .headers()
            .get("x-tunnel-subdomain")
            .and_then(|v| v.to_str().ok())
        {
            entry = state.registry.lookup(subdomain).await;
        }
    }
    let Some(entry) = entry else {
        debug!(%request_id, %host, path = %req.uri().path(), "no tunnel for request");
        return http::status_response(StatusCode::NOT_FOUND, "tunnel not found");
    };

    if entry.session.state() != SessionState::Active {
        return http::status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel session is not active");
    }

    if state.limits.max_request_body_size > 0 {
        let declared: Option<u64> = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if declared.is_some_and(|len| len > state.limits.max_request_body_size) {
            return http::status_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    }

    let is_websocket = http::is_websocket_upgrade(req.headers());
    let header = StreamHeader {
        kind: if is_websocket { StreamKind::Websocket } else { StreamKind::Http },
        local_port: entry.local_port,
        local_host: entry.local_host.clone(),
        request_id: request_id.clone(),
        subdomain: entry.subdomain.clone(),
        remote_addr: Some(peer.to_string()),
        host: (!host.is_empty()).then(|| host.clone()),
        method: Some(req.method().to_string()),
        path: req.uri().path_and_query().map(|pq| pq.as_str().to_owned()),
    };

    let stream = match state.control.proxy_request(&entry, header).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%request_id, subdomain = %entry.subdomain, %error, "opening tunnel stream failed");
            entry.session.metrics().errors.fetch_add(1, Ordering::Relaxed);
            return http::status_response(StatusCode::BAD_GATEWAY, "tunnel unavailable");
        }
    };

    info!(
        %request_id,
        subdomain = %entry.subdomain,
        method = %req.method(),
        path = %req.uri().path(),
        websocket = is_websocket,
        "proxying request"
    );

    let fallback_host = format!("{}.{}", entry.subdomain, state.registry.base_domain());
    let peer_ip = peer.ip().to_string();
    let session = Arc::clone(&entry.session);
    if is_websocket {
        http::bridge_websocket(req, stream, fallback_host, peer_ip, state.tls, session, request_id)
            .await
    } else {
        http::bridge_http(
            req,
            stream,
            fallback_host,
            peer_ip,
            state.tls,
            session,
            request_id,
            state.timeouts.request(),
        )
        .await
    }
}

/// `/myapp/users` → `("myapp", "/users")`; `/myapp` → `("myapp", "")`.
fn first_path_segment(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.find('/') {
        Some(idx) => Some((&trimmed[..idx], &trimmed[idx..])),
        None => Some((trimmed, "")),
    }
}

fn rewrite_path(rest: &str, query: Option<&str>) -> String {
    let path = if rest.is_empty() { "/" } else { rest };
    match query {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments() {
        assert_eq!(first_path_segment("/myapp/users"), Some(("myapp", "/users")));
        assert_eq!(first_path_segment("/myapp"), Some(("myapp", "")));
        assert_eq!(first_path_segment("/"), None);
        assert_eq!(first_path_segment(""), None);
    }

    #[test]
    fn path_rewrites() {
        assert_eq!(rewrite_path("/users", Some("x=1")), "/users?x=1");
        assert_eq!(rewrite_path("", None), "/");
        assert_eq!(rewrite_path("", Some("a=b")), "/?a=b");
    }
}
