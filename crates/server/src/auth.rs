//! Access control middleware.
//!
//! When `allowedIPs` is non-empty every request must come from a listed peer.
//! When `apiKey` is non-empty, requests to `/ws` and `/api/*` must include
//! `Authorization: Bearer <key>` (or `?token=<key>` for WebSocket). Static
//! files and `/health` skip the token check.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use tracing::warn;

use crate::state::AppState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let config = state.config();
    let server = &config.server;

    if !server.allowed_ips.is_empty() {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        if !peer.is_some_and(|ip| ip_allowed(&server.allowed_ips, ip)) {
            warn!(
                component = "auth",
                event = "auth.ip_rejected",
                peer = ?peer,
                path = %req.uri().path(),
                "Request from IP not in allow list"
            );
            return Err(StatusCode::FORBIDDEN);
        }
    }

    if server.api_key.is_empty() || !requires_token(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if presents_token(&req, &server.api_key) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.token_rejected",
        path = %req.uri().path(),
        "Missing or invalid API key"
    );
    Err(StatusCode::UNAUTHORIZED)
}

pub fn requires_token(path: &str) -> bool {
    path == "/ws" || path == "/api" || path.starts_with("/api/")
}

pub fn ip_allowed(allowed: &[String], ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    allowed
        .iter()
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .any(|candidate| candidate.to_canonical() == ip)
}

fn presents_token(req: &Request<Body>, expected: &str) -> bool {
    // Authorization header first
    let header_ok = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);
    if header_ok {
        return true;
    }

    // ?token= query param (for WebSocket connections), percent-decoded
    Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(query)| query.token)
        .is_some_and(|token| token == expected)
}
