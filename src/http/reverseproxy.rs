//! Data-plane reverse proxy.
//!
//! A dumb forwarder: once the session manager has resolved a target
//! instance, the request is rewritten to `http://<addr>` with path and
//! query preserved, and both bodies are streamed untouched.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Bus;
use crate::sessionmanager::hash::session_hash;
use crate::sessionmanager::request::SessionHandle;
use crate::shared::addr::ContainerAddr;
use crate::shared::config::{listen_addr, Config};
use crate::supervisor::Service;

/// Connection-level headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct ProxyState {
    sessions: SessionHandle,
    bus: Arc<Bus>,
    client: reqwest::Client,
    session_header: HeaderName,
    salt: String,
}

pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(proxy).with_state(state)
}

async fn proxy(State(state): State<ProxyState>, request: Request) -> Response {
    let started = Instant::now();

    let session_id = request
        .headers()
        .get(&state.session_header)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let hash = session_hash(&session_id, &state.salt);

    let addr = match state.sessions.match_container(session_id, hash.clone()).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!(session = %hash, error = %e, "no instance available");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json("The proxy is shutting down"),
            )
                .into_response();
        }
    };

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match forward(&state.client, &addr, request).await {
        Ok(response) => {
            debug!(
                session = %hash,
                %method,
                target = %format!("http://{addr}{path}"),
                status = response.status().as_u16(),
                "proxied request"
            );
            state.bus.proxy_metric_time.broadcast(started.elapsed());
            response
        }
        Err(e) => {
            warn!(session = %hash, target = %addr, error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, Json("Upstream request failed")).into_response()
        }
    }
}

/// Target URL for a request: scheme forced to http, host replaced by the
/// instance addr, path and query preserved.
fn target_url(addr: &ContainerAddr, request: &Request) -> String {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    format!("http://{addr}{path_and_query}")
}

async fn forward(
    client: &reqwest::Client,
    addr: &ContainerAddr,
    request: Request,
) -> Result<Response> {
    let url = target_url(addr, &request);
    let (parts, body) = request.into_parts();

    let mut upstream = client.request(parts.method, &url);
    for (name, value) in &parts.headers {
        if *name == header::HOST || HOP_BY_HOP.contains(name) {
            continue;
        }
        upstream = upstream.header(name, value);
    }

    let response = upstream
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .context("failed to reach instance")?;

    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers() {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .context("failed to assemble proxied response")
}

pub struct ProxyServer {
    addr: String,
    state: ProxyState,
}

impl ProxyServer {
    pub fn new(config: &Config, sessions: SessionHandle, bus: Arc<Bus>) -> Self {
        Self {
            addr: listen_addr(&config.reverseproxy.host, config.reverseproxy.port),
            state: ProxyState {
                sessions,
                bus,
                client: reqwest::Client::new(),
                session_header: HeaderName::from_bytes(
                    config.reverseproxy.session.header.as_bytes(),
                )
                .unwrap_or(HeaderName::from_static("x-session-id")),
                salt: config.reverseproxy.session.salt.clone(),
            },
        }
    }
}

#[async_trait]
impl Service for ProxyServer {
    fn name(&self) -> &'static str {
        "reverseproxy"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "reverse proxy listening");
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("reverse proxy closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_preserves_path_and_query() {
        let addr = ContainerAddr::new("web", 3, 8080);
        let request = Request::builder()
            .uri("https://proxy.example/challenge/flag?debug=1&x=y")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            target_url(&addr, &request),
            "http://web-3:8080/challenge/flag?debug=1&x=y"
        );
    }

    #[test]
    fn target_url_defaults_to_root() {
        let addr = ContainerAddr::new("web", 1, 80);
        let request = Request::builder()
            .uri("http://proxy.example")
            .body(Body::empty())
            .unwrap();
        assert_eq!(target_url(&addr, &request), "http://web-1:80/");
    }
}
