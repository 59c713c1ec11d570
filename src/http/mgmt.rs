//! Management REST server: session inspection and control, health and
//! metrics. Everything except `/healthz` and `/metrics` requires the
//! management key.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::sessionmanager::hash::session_hash;
use crate::sessionmanager::request::{SessionHandle, SessionInfo};
use crate::shared::config::{listen_addr, Config};
use crate::supervisor::Service;

pub const MGMT_KEY_HEADER: &str = "X-Management-Key";

#[derive(Debug)]
pub enum ApiError {
    Forbidden(String),
    NotFound(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[derive(Clone)]
pub struct MgmtState {
    pub sessions: SessionHandle,
    pub salt: String,
    pub key: String,
    pub registry: Arc<Registry>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionsResponse {
    sessions: HashMap<String, SessionInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionSummary {
    session_id: String,
    addr: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreated {
    session: SessionSummary,
    message: String,
}

pub fn router(state: MgmtState) -> Router {
    let protected = Router::new()
        .route("/session", get(get_sessions))
        .route("/session/{id}", axum::routing::post(post_session).delete(delete_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/", get(banner))
        .merge(protected)
        .fallback(not_found)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<MgmtState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = request
        .headers()
        .get(MGMT_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|key| key == state.key)
        .unwrap_or(false);
    if !authorized {
        return Err(ApiError::Forbidden(format!(
            "The header {MGMT_KEY_HEADER} is missing or invalid"
        )));
    }
    Ok(next.run(request).await)
}

async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    info!(%method, %uri, status = response.status().as_u16(), "mgmt request");
    response
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json("It's up!"))
}

async fn banner() -> impl IntoResponse {
    (StatusCode::OK, Json("REST Management Server"))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("404 page cannot be found".to_string())
}

async fn metrics(State(state): State<MgmtState>) -> ApiResult<Response> {
    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&state.registry.gather())
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn get_sessions(State(state): State<MgmtState>) -> ApiResult<Json<SessionsResponse>> {
    let sessions = state
        .sessions
        .sessions()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(SessionsResponse { sessions }))
}

async fn post_session(
    State(state): State<MgmtState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session_hash = session_hash(&id, &state.salt);
    let addr = state
        .sessions
        .match_container(id.clone(), session_hash)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            session: SessionSummary {
                session_id: id,
                addr: addr.to_string(),
            },
            message: "Session assigned".to_string(),
        }),
    ))
}

async fn delete_session(
    State(state): State<MgmtState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session_hash = session_hash(&id, &state.salt);
    let deleted = state
        .sessions
        .delete(session_hash)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    if deleted {
        Ok((StatusCode::OK, Json("Session deleted")))
    } else {
        Err(ApiError::NotFound("Session not found".to_string()))
    }
}

pub struct MgmtServer {
    addr: String,
    state: MgmtState,
}

impl MgmtServer {
    pub fn new(config: &Config, sessions: SessionHandle, registry: Arc<Registry>) -> Self {
        Self {
            addr: listen_addr(&config.mgmt.host, config.mgmt.port),
            state: MgmtState {
                sessions,
                salt: config.reverseproxy.session.salt.clone(),
                key: config.mgmt.key.clone(),
                registry,
            },
        }
    }
}

#[async_trait]
impl Service for MgmtServer {
    fn name(&self) -> &'static str {
        "mgmt"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "management server listening");
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("management server closed");
        Ok(())
    }
}
