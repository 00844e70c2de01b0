//! HTTP front: the `/http-bind` endpoint over axum.
//!
//! Requests arrive as JSON-encoded `<body/>` roots. A request without `sid`
//! creates a session; any other is bound to its session and answered when
//! the multiplexer releases it.

use crate::config::ServerConfig;
use crate::router::PacketRouter;
use crate::session::SessionManager;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bosh_core::{error_body, terminate_body, BindError, BodyRequest, BoshError, BoshResult};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

/// The binding server.
pub struct BoshServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
}

impl BoshServer {
    /// Create a server. Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig, router: Arc<dyn PacketRouter>) -> BoshResult<Self> {
        let sessions = Arc::new(SessionManager::new(config.bind, router)?);
        Ok(Self { config, sessions })
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            sessions: Arc::clone(&self.sessions),
        };

        Router::new()
            .route("/http-bind", post(bind_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> BoshResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, domain = %self.config.domain, "listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.session_count(),
    })
}

/// POST /http-bind
async fn bind_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BodyRequest>,
) -> Response {
    let secure = is_secure(&headers);

    let Some(stream_id) = request.sid() else {
        return match state.sessions.create_session(&request, secure) {
            Ok((_, body)) => xml(StatusCode::OK, body),
            Err(e) => error_response(&e),
        };
    };

    let Some(session) = state.sessions.get_session(stream_id) else {
        return error_response(&BoshError::SessionNotFound(stream_id.to_string()));
    };
    let Some(rid) = request.rid() else {
        return error_response(&BindError::new("Missing request id", false, 400).into());
    };

    if request.attr("type") == Some("terminate") {
        return match state
            .sessions
            .terminate_request(&session, rid, secure, &request.elements)
            .await
        {
            Ok(()) => xml(StatusCode::OK, terminate_body(None)),
            Err(e) => error_response(&e),
        };
    }

    match state
        .sessions
        .forward_request(&session, rid, secure, &request.elements)
        .await
    {
        Ok(conn) => xml(StatusCode::OK, conn.response().await.to_body()),
        Err(e) => error_response(&e),
    }
}

/// TLS is terminated in front of us; trust the proxy's word for it.
fn is_secure(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"))
}

fn xml(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn error_response(err: &BoshError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if err.terminates_session() {
        terminate_body(Some(err.condition()))
    } else {
        error_body(err.condition())
    };
    xml(status, body)
}
