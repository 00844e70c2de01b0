//! Session lifecycle management.
//!
//! Owns the registry of open sessions, creates them, and wires every session
//! to the inactivity timer and the protocol router. A session leaves the
//! registry exactly once, on its first close, whatever triggered it.

use super::connection::{self, HeldConnection};
use super::forwarder::StanzaForwarder;
use super::http_session::{CloseReason, HttpSession, SessionEvent, SessionParams};
use super::timer::InactivityTimer;
use crate::config::BindConfig;
use crate::router::PacketRouter;
use bosh_core::{BodyRequest, BoshError, BoshResult, Element, SessionCreationResponse};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const DEFAULT_WAIT: u64 = 60;
const DEFAULT_HOLD: u64 = 1;
const DEFAULT_LANGUAGE: &str = "en";

/// Manages all open sessions.
pub struct SessionManager {
    config: BindConfig,
    router: Arc<dyn PacketRouter>,
    sessions: Arc<DashMap<String, Arc<HttpSession>>>,
    timer: Arc<InactivityTimer>,
    forwarder: StanzaForwarder,
}

impl SessionManager {
    /// Create a session manager. Must be called from within a Tokio runtime,
    /// which the inactivity timer schedules on.
    pub fn new(config: BindConfig, router: Arc<dyn PacketRouter>) -> BoshResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| BoshError::Config(format!("no async runtime: {e}")))?;
        Ok(Self {
            config,
            forwarder: StanzaForwarder::new(Arc::clone(&router)),
            router,
            sessions: Arc::new(DashMap::new()),
            timer: InactivityTimer::new(runtime),
        })
    }

    pub fn config(&self) -> &BindConfig {
        &self.config
    }

    /// Create and register a session from the creation request.
    ///
    /// Returns the session and the creation response body. Malformed
    /// `wait`, `hold` or `xml:lang` values fall back to their defaults; a
    /// `wait` above the configured maximum is lowered to it.
    pub fn create_session(
        &self,
        request: &BodyRequest,
        secure: bool,
    ) -> BoshResult<(Arc<HttpSession>, String)> {
        let language = request
            .attr("xml:lang")
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string();
        let wait = int_attribute(request.attr("wait"), DEFAULT_WAIT).min(self.config.max_wait);
        let hold = int_attribute(request.attr("hold"), DEFAULT_HOLD);

        let stream_id = self.router.next_stream_id();
        self.router
            .open_session(&stream_id)
            .map_err(|e| BoshError::Unauthorized(e.to_string()))?;
        let features = self.router.stream_features(&stream_id);

        let session = Arc::new(HttpSession::new(
            stream_id.clone(),
            SessionParams {
                language,
                secure,
                wait: Duration::from_secs(wait),
                hold: usize::try_from(hold).unwrap_or(usize::MAX),
                max_requests: self.config.max_requests,
                max_polling_interval: self.config.polling(),
                inactivity_timeout: self.config.inactivity(),
                stream_features: features.clone(),
                initial_rid: request.rid(),
            },
        ));

        self.sessions.insert(stream_id.clone(), Arc::clone(&session));
        self.watch(&session);
        self.timer.reset(&session);

        info!(
            stream_id = %stream_id,
            language = %session.language(),
            wait,
            hold,
            secure,
            "session created"
        );

        let body = SessionCreationResponse {
            stream_id,
            secure,
            requests: self.config.max_requests,
            inactivity: self.config.inactivity_timeout,
            polling: self.config.polling_interval,
            wait,
            features,
        }
        .to_xml();

        Ok((session, body))
    }

    /// Keep the timer and registry in step with the session's lifecycle.
    fn watch(&self, session: &Arc<HttpSession>) {
        let timer = Arc::clone(&self.timer);
        let registry = Arc::clone(&self.sessions);
        let router = Arc::clone(&self.router);
        let weak = Arc::downgrade(session);

        session.add_lifecycle_handler(Box::new(
            move |session: &HttpSession, event: &SessionEvent| match *event {
                SessionEvent::ConnectionOpened { .. } => timer.stop(session.stream_id()),
                SessionEvent::ConnectionClosed {
                    connection_count: 0,
                    ..
                } => {
                    if let Some(session) = weak.upgrade() {
                        timer.reset(&session);
                    }
                }
                SessionEvent::ConnectionClosed { .. } => {}
                SessionEvent::SessionClosed { reason } => {
                    timer.stop(session.stream_id());
                    registry.remove(session.stream_id());
                    router.session_closed(session.stream_id());
                    debug!(stream_id = %session.stream_id(), ?reason, "session unregistered");
                }
            },
        ));
    }

    /// Look up an open session.
    pub fn get_session(&self, stream_id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.get(stream_id).map(|e| Arc::clone(e.value()))
    }

    /// Bind request `rid` to `session` and forward its stanzas.
    ///
    /// A terminating binding error closes the session before it is returned.
    pub async fn forward_request(
        &self,
        session: &Arc<HttpSession>,
        rid: u64,
        secure: bool,
        elements: &[Element],
    ) -> BoshResult<HeldConnection> {
        let mut conn = connection::bind(session, rid, secure, elements)
            .await
            .map_err(|e| fail(session, rid, e))?;
        let forwarded = self.forwarder.forward(session, elements);
        conn.end_turn();
        forwarded.map_err(|e| fail(session, rid, e.into()))?;
        Ok(conn)
    }

    /// Handle a client terminate request: forward its last stanzas, then
    /// close the session.
    pub async fn terminate_request(
        &self,
        session: &Arc<HttpSession>,
        rid: u64,
        secure: bool,
        elements: &[Element],
    ) -> BoshResult<()> {
        let conn = self.forward_request(session, rid, secure, elements).await?;
        session.close(CloseReason::Terminate);
        drop(conn);
        Ok(())
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every open session.
    pub fn shutdown(&self) {
        let open: Vec<Arc<HttpSession>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let count = open.len();
        for session in open {
            session.close(CloseReason::Shutdown);
        }
        info!(count, "sessions closed for shutdown");
    }
}

fn fail(session: &HttpSession, rid: u64, err: BoshError) -> BoshError {
    warn!(stream_id = %session.stream_id(), rid, error = %err, "bind request failed");
    if let BoshError::Bind(e) = &err {
        if e.terminate_session {
            session.close(CloseReason::Error(e.condition()));
        }
    }
    err
}

/// Parse an optional non-negative integer attribute, falling back to
/// `default` when it is missing, empty or malformed.
fn int_attribute(value: Option<&str>, default: u64) -> u64 {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
