use thiserror::Error;

/// A violation of the binding contract, reported on the HTTP exchange that
/// caused it.
///
/// `terminate_session` tells the HTTP layer whether the whole session must be
/// torn down or only this request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {status})")]
pub struct BindError {
    pub message: String,
    pub terminate_session: bool,
    pub status: u16,
}

impl BindError {
    pub fn new(message: impl Into<String>, terminate_session: bool, status: u16) -> Self {
        Self {
            message: message.into(),
            terminate_session,
            status,
        }
    }

    /// The router could not decode an element's payload.
    pub fn bad_encoding() -> Self {
        Self::new("Bad auth request, unknown encoding", true, 400)
    }

    /// The router does not recognize the stanza type.
    pub fn unknown_packet() -> Self {
        Self::new("Unknown packet type.", false, 400)
    }

    /// A request id outside the acceptable window, or a replayed one.
    pub fn out_of_order(rid: u64) -> Self {
        Self::new(format!("Request id {rid} is out of order"), false, 400)
    }

    /// The client polled more often than the negotiated polling interval.
    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::new(message, true, 403)
    }

    /// Terminate condition advertised in the terminate body.
    pub fn condition(&self) -> &'static str {
        match self.status {
            403 => "policy-violation",
            404 => "item-not-found",
            _ => "bad-request",
        }
    }
}

/// Errors produced by the HTTP binding layer.
#[derive(Debug, Error)]
pub enum BoshError {
    #[error("bind error: {0}")]
    Bind(#[from] BindError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The HTTP exchange was gone before its response could be delivered.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BoshError {
    /// HTTP-equivalent status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            BoshError::Bind(e) => e.status,
            BoshError::Unauthorized(_) => 401,
            BoshError::SessionNotFound(_) | BoshError::SessionClosed(_) => 404,
            BoshError::ConnectionClosed | BoshError::Config(_) | BoshError::Io(_) => 500,
        }
    }

    /// Whether the client must treat its session as over.
    pub fn terminates_session(&self) -> bool {
        match self {
            BoshError::Bind(e) => e.terminate_session,
            BoshError::SessionNotFound(_) | BoshError::SessionClosed(_) => true,
            _ => false,
        }
    }

    /// Condition name reported in the error or terminate body.
    pub fn condition(&self) -> &'static str {
        match self {
            BoshError::Bind(e) => e.condition(),
            BoshError::Unauthorized(_) => "not-authorized",
            BoshError::SessionNotFound(_) | BoshError::SessionClosed(_) => "item-not-found",
            BoshError::ConnectionClosed | BoshError::Config(_) | BoshError::Io(_) => {
                "internal-server-error"
            }
        }
    }
}

pub type BoshResult<T> = Result<T, BoshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_encoding_terminates() {
        let err = BindError::bad_encoding();
        assert!(err.terminate_session);
        assert_eq!(err.status, 400);
        assert_eq!(err.condition(), "bad-request");
    }

    #[test]
    fn unknown_packet_keeps_session() {
        let err = BindError::unknown_packet();
        assert!(!err.terminate_session);
        assert_eq!(err.status, 400);
        assert_eq!(err.message, "Unknown packet type.");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(BoshError::Unauthorized("closed".into()).status(), 401);
        assert_eq!(BoshError::SessionNotFound("abc".into()).status(), 404);
        assert_eq!(BoshError::from(BindError::out_of_order(7)).status(), 400);
        assert_eq!(
            BoshError::from(BindError::policy_violation("too fast")).status(),
            403
        );
    }

    #[test]
    fn terminating_errors() {
        assert!(BoshError::from(BindError::bad_encoding()).terminates_session());
        assert!(!BoshError::from(BindError::unknown_packet()).terminates_session());
        assert!(!BoshError::ConnectionClosed.terminates_session());
        assert!(BoshError::SessionNotFound("gone".into()).terminates_session());
    }

    #[test]
    fn conditions() {
        assert_eq!(BoshError::Unauthorized("x".into()).condition(), "not-authorized");
        assert_eq!(BoshError::SessionClosed("x".into()).condition(), "item-not-found");
        assert_eq!(
            BoshError::from(BindError::policy_violation("x")).condition(),
            "policy-violation"
        );
    }

    #[test]
    fn display_includes_status() {
        let err = BindError::unknown_packet();
        assert_eq!(err.to_string(), "Unknown packet type. (status 400)");
    }
}
