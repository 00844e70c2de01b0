//! Protocol router seam.
//!
//! The router interprets stanzas; the binding layer only hands them over and
//! relays what comes back. [`LoopbackRouter`] is the in-process router the
//! server runs with.

use crate::session::HttpSession;
use base64::Engine;
use bosh_core::Element;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

/// Failures reported by a [`PacketRouter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("unsupported encoding")]
    UnsupportedEncoding,

    #[error("unknown stanza type: {0}")]
    UnknownStanza(String),

    #[error("not accepting sessions: {0}")]
    Unauthorized(String),
}

/// The messaging-protocol side of a session.
pub trait PacketRouter: Send + Sync {
    /// A fresh, unique stream identifier.
    fn next_stream_id(&self) -> String;

    /// Materialize the protocol session for `stream_id`.
    fn open_session(&self, stream_id: &str) -> Result<(), RouteError>;

    /// Feature advertisement for the creation response.
    fn stream_features(&self, stream_id: &str) -> String;

    /// Process one inbound stanza. Replies go out through
    /// [`HttpSession::deliver`].
    fn route(&self, session: &HttpSession, element: &Element) -> Result<(), RouteError>;

    fn session_closed(&self, _stream_id: &str) {}
}

const SASL_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Router that answers stanzas itself.
///
/// Messages addressed to the server domain come straight back to the sender
/// with `to` and `from` swapped; `iq` requests get an empty result.
pub struct LoopbackRouter {
    domain: String,
    accepting: AtomicBool,
}

impl LoopbackRouter {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Refuse (or accept again) new sessions.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    fn reply_swapped(&self, element: &Element) -> Element {
        let mut reply = Element::new(element.name.clone());
        for (name, value) in &element.attrs {
            let name = match name.as_str() {
                "to" => "from",
                "from" => "to",
                other => other,
            };
            reply.attrs.insert(name.to_string(), value.clone());
        }
        if !reply.attrs.contains_key("from") {
            reply.attrs.insert("from".into(), self.domain.clone());
        }
        reply.children = element.children.clone();
        reply
    }
}

impl PacketRouter for LoopbackRouter {
    fn next_stream_id(&self) -> String {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        hex::encode(bytes)
    }

    fn open_session(&self, stream_id: &str) -> Result<(), RouteError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RouteError::Unauthorized(format!(
                "{} is not accepting connections",
                self.domain
            )));
        }
        debug!(stream_id, "protocol session opened");
        Ok(())
    }

    fn stream_features(&self, _stream_id: &str) -> String {
        format!(
            "<mechanisms xmlns='{SASL_NAMESPACE}'><mechanism>PLAIN</mechanism></mechanisms>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>"
        )
    }

    fn route(&self, session: &HttpSession, element: &Element) -> Result<(), RouteError> {
        match element.name.as_str() {
            "auth" => {
                let payload = element.text();
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|_| RouteError::UnsupportedEncoding)?;
                String::from_utf8(decoded).map_err(|_| RouteError::UnsupportedEncoding)?;
                session.deliver(vec![Element::new("success").with_attr("xmlns", SASL_NAMESPACE)]);
                Ok(())
            }
            "message" => {
                if element.attr("to") == Some(self.domain.as_str()) {
                    session.deliver(vec![self.reply_swapped(element)]);
                }
                Ok(())
            }
            "iq" => {
                if matches!(element.attr("type"), Some("get") | Some("set")) {
                    let mut result = Element::new("iq").with_attr("type", "result");
                    if let Some(id) = element.attr("id") {
                        result = result.with_attr("id", id);
                    }
                    if let Some(from) = element.attr("from") {
                        result = result.with_attr("to", from);
                    }
                    session.deliver(vec![result.with_attr("from", self.domain.as_str())]);
                }
                Ok(())
            }
            "presence" => Ok(()),
            other => Err(RouteError::UnknownStanza(other.to_string())),
        }
    }
}
