//! Hands inbound stanzas to the protocol router.

use super::http_session::HttpSession;
use crate::router::{PacketRouter, RouteError};
use bosh_core::{BindError, Element};
use std::sync::Arc;
use tracing::debug;

pub struct StanzaForwarder {
    router: Arc<dyn PacketRouter>,
}

impl StanzaForwarder {
    pub fn new(router: Arc<dyn PacketRouter>) -> Self {
        Self { router }
    }

    /// Route `elements` in request order, stopping at the first failure.
    ///
    /// A bad encoding ends the session; an unrecognized stanza only fails
    /// this request.
    pub fn forward(&self, session: &HttpSession, elements: &[Element]) -> Result<(), BindError> {
        for element in elements {
            self.router.route(session, element).map_err(|e| {
                debug!(stream_id = %session.stream_id(), stanza = %element.name, error = %e, "route failed");
                match e {
                    RouteError::UnsupportedEncoding => BindError::bad_encoding(),
                    RouteError::UnknownStanza(_) | RouteError::Unauthorized(_) => {
                        BindError::unknown_packet()
                    }
                }
            })?;
        }
        Ok(())
    }
}
