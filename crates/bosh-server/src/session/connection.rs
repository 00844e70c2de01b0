//! Connection multiplexer: binds inbound HTTP requests to a session.
//!
//! A bound request becomes a [`HeldConnection`]. Its response is released
//! when the session has data for it, when the hold ceiling pushes it out,
//! when `wait` elapses, or when the session closes, whichever comes first.

use super::http_session::{Admission, Delivery, HttpSession};
use bosh_core::{BindError, BoshError, BoshResult, Element};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// An HTTP request bound to a session, awaiting its response.
///
/// Dropping it before [`HeldConnection::response`] completes (the HTTP
/// worker went away) detaches it from the session.
#[derive(Debug)]
pub struct HeldConnection {
    session: Arc<HttpSession>,
    rid: u64,
    secure: bool,
    poll: bool,
    rx: oneshot::Receiver<Delivery>,
    /// Bind time plus the session's `wait`.
    deadline: Instant,
    turn_open: bool,
    released: bool,
}

/// Bind request `rid` carrying `elements` to `session`.
///
/// Requests that arrive ahead of sequence wait (at most `wait`) for their
/// predecessors before attaching, so stanzas are forwarded in rid order.
pub async fn bind(
    session: &Arc<HttpSession>,
    rid: u64,
    secure: bool,
    elements: &[Element],
) -> BoshResult<HeldConnection> {
    let poll = elements.is_empty();
    loop {
        match session.admit(rid, poll)? {
            Admission::Attached(rx) => {
                debug!(stream_id = %session.stream_id(), rid, poll, "connection bound");
                return Ok(HeldConnection {
                    session: Arc::clone(session),
                    rid,
                    secure,
                    poll,
                    rx,
                    deadline: deadline_after(session.wait()),
                    turn_open: true,
                    released: false,
                });
            }
            Admission::Wait(turn) => {
                debug!(stream_id = %session.stream_id(), rid, "request ahead of sequence, waiting");
                match tokio::time::timeout(session.wait(), turn).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => {
                        return Err(BoshError::SessionClosed(session.stream_id().to_string()))
                    }
                    Err(_) => {
                        session.abandon_wait(rid);
                        return Err(BindError::out_of_order(rid).into());
                    }
                }
            }
        }
    }
}

/// `now + wait`, saturating at a deadline that never arrives in practice.
fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

const FAR_FUTURE_SECS: u64 = 86400 * 365 * 30;

impl HeldConnection {
    pub fn rid(&self) -> u64 {
        self.rid
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The request carried no stanzas.
    pub fn is_poll(&self) -> bool {
        self.poll
    }

    pub fn session(&self) -> &Arc<HttpSession> {
        &self.session
    }

    /// Signal that this request's stanzas have been forwarded; the next
    /// request in sequence may bind.
    pub fn end_turn(&mut self) {
        if self.turn_open {
            self.turn_open = false;
            self.session.end_turn(self.rid);
        }
    }

    /// Wait for the response, at most the session's `wait` after binding.
    ///
    /// An elapsed `wait` yields an empty payload.
    pub async fn response(mut self) -> Delivery {
        self.end_turn();
        let delivery = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Delivery::empty(),
            Err(_) => {
                if self.session.detach(self.rid) {
                    debug!(stream_id = %self.session.stream_id(), rid = self.rid, "wait elapsed");
                    Delivery::empty()
                } else {
                    // Released while the timeout fired.
                    self.rx.try_recv().unwrap_or_else(|_| Delivery::empty())
                }
            }
        };
        self.released = true;
        delivery
    }
}

impl Drop for HeldConnection {
    fn drop(&mut self) {
        self.end_turn();
        if !self.released && self.session.detach(self.rid) {
            debug!(stream_id = %self.session.stream_id(), rid = self.rid, "held connection abandoned");
        }
    }
}
