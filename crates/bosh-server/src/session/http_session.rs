//! In-memory record of one client's binding session.
//!
//! All mutable state sits behind a single per-session mutex. Lifecycle
//! handlers run synchronously while that mutex is held, so they must never
//! call back into methods of the same session that lock it.

use bosh_core::{payload_body, terminate_body, BindError, BoshError, BoshResult, Element};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// State transitions published to lifecycle handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A request was bound; `connection_count` includes it.
    ConnectionOpened { rid: u64, connection_count: usize },
    /// A bound request was released or detached.
    ConnectionClosed { rid: u64, connection_count: usize },
    SessionClosed { reason: CloseReason },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a terminate request.
    Terminate,
    /// No request was bound for the inactivity timeout.
    Inactivity,
    /// A binding error that ends the session.
    Error(&'static str),
    /// The server is going down.
    Shutdown,
}

impl CloseReason {
    /// Condition reported to connections still held when the session closes.
    pub fn condition(&self) -> Option<&'static str> {
        match self {
            CloseReason::Terminate | CloseReason::Inactivity => None,
            CloseReason::Error(condition) => Some(*condition),
            CloseReason::Shutdown => Some("system-shutdown"),
        }
    }
}

/// What a released connection answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Outgoing stanzas; empty when `wait` elapsed or the hold ceiling was hit.
    Payload(Vec<Element>),
    /// The session closed while the connection was held.
    Terminate(Option<&'static str>),
}

impl Delivery {
    pub fn empty() -> Self {
        Delivery::Payload(Vec::new())
    }

    /// Render the response body.
    pub fn to_body(&self) -> String {
        match self {
            Delivery::Payload(elements) => payload_body(elements),
            Delivery::Terminate(condition) => terminate_body(*condition),
        }
    }
}

/// Observer invoked under the session lock for every [`SessionEvent`].
pub type LifecycleHandler = Box<dyn Fn(&HttpSession, &SessionEvent) + Send + Sync>;

/// Negotiated and derived parameters, fixed at creation.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub language: String,
    pub secure: bool,
    pub wait: Duration,
    pub hold: usize,
    pub max_requests: u32,
    pub max_polling_interval: Duration,
    pub inactivity_timeout: Duration,
    pub stream_features: String,
    /// rid of the creation request; the next bound request must follow it.
    pub initial_rid: Option<u64>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            secure: false,
            wait: Duration::from_secs(60),
            hold: 1,
            max_requests: 2,
            max_polling_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(1800),
            stream_features: String::new(),
            initial_rid: None,
        }
    }
}

/// A bound request waiting for its response.
struct Slot {
    rid: u64,
    tx: oneshot::Sender<Delivery>,
}

struct SessionState {
    connection_count: usize,
    /// Highest rid admitted so far.
    last_rid: Option<u64>,
    /// `last_rid` is still forwarding its stanzas.
    turn_open: bool,
    /// Requests that arrived ahead of sequence, keyed by rid.
    waiting: BTreeMap<u64, oneshot::Sender<()>>,
    /// Held connections, ascending rid.
    held: VecDeque<Slot>,
    /// Stanzas produced while no connection was held.
    outbound: Vec<Element>,
    last_poll: Option<Instant>,
}

/// Outcome of trying to bind a request.
pub(crate) enum Admission {
    Attached(oneshot::Receiver<Delivery>),
    /// Ahead of sequence; resolves when the preceding rid is done.
    Wait(oneshot::Receiver<()>),
}

/// One client's long-lived binding session.
pub struct HttpSession {
    stream_id: String,
    language: String,
    secure: bool,
    wait: Duration,
    hold: usize,
    max_requests: u32,
    max_polling_interval: Duration,
    inactivity_timeout: Duration,
    stream_features: String,
    closed: AtomicBool,
    state: Mutex<SessionState>,
    handlers: RwLock<Vec<LifecycleHandler>>,
}

impl HttpSession {
    pub fn new(stream_id: impl Into<String>, params: SessionParams) -> Self {
        Self {
            stream_id: stream_id.into(),
            language: params.language,
            secure: params.secure,
            wait: params.wait,
            hold: params.hold,
            max_requests: params.max_requests.max(1),
            max_polling_interval: params.max_polling_interval,
            inactivity_timeout: params.inactivity_timeout,
            stream_features: params.stream_features,
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                connection_count: 0,
                last_rid: params.initial_rid,
                turn_open: false,
                waiting: BTreeMap::new(),
                held: VecDeque::new(),
                outbound: Vec::new(),
                last_poll: None,
            }),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn hold(&self) -> usize {
        self.hold
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn max_polling_interval(&self) -> Duration {
        self.max_polling_interval
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    pub fn available_stream_features(&self) -> &str {
        &self.stream_features
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of bound requests that have not been released yet.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connection_count
    }

    /// rids of the connections currently held, in release order.
    pub fn held_rids(&self) -> Vec<u64> {
        self.state.lock().held.iter().map(|s| s.rid).collect()
    }

    /// Stanzas queued for the next bound connection.
    pub fn pending_outbound(&self) -> usize {
        self.state.lock().outbound.len()
    }

    pub fn add_lifecycle_handler(&self, handler: LifecycleHandler) {
        self.handlers.write().push(handler);
    }

    fn emit(&self, event: SessionEvent) {
        for handler in self.handlers.read().iter() {
            handler(self, &event);
        }
    }

    /// Try to bind request `rid`.
    ///
    /// A request whose predecessor has not finished yet is parked and told to
    /// wait; anything replayed or beyond the `requests` window is rejected.
    pub(crate) fn admit(&self, rid: u64, poll: bool) -> BoshResult<Admission> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Err(BoshError::SessionClosed(self.stream_id.clone()));
        }

        if let Some(last) = state.last_rid {
            if rid <= last || rid > last.saturating_add(u64::from(self.max_requests)) {
                return Err(BindError::out_of_order(rid).into());
            }
            if last.checked_add(1) != Some(rid) || state.turn_open {
                if state.waiting.contains_key(&rid) {
                    return Err(BindError::out_of_order(rid).into());
                }
                let (tx, rx) = oneshot::channel();
                state.waiting.insert(rid, tx);
                return Ok(Admission::Wait(rx));
            }
        }

        if poll && self.hold == 0 {
            let now = Instant::now();
            if let Some(prev) = state.last_poll {
                if now.duration_since(prev) < self.max_polling_interval {
                    return Err(BindError::policy_violation(format!(
                        "polling more often than every {}s",
                        self.max_polling_interval.as_secs()
                    ))
                    .into());
                }
            }
            state.last_poll = Some(now);
        }

        state.last_rid = Some(rid);
        state.turn_open = true;
        state.connection_count += 1;
        self.emit(SessionEvent::ConnectionOpened {
            rid,
            connection_count: state.connection_count,
        });

        let (tx, rx) = oneshot::channel();
        let pos = state
            .held
            .iter()
            .position(|s| s.rid > rid)
            .unwrap_or(state.held.len());
        state.held.insert(pos, Slot { rid, tx });

        if !state.outbound.is_empty() {
            let pending = std::mem::take(&mut state.outbound);
            self.flush_locked(&mut state, pending);
        }

        while state.held.len() > self.hold {
            let Some(slot) = state.held.pop_front() else {
                break;
            };
            self.detach_locked(&mut state, slot.rid);
            if slot.tx.send(Delivery::empty()).is_err() {
                debug!(stream_id = %self.stream_id, rid = slot.rid, "connection closed before release");
            }
        }

        Ok(Admission::Attached(rx))
    }

    /// Mark `rid` as done forwarding and let the next request in sequence in.
    pub(crate) fn end_turn(&self, rid: u64) {
        let mut state = self.state.lock();
        if state.last_rid != Some(rid) || !state.turn_open {
            return;
        }
        state.turn_open = false;

        while let Some(next) = state.last_rid.and_then(|last| last.checked_add(1)) {
            let Some(waiter) = state.waiting.remove(&next) else {
                return;
            };
            if waiter.send(()).is_ok() {
                return;
            }
            // The waiting request went away; its rid is spent.
            state.last_rid = Some(next);
        }
    }

    /// Forget a parked request that gave up waiting.
    pub(crate) fn abandon_wait(&self, rid: u64) {
        self.state.lock().waiting.remove(&rid);
    }

    /// Remove a still-held connection without answering it.
    ///
    /// Returns `false` if it was already released.
    pub(crate) fn detach(&self, rid: u64) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.held.iter().position(|s| s.rid == rid) else {
            return false;
        };
        state.held.remove(pos);
        self.detach_locked(&mut state, rid);
        true
    }

    fn detach_locked(&self, state: &mut SessionState, rid: u64) {
        state.connection_count = state.connection_count.saturating_sub(1);
        self.emit(SessionEvent::ConnectionClosed {
            rid,
            connection_count: state.connection_count,
        });
    }

    /// Hand outgoing stanzas to the client.
    ///
    /// Releases the oldest held connection with them, or queues them for the
    /// next request when nothing is held.
    pub fn deliver(&self, elements: Vec<Element>) {
        if elements.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if self.is_closed() {
            debug!(stream_id = %self.stream_id, count = elements.len(), "dropping stanzas for closed session");
            return;
        }
        self.flush_locked(&mut state, elements);
    }

    fn flush_locked(&self, state: &mut SessionState, elements: Vec<Element>) {
        let mut delivery = Delivery::Payload(elements);
        while let Some(slot) = state.held.pop_front() {
            self.detach_locked(state, slot.rid);
            match slot.tx.send(delivery) {
                Ok(()) => return,
                Err(returned) => {
                    debug!(
                        stream_id = %self.stream_id,
                        rid = slot.rid,
                        error = %BoshError::ConnectionClosed,
                        "release failed, trying next connection"
                    );
                    delivery = returned;
                }
            }
        }
        if let Delivery::Payload(elements) = delivery {
            state.outbound.extend(elements);
        }
    }

    /// Close the session if it is still idle.
    ///
    /// `still_armed` runs under the session lock and lets the caller confirm
    /// that the expiry that fired has not been superseded.
    pub(crate) fn expire(&self, still_armed: impl FnOnce() -> bool) -> bool {
        let mut state = self.state.lock();
        if state.connection_count > 0 || !still_armed() {
            return false;
        }
        self.close_locked(&mut state, CloseReason::Inactivity)
    }

    /// Close the session. Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        self.close_locked(&mut state, reason)
    }

    fn close_locked(&self, state: &mut SessionState, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        // Dropping the senders wakes parked requests with an error.
        state.waiting.clear();
        state.outbound.clear();

        let condition = reason.condition();
        while let Some(slot) = state.held.pop_front() {
            self.detach_locked(state, slot.rid);
            if slot.tx.send(Delivery::Terminate(condition)).is_err() {
                debug!(stream_id = %self.stream_id, rid = slot.rid, "connection closed before terminate");
            }
        }

        self.emit(SessionEvent::SessionClosed { reason });
        info!(stream_id = %self.stream_id, ?reason, "session closed");
        true
    }
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("stream_id", &self.stream_id)
            .field("language", &self.language)
            .field("secure", &self.secure)
            .field("wait", &self.wait)
            .field("hold", &self.hold)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(hold: usize) -> HttpSession {
        HttpSession::new(
            "s1",
            SessionParams {
                hold,
                ..SessionParams::default()
            },
        )
    }

    fn attached(admission: Admission) -> oneshot::Receiver<Delivery> {
        match admission {
            Admission::Attached(rx) => rx,
            Admission::Wait(_) => panic!("expected the request to attach"),
        }
    }

    fn recording(session: &HttpSession) -> Arc<parking_lot::Mutex<Vec<SessionEvent>>> {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        session.add_lifecycle_handler(Box::new(move |_: &HttpSession, event: &SessionEvent| {
            sink.lock().push(*event)
        }));
        events
    }

    #[test]
    fn attach_counts_and_notifies() {
        let s = session(1);
        let events = recording(&s);

        let _rx = attached(s.admit(1, true).unwrap());
        assert_eq!(s.connection_count(), 1);
        assert_eq!(s.held_rids(), vec![1]);
        assert_eq!(
            events.lock().as_slice(),
            &[SessionEvent::ConnectionOpened {
                rid: 1,
                connection_count: 1
            }]
        );
    }

    #[test]
    fn hold_ceiling_releases_oldest_with_empty_body() {
        let s = session(1);
        let mut first = attached(s.admit(1, true).unwrap());
        s.end_turn(1);
        let _second = attached(s.admit(2, true).unwrap());

        assert_eq!(first.try_recv().unwrap(), Delivery::empty());
        assert_eq!(s.held_rids(), vec![2]);
        assert_eq!(s.connection_count(), 1);
    }

    #[test]
    fn hold_zero_answers_immediately() {
        let s = session(0);
        let mut rx = attached(s.admit(1, false).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Delivery::empty());
        assert_eq!(s.connection_count(), 0);
    }

    #[test]
    fn deliver_releases_held_connection() {
        let s = session(1);
        let mut rx = attached(s.admit(1, true).unwrap());
        s.deliver(vec![Element::new("message")]);

        assert_eq!(
            rx.try_recv().unwrap(),
            Delivery::Payload(vec![Element::new("message")])
        );
        assert_eq!(s.connection_count(), 0);
        assert_eq!(s.pending_outbound(), 0);
    }

    #[test]
    fn deliver_without_connection_queues_until_next_bind() {
        let s = session(1);
        s.deliver(vec![Element::new("presence")]);
        assert_eq!(s.pending_outbound(), 1);

        let mut rx = attached(s.admit(1, true).unwrap());
        assert_eq!(
            rx.try_recv().unwrap(),
            Delivery::Payload(vec![Element::new("presence")])
        );
        assert_eq!(s.pending_outbound(), 0);
        assert_eq!(s.connection_count(), 0);
    }

    #[test]
    fn deliver_skips_connections_whose_transport_is_gone() {
        let s = session(2);
        let gone = attached(s.admit(1, true).unwrap());
        s.end_turn(1);
        let mut alive = attached(s.admit(2, true).unwrap());
        drop(gone);

        s.deliver(vec![Element::new("iq")]);
        assert_eq!(
            alive.try_recv().unwrap(),
            Delivery::Payload(vec![Element::new("iq")])
        );
        assert_eq!(s.connection_count(), 0);
    }

    #[test]
    fn deliver_to_only_dead_connection_requeues() {
        let s = session(1);
        drop(attached(s.admit(1, true).unwrap()));
        s.deliver(vec![Element::new("iq")]);
        assert_eq!(s.pending_outbound(), 1);
    }

    #[test]
    fn replayed_rid_is_rejected() {
        let s = session(1);
        let _rx = attached(s.admit(5, true).unwrap());
        s.end_turn(5);
        let err = s.admit(5, true).err().unwrap();
        assert_eq!(err.status(), 400);
        assert!(!err.terminates_session());
    }

    #[test]
    fn rid_beyond_window_is_rejected() {
        let s = session(1);
        let _rx = attached(s.admit(1, true).unwrap());
        s.end_turn(1);
        // max_requests = 2: rids 2 and 3 are acceptable, 4 is not.
        assert!(s.admit(4, true).is_err());
    }

    #[test]
    fn early_rid_waits_for_predecessor() {
        let s = session(2);
        let _rx1 = attached(s.admit(1, true).unwrap());
        s.end_turn(1);

        let Admission::Wait(mut turn) = s.admit(3, true).unwrap() else {
            panic!("rid 3 should wait for rid 2");
        };
        assert!(turn.try_recv().is_err());

        let _rx2 = attached(s.admit(2, true).unwrap());
        assert!(turn.try_recv().is_err());
        s.end_turn(2);
        assert!(turn.try_recv().is_ok());

        let _rx3 = attached(s.admit(3, true).unwrap());
        assert_eq!(s.held_rids(), vec![2, 3]);
    }

    #[test]
    fn duplicate_waiting_rid_is_rejected() {
        let s = session(1);
        let _rx = attached(s.admit(1, true).unwrap());
        let _turn = s.admit(2, true).unwrap();
        assert!(s.admit(2, true).is_err());
    }

    #[test]
    fn initial_rid_seeds_sequence() {
        let s = HttpSession::new(
            "s",
            SessionParams {
                initial_rid: Some(100),
                ..SessionParams::default()
            },
        );
        assert!(s.admit(100, true).is_err());
        assert!(matches!(s.admit(101, true), Ok(Admission::Attached(_))));
    }

    #[test]
    fn highest_rid_ends_turn_cleanly() {
        let s = HttpSession::new(
            "s",
            SessionParams {
                initial_rid: Some(u64::MAX - 1),
                ..SessionParams::default()
            },
        );
        let _rx = attached(s.admit(u64::MAX, true).unwrap());
        s.end_turn(u64::MAX);
        assert!(s.admit(u64::MAX, true).is_err());
        assert_eq!(s.held_rids(), vec![u64::MAX]);
    }

    #[test]
    fn polling_too_often_without_hold_is_a_policy_violation() {
        let s = session(0);
        let _ = attached(s.admit(1, true).unwrap());
        s.end_turn(1);
        let err = s.admit(2, true).err().unwrap();
        assert_eq!(err.status(), 403);
        assert!(err.terminates_session());
    }

    #[test]
    fn close_terminates_held_connections_once() {
        let s = session(2);
        let events = recording(&s);
        let mut rx1 = attached(s.admit(1, true).unwrap());
        s.end_turn(1);
        let mut rx2 = attached(s.admit(2, true).unwrap());

        assert!(s.close(CloseReason::Shutdown));
        assert!(!s.close(CloseReason::Terminate));
        assert!(s.is_closed());

        let terminate = Delivery::Terminate(Some("system-shutdown"));
        assert_eq!(rx1.try_recv().unwrap(), terminate);
        assert_eq!(rx2.try_recv().unwrap(), terminate);
        assert_eq!(s.connection_count(), 0);

        let closed: Vec<_> = events
            .lock()
            .iter()
            .filter(|e| matches!(e, SessionEvent::SessionClosed { .. }))
            .copied()
            .collect();
        assert_eq!(
            closed,
            vec![SessionEvent::SessionClosed {
                reason: CloseReason::Shutdown
            }]
        );
    }

    #[test]
    fn closed_session_refuses_binds() {
        let s = session(1);
        s.close(CloseReason::Terminate);
        assert!(matches!(s.admit(1, true), Err(BoshError::SessionClosed(_))));
    }

    #[test]
    fn close_wakes_parked_requests_with_error() {
        let s = session(1);
        let _rx = attached(s.admit(1, true).unwrap());
        let Admission::Wait(mut turn) = s.admit(2, true).unwrap() else {
            panic!("rid 2 should wait while rid 1 forwards");
        };
        s.close(CloseReason::Terminate);
        assert!(matches!(
            turn.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn expire_declines_while_connection_held() {
        let s = session(1);
        let _rx = attached(s.admit(1, true).unwrap());
        assert!(!s.expire(|| true));
        assert!(!s.is_closed());
    }

    #[test]
    fn expire_declines_when_superseded() {
        let s = session(1);
        assert!(!s.expire(|| false));
        assert!(s.expire(|| true));
        assert!(s.is_closed());
    }

    #[test]
    fn detach_only_removes_held_connections() {
        let s = session(1);
        let _rx = attached(s.admit(1, true).unwrap());
        assert!(s.detach(1));
        assert!(!s.detach(1));
        assert_eq!(s.connection_count(), 0);
    }

    #[test]
    fn delivery_bodies() {
        assert_eq!(
            Delivery::empty().to_body(),
            "<body xmlns='http://jabber.org/protocol/httpbind'/>"
        );
        assert_eq!(
            Delivery::Terminate(None).to_body(),
            "<body xmlns='http://jabber.org/protocol/httpbind' type='terminate'/>"
        );
    }
}
