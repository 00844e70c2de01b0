//! Inactivity timer: one pending expiry task per idle open session.
//!
//! Each scheduled task carries a token. When it fires it asks the session to
//! expire itself, and the session re-checks under its own lock that the
//! token is still the armed one and no connection is bound. A task that
//! fired concurrently with `stop` or `reset` therefore closes nothing.

use super::http_session::HttpSession;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct ScheduledExpiry {
    token: u64,
    handle: JoinHandle<()>,
}

/// Process-wide scheduler of session expiry tasks.
pub struct InactivityTimer {
    runtime: Handle,
    tasks: Mutex<HashMap<String, ScheduledExpiry>>,
    next_token: AtomicU64,
}

impl InactivityTimer {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Cancel any pending expiry for `session` and, unless it is closed,
    /// schedule a new one `inactivity_timeout` from now.
    pub fn reset(self: &Arc<Self>, session: &Arc<HttpSession>) {
        let stream_id = session.stream_id().to_string();
        let mut tasks = self.tasks.lock();
        if let Some(prev) = tasks.remove(&stream_id) {
            prev.handle.abort();
        }
        if session.is_closed() {
            return;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let timeout = session.inactivity_timeout();
        let weak_session = Arc::downgrade(session);
        let weak_timer: Weak<Self> = Arc::downgrade(self);
        let id = stream_id.clone();

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(session), Some(timer)) = (weak_session.upgrade(), weak_timer.upgrade())
            else {
                return;
            };
            if session.expire(|| timer.is_armed(&id, token)) {
                info!(stream_id = %id, timeout_secs = timeout.as_secs(), "session expired after inactivity");
            } else {
                debug!(stream_id = %id, "expiry superseded");
            }
        });

        tasks.insert(stream_id, ScheduledExpiry { token, handle });
    }

    /// Cancel the pending expiry for `stream_id`, if any.
    pub fn stop(&self, stream_id: &str) {
        if let Some(task) = self.tasks.lock().remove(stream_id) {
            task.handle.abort();
        }
    }

    fn is_armed(&self, stream_id: &str, token: u64) -> bool {
        self.tasks
            .lock()
            .get(stream_id)
            .is_some_and(|t| t.token == token)
    }

    pub fn is_scheduled(&self, stream_id: &str) -> bool {
        self.tasks.lock().contains_key(stream_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.handle.abort();
        }
    }
}
