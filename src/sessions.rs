//! Registry of live progress channels, keyed by the client-chosen session id.
//!
//! Download workers call [`SessionRegistry::publish`] from blocking threads.
//! The registry only does bookkeeping and a non-blocking enqueue under its
//! lock; the WebSocket send itself happens on the connection task that owns
//! the socket, which drains its [`SessionHandle`].

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use crate::progress::ProgressRecord;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MIN_DELTA: f64 = 1.0;
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Caps how often a session receives throttled updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottlePolicy {
    pub min_interval: Duration,
    pub min_delta: f64,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            min_delta: DEFAULT_MIN_DELTA,
        }
    }
}

impl ThrottlePolicy {
    fn allows(&self, last: &LastUpdate, now: Instant, progress: f64) -> bool {
        let interval_elapsed = match last.sent_at {
            Some(sent_at) => now.saturating_duration_since(sent_at) >= self.min_interval,
            None => true,
        };
        interval_elapsed || (progress - last.progress).abs() >= self.min_delta
    }
}

#[derive(Debug, Clone, Copy)]
struct LastUpdate {
    sent_at: Option<Instant>,
    progress: f64,
}

impl LastUpdate {
    fn never() -> Self {
        Self {
            sent_at: None,
            progress: 0.0,
        }
    }
}

struct SessionEntry {
    generation: u64,
    sender: mpsc::Sender<ProgressRecord>,
    last: LastUpdate,
}

/// Outcome of a publish attempt. Callers are free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Throttled,
    NoSession,
    /// The connection's queue was full; the record was dropped.
    Dropped,
    /// The connection is gone; its registration was removed.
    Disconnected,
}

/// Receiving end of one registered connection.
pub struct SessionHandle {
    session_id: String,
    generation: u64,
    receiver: mpsc::Receiver<ProgressRecord>,
}

impl SessionHandle {
    /// Next queued record. Returns `None` once the registration was closed or
    /// replaced by a newer connection with the same id.
    pub async fn recv(&mut self) -> Option<ProgressRecord> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<ProgressRecord> {
        self.receiver.try_recv().ok()
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    policy: ThrottlePolicy,
    capacity: usize,
    next_generation: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(ThrottlePolicy::default(), DEFAULT_QUEUE_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(policy: ThrottlePolicy, capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
            capacity: capacity.max(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Registers a new connection for `session_id`, replacing any previous
    /// one. The replaced connection's handle stops yielding records.
    pub fn open(&self, session_id: &str) -> SessionHandle {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = SessionEntry {
            generation,
            sender,
            last: LastUpdate::never(),
        };
        let replaced = self
            .sessions
            .lock()
            .insert(session_id.to_string(), entry)
            .is_some();
        if replaced {
            info!(session_id, "replaced existing progress channel");
        } else {
            info!(session_id, "progress channel connected");
        }
        SessionHandle {
            session_id: session_id.to_string(),
            generation,
            receiver,
        }
    }

    /// Removes the registration for `session_id`, if any.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id).is_some();
        if removed {
            info!(session_id, "progress channel closed");
        }
        removed
    }

    /// Removes the registration only if it still belongs to `handle`, so a
    /// stale connection tearing down cannot evict its replacement.
    pub fn release(&self, handle: &SessionHandle) {
        let mut sessions = self.sessions.lock();
        let owned = sessions
            .get(&handle.session_id)
            .is_some_and(|entry| entry.generation == handle.generation);
        if owned {
            sessions.remove(&handle.session_id);
            info!(session_id = %handle.session_id, "progress channel closed");
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `record` for the session if the throttle allows it. Never
    /// blocks and never fails; a missing or broken channel only means the
    /// download runs without a live display.
    pub fn publish(&self, session_id: &str, record: &ProgressRecord) -> Delivery {
        self.deliver(session_id, record, true)
    }

    /// Like [`publish`](Self::publish) but skips the throttle. Used for stage
    /// changes the client must not miss.
    pub fn publish_final(&self, session_id: &str, record: &ProgressRecord) -> Delivery {
        self.deliver(session_id, record, false)
    }

    fn deliver(&self, session_id: &str, record: &ProgressRecord, throttled: bool) -> Delivery {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return Delivery::NoSession;
        };

        let now = Instant::now();
        if throttled && !self.policy.allows(&entry.last, now, record.progress) {
            return Delivery::Throttled;
        }

        match entry.sender.try_send(record.clone()) {
            Ok(()) => {
                entry.last = LastUpdate {
                    sent_at: Some(now),
                    progress: record.progress,
                };
                debug!(session_id, progress = record.progress, phase = %record.phase, "progress queued");
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                debug!(session_id, "progress queue full, dropping update");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                sessions.remove(session_id);
                info!(session_id, "progress channel went away, unregistering");
                Delivery::Disconnected
            }
        }
    }
}
