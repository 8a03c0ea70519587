//! Session state for one connected client.
//!
//! A session is the server-side end of the three per-client FIFOs: the
//! request channel (read here), the response channel (written by the owning
//! worker), and the notification channel (written only by the store's
//! notification fan-out). The live-session table indexes every session that
//! has been claimed by a worker so the reset pass can find them.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::protocol::{Notification, Response};
use crate::{KvsubError, Result};

/// the number of session worker threads, and therefore the admission queue
/// capacity and the cap on simultaneously connected clients
pub const MAX_SESSIONS: usize = 8;

/// process-unique identifier of a session
pub type SessionId = u64;

/// Lifecycle of a session.
///
/// Pending: accepted, waiting in the admission queue.
/// Active: owned by a worker, serving requests.
/// Draining: the peer is known to be gone; teardown is owed.
/// Closed: subscriptions purged and channels released.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// accepted but not yet claimed by a worker
    Pending,
    /// claimed by a worker and serving requests
    Active,
    /// peer gone or reset requested; awaiting purge
    Draining,
    /// fully torn down
    Closed,
}

/// The server-side state of one client connection
pub struct Session {
    /// process-unique session id
    pub id: SessionId,
    // request channel; moved out by the worker that claims the session
    request: Mutex<Option<File>>,
    // response channel; written by the acceptor (connect reply) and the worker
    response: Mutex<File>,
    // notification channel; written only by the notification fan-out
    notification: Mutex<File>,
    // cleared once a notification write fails, so a dead peer is written once
    notif_alive: AtomicBool,
    // keys this session currently observes; the other half of the
    // bidirectional index whose key side lives in the store's entries
    subscribed: Mutex<HashSet<String>>,
    state: Mutex<SessionState>,
}

impl Session {
    /// wraps freshly opened per-session channels into a Pending session
    pub fn new(id: SessionId, request: File, response: File, notification: File) -> Session {
        Session {
            id,
            request: Mutex::new(Some(request)),
            response: Mutex::new(response),
            notification: Mutex::new(notification),
            notif_alive: AtomicBool::new(true),
            subscribed: Mutex::new(HashSet::new()),
            state: Mutex::new(SessionState::Pending),
        }
    }

    /// current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// moves the session to `next`; transitions are monotonic, a Closed
    /// session never leaves Closed
    pub fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        if *state == SessionState::Closed {
            return;
        }
        *state = next;
    }

    /// hands the request channel to the claiming worker; subsequent calls
    /// return None (the request channel has exactly one reader)
    pub fn take_request_channel(&self) -> Option<File> {
        self.request
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    /// writes one response frame on the response channel.
    ///
    /// # Errors
    /// [`KvsubError::PeerGone`] when the client closed its read end
    pub fn write_response(&self, response: Response) -> Result<()> {
        let mut channel = self
            .response
            .lock()
            .map_err(|_| KvsubError::Locking(format!("response lock poisoned (session {})", self.id)))?;
        channel
            .write_all(response.encode().as_bytes())
            .and_then(|_| channel.flush())
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    KvsubError::PeerGone
                } else {
                    e.into()
                }
            })
    }

    /// Best-effort delivery of one notification record.
    ///
    /// Returns true when the record reached the pipe. On the first failed
    /// write the sink is disabled and the session marked Draining, so a
    /// vanished peer is never written to twice.
    pub fn push_notification(&self, event: &Notification) -> bool {
        if !self.notif_alive.load(Ordering::Acquire) {
            return false;
        }
        let mut channel = match self.notification.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.notif_alive.store(false, Ordering::Release);
                return false;
            }
        };
        let frame = event.encode();
        match channel.write_all(frame.as_bytes()).and_then(|_| channel.flush()) {
            Ok(()) => true,
            Err(e) => {
                debug!(session = self.id, error = %e, "notification channel dead");
                self.notif_alive.store(false, Ordering::Release);
                self.set_state(SessionState::Draining);
                false
            }
        }
    }

    /// locks the set of keys this session observes
    pub fn subscribed_keys(&self) -> Result<std::sync::MutexGuard<'_, HashSet<String>>> {
        self.subscribed
            .lock()
            .map_err(|_| KvsubError::Locking(format!("subscription lock poisoned (session {})", self.id)))
    }

    /// snapshot of the observed keys, for teardown walks that must not hold
    /// the session lock while taking bucket locks
    pub fn subscribed_snapshot(&self) -> Result<Vec<String>> {
        Ok(self.subscribed_keys()?.iter().cloned().collect())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// The directory of live sessions, indexed by id.
///
/// Guarded by its own mutex; by the global lock order it is taken only after
/// any bucket or session lock already held.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    /// an empty table
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    /// records a claimed session
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        self.lock()?.insert(session.id, session);
        Ok(())
    }

    /// drops a session from the directory, returning it if it was present
    pub fn remove(&self, id: SessionId) -> Result<Option<Arc<Session>>> {
        Ok(self.lock()?.remove(&id))
    }

    /// number of live sessions
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// true when no session is live
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// takes every live session out of the directory (the reset pass)
    pub fn drain_all(&self) -> Result<Vec<Arc<Session>>> {
        Ok(self.lock()?.drain().map(|(_, s)| s).collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, Arc<Session>>>> {
        self.inner
            .lock()
            .map_err(|_| KvsubError::Locking("session table lock poisoned".into()))
    }
}
