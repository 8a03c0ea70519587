//! The session worker pool.
//!
//! Each worker owns one active session at a time: it claims the session
//! from the admission queue, records it in the live-session table, and
//! loops on the request channel until the client disconnects (cleanly or
//! not), then returns to the queue for the next session. Responses for a
//! session are written only here, so they follow request order.

use std::io::BufReader;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::acceptor::block_worker_signals;
use crate::admission::AdmissionQueue;
use crate::protocol::{read_frame, Request, Response};
use crate::session::{Session, SessionState, SessionTable};
use crate::store::{KvStore, SubscribeOutcome, UnsubscribeOutcome};
use crate::Result;

/// whether to keep serving the current session after a request
enum Served {
    /// keep reading the request channel
    Continue,
    /// the session ended; claim the next one
    Done,
}

/// A running pool of session workers
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// starts `count` workers consuming from `queue`
    ///
    /// # Errors
    /// returns an error when a thread cannot be spawned
    pub fn start(
        store: Arc<KvStore>,
        table: Arc<SessionTable>,
        queue: Arc<AdmissionQueue>,
        count: usize,
    ) -> Result<WorkerPool> {
        let mut handles = Vec::with_capacity(count);
        for n in 0..count {
            let store = Arc::clone(&store);
            let table = Arc::clone(&table);
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("session-worker-{}", n))
                .spawn(move || {
                    block_worker_signals();
                    worker_loop(&store, &table, &queue);
                })?;
            handles.push(handle);
        }
        Ok(WorkerPool { handles })
    }

    /// waits for the workers to exit (they only do when the admission
    /// queue is closed)
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("session worker panicked");
            }
        }
    }
}

#[instrument(skip_all)]
fn worker_loop(store: &KvStore, table: &SessionTable, queue: &AdmissionQueue) {
    loop {
        let session = match queue.take() {
            Ok(session) => session,
            Err(_) => {
                debug!("admission queue closed, worker exiting");
                return;
            }
        };
        serve_session(store, table, session);
    }
}

/// serves one session from claim to teardown
fn serve_session(store: &KvStore, table: &SessionTable, session: Arc<Session>) {
    session.set_state(SessionState::Active);
    if let Err(e) = table.insert(Arc::clone(&session)) {
        warn!(session = session.id, error = %e, "could not record session");
    }
    info!(session = session.id, "serving");

    let request_channel = match session.take_request_channel() {
        Some(file) => file,
        None => {
            // the reset pass got here first
            teardown(store, table, &session, false);
            return;
        }
    };
    let mut requests = BufReader::new(request_channel);

    loop {
        // a failed notification write marks the session Draining, and the
        // reset pass marks it Closed; either way this session is over
        if session.state() != SessionState::Active {
            teardown(store, table, &session, false);
            return;
        }
        match read_frame(&mut requests) {
            Ok(Some(frame)) => match dispatch(store, table, &session, &frame) {
                Ok(Served::Continue) => {}
                Ok(Served::Done) => return,
                Err(e) if e.is_peer_gone() => {
                    teardown(store, table, &session, false);
                    return;
                }
                Err(e) => {
                    warn!(session = session.id, error = %e, "request failed");
                    teardown(store, table, &session, false);
                    return;
                }
            },
            // EOF: the client vanished without a DISCONNECT
            Ok(None) => {
                debug!(session = session.id, "sudden disconnect");
                teardown(store, table, &session, false);
                return;
            }
            Err(e) => {
                warn!(session = session.id, error = %e, "request channel unreadable");
                teardown(store, table, &session, false);
                return;
            }
        }
    }
}

/// decodes and executes one request frame
fn dispatch(
    store: &KvStore,
    table: &SessionTable,
    session: &Arc<Session>,
    frame: &str,
) -> Result<Served> {
    let request = match Request::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            // protocol errors are contained: log, drop the frame, go on
            warn!(session = session.id, error = %e, "malformed request frame");
            return Ok(Served::Continue);
        }
    };
    debug!(session = session.id, ?request, "dispatch");

    match request {
        Request::Disconnect => {
            let clean = store.purge_session(session).is_ok();
            session.write_response(Response::disconnect(clean))?;
            teardown_purged(table, session);
            Ok(Served::Done)
        }
        Request::Subscribe { key } => {
            let outcome = store.subscribe(session, &key)?;
            session.write_response(Response::subscribe(
                outcome == SubscribeOutcome::Subscribed,
            ))?;
            Ok(Served::Continue)
        }
        Request::Unsubscribe { key } => {
            let outcome = store.unsubscribe(session, &key)?;
            session.write_response(Response::unsubscribe(
                outcome == UnsubscribeOutcome::Unsubscribed,
            ))?;
            Ok(Served::Continue)
        }
    }
}

/// the sudden-disconnect path: purge subscriptions, then release
fn teardown(store: &KvStore, table: &SessionTable, session: &Arc<Session>, clean: bool) {
    if let Err(e) = store.purge_session(session) {
        warn!(session = session.id, error = %e, "purge failed");
    }
    teardown_purged(table, session);
    if clean {
        info!(session = session.id, "session closed");
    } else {
        info!(session = session.id, "session dropped");
    }
}

/// releases an already-purged session: mark closed, forget it, and let the
/// channel files close as the last references drop
fn teardown_purged(table: &SessionTable, session: &Arc<Session>) {
    session.set_state(SessionState::Closed);
    if let Err(e) = table.remove(session.id) {
        warn!(session = session.id, error = %e, "could not drop session record");
    }
}
