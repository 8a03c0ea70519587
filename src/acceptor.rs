//! The single-threaded acceptor owning the registration FIFO, plus the
//! process's signal plumbing.
//!
//! One thread reads connect records, opens the three per-session pipes,
//! hands the session to the admission queue (blocking until a worker claims
//! it) and only then writes the connect reply. Keeping this single-threaded
//! serializes the FIFO-open dance, which is order-sensitive on both ends.
//!
//! SIGUSR1 asks the server to drop every active session. The handler only
//! sets a flag; it is installed without SA_RESTART so the blocking
//! registration read returns EINTR, at which point the acceptor walks the
//! live-session table and runs the sudden-disconnect pass.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet,
                       SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info, warn};

use crate::admission::AdmissionQueue;
use crate::protocol::{ConnectRequest, Response};
use crate::session::{Session, SessionId, SessionTable};
use crate::store::KvStore;
use crate::{KvsubError, Result};

static RESET_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_signum: nix::libc::c_int) {
    RESET_PENDING.store(true, Ordering::SeqCst);
}

/// Installs the SIGUSR1 reset handler for the whole process. Must run
/// before any worker thread starts so the workers inherit nothing stale.
pub fn install_reset_handler() -> Result<()> {
    // no SA_RESTART: the registration read must surface EINTR
    let action = SigAction::new(
        SigHandler::Handler(on_sigusr1),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }?;
    Ok(())
}

/// consumes a pending reset request, if any
fn take_reset_request() -> bool {
    RESET_PENDING.swap(false, Ordering::SeqCst)
}

/// Blocks SIGUSR1 and SIGPIPE on the calling thread. Every session and job
/// worker runs this first: the reset signal is for the acceptor alone, and
/// broken pipes must arrive as EPIPE write errors, not signals.
pub(crate) fn block_worker_signals() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGUSR1);
    set.add(Signal::SIGPIPE);
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        warn!(error = %e, "could not block worker signals");
    }
}

/// Blocks SIGPIPE only; the acceptor must keep receiving SIGUSR1 but its
/// connect replies can hit a vanished peer
fn block_sigpipe() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGPIPE);
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        warn!(error = %e, "could not block SIGPIPE");
    }
}

/// Line reader over the registration FIFO that surfaces EINTR instead of
/// silently retrying, so a reset can interrupt a blocking read.
struct RegistrationLines {
    src: File,
    buf: Vec<u8>,
}

impl RegistrationLines {
    fn new(src: File) -> RegistrationLines {
        RegistrationLines {
            src,
            buf: Vec::new(),
        }
    }

    /// next newline-terminated record; `Ok(None)` when every writer closed
    fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            let mut chunk = [0_u8; 512];
            let n = self.src.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// The connection-accepting half of the server
pub struct Acceptor {
    store: Arc<KvStore>,
    table: Arc<SessionTable>,
    queue: Arc<AdmissionQueue>,
    registration_path: PathBuf,
    next_id: SessionId,
}

impl Acceptor {
    /// an acceptor that will own the FIFO at `registration_path`
    pub fn new(
        store: Arc<KvStore>,
        table: Arc<SessionTable>,
        queue: Arc<AdmissionQueue>,
        registration_path: PathBuf,
    ) -> Acceptor {
        Acceptor {
            store,
            table,
            queue,
            registration_path,
            next_id: 0,
        }
    }

    /// Creates the registration FIFO and serves connect records until the
    /// FIFO becomes unreadable. Handles the reset signal between records.
    pub fn run(mut self) -> Result<()> {
        block_sigpipe();
        create_fifo(&self.registration_path)?;
        info!(path = %self.registration_path.display(), "registration FIFO ready");

        // blocks until the first client opens the write end
        let registration = File::open(&self.registration_path)?;
        // keep one writer of our own so the read end never sticks at EOF
        // while no client is connected
        let _hold_open = OpenOptions::new()
            .write(true)
            .open(&self.registration_path)?;

        let mut records = RegistrationLines::new(registration);
        loop {
            match records.next_line() {
                Ok(Some(record)) => {
                    if let Err(e) = self.admit(&record) {
                        warn!(error = %e, "connect record rejected");
                    }
                }
                Ok(None) => {
                    // unreachable while _hold_open lives; treat as fatal
                    return Err(KvsubError::Resource(
                        "registration FIFO closed".to_string(),
                    ));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if take_reset_request() {
                        self.reset_all()?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// serves one connect record: open the session pipes, hand the session
    /// to a worker, reply on the response pipe
    fn admit(&mut self, record: &str) -> Result<()> {
        let connect = ConnectRequest::decode(record)?;
        debug!(?connect, "connect record");

        let session = match open_session_channels(&connect, self.alloc_id()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                // best effort: tell the client it was rejected
                if let Ok(mut resp) = OpenOptions::new().write(true).open(&connect.resp_path) {
                    use std::io::Write;
                    let _ = resp.write_all(Response::connect(false).encode().as_bytes());
                }
                return Err(e);
            }
        };

        // rendezvous: returns only once a worker owns the session
        self.queue.offer(Arc::clone(&session))?;

        if let Err(e) = session.write_response(Response::connect(true)) {
            // the peer vanished between registering and claiming; the
            // worker will see EOF on the request channel and clean up
            warn!(session = session.id, error = %e, "connect reply failed");
        }
        info!(session = session.id, "session admitted");
        Ok(())
    }

    fn alloc_id(&mut self) -> SessionId {
        self.next_id += 1;
        self.next_id
    }

    /// the reset pass: sudden-disconnect every live session
    fn reset_all(&self) -> Result<()> {
        let sessions = self.table.drain_all()?;
        info!(count = sessions.len(), "reset requested, dropping sessions");
        for session in sessions {
            if let Err(e) = self.store.purge_session(&session) {
                warn!(session = session.id, error = %e, "purge failed during reset");
            }
            session.set_state(crate::session::SessionState::Closed);
        }
        Ok(())
    }
}

/// unlinks any stale FIFO at `path` and creates a fresh one, mode 0640
pub(crate) fn create_fifo(path: &Path) -> Result<()> {
    match nix::unistd::unlink(path) {
        Ok(()) => {}
        Err(nix::errno::Errno::ENOENT) => {}
        Err(e) => return Err(e.into()),
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP)?;
    Ok(())
}

/// opens the three per-session channels in the fixed order the client
/// mirrors: response (write), notification (write), request (read)
fn open_session_channels(connect: &ConnectRequest, id: SessionId) -> Result<Session> {
    let response = OpenOptions::new()
        .write(true)
        .open(&connect.resp_path)
        .map_err(|e| KvsubError::Resource(format!("open {}: {}", connect.resp_path, e)))?;
    let notification = OpenOptions::new()
        .write(true)
        .open(&connect.notif_path)
        .map_err(|e| KvsubError::Resource(format!("open {}: {}", connect.notif_path, e)))?;
    let request = File::open(&connect.req_path)
        .map_err(|e| KvsubError::Resource(format!("open {}: {}", connect.req_path, e)))?;
    Ok(Session::new(id, request, response, notification))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fifo_replaces_a_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("register");
        create_fifo(&path).unwrap();
        create_fifo(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn registration_lines_split_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        std::fs::write(&path, "1|/a|/b|/c\n1|/d|/e|/f\n").unwrap();
        let mut lines = RegistrationLines::new(File::open(&path).unwrap());
        assert_eq!(lines.next_line().unwrap().unwrap(), "1|/a|/b|/c");
        assert_eq!(lines.next_line().unwrap().unwrap(), "1|/d|/e|/f");
        assert!(lines.next_line().unwrap().is_none());
    }
}
