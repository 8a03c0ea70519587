use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::acceptor::create_fifo;
use crate::protocol::{read_frame, ConnectRequest, Notification, Opcode, Request, Response};
use crate::{KvsubError, Result};

/// `Client` holds one live session with a kvsub server.
///
/// Connecting creates the session's three FIFOs, registers them with the
/// server, and spawns a reader thread that turns the notification channel
/// into a stream of [`Notification`] values.
///
/// # Example
/// ```no_run
/// use std::path::Path;
/// use kvsub::Client;
/// # fn main() -> kvsub::Result<()> {
/// let mut client = Client::connect(
///     Path::new("/tmp/kvsub-reg"),
///     Path::new("/tmp/req1"),
///     Path::new("/tmp/resp1"),
///     Path::new("/tmp/notif1"),
/// )?;
/// if client.subscribe("apple")? {
///     println!("watching apple");
/// }
/// client.disconnect()?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    requests: File,
    responses: BufReader<File>,
    notifications: Receiver<Notification>,
    notif_thread: Option<thread::JoinHandle<()>>,
    req_path: PathBuf,
    resp_path: PathBuf,
    notif_path: PathBuf,
}

impl Client {
    /// Establishes a session: creates the three FIFOs, sends the connect
    /// record on the registration FIFO, opens the channel ends in the
    /// order the server mirrors, and waits for the `1|0` reply.
    ///
    /// # Errors
    /// [`KvsubError::Resource`] when a FIFO cannot be created or opened,
    /// or when the server rejects the connection
    pub fn connect(
        register_path: &Path,
        req_path: &Path,
        resp_path: &Path,
        notif_path: &Path,
    ) -> Result<Client> {
        create_fifo(req_path)?;
        create_fifo(resp_path)?;
        create_fifo(notif_path)?;

        let mut register = OpenOptions::new()
            .write(true)
            .open(register_path)
            .map_err(|e| {
                KvsubError::Resource(format!("open {}: {}", register_path.display(), e))
            })?;
        let record = ConnectRequest {
            req_path: req_path.to_string_lossy().into_owned(),
            resp_path: resp_path.to_string_lossy().into_owned(),
            notif_path: notif_path.to_string_lossy().into_owned(),
        };
        register.write_all(record.encode().as_bytes())?;

        // mirror of the server's open order: resp read, notif read, req write
        let responses = File::open(resp_path)?;
        let notifications_pipe = File::open(notif_path)?;
        let requests = OpenOptions::new().write(true).open(req_path)?;

        let mut responses = BufReader::new(responses);
        let reply = await_reply(&mut responses, Opcode::Connect)?;
        if !reply.is_ok() {
            return Err(KvsubError::Resource(
                "Could not connect to server!".to_string(),
            ));
        }
        debug!("connected");

        let (tx, rx) = unbounded();
        let notif_thread = thread::Builder::new()
            .name("notif-reader".to_string())
            .spawn(move || read_notifications(notifications_pipe, tx))?;

        Ok(Client {
            requests,
            responses,
            notifications: rx,
            notif_thread: Some(notif_thread),
            req_path: req_path.to_path_buf(),
            resp_path: resp_path.to_path_buf(),
            notif_path: notif_path.to_path_buf(),
        })
    }

    /// Asks the server to observe `key`.
    /// Returns true when the key existed and the subscription is live.
    pub fn subscribe(&mut self, key: &str) -> Result<bool> {
        self.requests.write_all(
            Request::Subscribe {
                key: key.to_string(),
            }
            .encode()
            .as_bytes(),
        )?;
        let reply = await_reply(&mut self.responses, Opcode::Subscribe)?;
        Ok(reply.is_ok())
    }

    /// Drops the observation of `key`.
    /// Returns true when a subscription actually existed.
    pub fn unsubscribe(&mut self, key: &str) -> Result<bool> {
        self.requests.write_all(
            Request::Unsubscribe {
                key: key.to_string(),
            }
            .encode()
            .as_bytes(),
        )?;
        let reply = await_reply(&mut self.responses, Opcode::Unsubscribe)?;
        Ok(reply.is_ok())
    }

    /// Ends the session cleanly: the server purges every subscription
    /// before replying. The FIFOs are removed on drop.
    pub fn disconnect(mut self) -> Result<()> {
        self.requests
            .write_all(Request::Disconnect.encode().as_bytes())?;
        let reply = await_reply(&mut self.responses, Opcode::Disconnect)?;
        if !reply.is_ok() {
            warn!("server reported an unclean disconnect");
        }
        // the server closed its notification end; the reader sees EOF
        if let Some(handle) = self.notif_thread.take() {
            if handle.join().is_err() {
                warn!("notification reader panicked");
            }
        }
        Ok(())
    }

    /// stream of notifications for the keys this session observes
    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    /// convenience: next notification, waiting up to `timeout`
    pub fn recv_notification(&self, timeout: Duration) -> Option<Notification> {
        self.notifications.recv_timeout(timeout).ok()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // best effort: the FIFOs belong to this client
        for path in &[&self.req_path, &self.resp_path, &self.notif_path] {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// reads one response frame and checks it answers `expected`
fn await_reply(responses: &mut BufReader<File>, expected: Opcode) -> Result<Response> {
    let frame = read_frame(responses)?.ok_or(KvsubError::PeerGone)?;
    let reply = Response::decode(&frame)?;
    if reply.op != expected {
        return Err(KvsubError::Protocol(format!(
            "expected a reply to opcode {:?}, got {:?}",
            expected, reply.op
        )));
    }
    Ok(reply)
}

/// the notification-reader thread: pipe records in, channel values out
fn read_notifications(pipe: File, tx: Sender<Notification>) {
    let mut reader = BufReader::new(pipe);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => match Notification::decode(&frame) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        // client dropped the receiving side
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "unreadable notification record"),
            },
            Ok(None) => {
                debug!("notification channel closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "notification channel failed");
                return;
            }
        }
    }
}
