//! Wire protocol shared by the server and the client.
//!
//! Frames are plain text, `|`-delimited, with a single decimal digit opcode.
//! Named pipes carry no message boundaries, so every frame is terminated by a
//! newline and the reader scans up to it. The payload bytes in front of the
//! terminator are fixed by the protocol, response-code polarity included
//! (`1|0` = connect ok, `3|1` = subscribed, `4|0` = unsubscribed), and
//! existing clients depend on them staying exactly as they are.

use std::convert::TryFrom;
use std::io::BufRead;

use crate::{KvsubError, Result};

/// Operation codes used on the registration and request channels
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    /// open a new session (registration channel)
    Connect = 1,
    /// end the session cleanly
    Disconnect = 2,
    /// start observing a key
    Subscribe = 3,
    /// stop observing a key
    Unsubscribe = 4,
}

impl Opcode {
    /// the single decimal digit that encodes this opcode on the wire
    pub fn digit(self) -> char {
        match self {
            Opcode::Connect => '1',
            Opcode::Disconnect => '2',
            Opcode::Subscribe => '3',
            Opcode::Unsubscribe => '4',
        }
    }
}

impl TryFrom<&str> for Opcode {
    type Error = KvsubError;

    fn try_from(token: &str) -> Result<Self> {
        match token {
            "1" => Ok(Opcode::Connect),
            "2" => Ok(Opcode::Disconnect),
            "3" => Ok(Opcode::Subscribe),
            "4" => Ok(Opcode::Unsubscribe),
            other => Err(KvsubError::Protocol(format!("unknown opcode {:?}", other))),
        }
    }
}

/// The connect record a client writes on the registration channel.
/// Carries the paths of the three per-session FIFOs the client created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// path of the FIFO the client will write requests to
    pub req_path: String,
    /// path of the FIFO the server will write responses to
    pub resp_path: String,
    /// path of the FIFO the server will write notifications to
    pub notif_path: String,
}

impl ConnectRequest {
    /// renders the connect record, newline terminated
    pub fn encode(&self) -> String {
        format!(
            "1|{}|{}|{}\n",
            self.req_path, self.resp_path, self.notif_path
        )
    }

    /// parses a connect record from a line with the terminator stripped
    pub fn decode(line: &str) -> Result<ConnectRequest> {
        let mut fields = line.split('|');
        let op = fields
            .next()
            .ok_or_else(|| KvsubError::Protocol("empty connect record".into()))?;
        if Opcode::try_from(op)? != Opcode::Connect {
            return Err(KvsubError::Protocol(format!(
                "expected connect record, got opcode {}",
                op
            )));
        }
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(req), Some(resp), Some(notif), None)
                if !req.is_empty() && !resp.is_empty() && !notif.is_empty() =>
            {
                Ok(ConnectRequest {
                    req_path: req.to_string(),
                    resp_path: resp.to_string(),
                    notif_path: notif.to_string(),
                })
            }
            _ => Err(KvsubError::Protocol(format!(
                "malformed connect record {:?}",
                line
            ))),
        }
    }
}

/// These are the requests a connected session can make on its request channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// end the session; the server purges every subscription first
    Disconnect,
    /// observe mutations of the named key
    Subscribe {
        /// the key to observe
        key: String,
    },
    /// stop observing the named key
    Unsubscribe {
        /// the key to stop observing
        key: String,
    },
}

impl Request {
    /// renders the request frame, newline terminated
    pub fn encode(&self) -> String {
        match self {
            Request::Disconnect => "2\n".to_string(),
            Request::Subscribe { key } => format!("3|{}\n", key),
            Request::Unsubscribe { key } => format!("4|{}\n", key),
        }
    }

    /// parses a request frame from a line with the terminator stripped
    pub fn decode(line: &str) -> Result<Request> {
        let mut fields = line.split('|');
        let op = fields
            .next()
            .ok_or_else(|| KvsubError::Protocol("empty request frame".into()))?;
        let request = match Opcode::try_from(op)? {
            Opcode::Disconnect => match fields.next() {
                None => Request::Disconnect,
                Some(_) => {
                    return Err(KvsubError::Protocol(format!(
                        "disconnect carries no payload: {:?}",
                        line
                    )))
                }
            },
            Opcode::Subscribe => Request::Subscribe {
                key: single_key_field(fields, line)?,
            },
            Opcode::Unsubscribe => Request::Unsubscribe {
                key: single_key_field(fields, line)?,
            },
            Opcode::Connect => {
                return Err(KvsubError::Protocol(
                    "connect is only valid on the registration channel".into(),
                ))
            }
        };
        Ok(request)
    }
}

/// pulls exactly one non-empty key field out of the remainder of a frame
fn single_key_field<'a, I>(mut fields: I, line: &str) -> Result<String>
where
    I: Iterator<Item = &'a str>,
{
    match (fields.next(), fields.next()) {
        (Some(key), None) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(KvsubError::Protocol(format!(
            "expected a single key field: {:?}",
            line
        ))),
    }
}

/// A response frame written on the per-session response channel.
///
/// The code polarity is asymmetric and wire-frozen:
/// connect/disconnect/unsubscribe report success as `0`, subscribe reports
/// "key existed, now subscribed" as `1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    /// the opcode being answered
    pub op: Opcode,
    /// the single-digit result code
    pub code: u8,
}

impl Response {
    /// reply to CONNECT: `1|0` accepted, `1|1` rejected
    pub fn connect(ok: bool) -> Response {
        Response {
            op: Opcode::Connect,
            code: if ok { 0 } else { 1 },
        }
    }

    /// reply to DISCONNECT: `2|0` clean teardown, `2|1` partial
    pub fn disconnect(ok: bool) -> Response {
        Response {
            op: Opcode::Disconnect,
            code: if ok { 0 } else { 1 },
        }
    }

    /// reply to SUBSCRIBE: `3|1` key existed and is now observed, `3|0` no such key
    pub fn subscribe(subscribed: bool) -> Response {
        Response {
            op: Opcode::Subscribe,
            code: if subscribed { 1 } else { 0 },
        }
    }

    /// reply to UNSUBSCRIBE: `4|0` removed, `4|1` was not subscribed
    pub fn unsubscribe(removed: bool) -> Response {
        Response {
            op: Opcode::Unsubscribe,
            code: if removed { 0 } else { 1 },
        }
    }

    /// true when this response reports success for its opcode
    pub fn is_ok(&self) -> bool {
        match self.op {
            Opcode::Subscribe => self.code == 1,
            _ => self.code == 0,
        }
    }

    /// renders the response frame, newline terminated.
    /// The payload is three bytes, well below PIPE_BUF, so the write is atomic.
    pub fn encode(&self) -> String {
        format!("{}|{}\n", self.op.digit(), self.code)
    }

    /// parses a response frame from a line with the terminator stripped
    pub fn decode(line: &str) -> Result<Response> {
        let mut fields = line.split('|');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(op), Some(code), None) => {
                let op = Opcode::try_from(op)?;
                let code = code
                    .parse::<u8>()
                    .map_err(|_| KvsubError::Protocol(format!("bad result code {:?}", line)))?;
                Ok(Response { op, code })
            }
            _ => Err(KvsubError::Protocol(format!(
                "malformed response frame {:?}",
                line
            ))),
        }
    }
}

/// An event record delivered on a session's notification channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// a subscribed key was written; carries the new value
    Changed {
        /// the mutated key
        key: String,
        /// the value the key now holds
        value: String,
    },
    /// a subscribed key was deleted; the subscription is implicitly over
    Deleted {
        /// the removed key
        key: String,
    },
}

impl Notification {
    /// renders the notification record, newline terminated
    pub fn encode(&self) -> String {
        match self {
            Notification::Changed { key, value } => format!("({},{})\n", key, value),
            Notification::Deleted { key } => format!("({},DELETED)\n", key),
        }
    }

    /// parses a notification record from a line with the terminator stripped
    pub fn decode(line: &str) -> Result<Notification> {
        let inner = line
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| {
                KvsubError::Protocol(format!("malformed notification record {:?}", line))
            })?;
        let mut fields = inner.splitn(2, ',');
        match (fields.next(), fields.next()) {
            (Some(key), Some(value)) if !key.is_empty() => {
                if value == "DELETED" {
                    Ok(Notification::Deleted {
                        key: key.to_string(),
                    })
                } else {
                    Ok(Notification::Changed {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                }
            }
            _ => Err(KvsubError::Protocol(format!(
                "malformed notification record {:?}",
                line
            ))),
        }
    }
}

/// Reads one newline-terminated frame from `reader`.
/// Returns `Ok(None)` on a clean EOF (every writer closed the pipe).
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn connect_record_round_trips() {
        let req = ConnectRequest {
            req_path: "/tmp/req7".to_string(),
            resp_path: "/tmp/resp7".to_string(),
            notif_path: "/tmp/notif7".to_string(),
        };
        let line = req.encode();
        assert_eq!(line, "1|/tmp/req7|/tmp/resp7|/tmp/notif7\n");
        assert_eq!(ConnectRequest::decode(line.trim_end()).unwrap(), req);
    }

    #[test]
    fn connect_record_rejects_missing_paths() {
        assert!(ConnectRequest::decode("1|/tmp/req|/tmp/resp").is_err());
        assert!(ConnectRequest::decode("1||/tmp/resp|/tmp/notif").is_err());
        assert!(ConnectRequest::decode("2|/a|/b|/c").is_err());
    }

    #[test]
    fn request_frames_round_trip() {
        for req in &[
            Request::Disconnect,
            Request::Subscribe {
                key: "apple".to_string(),
            },
            Request::Unsubscribe {
                key: "apple".to_string(),
            },
        ] {
            let line = req.encode();
            assert_eq!(&Request::decode(line.trim_end()).unwrap(), req);
        }
    }

    #[test]
    fn request_decode_rejects_garbage() {
        assert!(Request::decode("9|apple").is_err());
        assert!(Request::decode("3|").is_err());
        assert!(Request::decode("3|a|b").is_err());
        assert!(Request::decode("2|payload").is_err());
        assert!(Request::decode("1|/a|/b|/c").is_err());
    }

    #[test]
    fn response_codes_keep_the_historical_polarity() {
        assert_eq!(Response::connect(true).encode(), "1|0\n");
        assert_eq!(Response::connect(false).encode(), "1|1\n");
        assert_eq!(Response::disconnect(true).encode(), "2|0\n");
        assert_eq!(Response::subscribe(true).encode(), "3|1\n");
        assert_eq!(Response::subscribe(false).encode(), "3|0\n");
        assert_eq!(Response::unsubscribe(true).encode(), "4|0\n");
        assert_eq!(Response::unsubscribe(false).encode(), "4|1\n");
    }

    #[test]
    fn response_is_ok_follows_polarity() {
        assert!(Response::connect(true).is_ok());
        assert!(Response::subscribe(true).is_ok());
        assert!(!Response::subscribe(false).is_ok());
        assert!(Response::unsubscribe(true).is_ok());
        assert!(!Response::unsubscribe(false).is_ok());
    }

    #[test]
    fn notification_records_round_trip() {
        let changed = Notification::Changed {
            key: "apple".to_string(),
            value: "green".to_string(),
        };
        assert_eq!(changed.encode(), "(apple,green)\n");
        assert_eq!(Notification::decode("(apple,green)").unwrap(), changed);

        let deleted = Notification::Deleted {
            key: "apple".to_string(),
        };
        assert_eq!(deleted.encode(), "(apple,DELETED)\n");
        assert_eq!(Notification::decode("(apple,DELETED)").unwrap(), deleted);
    }

    #[test]
    fn read_frame_stops_at_newline_and_reports_eof() {
        let mut cursor = Cursor::new(b"3|apple\n2\n".to_vec());
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), "3|apple");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), "2");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }
}
