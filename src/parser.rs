//! Line-oriented parsers for the two command languages of the system: the
//! batch commands found in `.job` files and the interactive commands a
//! client reads from stdin.
//!
//! Parsing never fails hard: an unrecognizable line becomes
//! [`Command::Invalid`] (or [`ClientCommand::Invalid`]) and the caller
//! decides to log and move on, which is what the job runner does.

use std::io::BufRead;

use crate::Result;

/// One parsed job-file command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `WRITE [(k,v)(k2,v2)…]` — store every pair
    Write(Vec<(String, String)>),
    /// `READ [k,k2,…]` — look up every key
    Read(Vec<String>),
    /// `DELETE [k,k2,…]` — delete every key
    Delete(Vec<String>),
    /// `SHOW` — dump the whole store
    Show,
    /// `WAIT <ms>` — pause this job for the given milliseconds
    Wait(u64),
    /// `BACKUP` — snapshot the store to the next numbered backup file
    Backup,
    /// `HELP` — print the usage text
    Help,
    /// a blank line
    Empty,
    /// anything unrecognizable
    Invalid,
}

/// parses one job-file line
pub fn parse_line(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Command::Empty;
    }
    if trimmed == "SHOW" {
        return Command::Show;
    }
    if trimmed == "BACKUP" {
        return Command::Backup;
    }
    if trimmed == "HELP" {
        return Command::Help;
    }
    if let Some(rest) = trimmed.strip_prefix("WRITE") {
        return match parse_pair_list(rest.trim()) {
            Some(pairs) if !pairs.is_empty() => Command::Write(pairs),
            _ => Command::Invalid,
        };
    }
    if let Some(rest) = trimmed.strip_prefix("READ") {
        return match parse_key_list(rest.trim()) {
            Some(keys) if !keys.is_empty() => Command::Read(keys),
            _ => Command::Invalid,
        };
    }
    if let Some(rest) = trimmed.strip_prefix("DELETE") {
        return match parse_key_list(rest.trim()) {
            Some(keys) if !keys.is_empty() => Command::Delete(keys),
            _ => Command::Invalid,
        };
    }
    if let Some(rest) = trimmed.strip_prefix("WAIT") {
        return match rest.trim().parse::<u64>() {
            Ok(ms) => Command::Wait(ms),
            Err(_) => Command::Invalid,
        };
    }
    Command::Invalid
}

/// `[(k,v)(k2,v2)…]` → pairs, or None on malformed input
fn parse_pair_list(payload: &str) -> Option<Vec<(String, String)>> {
    let inner = payload.strip_prefix('[')?.strip_suffix(']')?;
    let mut pairs = Vec::new();
    let mut rest = inner.trim();
    while !rest.is_empty() {
        let after_open = rest.strip_prefix('(')?;
        let close = after_open.find(')')?;
        let body = &after_open[..close];
        let comma = body.find(',')?;
        let key = body[..comma].trim();
        let value = body[comma + 1..].trim();
        if key.is_empty() || value.is_empty() {
            return None;
        }
        pairs.push((key.to_string(), value.to_string()));
        rest = after_open[close + 1..].trim_start();
    }
    Some(pairs)
}

/// `[k,k2,…]` → keys, or None on malformed input
fn parse_key_list(payload: &str) -> Option<Vec<String>> {
    let inner = payload.strip_prefix('[')?.strip_suffix(']')?;
    let mut keys = Vec::new();
    for token in inner.split(',') {
        let key = token.trim();
        if key.is_empty() {
            return None;
        }
        keys.push(key.to_string());
    }
    Some(keys)
}

/// Iterator over the commands of a job file, one per line, ending at EOF
pub struct Commands<R> {
    reader: R,
}

impl<R: BufRead> Commands<R> {
    /// wraps a buffered reader over a job file
    pub fn new(reader: R) -> Commands<R> {
        Commands { reader }
    }
}

impl<R: BufRead> Iterator for Commands<R> {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(Ok(parse_line(&line))),
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// One parsed interactive client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `SUBSCRIBE <key>` — observe a key
    Subscribe(String),
    /// `UNSUBSCRIBE <key>` — stop observing a key
    Unsubscribe(String),
    /// `DISCONNECT` — end the session
    Disconnect,
    /// `DELAY <ms>` — pause the client script
    Delay(u64),
    /// a blank line
    Empty,
    /// anything unrecognizable
    Invalid,
}

/// parses one interactive client line
pub fn parse_client_line(line: &str) -> ClientCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ClientCommand::Empty;
    }
    if trimmed == "DISCONNECT" {
        return ClientCommand::Disconnect;
    }
    let mut words = trimmed.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("SUBSCRIBE"), Some(key), None) => ClientCommand::Subscribe(key.to_string()),
        (Some("UNSUBSCRIBE"), Some(key), None) => ClientCommand::Unsubscribe(key.to_string()),
        (Some("DELAY"), Some(ms), None) => match ms.parse::<u64>() {
            Ok(ms) => ClientCommand::Delay(ms),
            Err(_) => ClientCommand::Invalid,
        },
        _ => ClientCommand::Invalid,
    }
}
