use std::io;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`KvsubError`]
pub type Result<T> = std::result::Result<T, KvsubError>;

/// Error variants used throughout the kvsub server and client.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum KvsubError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for errors when a key was not found in the store
    #[error("Key not found")]
    KeyNotFound,

    /// a key is empty, too long, or starts with a byte outside the hashable range
    #[error("invalid key: {}", .0)]
    InvalidKey(String),

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// a malformed or unrecognized frame was received on a session channel
    #[error("protocol error: {}", .0)]
    Protocol(String),

    /// the peer end of a session channel is gone (EOF or broken pipe)
    #[error("peer disconnected")]
    PeerGone,

    /// a FIFO or session resource could not be created or opened
    #[error("{}", .0)]
    Resource(String),

    /// variant for errors caused by poisoned or unusable locks
    #[error("{}", .0)]
    Locking(String),

    /// errors raised by OS-level calls made through the nix crate
    #[error("system call failed")]
    Sys(#[from] nix::Error),
}

impl KvsubError {
    /// true when the error means the other end of a pipe has vanished,
    /// either reported directly or as a broken-pipe write failure
    pub fn is_peer_gone(&self) -> bool {
        match self {
            KvsubError::PeerGone => true,
            KvsubError::Io { source } => source.kind() == io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for KvsubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_peer_gone() {
        let err: KvsubError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_peer_gone());
        assert!(KvsubError::PeerGone.is_peer_gone());
    }

    #[test]
    fn other_io_errors_are_not_peer_gone() {
        let err: KvsubError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(!err.is_peer_gone());
        assert!(!KvsubError::KeyNotFound.is_peer_gone());
    }

    #[test]
    fn debug_prints_the_error_chain() {
        let err: KvsubError = io::Error::new(io::ErrorKind::Other, "disk fell off").into();
        let rendered = format!("{:?}", err);
        assert!(rendered.contains("IO error"));
        assert!(rendered.contains("Caused by: disk fell off"));
    }
}
