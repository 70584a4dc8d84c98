use std::io;

use thiserror::Error;

/// Error taxonomy for the core protocol (spec §7).
///
/// Every I/O-carrying variant keeps the underlying `io::Error` via `#[source]`
/// so callers can match on `ErrorKind` if they need to. End-of-stream is
/// never represented here — it is reported to handlers as a clean close with
/// no cause.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no registered builder for msg_type {0}")]
    UnknownMsgType(i16),

    #[error("io reactor stopped unexpectedly")]
    FailedToRunReactor(#[source] io::Error),

    #[error("failed to connect to {addr}")]
    FailedToConnect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read from peer {peer:?}")]
    FailedToRead {
        peer: Option<crate::PeerId>,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to peer {peer:?}")]
    FailedToWrite {
        peer: Option<crate::PeerId>,
        #[source]
        source: io::Error,
    },

    #[error("roster is full (capacity {capacity})")]
    ServerFull { capacity: usize },

    #[error("name already taken")]
    DuplicateName,
}

pub type Result<T> = std::result::Result<T, Error>;
