use std::io;
use std::net::SocketAddrV4;
use thiserror::Error;

use crate::protocol::{Command, MAX_PAYLOAD_SIZE};

/// Framing and tag errors raised by the codec
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("unknown command tag {0}")]
    UnknownCommand(u8),

    #[error("payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to insert a route into the OS routing table
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("adding routes requires root privileges; to add the route manually: {manual}")]
    NeedsPrivilege { manual: String },

    #[error("route may already exist or could not be added: {manual}")]
    Rejected { manual: String },

    #[error("failed to run route command: {0}")]
    Spawn(#[source] io::Error),

    #[error("route insertion is not supported on this platform")]
    Unsupported,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("could not connect to server at {target}: {source}")]
    Unreachable {
        target: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced by `list` and `get`
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("server error: {0}")]
    Server(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected {0:?} reply from server")]
    UnexpectedReply(Command),

    #[error("server closed the connection without replying")]
    NoReply,

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("{context}: {source}")]
    Local {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ClientError {
    pub fn local(context: impl Into<String>, source: io::Error) -> Self {
        Self::Local {
            context: context.into(),
            source,
        }
    }
}
